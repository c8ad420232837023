// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! Canned, low-confidence results substituted when a step cannot complete
//! and `fallback_enabled` permits it. Every entry carries `confidence <=
//! 0.5` so downstream consumers can detect degradation.

use crate::workflow::ServiceId;
use serde_json::{json, Value};

/// Returns the static fallback payload for a service, with
/// `status: "fallback"` at the top level (the invariant the engine checks
/// when deciding whether a step "fallback-succeeded").
pub fn canned_result(service_id: ServiceId) -> Value {
    match service_id {
        ServiceId::ImageProcessing => json!({
            "status": "fallback",
            "result": { "category": "unknown", "tags": [], "confidence": 0.3 },
            "message": "using fallback image analysis due to service unavailability",
        }),
        ServiceId::Nlu => json!({
            "status": "fallback",
            "result": { "intent": "unknown", "entities": [], "confidence": 0.3 },
            "message": "using fallback text analysis due to service unavailability",
        }),
        ServiceId::StyleProfile => json!({
            "status": "fallback",
            "result": { "style": "versatile", "confidence": 0.4 },
            "message": "using fallback style profiling due to service unavailability",
        }),
        ServiceId::CombinationEngine => json!({
            "status": "fallback",
            "result": { "combinations": [], "confidence": 0.3 },
            "message": "using fallback combination generation due to service unavailability",
        }),
        ServiceId::RecommendationEngine => json!({
            "status": "fallback",
            "result": {
                "recommendations": [
                    { "item": "versatile_piece_1", "score": 0.7, "reason": "fallback_recommendation" },
                    { "item": "versatile_piece_2", "score": 0.6, "reason": "fallback_recommendation" },
                ],
                "confidence": 0.5,
            },
            "message": "using fallback recommendations due to service unavailability",
        }),
        ServiceId::FeedbackLoop => json!({
            "status": "fallback",
            "result": {},
            "confidence": 0.3,
            "message": "generic fallback for feedback-loop",
        }),
    }
}

/// Extracts the `confidence` field embedded in a canned result, wherever it
/// lives in the payload shape (top level or nested under `result`).
pub fn confidence_of(value: &Value) -> Option<f64> {
    value
        .get("confidence")
        .or_else(|| value.get("result").and_then(|r| r.get("confidence")))
        .and_then(Value::as_f64)
}
