use serde_json::json;

use crate::schedule::EngineError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Engine errors map onto the IPC code vocabulary; validation violations
/// travel in `details` so the UI can attach them to fields.
pub fn engine_err(id: &str, e: EngineError) -> serde_json::Value {
    match e {
        EngineError::Validation(violations) => err(
            id,
            "validation_failed",
            "lesson fields failed validation",
            Some(json!({ "violations": violations })),
        ),
        EngineError::Referential(message) => err(id, "referential_violation", message, None),
        EngineError::NotFound(message) => err(id, "not_found", message, None),
        EngineError::Storage(cause) => err(id, "db_query_failed", format!("{cause:#}"), None),
    }
}
