//! Usage: In-place rewrite of the JSON `model` field for providers with a
//! model mapping. Only that one field changes; the rest of the body is
//! forwarded as the client sent it.

use axum::body::Bytes;
use serde_json::Value;

pub(super) fn replace_model_in_body(body: &Bytes, model: &str) -> Result<Bytes, String> {
    let mut root: Value = serde_json::from_slice(body)
        .map_err(|e| format!("request body is not valid JSON: {e}"))?;

    let Some(obj) = root.as_object_mut() else {
        return Err("request body is not a JSON object".to_string());
    };
    if !obj.contains_key("model") {
        return Err("request body has no model field".to_string());
    }
    obj.insert("model".to_string(), Value::String(model.to_string()));

    serde_json::to_vec(&root)
        .map(Bytes::from)
        .map_err(|e| format!("failed to re-serialize request body: {e}"))
}
