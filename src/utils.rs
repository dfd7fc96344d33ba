use serde_json::Value;

/// Renders a JSON value the way it should appear on the wire: strings bare,
/// everything else via its JSON form.
pub(crate) fn value_to_clean_string(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        _ => val.to_string(),
    }
}
