use crate::error::DecodeError;
use serde_json::Value;

const RAW_TEXT_LIMIT: usize = 2000;
/// Deepest array/object nesting accepted; matches serde_json's recursion limit.
const MAX_NESTING_DEPTH: usize = 128;

/// Splits a message body into its batch items, preserving order.
///
/// A JSON object yields one item and a JSON array yields its elements; any other
/// shape, or a body that is not JSON, is a [`DecodeError`] carrying the raw text.
pub fn unwrap_batch(body: &[u8]) -> Result<Vec<Value>, DecodeError> {
    // Decoding into `Value` recurses per nesting level; reject before it can exhaust the stack.
    if exceeds_nesting_depth(body, MAX_NESTING_DEPTH) {
        return Err(DecodeError {
            reason: format!("nesting deeper than {MAX_NESTING_DEPTH} levels"),
            raw_text: raw_text(body),
        });
    }
    let mut bytes = body.to_vec();
    let decoded: Value = simd_json::serde::from_slice(&mut bytes).map_err(|err| DecodeError {
        reason: err.to_string(),
        raw_text: raw_text(body),
    })?;

    match decoded {
        Value::Array(items) => Ok(items),
        Value::Object(_) => Ok(vec![decoded]),
        other => Err(DecodeError {
            reason: format!("expected object or array, got {}", kind(&other)),
            raw_text: raw_text(body),
        }),
    }
}

/// Lossy UTF-8 rendering of a body, truncated for dead-letter payloads.
pub fn raw_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(RAW_TEXT_LIMIT)
        .collect()
}

/// Byte scan for bracket depth, skipping string contents and escapes.
fn exceeds_nesting_depth(body: &[u8], limit: usize) -> bool {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for &byte in body {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                if depth > limit {
                    return true;
                }
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    false
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
