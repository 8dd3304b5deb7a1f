use super::types::{EventValue, ValidatedEvent};
use crate::error::ValidationError;
use serde_json::{Map, Value};

/// Checks one decoded batch item and normalizes it into a [`ValidatedEvent`].
pub fn validate_event(item: &Value, supported_schema: i64) -> Result<ValidatedEvent, ValidationError> {
    let Value::Object(obj) = item else {
        return Err(ValidationError::NotAnObject);
    };

    let schema = match obj.get("schema") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("schema")),
        Some(value) => value.as_i64().ok_or(ValidationError::InvalidField {
            field: "schema",
            expected: "an integer",
        })?,
    };
    let event_id = required_string(obj, "event_id")?;
    let device_id = required_string(obj, "device_id")?;
    let event_type = required_string(obj, "event_type")?;

    if schema != supported_schema {
        return Err(ValidationError::UnsupportedSchema {
            found: schema,
            supported: supported_schema,
        });
    }
    let schema = i32::try_from(schema).map_err(|_| ValidationError::UnsupportedSchema {
        found: schema,
        supported: supported_schema,
    })?;

    // The device id is substituted into the ack topic, so it must be one topic level.
    if device_id.contains(['/', '+', '#']) {
        return Err(ValidationError::InvalidField {
            field: "device_id",
            expected: "a single topic level without '/', '+' or '#'",
        });
    }

    let value = match obj.get("value") {
        None | Some(Value::Null) => None,
        Some(Value::Number(number)) => {
            let value = number.as_f64().ok_or(ValidationError::InvalidField {
                field: "value",
                expected: "a finite number or a string",
            })?;
            Some(EventValue::Number(value))
        }
        Some(Value::String(text)) => Some(classify_text_value(text)),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "value",
                expected: "a number or a string",
            })
        }
    };

    let unit = match obj.get("unit") {
        None | Some(Value::Null) => None,
        Some(Value::String(unit)) => Some(unit.clone()),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "unit",
                expected: "a string",
            })
        }
    };

    let ts_device = obj
        .get("ts_device")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string());

    let meta = match obj.get("meta") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(meta)) => Value::Object(meta.clone()),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "meta",
                expected: "an object",
            })
        }
    };

    Ok(ValidatedEvent {
        event_id,
        device_id,
        schema,
        event_type,
        value,
        unit,
        ts_device,
        meta,
    })
}

/// Text that parses as a finite float once trimmed is numeric. Anything else is
/// kept as text exactly as sent, surrounding whitespace included.
pub fn classify_text_value(text: &str) -> EventValue {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => EventValue::Number(value),
        _ => EventValue::Text(text.to_string()),
    }
}

fn required_string(obj: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        // Whitespace-only counts as empty, but the value is kept verbatim.
        Some(Value::String(value)) if value.trim().is_empty() => {
            Err(ValidationError::EmptyField(field))
        }
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ValidationError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}
