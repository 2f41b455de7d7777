//! Event schema validation.
//!
//! Producers may hand the facade either a typed [`Event`] or a raw JSON
//! value. Both paths end up here; neither has side effects.

use serde_json::Value;

use crate::error::{EventError, EventResult};
use crate::event::{Event, EventType};

/// Validates a raw JSON event and converts it into a typed [`Event`].
///
/// Fails when `eventType` is not a string or not a known type, when
/// `timestamp`/`operationId` are missing, empty or not strings, or when
/// `data`/`metadata` are present but not objects.
pub fn validate(raw: &Value) -> EventResult<Event> {
    let obj = raw
        .as_object()
        .ok_or_else(|| EventError::Schema("event must be an object".into()))?;

    let event_type = obj
        .get("eventType")
        .and_then(Value::as_str)
        .ok_or_else(|| EventError::Schema("eventType must be a string".into()))?;
    event_type.parse::<EventType>()?;

    require_string(raw, "timestamp")?;
    require_string(raw, "operationId")?;
    require_object_if_present(raw.get("data"), "data")?;
    require_object_if_present(raw.get("metadata"), "metadata")?;

    let event: Event =
        serde_json::from_value(raw.clone()).map_err(|e| EventError::Schema(e.to_string()))?;
    validate_event(&event)?;
    Ok(event)
}

/// Checks the invariants of an already-typed event.
pub fn validate_event(event: &Event) -> EventResult<()> {
    if event.operation_id.trim().is_empty() {
        return Err(EventError::Schema("operationId must be a non-empty string".into()));
    }
    require_object_if_present(event.data.as_ref(), "data")?;
    require_object_if_present(event.metadata.as_ref(), "metadata")?;
    Ok(())
}

fn require_string(raw: &Value, field: &str) -> EventResult<()> {
    match raw.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(EventError::Schema(format!("{} must be a non-empty string", field))),
    }
}

fn require_object_if_present(value: Option<&Value>, field: &str) -> EventResult<()> {
    match value {
        None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(EventError::Schema(format!("{} must be an object", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_raw() -> Value {
        json!({
            "eventType": "deployment.started",
            "timestamp": "2025-01-01T00:00:00Z",
            "operationId": "dep-1",
            "data": {"status": "InProgress"},
            "metadata": {"user": "ops"}
        })
    }

    #[test]
    fn test_valid_event() {
        let event = validate(&valid_raw()).unwrap();
        assert_eq!(event.event_type, EventType::DeploymentStarted);
        assert_eq!(event.operation_id, "dep-1");
    }

    #[test]
    fn test_rejects_non_string_event_type() {
        let mut raw = valid_raw();
        raw["eventType"] = json!(42);
        assert!(matches!(validate(&raw), Err(EventError::Schema(_))));
    }

    #[test]
    fn test_rejects_unknown_event_type() {
        let mut raw = valid_raw();
        raw["eventType"] = json!("deployment.teleported");
        let err = validate(&raw).unwrap_err();
        assert!(err.to_string().contains("deployment.teleported"));
    }

    #[test]
    fn test_rejects_missing_timestamp_and_operation() {
        let mut raw = valid_raw();
        raw.as_object_mut().unwrap().remove("timestamp");
        assert!(validate(&raw).is_err());

        let mut raw = valid_raw();
        raw["operationId"] = json!("");
        assert!(validate(&raw).is_err());

        let mut raw = valid_raw();
        raw["operationId"] = json!(7);
        assert!(validate(&raw).is_err());
    }

    #[test]
    fn test_rejects_non_object_data_and_metadata() {
        let mut raw = valid_raw();
        raw["data"] = json!("text");
        assert!(validate(&raw).is_err());

        let mut raw = valid_raw();
        raw["metadata"] = json!([1, 2]);
        assert!(validate(&raw).is_err());

        let mut raw = valid_raw();
        raw["data"] = Value::Null;
        assert!(validate(&raw).is_ok());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let mut raw = valid_raw();
        raw["surprise"] = json!(true);
        assert!(matches!(validate(&raw), Err(EventError::Schema(_))));
    }

    #[test]
    fn test_typed_event_validation() {
        let event = Event::new(EventType::ExportStarted, "  ");
        assert!(validate_event(&event).is_err());

        let event = Event::new(EventType::ExportStarted, "exp-1").with_data(json!(3));
        assert!(validate_event(&event).is_err());

        let event = Event::new(EventType::ExportStarted, "exp-1").with_data(json!({}));
        assert!(validate_event(&event).is_ok());
    }
}
