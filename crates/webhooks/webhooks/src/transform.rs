//! Flattening of events into webhook payloads.

use serde_json::{Map, Value};

use dxp_events::{Event, OperationKind};

/// Fields lifted from `data` ahead of the rest.
const PROMOTED_DATA_FIELDS: [&str; 9] = [
    "status",
    "progress",
    "percentComplete",
    "slotUrl",
    "error",
    "message",
    "deploymentId",
    "exportId",
    "downloadId",
];

/// Fields lifted from `metadata` ahead of the rest.
const PROMOTED_METADATA_FIELDS: [&str; 6] = [
    "project",
    "environment",
    "sourceEnvironment",
    "targetEnvironment",
    "operation",
    "user",
];

/// Flattens an event object into a webhook payload.
///
/// `eventType` and `timestamp` come first, `operationId` is renamed to the
/// kind-specific id (`deploymentId`, `exportId` or `downloadId`), and the
/// contents of `data` and `metadata` are lifted to the top level. The first
/// write of a key wins. Already-flat input comes back unchanged. Non-object
/// input is returned as is.
pub fn transform(event: &Value) -> Value {
    let Some(input) = event.as_object() else {
        return event.clone();
    };
    let mut out = Map::new();

    for core in ["eventType", "timestamp"] {
        if let Some(value) = input.get(core) {
            out.insert(core.to_string(), value.clone());
        }
    }

    if let Some(operation_id) = input.get("operationId") {
        let id_key = input
            .get("eventType")
            .and_then(Value::as_str)
            .and_then(|t| t.split_once('.'))
            .and_then(|(prefix, _)| OperationKind::from_prefix(prefix))
            .map(|kind| kind.id_key())
            .unwrap_or("operationId");
        insert_first(&mut out, id_key, operation_id);
    }

    if let Some(Value::Object(data)) = input.get("data") {
        lift(&mut out, data, &PROMOTED_DATA_FIELDS);
    }
    if let Some(Value::Object(metadata)) = input.get("metadata") {
        lift(&mut out, metadata, &PROMOTED_METADATA_FIELDS);
    }

    for (key, value) in input {
        if matches!(key.as_str(), "data" | "metadata" | "operationId") {
            continue;
        }
        insert_first(&mut out, key, value);
    }

    Value::Object(out)
}

/// Flattens a typed event.
pub fn transform_event(event: &Event) -> Value {
    match serde_json::to_value(event) {
        Ok(value) => transform(&value),
        Err(e) => {
            tracing::error!(event_type = %event.event_type, "Failed to serialize event: {}", e);
            Value::Null
        }
    }
}

fn lift(out: &mut Map<String, Value>, source: &Map<String, Value>, promoted: &[&str]) {
    for key in promoted {
        if let Some(value) = source.get(*key) {
            insert_first(out, key, value);
        }
    }
    for (key, value) in source {
        insert_first(out, key, value);
    }
}

fn insert_first(out: &mut Map<String, Value>, key: &str, value: &Value) {
    if !out.contains_key(key) {
        out.insert(key.to_string(), value.clone());
    }
}
