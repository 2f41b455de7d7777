//! Subscription pattern matching shared by every bus backend.

/// Checks if an event type matches a subscription pattern.
///
/// Patterns support:
/// - Exact match: "deployment.started"
/// - All events: "*"
/// - Namespace wildcard: "deployment.*" (any type under the `deployment.` prefix)
/// - Literal prefix: "deploy*" (any type starting with `deploy`)
///
/// Anything else does not match.
pub fn matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return event_type.starts_with(prefix);
    }

    false
}
