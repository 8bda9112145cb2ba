//! Condition management helpers following Kubernetes API conventions

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::Condition;

/// Condition types reported on `Ipfs` and `CircuitRelay` status
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_WORKLOAD_READY: &str = "WorkloadReady";
pub const CONDITION_TYPE_RELAY_BOUND: &str = "RelayBound";
pub const CONDITION_TYPE_FOLLOWS_SYNCED: &str = "FollowsSynced";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";
pub const CONDITION_TYPE_ADDRESS_RESOLVED: &str = "AddressResolved";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Stable reason codes
pub const REASON_NODE_READY: &str = "NodeReady";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_WORKLOAD_HEALTHY: &str = "WorkloadHealthy";
pub const REASON_WORKLOAD_PROVISIONING: &str = "WorkloadProvisioning";
pub const REASON_WORKLOAD_FAILING: &str = "WorkloadFailing";
pub const REASON_WORKLOAD_ERROR: &str = "WorkloadError";
pub const REASON_RELAYS_BOUND: &str = "RelaysBound";
pub const REASON_RELAYS_NOT_REQUIRED: &str = "RelaysNotRequired";
pub const REASON_RELAYS_PENDING: &str = "RelaysPending";
pub const REASON_RELAY_UNAVAILABLE: &str = "RelayUnavailable";
pub const REASON_FOLLOWS_SYNCED: &str = "FollowsSynced";
pub const REASON_FOLLOWS_PARTIAL: &str = "FollowsPartiallySynced";
pub const REASON_FOLLOWS_FAILED: &str = "FollowsFailed";
pub const REASON_NO_FOLLOWS: &str = "NoFollows";
pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";
pub const REASON_NO_ISSUES: &str = "NoIssues";
pub const REASON_ADDRESS_PUBLISHED: &str = "AddressPublished";
pub const REASON_AWAITING_ADDRESS: &str = "AwaitingAddress";

fn format_time(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Update or add a condition to the conditions list
///
/// A new type is appended. An existing entry whose status changes gets
/// `now` as its transition time. An entry whose status is unchanged only
/// has its reason and message refreshed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.status = status.to_string();
            existing.last_transition_time = format_time(now);
        }
        existing.reason = reason.to_string();
        existing.message = message.to_string();
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: format_time(now),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        });
    }
}

/// Boolean shorthand for [`set_condition`]
pub fn set_condition_bool(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let status = if status {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    set_condition(conditions, type_, status, reason, message, now);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Stamp every condition with the generation it was computed from
pub fn set_observed_generation(conditions: &mut [Condition], generation: Option<i64>) {
    for condition in conditions {
        condition.observed_generation = generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "AllHealthy",
            "All checks passed",
            t(0),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_eq!(conditions[0].last_transition_time, format_time(t(0)));
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition_bool(&mut conditions, CONDITION_TYPE_RELAY_BOUND, false, "A", "first", t(0));
        set_condition_bool(&mut conditions, CONDITION_TYPE_RELAY_BOUND, false, "B", "second", t(30));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, format_time(t(0)));
        assert_eq!(conditions[0].reason, "B");
        assert_eq!(conditions[0].message, "second");
    }

    #[test]
    fn test_status_change_moves_transition_time() {
        let mut conditions = Vec::new();
        set_condition_bool(&mut conditions, CONDITION_TYPE_READY, false, "NotYet", "", t(0));
        set_condition_bool(&mut conditions, CONDITION_TYPE_READY, true, "Healthy", "", t(45));

        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_eq!(conditions[0].last_transition_time, format_time(t(45)));
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut conditions = Vec::new();
        for type_ in [
            CONDITION_TYPE_WORKLOAD_READY,
            CONDITION_TYPE_RELAY_BOUND,
            CONDITION_TYPE_READY,
        ] {
            set_condition(&mut conditions, type_, CONDITION_STATUS_UNKNOWN, "Init", "", t(0));
        }
        set_condition_bool(&mut conditions, CONDITION_TYPE_RELAY_BOUND, true, "Bound", "", t(1));

        let order: Vec<_> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(
            order,
            vec![
                CONDITION_TYPE_WORKLOAD_READY,
                CONDITION_TYPE_RELAY_BOUND,
                CONDITION_TYPE_READY
            ]
        );
    }

    #[test]
    fn test_find_and_remove() {
        let mut conditions = Vec::new();
        set_condition_bool(&mut conditions, CONDITION_TYPE_READY, true, "Healthy", "", t(0));
        set_condition_bool(&mut conditions, CONDITION_TYPE_DEGRADED, false, REASON_NO_ISSUES, "", t(0));

        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
        assert!(find_condition(&conditions, CONDITION_TYPE_FOLLOWS_SYNCED).is_none());

        remove_condition(&mut conditions, CONDITION_TYPE_DEGRADED);
        assert!(find_condition(&conditions, CONDITION_TYPE_DEGRADED).is_none());
        assert_eq!(conditions.len(), 1);
    }
}
