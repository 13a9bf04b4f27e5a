use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Builds a condition stamped with the current time
pub fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation: generation,
    }
}

/// Sets the corresponding condition in conditions to new_condition and returns whether it
/// changed.
///
/// 1. If the condition of the specified type already exists, all fields of the existing condition
///    are updated to new_condition. LastTransitionTime is only bumped when the status flips
/// 2. If a condition of the specified type does not exist, new_condition is appended
pub fn set_status_condition(conditions: &mut Vec<Condition>, new_condition: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new_condition.type_) else {
        conditions.push(new_condition);
        return true;
    };

    let mut changed = false;
    if existing.status != new_condition.status {
        existing.status = new_condition.status;
        existing.last_transition_time = new_condition.last_transition_time;
        changed = true;
    }
    if existing.reason != new_condition.reason {
        existing.reason = new_condition.reason;
        changed = true;
    }
    if existing.message != new_condition.message {
        existing.message = new_condition.message;
        changed = true;
    }
    if existing.observed_generation != new_condition.observed_generation {
        existing.observed_generation = new_condition.observed_generation;
        changed = true;
    }
    changed
}

/// Removes the corresponding condition_type from conditions if present.
pub fn remove_status_condition(conditions: &mut Vec<Condition>, condition_type: &str) -> bool {
    let original_len = conditions.len();
    conditions.retain(|condition| condition.type_ != condition_type);
    conditions.len() != original_len
}

/// Finds the condition_type in conditions.
pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|condition| condition.type_ == condition_type && condition.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_status_condition() {
        let mut conditions = Vec::new();

        let changed = set_status_condition(&mut conditions, condition("Ready", true, "Testing", "ok", Some(1)));
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        let first_transition = conditions[0].last_transition_time.clone();

        // same status, new message: transition time stays
        let changed = set_status_condition(&mut conditions, condition("Ready", true, "Testing", "still ok", Some(1)));
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, first_transition);

        let changed = set_status_condition(&mut conditions, condition("Ready", true, "Testing", "still ok", Some(1)));
        assert!(!changed);

        let changed = set_status_condition(&mut conditions, condition("Ready", false, "Broken", "down", Some(2)));
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert!(!is_status_condition_true(&conditions, "Ready"));
    }

    #[test]
    fn test_remove_status_condition() {
        let mut conditions = vec![condition("DeletionIsBlocked", true, "ObjectHasDependents", "", None)];
        assert!(find_status_condition(&conditions, "DeletionIsBlocked").is_some());
        assert!(remove_status_condition(&mut conditions, "DeletionIsBlocked"));
        assert!(conditions.is_empty());
        assert!(!remove_status_condition(&mut conditions, "DeletionIsBlocked"));
    }
}
