//! Folds new conditions into the status condition list of a forwarder.

use log_forwarder_crd::{Condition, ConditionStatus};

/// Returns the conditions with `condition` applied, and whether it was newly asserted.
///
/// A condition replaces the one of the same type in place. It counts as newly asserted when no
/// condition of its type existed or when the status changed; otherwise the existing transition
/// time is kept.
pub fn apply_condition(
    conditions: &[Condition],
    mut condition: Condition,
) -> (Vec<Condition>, bool) {
    let mut conditions = conditions.to_vec();
    match conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        Some(existing) => {
            let newly_asserted = existing.status != condition.status;
            if !newly_asserted {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
            (conditions, newly_asserted)
        }
        None => {
            conditions.push(condition);
            (conditions, true)
        }
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|condition| condition.status == ConditionStatus::True)
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::DateTime};
    use log_forwarder_crd::{CONDITION_TYPE_COLLECTOR_DEAD_END, CONDITION_TYPE_READY};
    use rstest::rstest;

    use super::*;

    pub(crate) fn at(seconds: i64) -> Time {
        Time(DateTime::from_timestamp(seconds, 0).expect("valid timestamp"))
    }

    #[test]
    fn test_first_condition_is_newly_asserted() {
        let (conditions, newly_asserted) = apply_condition(&[], Condition::ready(at(10)));
        assert!(newly_asserted);
        assert_eq!(conditions, vec![Condition::ready(at(10))]);
        assert!(is_true(&conditions, CONDITION_TYPE_READY));
    }

    #[rstest]
    #[case(ConditionStatus::True, ConditionStatus::True, false)]
    #[case(ConditionStatus::False, ConditionStatus::True, true)]
    #[case(ConditionStatus::Unknown, ConditionStatus::False, true)]
    fn test_replacing_a_condition(
        #[case] before: ConditionStatus,
        #[case] after: ConditionStatus,
        #[case] expect_newly_asserted: bool,
    ) {
        let existing = vec![
            Condition::no_dead_end(at(1)),
            Condition::new(CONDITION_TYPE_READY, before, "", "", at(1)),
        ];
        let (conditions, newly_asserted) = apply_condition(
            &existing,
            Condition::new(CONDITION_TYPE_READY, after.clone(), "", "", at(20)),
        );

        assert_eq!(newly_asserted, expect_newly_asserted);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0], existing[0]);

        let ready = find(&conditions, CONDITION_TYPE_READY).expect("ready condition");
        assert_eq!(ready.status, after);
        let expected_time = if expect_newly_asserted { at(20) } else { at(1) };
        assert_eq!(ready.last_transition_time, Some(expected_time));
    }

    #[test]
    fn test_message_is_updated_without_transition() {
        let existing = vec![Condition::dead_end("output [a] is broken", at(1))];
        let (conditions, newly_asserted) =
            apply_condition(&existing, Condition::dead_end("output [b] is broken", at(5)));

        assert!(!newly_asserted);
        assert_eq!(conditions[0].message, "output [b] is broken");
        assert_eq!(conditions[0].last_transition_time, Some(at(1)));
        assert!(is_true(&conditions, CONDITION_TYPE_COLLECTOR_DEAD_END));
        // the input is left untouched
        assert_eq!(existing[0].message, "output [a] is broken");
    }
}
