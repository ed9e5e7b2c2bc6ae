//! Claim eligibility and ordering for the task queue.
//!
//! A task is eligible for a manager when it is available, every required
//! program is offered (with a version match when the requirement pins one),
//! and one of the manager's tags matches the task's compute tag (`*` serves
//! any tag).
//!
//! Claim order honors the manager's tag preference: tags are tried in the
//! order given, with `*` picking up everything not already taken by an
//! earlier explicit tag. Within a tag, higher priority wins, then earlier
//! submission, then lower id.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use models::Id;

use crate::store::TaskRow;

pub const WILDCARD_TAG: &str = "*";

/// Program/version requirement check: every required program must be
/// offered; a pinned version must match the offered version exactly.
pub fn programs_satisfied(
    required: &BTreeMap<String, Option<String>>,
    offered: &BTreeMap<String, Option<String>>,
) -> bool {
    required.iter().all(|(program, requirement)| {
        match (offered.get(program), requirement) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(offer), Some(version)) => offer.as_deref() == Some(version.as_str()),
        }
    })
}

fn claim_order(a: &TaskRow, b: &TaskRow) -> Ordering {
    b.compute_priority
        .cmp(&a.compute_priority)
        .then(a.created_on.cmp(&b.created_on))
        .then(a.id.cmp(&b.id))
}

/// Select up to `limit` task ids from `candidates` (already filtered for
/// availability and program eligibility) in claim order for `tags`.
pub fn select_for_claim(candidates: &[TaskRow], tags: &[String], limit: usize) -> Vec<Id> {
    let mut chosen: Vec<Id> = Vec::new();

    for tag in tags {
        if chosen.len() >= limit {
            break;
        }

        let mut matched: Vec<&TaskRow> = candidates
            .iter()
            .filter(|t| !chosen.contains(&t.id))
            .filter(|t| tag == WILDCARD_TAG || t.compute_tag == *tag)
            .collect();
        matched.sort_by(|a, b| claim_order(a, b));

        for task in matched {
            if chosen.len() >= limit {
                break;
            }
            chosen.push(task.id);
        }
    }

    chosen
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{Duration, Utc};
    use models::{ComputePriority, TaskSpec};

    fn programs(names: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        names
            .iter()
            .map(|(n, v)| (n.to_string(), v.map(String::from)))
            .collect()
    }

    fn task(id: i64, tag: &str, priority: ComputePriority, age_secs: i64) -> TaskRow {
        TaskRow {
            id: Id(id),
            record_id: Id(id + 100),
            spec: TaskSpec::compute(serde_json::json!({}), "psi4"),
            required_programs: programs(&[("psi4", None)]),
            compute_tag: tag.to_string(),
            compute_priority: priority,
            available: true,
            created_on: Utc::now() - Duration::seconds(1000 - age_secs),
        }
    }

    #[test]
    fn program_subset_and_version_match() {
        let offered = programs(&[("psi4", None), ("geometric", Some("v3.0"))]);

        assert!(programs_satisfied(&programs(&[("psi4", None)]), &offered));
        assert!(programs_satisfied(
            &programs(&[("psi4", None), ("geometric", None)]),
            &offered
        ));
        assert!(programs_satisfied(
            &programs(&[("geometric", Some("v3.0"))]),
            &offered
        ));
        assert!(!programs_satisfied(
            &programs(&[("geometric", Some("v4.0"))]),
            &offered
        ));
        assert!(!programs_satisfied(&programs(&[("rdkit", None)]), &offered));
    }

    #[test]
    fn priority_then_age_within_a_tag() {
        let tasks = vec![
            task(1, "tag1", ComputePriority::Low, 0),
            task(2, "tag1", ComputePriority::Normal, 1),
            task(3, "tag1", ComputePriority::High, 2),
            task(4, "tag1", ComputePriority::Normal, 3),
            task(5, "tag1", ComputePriority::High, 4),
        ];
        let order = select_for_claim(&tasks, &["tag1".to_string()], 10);
        assert_eq!(order, vec![Id(3), Id(5), Id(2), Id(4), Id(1)]);
    }

    #[test]
    fn explicit_tags_win_over_wildcard() {
        let tasks = vec![
            task(1, "tag1", ComputePriority::Normal, 0),
            task(2, "tag2", ComputePriority::High, 1),
            task(3, "tag3", ComputePriority::Normal, 2),
        ];
        let tags = vec!["tag3".to_string(), "*".to_string()];

        let order = select_for_claim(&tasks, &tags, 3);
        // tag3 first despite lower priority, then remaining in claim order.
        assert_eq!(order, vec![Id(3), Id(2), Id(1)]);
    }

    #[test]
    fn limit_cuts_across_tag_groups() {
        let tasks = vec![
            task(1, "tag1", ComputePriority::Normal, 0),
            task(2, "tag2", ComputePriority::Normal, 1),
            task(3, "tag3", ComputePriority::Normal, 2),
        ];
        let tags = vec!["tag3".to_string(), "*".to_string()];
        assert_eq!(select_for_claim(&tasks, &tags, 2), vec![Id(3), Id(1)]);
    }

    #[test]
    fn wildcard_task_tag_is_ordinary() {
        // A task whose tag is literally `*` is only matched by a manager
        // wildcard, not by explicit tags.
        let tasks = vec![task(1, "*", ComputePriority::Normal, 0)];
        assert_eq!(
            select_for_claim(&tasks, &["tag1".to_string()], 5),
            Vec::<Id>::new()
        );
        assert_eq!(
            select_for_claim(&tasks, &["*".to_string()], 5),
            vec![Id(1)]
        );
    }
}
