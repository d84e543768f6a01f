//! Semantic validation of planning-agent output.
//!
//! Validation never rejects a plan. It reports warnings for suspicious
//! tasks and errors for dependencies it had to drop, and returns tasks
//! whose `depends_on` graph is guaranteed acyclic.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::agents::TaskProposal;
use crate::storage::Task;

/// Inclusive priority bounds.
pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 100;

/// Non-blocking findings from semantic validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Convert proposals into tasks of `plan_id`, resolving and checking dependencies.
pub fn validate_proposals(plan_id: &str, proposals: Vec<TaskProposal>) -> (Vec<Task>, ValidationReport) {
    let mut report = ValidationReport::default();

    let mut seen_titles: HashSet<String> = HashSet::new();
    let mut title_index: HashMap<String, usize> = HashMap::new();
    for (i, proposal) in proposals.iter().enumerate() {
        let key = proposal.title.trim().to_lowercase();
        if !seen_titles.insert(key.clone()) {
            report
                .warnings
                .push(format!("Duplicate task title '{}'", proposal.title.trim()));
        }
        title_index.entry(key).or_insert(i);
    }

    let total = proposals.len();
    let mut tasks: Vec<Task> = Vec::with_capacity(total);
    let mut wanted: Vec<Vec<usize>> = Vec::with_capacity(proposals.len());

    for (i, proposal) in proposals.into_iter().enumerate() {
        let title = proposal.title.trim().to_string();

        if proposal.acceptance_criteria.iter().all(|c| c.trim().is_empty()) {
            report
                .warnings
                .push(format!("Task '{}' has no acceptance criteria", title));
        }

        let priority = proposal.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        if priority != proposal.priority {
            report.warnings.push(format!(
                "Task '{}' priority {} is outside {}..={}; clamped to {}",
                title, proposal.priority, MIN_PRIORITY, MAX_PRIORITY, priority
            ));
        }

        let mut deps: Vec<usize> = Vec::new();
        for reference in &proposal.depends_on {
            match resolve_reference(reference, &title_index, total) {
                Some(target) if target == i => report
                    .errors
                    .push(format!("Task '{}' depends on itself; dependency dropped", title)),
                Some(target) => {
                    if !deps.contains(&target) {
                        deps.push(target);
                    }
                }
                None => report.warnings.push(format!(
                    "Task '{}' depends on unknown task '{}'; dependency dropped",
                    title,
                    reference.trim()
                )),
            }
        }
        wanted.push(deps);

        let mut task = Task::new(plan_id, title)
            .with_description(proposal.description.trim())
            .with_priority(priority as i32)
            .with_acceptance_criteria(clean(proposal.acceptance_criteria));
        task.assigned_agent = proposal.assigned_agent.filter(|a| !a.trim().is_empty());
        task.validation_steps = clean(proposal.validation_steps);
        task.scope = proposal.scope.filter(|s| !s.trim().is_empty());
        task.keywords = clean(proposal.keywords);
        task.suggested_recall_queries = clean(proposal.suggested_recall_queries);
        tasks.push(task);
    }

    // Add edges in proposal order; an edge that would close a cycle is dropped.
    let mut accepted: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (from, deps) in wanted.iter().enumerate() {
        for &to in deps {
            if reaches(&accepted, to, from) {
                report.errors.push(format!(
                    "Dependency '{}' -> '{}' would create a cycle; dependency dropped",
                    tasks[from].title, tasks[to].title
                ));
            } else {
                accepted[from].push(to);
            }
        }
    }

    for (from, deps) in accepted.iter().enumerate() {
        let ids = deps.iter().map(|&to| tasks[to].id.clone()).collect();
        tasks[from].depends_on = ids;
    }

    (tasks, report)
}

/// A title (case-insensitive) or a 1-based position.
fn resolve_reference(
    reference: &str,
    title_index: &HashMap<String, usize>,
    total: usize,
) -> Option<usize> {
    let key = reference.trim().to_lowercase();
    if let Some(&index) = title_index.get(&key) {
        return Some(index);
    }
    match key.trim_start_matches('#').parse::<usize>() {
        Ok(position) if (1..=total).contains(&position) => Some(position - 1),
        _ => None,
    }
}

/// Whether `target` is reachable from `start` along accepted dependency edges.
fn reaches(edges: &[Vec<usize>], start: usize, target: usize) -> bool {
    let mut stack = vec![start];
    let mut visited = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if visited.insert(node) {
            stack.extend(edges[node].iter().copied());
        }
    }
    false
}

fn clean(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::validate_task_graph;

    fn proposal(title: &str, deps: &[&str]) -> TaskProposal {
        TaskProposal::new(title)
            .with_depends_on(deps)
            .with_acceptance_criteria(&["works"])
    }

    #[test]
    fn test_chain_is_preserved() {
        let (tasks, report) = validate_proposals(
            "p",
            vec![proposal("A", &[]), proposal("B", &["A"]), proposal("C", &["b"])],
        );
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(tasks[1].depends_on, vec![tasks[0].id.clone()]);
        assert_eq!(tasks[2].depends_on, vec![tasks[1].id.clone()]);
        assert!(tasks.iter().all(|t| t.plan_id == "p"));
    }

    #[test]
    fn test_cycle_edge_is_dropped() {
        let (tasks, report) =
            validate_proposals("p", vec![proposal("A", &["B"]), proposal("B", &["A"])]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("cycle"));
        assert_eq!(tasks[0].depends_on, vec![tasks[1].id.clone()]);
        assert!(tasks[1].depends_on.is_empty());
        assert!(validate_task_graph(&tasks).is_ok());
    }

    #[test]
    fn test_self_dependency_is_an_error() {
        let (tasks, report) = validate_proposals("p", vec![proposal("A", &["A"])]);
        assert_eq!(report.errors.len(), 1);
        assert!(tasks[0].depends_on.is_empty());
    }

    #[test]
    fn test_positions_resolve() {
        let (tasks, report) =
            validate_proposals("p", vec![proposal("A", &[]), proposal("B", &["1"])]);
        assert!(report.errors.is_empty());
        assert_eq!(tasks[1].depends_on, vec![tasks[0].id.clone()]);
    }

    #[test]
    fn test_warnings() {
        let mut loud = proposal("A", &["ghost"]);
        loud.priority = 250;
        let bare = TaskProposal::new("a");
        let (tasks, report) = validate_proposals("p", vec![loud, bare]);

        assert_eq!(tasks[0].priority, 100);
        assert!(report.warnings.iter().any(|w| w.contains("Duplicate task title")));
        assert!(report.warnings.iter().any(|w| w.contains("no acceptance criteria")));
        assert!(report.warnings.iter().any(|w| w.contains("clamped to 100")));
        assert!(report.warnings.iter().any(|w| w.contains("unknown task 'ghost'")));
        assert!(report.errors.is_empty());
    }
}
