//! Readiness and skip propagation over a job graph.
//!
//! The scheduler is a pure function of the graph, the current job statuses
//! and the clearance state. It never starts anything; it only reports which
//! blocked jobs became ready and which must be skipped.

use std::collections::BTreeMap;

use crate::clearance::ClearanceState;
use crate::graph::{GraphNode, JobGraph};
use crate::run::{JobStatus, SkipReason};

/// A status change proposed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Ready(String),
    Skip { job: String, reason: SkipReason },
}

/// Compute transitions for every blocked job.
///
/// A job is ready exactly when every dependency has succeeded and, if the
/// job requires clearance, the gate passes. A job with a failed or skipped
/// dependency is skipped; walking in topological order lets the skip reach
/// every transitive dependent in a single pass.
pub fn evaluate(
    graph: &JobGraph,
    statuses: &BTreeMap<String, JobStatus>,
    clearance: ClearanceState,
) -> Vec<Transition> {
    let mut view = statuses.clone();
    let mut transitions = Vec::new();

    for name in graph.order() {
        let Some(GraphNode::Job(spec)) = graph.node(name) else {
            continue;
        };
        if view.get(name) != Some(&JobStatus::Blocked) {
            continue;
        }

        let deps = graph.needs(name).cloned().unwrap_or_default();

        let broken = deps.iter().find(|d| {
            matches!(
                view.get(d.as_str()),
                Some(JobStatus::Failed | JobStatus::Skipped)
            )
        });
        if let Some(dep) = broken {
            let reason = SkipReason::DependencyFailed {
                dependency: dep.clone(),
            };
            view.insert(name.clone(), JobStatus::Skipped);
            transitions.push(Transition::Skip {
                job: name.clone(),
                reason,
            });
            continue;
        }

        let deps_done = deps
            .iter()
            .all(|d| view.get(d.as_str()) == Some(&JobStatus::Succeeded));
        let cleared = !spec.requires_clearance() || clearance.passes();

        if deps_done && cleared {
            view.insert(name.clone(), JobStatus::Ready);
            transitions.push(Transition::Ready(name.clone()));
        }
    }

    transitions
}
