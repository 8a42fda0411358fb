//! Workflow projection: where a patient stands, derived from which stage
//! records exist.
//!
//! Nothing here is stored. The state is recomputed on every read from a
//! snapshot of the patient's stage kinds, so it cannot drift from the
//! records themselves.
//!
//! Stages form a strict prefix: Assessment → Authorization →
//! ProcedureExecution → FollowUp. The current stage is the first one
//! without a record. Records past that gap are an anomaly, reported on the
//! state rather than raised as an error.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{NextAction, StageKind, StageSet};

/// Stage records that exist beyond the first missing stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAnomaly {
    /// First stage in order without a record.
    pub gap: StageKind,
    /// Stages recorded after the gap, in workflow order.
    pub out_of_order: Vec<StageKind>,
}

impl std::fmt::Display for WorkflowAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let beyond: Vec<&str> = self.out_of_order.iter().map(|k| k.as_str()).collect();
        write!(
            f,
            "{} recorded while {} is missing",
            beyond.join(", "),
            self.gap
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// `None` once all four stages are recorded.
    pub current_stage: Option<StageKind>,
    pub completed_stages: BTreeSet<StageKind>,
    pub next_action: NextAction,
    /// Set when the workflow is inconsistent.
    pub anomaly: Option<WorkflowAnomaly>,
}

impl WorkflowState {
    pub fn is_complete(&self) -> bool {
        self.next_action == NextAction::Complete
    }

    pub fn is_inconsistent(&self) -> bool {
        self.anomaly.is_some()
    }
}

/// Project the workflow state from the set of recorded stage kinds.
pub fn evaluate(completed: &BTreeSet<StageKind>) -> WorkflowState {
    let current_stage = StageKind::ORDER
        .iter()
        .copied()
        .find(|kind| !completed.contains(kind));

    let next_action = current_stage
        .map(|kind| kind.action())
        .unwrap_or(NextAction::Complete);

    let anomaly = current_stage.and_then(|gap| {
        let out_of_order: Vec<StageKind> = completed
            .iter()
            .copied()
            .filter(|kind| *kind > gap)
            .collect();
        (!out_of_order.is_empty()).then_some(WorkflowAnomaly { gap, out_of_order })
    });

    WorkflowState {
        current_stage,
        completed_stages: completed.clone(),
        next_action,
        anomaly,
    }
}

/// Convenience over a loaded stage snapshot.
pub fn evaluate_stages(stages: &StageSet) -> WorkflowState {
    evaluate(&stages.kinds())
}
