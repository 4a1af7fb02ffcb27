//! Decision-trace assembly.
//!
//! Every pipeline stage that touches an item appends exactly one step to
//! its trace. Stages that defer an item stash their steps on the pending
//! item; the classifying stage folds them in front of its own step so the
//! final trace reads in pipeline order.

use crate::types::TraceStep;

/// Append-only builder for an item's decision trace.
#[derive(Debug, Default)]
pub struct TraceBuilder {
    steps: Vec<TraceStep>,
}

impl TraceBuilder {
    /// Start an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Carry forward steps accumulated by earlier stages.
    pub fn extend(&mut self, steps: &[TraceStep]) -> &mut Self {
        self.steps.extend_from_slice(steps);
        self
    }

    /// Append one step.
    pub fn add(&mut self, step: TraceStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Finish the trace.
    pub fn build(self) -> Vec<TraceStep> {
        self.steps
    }
}
