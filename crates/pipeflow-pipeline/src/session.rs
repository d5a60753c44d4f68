use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use pipeflow_types::{Tensor, TensorMap};

use crate::error::{PipelineError, Result};
use crate::metadata::{CollapseDetails, SessionMetadata};

// ── Session State Machine ────────────────────────────────────────────────────

/// Created → Ready → [Deferred ⇄] Executing → Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for inputs from predecessors.
    Created,
    /// Every expected input has arrived.
    Ready,
    /// Execution was attempted but the node's resource was unavailable.
    Deferred,
    /// Handed to the plugin or backend; no further inputs accepted.
    Executing,
    /// Outcome stored; waiting for the scheduler to fetch it.
    Completed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created   => write!(f, "Created"),
            Self::Ready     => write!(f, "Ready"),
            Self::Deferred  => write!(f, "Deferred"),
            Self::Executing => write!(f, "Executing"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

// ── Node Session ─────────────────────────────────────────────────────────────

/// Per-(node, session key) record of collected inputs and execution state.
///
/// Every mutation happens under the owning node's session lock.
#[derive(Debug)]
pub struct NodeSession {
    node: String,
    metadata: SessionMetadata,
    collapse: CollapseDetails,
    /// input name → shard id → tensor.
    inputs: BTreeMap<String, BTreeMap<usize, Tensor>>,
    remaining: usize,
    state: SessionState,
    created_at: Instant,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
    outcome: Option<Result<TensorMap>>,
}

impl NodeSession {
    /// A session expecting `input_count` inputs, each from every collapsed
    /// shard. A session with nothing to wait for starts out `Ready`.
    pub fn new(
        node: impl Into<String>,
        metadata: SessionMetadata,
        collapse: CollapseDetails,
        input_count: usize,
    ) -> Self {
        let remaining = input_count * collapse.total_shards();
        Self {
            node: node.into(),
            metadata,
            collapse,
            inputs: BTreeMap::new(),
            remaining,
            state: if remaining == 0 { SessionState::Ready } else { SessionState::Created },
            created_at: Instant::now(),
            started_at: None,
            elapsed: None,
            outcome: None,
        }
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn collapse(&self) -> &CollapseDetails {
        &self.collapse
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Store one delivered input. Returns `true` when this delivery made the
    /// session ready.
    pub fn set_input(&mut self, input: &str, shard: usize, tensor: Tensor) -> Result<bool> {
        if self.state != SessionState::Created {
            return Err(self.transition_error("accepting inputs"));
        }
        if shard >= self.collapse.total_shards() {
            return Err(PipelineError::Gather {
                node: self.node.clone(),
                reason: format!(
                    "shard {shard} out of range for {} collapsed shards",
                    self.collapse.total_shards()
                ),
            });
        }
        let slots = self.inputs.entry(input.to_string()).or_default();
        if slots.contains_key(&shard) {
            return Err(PipelineError::DuplicateInput {
                node: self.node.clone(),
                input: input.to_string(),
                shard,
            });
        }
        slots.insert(shard, tensor);
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.state = SessionState::Ready;
            return Ok(true);
        }
        Ok(false)
    }

    /// Collected inputs, stacking gathered shards in shard order with the
    /// collapsed shard counts as leading dimensions.
    pub fn take_inputs(&mut self) -> Result<TensorMap> {
        let inputs = std::mem::take(&mut self.inputs);
        if self.collapse.is_empty() {
            return Ok(inputs
                .into_iter()
                .filter_map(|(name, mut slots)| slots.remove(&0).map(|t| (name, t)))
                .collect());
        }
        let total = self.collapse.total_shards();
        let mut out = TensorMap::new();
        for (name, slots) in inputs {
            if slots.len() != total {
                return Err(PipelineError::Gather {
                    node: self.node.clone(),
                    reason: format!("input {name} has {} of {total} shards", slots.len()),
                });
            }
            let shards: Vec<Tensor> = slots.into_values().collect();
            let stacked = Tensor::stack(&shards, &self.collapse.shard_counts).map_err(|e| {
                PipelineError::Gather { node: self.node.clone(), reason: format!("{name}: {e}") }
            })?;
            out.insert(name, stacked);
        }
        Ok(out)
    }

    /// `Ready → Deferred`, or stays `Deferred` on a repeated miss.
    pub fn defer(&mut self) -> Result<()> {
        match self.state {
            SessionState::Ready | SessionState::Deferred => {
                self.state = SessionState::Deferred;
                Ok(())
            }
            _ => Err(self.transition_error("Deferred")),
        }
    }

    /// `Ready | Deferred → Executing`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Ready | SessionState::Deferred => {
                self.state = SessionState::Executing;
                self.started_at = Some(Instant::now());
                Ok(())
            }
            _ => Err(self.transition_error("Executing")),
        }
    }

    /// `Executing → Completed`, storing the execution outcome.
    pub fn complete(&mut self, outcome: Result<TensorMap>) -> Result<()> {
        if self.state != SessionState::Executing {
            return Err(self.transition_error("Completed"));
        }
        self.elapsed = self.started_at.map(|t| t.elapsed());
        self.outcome = Some(outcome);
        self.state = SessionState::Completed;
        Ok(())
    }

    /// The stored outcome. Only valid once `Completed`.
    pub fn take_outcome(&mut self) -> Result<TensorMap> {
        if self.state != SessionState::Completed {
            return Err(self.transition_error("fetching results"));
        }
        self.outcome.take().unwrap_or_else(|| Err(self.transition_error("fetching results")))
    }

    /// Time spent executing, once completed.
    pub fn execution_time(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn transition_error(&self, to: &str) -> PipelineError {
        PipelineError::InvalidTransition {
            node: format!("{} [{}]", self.node, self.metadata.session_key()),
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn scalar(v: f32) -> Tensor {
        Tensor::from_f32(vec![1], &[v]).unwrap()
    }

    fn plain(inputs: usize) -> NodeSession {
        NodeSession::new("n", SessionMetadata::new("req"), CollapseDetails::default(), inputs)
    }

    #[test]
    fn ready_after_last_input() {
        let mut s = plain(2);
        assert_eq!(s.state(), SessionState::Created);
        assert!(!s.set_input("a", 0, scalar(1.0)).unwrap());
        assert_eq!(s.remaining(), 1);
        assert!(s.set_input("b", 0, scalar(2.0)).unwrap());
        assert!(s.is_ready());
        let inputs = s.take_inputs().unwrap();
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn no_inputs_means_ready() {
        assert!(plain(0).is_ready());
    }

    #[test]
    fn duplicate_delivery_rejected() {
        let mut s = plain(2);
        s.set_input("a", 0, scalar(1.0)).unwrap();
        let err = s.set_input("a", 0, scalar(1.0)).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateInput { .. }));
    }

    #[test]
    fn inputs_refused_once_ready() {
        let mut s = plain(1);
        s.set_input("a", 0, scalar(1.0)).unwrap();
        assert!(matches!(
            s.set_input("b", 0, scalar(1.0)),
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn gather_stacks_in_shard_order() {
        let root = SessionMetadata::new("req");
        let shards = root.generate_subsessions("split", 3).unwrap();
        let gather: BTreeSet<String> = ["split".to_string()].into();
        let (parent, details) = shards[0].collapse(&gather).unwrap();
        let mut s = NodeSession::new("g", parent, details.clone(), 1);
        assert_eq!(s.remaining(), 3);
        for meta in shards.iter().rev() {
            let id = meta.shard_id(&details);
            s.set_input("x", id, scalar(id as f32)).unwrap();
        }
        assert!(s.is_ready());
        let out = s.take_inputs().unwrap();
        assert_eq!(out["x"].shape(), &[3, 1]);
        assert_eq!(out["x"].to_f32_vec().unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn lifecycle_with_deferral() {
        let mut s = plain(0);
        s.defer().unwrap();
        s.defer().unwrap();
        assert_eq!(s.state(), SessionState::Deferred);
        s.start().unwrap();
        assert!(s.start().is_err());
        assert!(s.take_outcome().is_err());
        s.complete(Ok(TensorMap::new())).unwrap();
        assert!(s.execution_time().is_some());
        assert!(s.take_outcome().unwrap().is_empty());
    }
}
