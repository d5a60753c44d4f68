//! Pipeline nodes and their per-request sessions.
//!
//! A node keeps one [`NodeSession`] per session key. Inputs arrive through
//! [`Node::set_inputs`]; once the last one lands the scheduler calls
//! [`Node::execute`], and after the completion event it collects the results
//! (fanned out into shards for demultiplexers) with [`Node::fetch_results`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use pipeflow_plugin::NodePlugin;
use pipeflow_types::{DemultiplyCount, Mapping, SchedulerConfig, Tensor, TensorMap};
use rayon::ThreadPool;
use tracing::{debug, warn};

use crate::backend::ModelRunner;
use crate::completion::{CompletionQueue, SessionEvent};
use crate::error::{PipelineError, Result};
use crate::metadata::{CollapseDetails, SessionMetadata};
use crate::session::{NodeSession, SessionState};

/// What runs when a session of the node executes.
pub enum NodeImpl {
    /// Publishes the request inputs as its outputs.
    Entry,
    /// Forwards its inputs; the scheduler turns them into the response.
    Exit,
    Model(Arc<dyn ModelRunner>),
    Custom(Arc<dyn NodePlugin>),
}

impl NodeImpl {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Entry     => "entry",
            Self::Exit      => "exit",
            Self::Model(_)  => "model",
            Self::Custom(_) => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteStatus {
    /// Execution began; a completion event will follow.
    Started,
    /// The node's resource was unavailable; retry later.
    NotReady,
}

/// Request-wide state a node needs while executing.
pub(crate) struct ExecutionContext<'a> {
    pub request_inputs: &'a TensorMap,
    pub completions: &'a CompletionQueue,
    pub config: &'a SchedulerConfig,
    pub workers: Option<&'a ThreadPool>,
}

/// Results of one finished session: a single entry, or one per shard when
/// the node demultiplies.
pub type SessionResults = Vec<(SessionMetadata, TensorMap)>;

pub struct Node {
    name: String,
    kind: NodeImpl,
    demultiply: Option<DemultiplyCount>,
    gather_from: BTreeSet<String>,
    input_count: usize,
    sessions: Mutex<HashMap<String, NodeSession>>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        kind: NodeImpl,
        demultiply: Option<DemultiplyCount>,
        gather_from: BTreeSet<String>,
        input_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            demultiply,
            gather_from,
            input_count,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeImpl {
        &self.kind
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.kind, NodeImpl::Entry)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, NodeImpl::Exit)
    }

    pub fn plugin(&self) -> Option<&Arc<dyn NodePlugin>> {
        match &self.kind {
            NodeImpl::Custom(plugin) => Some(plugin),
            _ => None,
        }
    }

    pub fn demultiply_count(&self) -> Option<DemultiplyCount> {
        self.demultiply
    }

    pub fn gather_from(&self) -> &BTreeSet<String> {
        &self.gather_from
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    /// Sessions currently held, across all requests.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Key of the session that inputs carrying `metadata` belong to,
    /// creating it when absent.
    pub fn get_or_create_session(&self, metadata: &SessionMetadata) -> Result<String> {
        let (parent, collapse, _) = self.locate(metadata)?;
        let key = parent.session_key();
        self.lock()
            .entry(key.clone())
            .or_insert_with(|| self.new_session(&key, parent, collapse));
        Ok(key)
    }

    /// Deliver the outputs of `from` (produced under `metadata`) through
    /// `mapping`. Returns the session key once the session became ready.
    pub fn set_inputs(
        &self,
        from: &Node,
        metadata: &SessionMetadata,
        outputs: &TensorMap,
        mapping: &[Mapping],
    ) -> Result<Option<String>> {
        let (parent, collapse, shard) = self.locate(metadata)?;
        let key = parent.session_key();
        let mut sessions = self.lock();
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| self.new_session(&key, parent, collapse));
        let mut ready = false;
        for m in mapping {
            let tensor = outputs.get(&m.output).ok_or_else(|| {
                if from.is_entry() {
                    PipelineError::MissingRequestInput(m.output.clone())
                } else {
                    PipelineError::MissingOutput {
                        node: from.name.clone(),
                        output: m.output.clone(),
                        consumer: self.name.clone(),
                    }
                }
            })?;
            ready |= session.set_input(&m.input, shard, tensor.clone())?;
        }
        Ok(ready.then_some(key))
    }

    /// Start executing a ready (or deferred) session.
    pub(crate) fn execute(self: &Arc<Self>, key: &str, ctx: &ExecutionContext<'_>) -> Result<ExecuteStatus> {
        match &self.kind {
            NodeImpl::Entry => {
                let mut sessions = self.lock();
                let session = self.session_mut(&mut sessions, key)?;
                session.start()?;
                session.complete(Ok(ctx.request_inputs.clone()))?;
                drop(sessions);
                ctx.completions.push(self.event(key));
            }
            NodeImpl::Exit => {
                let mut sessions = self.lock();
                let session = self.session_mut(&mut sessions, key)?;
                session.start()?;
                let inputs = session.take_inputs();
                session.complete(inputs)?;
                drop(sessions);
                ctx.completions.push(self.event(key));
            }
            NodeImpl::Custom(plugin) => {
                let inputs = {
                    let mut sessions = self.lock();
                    let session = self.session_mut(&mut sessions, key)?;
                    session.start()?;
                    session.take_inputs()
                };
                let node = Arc::clone(self);
                let plugin = Arc::clone(plugin);
                let queue = ctx.completions.clone();
                let key = key.to_string();
                let job = move || {
                    let outcome = inputs.and_then(|i| Ok(plugin.execute(&i)?));
                    node.finish(&key, outcome, &queue);
                };
                match ctx.workers {
                    Some(pool) => pool.spawn(job),
                    None => job(),
                }
            }
            NodeImpl::Model(runner) => {
                let slot = runner.try_acquire(ctx.config.slot_acquire_timeout());
                let mut sessions = self.lock();
                let session = self.session_mut(&mut sessions, key)?;
                let Some(slot) = slot else {
                    session.defer()?;
                    debug!(node = %self.name, session = %key, "no execution slot, deferred");
                    return Ok(ExecuteStatus::NotReady);
                };
                session.start()?;
                let inputs = session.take_inputs();
                drop(sessions);
                match inputs {
                    Ok(inputs) => {
                        let node = Arc::clone(self);
                        let queue = ctx.completions.clone();
                        let key = key.to_string();
                        runner.submit(
                            inputs,
                            slot,
                            Box::new(move |result: std::result::Result<TensorMap, String>| {
                                let outcome = result.map_err(|reason| PipelineError::Inference {
                                    node: node.name.clone(),
                                    reason,
                                });
                                node.finish(&key, outcome, &queue);
                            }),
                        );
                    }
                    Err(e) => {
                        drop(slot);
                        self.finish(key, Err(e), ctx.completions);
                    }
                }
            }
        }
        Ok(ExecuteStatus::Started)
    }

    /// Remove a completed session and hand out its results.
    ///
    /// The session is removed even when execution failed, so a failed
    /// request leaves nothing behind.
    pub fn fetch_results(&self, key: &str, config: &SchedulerConfig) -> Result<SessionResults> {
        let mut session = self
            .lock()
            .remove(key)
            .ok_or_else(|| self.unknown_session(key))?;
        let outputs = session.take_outcome()?;
        debug!(
            node = %self.name,
            session = %key,
            exec_us = session.execution_time().map(|d| d.as_micros() as u64).unwrap_or(0),
            age_us = session.age().as_micros() as u64,
            outputs = outputs.len(),
            "session finished"
        );
        let metadata = session.metadata().clone();
        match self.demultiply {
            None => Ok(vec![(metadata, outputs)]),
            Some(count) => self.demultiply(metadata, outputs, count, config.max_demultiply_shards),
        }
    }

    /// Drop a session that has not started executing. Returns `false` when
    /// the node is busy or the session is executing; retry later.
    pub fn try_disarm(&self, key: &str) -> bool {
        let mut sessions = match self.sessions.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        match sessions.get(key).map(NodeSession::state) {
            Some(SessionState::Executing) | Some(SessionState::Completed) => false,
            _ => {
                sessions.remove(key);
                true
            }
        }
    }

    /// Drop every session of `request_id`. Returns how many were dropped.
    pub fn purge_request(&self, request_id: &str) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.metadata().request_id() != request_id);
        before - sessions.len()
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Session this metadata feeds and the shard slot within it.
    fn locate(&self, metadata: &SessionMetadata) -> Result<(SessionMetadata, CollapseDetails, usize)> {
        let (parent, collapse) = metadata.collapse(&self.gather_from)?;
        let shard = metadata.shard_id(&collapse);
        Ok((parent, collapse, shard))
    }

    fn new_session(&self, key: &str, metadata: SessionMetadata, collapse: CollapseDetails) -> NodeSession {
        debug!(
            node = %self.name,
            session = %key,
            inputs = self.input_count,
            shards = collapse.total_shards(),
            "session created"
        );
        NodeSession::new(self.name.clone(), metadata, collapse, self.input_count)
    }

    /// Store an execution outcome and announce it.
    fn finish(&self, key: &str, outcome: Result<TensorMap>, queue: &CompletionQueue) {
        if let Err(e) = &outcome {
            debug!(node = %self.name, session = %key, error = %e, "execution failed");
        }
        {
            let mut sessions = self.lock();
            match sessions.get_mut(key) {
                Some(session) => {
                    if let Err(e) = session.complete(outcome) {
                        warn!(node = %self.name, session = %key, error = %e, "cannot store outcome");
                    }
                }
                None => warn!(node = %self.name, session = %key, "session vanished before completion"),
            }
        }
        queue.push(self.event(key));
    }

    fn demultiply(
        &self,
        metadata: SessionMetadata,
        outputs: TensorMap,
        count: DemultiplyCount,
        limit: usize,
    ) -> Result<SessionResults> {
        let reject = |reason: String| PipelineError::Demultiply { node: self.name.clone(), reason };
        let first = outputs
            .values()
            .next()
            .ok_or_else(|| reject("node produced no outputs".into()))?;
        let actual = first
            .leading_dim()
            .ok_or_else(|| reject("first output has no dimensions".into()))?;
        if let DemultiplyCount::Fixed(expected) = count {
            if expected != actual {
                return Err(PipelineError::DemultiplyCountMismatch {
                    node: self.name.clone(),
                    expected,
                    actual,
                });
            }
        }
        if actual == 0 {
            return Err(PipelineError::DemultiplyZeroShards { node: self.name.clone() });
        }
        if actual > limit {
            return Err(PipelineError::DemultiplyLimitExceeded {
                node: self.name.clone(),
                actual,
                limit,
            });
        }
        let mut split: Vec<(String, Vec<Tensor>)> = Vec::with_capacity(outputs.len());
        for (name, tensor) in outputs {
            if tensor.leading_dim() != Some(actual) {
                return Err(reject(format!(
                    "output {name} has shape {:?}, expected {actual} shards",
                    tensor.shape()
                )));
            }
            split.push((name, tensor.split_leading()?));
        }
        let children = metadata.generate_subsessions(&self.name, actual)?;
        debug!(node = %self.name, shards = actual, "demultiplied");
        Ok(children
            .into_iter()
            .enumerate()
            .map(|(i, child)| {
                let shard = split.iter().map(|(name, shards)| (name.clone(), shards[i].clone())).collect();
                (child, shard)
            })
            .collect())
    }

    fn session_mut<'s>(
        &self,
        sessions: &'s mut HashMap<String, NodeSession>,
        key: &str,
    ) -> Result<&'s mut NodeSession> {
        sessions.get_mut(key).ok_or_else(|| self.unknown_session(key))
    }

    fn unknown_session(&self, key: &str) -> PipelineError {
        PipelineError::UnknownSession { node: self.name.clone(), key: key.to_string() }
    }

    fn event(&self, key: &str) -> SessionEvent {
        SessionEvent { node: self.name.clone(), key: key.to_string() }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NodeSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("demultiply", &self.demultiply)
            .field("gather_from", &self.gather_from)
            .field("input_count", &self.input_count)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
