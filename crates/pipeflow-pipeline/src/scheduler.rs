//! Per-request event loop.
//!
//! ```text
//! Pending ──run──▶ Running ──first error──▶ Draining ──started == finished──▶ Done
//!                     └──────────────started == finished─────────────────────▶ Done
//! ```
//!
//! The loop waits on the completion queue with a bounded timeout. Each event
//! fetches the finished session's results, routes them to the dependants and
//! starts whatever became ready. Sessions whose node had no execution slot
//! are parked on a deferred list and retried, oldest first, whenever no new
//! completion is waiting. After the first error nothing new is started:
//! in-flight sessions run out and deferred ones are disarmed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread;

use pipeflow_types::TensorMap;
use tracing::{debug, error};

use crate::completion::{CompletionQueue, SessionEvent};
use crate::error::{PipelineError, Result};
use crate::metadata::SessionMetadata;
use crate::node::{ExecuteStatus, ExecutionContext, Node};
use crate::pipeline::Pipeline;

// ── Scheduler State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created; the entry session has not been started.
    Pending,
    /// Routing results and starting ready sessions.
    Running,
    /// A session failed; waiting for in-flight work to finish.
    Draining,
    /// Every started session is accounted for.
    Done,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending  => write!(f, "Pending"),
            Self::Running  => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Done     => write!(f, "Done"),
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct PipelineScheduler<'p> {
    pipeline: &'p Pipeline,
    root: SessionMetadata,
    inputs: TensorMap,
    completions: CompletionQueue,
    state: SchedulerState,
    started: usize,
    finished: usize,
    deferred: VecDeque<(Arc<Node>, String)>,
    first_error: Option<PipelineError>,
    response: TensorMap,
}

impl<'p> PipelineScheduler<'p> {
    pub fn new(pipeline: &'p Pipeline, request_id: &str, inputs: TensorMap) -> Self {
        Self {
            pipeline,
            root: SessionMetadata::new(request_id),
            inputs,
            completions: CompletionQueue::new(),
            state: SchedulerState::Pending,
            started: 0,
            finished: 0,
            deferred: VecDeque::new(),
            first_error: None,
            response: TensorMap::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Drive the request to completion and return the response outputs, or
    /// the first error any session hit.
    pub fn run(mut self) -> Result<TensorMap> {
        self.state = SchedulerState::Running;

        let entry = Arc::clone(self.pipeline.entry_node());
        match entry.get_or_create_session(&self.root) {
            Ok(key) => self.start(&entry, key),
            Err(e) => self.fail(e),
        }

        let wait = self.pipeline.config().completion_wait();
        while self.started != self.finished {
            if self.state == SchedulerState::Draining && !self.deferred.is_empty() {
                self.disarm_deferred();
                continue;
            }
            match self.completions.pop_timeout(wait) {
                Some(event) => {
                    self.on_completion(event);
                    self.retry_deferred();
                }
                None => self.retry_deferred(),
            }
        }

        let leftover = self.pipeline.purge_request(self.root.request_id());
        if leftover > 0 {
            debug!(
                pipeline = %self.pipeline.name(),
                request_id = %self.root.request_id(),
                sessions = leftover,
                "dropped sessions that never became ready"
            );
        }
        self.state = SchedulerState::Done;
        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(std::mem::take(&mut self.response)),
        }
    }

    // ── Events ───────────────────────────────────────────────────────────

    fn on_completion(&mut self, event: SessionEvent) {
        self.finished += 1;
        let pipeline = self.pipeline;
        let Some(node) = pipeline.node(&event.node) else {
            self.fail(PipelineError::Structure(format!(
                "completion for unknown node '{}'",
                event.node
            )));
            return;
        };
        let results = node.fetch_results(&event.key, pipeline.config());
        if self.state != SchedulerState::Running {
            if let Err(e) = results {
                debug!(node = %node.name(), session = %event.key, error = %e, "failure while draining");
            }
            return;
        }
        let results = match results {
            Ok(results) => results,
            Err(e) => return self.fail(e),
        };

        if node.is_exit() {
            for (_, outputs) in results {
                for (name, tensor) in outputs {
                    if self.response.contains_key(&name) {
                        return self.fail(PipelineError::DuplicateResponseOutput(name));
                    }
                    self.response.insert(name, tensor);
                }
            }
            return;
        }

        let mut ready = Vec::new();
        for (metadata, outputs) in &results {
            for dependant in pipeline.dependants(node.name()) {
                match dependant.node.set_inputs(node, metadata, outputs, &dependant.mapping) {
                    Ok(Some(key)) => ready.push((Arc::clone(&dependant.node), key)),
                    Ok(None) => {}
                    Err(e) => return self.fail(e),
                }
            }
        }
        drop(results);
        for (node, key) in ready {
            if self.state != SchedulerState::Running {
                break;
            }
            self.start(&node, key);
        }
    }

    // ── Execution ────────────────────────────────────────────────────────

    fn start(&mut self, node: &Arc<Node>, key: String) {
        self.started += 1;
        self.attempt(node, key);
    }

    fn attempt(&mut self, node: &Arc<Node>, key: String) {
        let ctx = ExecutionContext {
            request_inputs: &self.inputs,
            completions: &self.completions,
            config: self.pipeline.config(),
            workers: self.pipeline.workers(),
        };
        match node.execute(&key, &ctx) {
            Ok(ExecuteStatus::Started) => {}
            Ok(ExecuteStatus::NotReady) => self.deferred.push_back((Arc::clone(node), key)),
            Err(e) => {
                self.finished += 1;
                node.try_disarm(&key);
                self.fail(e);
            }
        }
    }

    /// Retry deferred sessions, oldest first, until one is still blocked
    /// past its turn or a completion arrives.
    fn retry_deferred(&mut self) {
        let pending = self.deferred.len();
        for _ in 0..pending {
            if self.state != SchedulerState::Running || self.completions.has_pending() {
                break;
            }
            let Some((node, key)) = self.deferred.pop_front() else { break };
            self.attempt(&node, key);
        }
    }

    /// Drop deferred sessions without executing them. Sessions whose node
    /// is busy stay listed for the next pass.
    fn disarm_deferred(&mut self) {
        let pending = self.deferred.len();
        for _ in 0..pending {
            let Some((node, key)) = self.deferred.pop_front() else { break };
            if node.try_disarm(&key) {
                self.finished += 1;
                debug!(node = %node.name(), session = %key, "deferred session disarmed");
            } else {
                self.deferred.push_back((node, key));
            }
        }
        if !self.deferred.is_empty() {
            thread::sleep(self.pipeline.config().disarm_backoff());
        }
    }

    fn fail(&mut self, e: PipelineError) {
        if self.first_error.is_none() {
            error!(
                pipeline = %self.pipeline.name(),
                request_id = %self.root.request_id(),
                error = %e,
                in_flight = self.started - self.finished,
                "request failed, draining"
            );
            self.first_error = Some(e);
        } else {
            debug!(error = %e, "further failure while draining");
        }
        self.state = SchedulerState::Draining;
    }
}
