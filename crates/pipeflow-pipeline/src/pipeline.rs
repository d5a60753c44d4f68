//! A loaded pipeline: nodes wired by their connections, ready to serve
//! requests concurrently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pipeflow_plugin::{LibraryRegistry, PluginInstance};
use pipeflow_types::{Mapping, NodeKind, PipelineDefinition, SchedulerConfig, TensorMap, TensorSpec};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::info;
use uuid::Uuid;

use crate::backend::InferenceBackend;
use crate::error::{PipelineError, Result};
use crate::node::{Node, NodeImpl};
use crate::scheduler::PipelineScheduler;

/// A downstream node and the mapping of one connection into it.
#[derive(Debug)]
pub struct Dependant {
    pub node: Arc<Node>,
    pub mapping: Vec<Mapping>,
}

/// Result of one request.
#[derive(Debug)]
pub struct RequestOutcome {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outputs: TensorMap,
}

pub struct Pipeline {
    name: String,
    order: Vec<Arc<Node>>,
    nodes: HashMap<String, Arc<Node>>,
    entry: Arc<Node>,
    dependants: HashMap<String, Vec<Dependant>>,
    config: SchedulerConfig,
    workers: Option<ThreadPool>,
}

impl Pipeline {
    /// Assemble a pipeline, initializing one plugin instance per custom node
    /// and resolving every model on `backend`.
    pub fn build(
        definition: &PipelineDefinition,
        libraries: &LibraryRegistry,
        backend: &dyn InferenceBackend,
    ) -> Result<Self> {
        definition.check()?;
        check_acyclic(definition)?;

        let entry_name = definition.entry()?.name.clone();
        let mut order = Vec::with_capacity(definition.nodes.len());
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for def in &definition.nodes {
            let input_count = definition.input_count(&def.name);
            if def.name != entry_name && input_count == 0 {
                return Err(PipelineError::Structure(format!(
                    "node '{}' has no inputs and would never run",
                    def.name
                )));
            }
            let kind = match &def.kind {
                NodeKind::Entry => NodeImpl::Entry,
                NodeKind::Exit => NodeImpl::Exit,
                NodeKind::Model { model_name } => NodeImpl::Model(backend.model(model_name)?),
                NodeKind::Custom { library, params } => {
                    let library = libraries.get(library)?;
                    NodeImpl::Custom(Arc::new(PluginInstance::initialize(&def.name, library, params)?))
                }
            };
            let node = Arc::new(Node::new(
                def.name.clone(),
                kind,
                def.demultiply_count,
                def.gather_from.clone(),
                input_count,
            ));
            order.push(Arc::clone(&node));
            nodes.insert(def.name.clone(), node);
        }

        let mut dependants: HashMap<String, Vec<Dependant>> = HashMap::new();
        for conn in &definition.connections {
            let to = nodes.get(&conn.to).ok_or_else(|| {
                PipelineError::Structure(format!("unknown node '{}'", conn.to))
            })?;
            dependants.entry(conn.from.clone()).or_default().push(Dependant {
                node: Arc::clone(to),
                mapping: conn.mapping.clone(),
            });
        }

        let entry = nodes
            .get(&entry_name)
            .cloned()
            .ok_or_else(|| PipelineError::Structure("missing entry node".into()))?;

        let config = definition.scheduler.clone();
        let workers = match config.custom_node_workers {
            0 => None,
            n => Some(
                ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("pipeflow-custom-{i}"))
                    .build()
                    .map_err(|e| PipelineError::Structure(format!("custom node workers: {e}")))?,
            ),
        };

        info!(
            pipeline = %definition.name,
            nodes = order.len(),
            connections = definition.connections.len(),
            custom_workers = config.custom_node_workers,
            "pipeline loaded"
        );

        Ok(Self {
            name: definition.name.clone(),
            order,
            nodes,
            entry,
            dependants,
            config,
            workers,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.order
    }

    pub fn entry_node(&self) -> &Arc<Node> {
        &self.entry
    }

    pub fn dependants(&self, node: &str) -> &[Dependant] {
        self.dependants.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn workers(&self) -> Option<&ThreadPool> {
        self.workers.as_ref()
    }

    /// Sessions held across all nodes and requests.
    pub fn in_flight_sessions(&self) -> usize {
        self.order.iter().map(|n| n.session_count()).sum()
    }

    // ── Requests ─────────────────────────────────────────────────────────

    /// Run one request. Safe to call from many threads at once.
    pub fn execute(&self, inputs: TensorMap) -> Result<RequestOutcome> {
        let request_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = PipelineScheduler::new(self, &request_id, inputs).run();
        let elapsed = clock.elapsed();
        let outputs = result?;
        info!(
            pipeline = %self.name,
            request_id = %request_id,
            elapsed_us = elapsed.as_micros() as u64,
            outputs = outputs.len(),
            "request completed"
        );
        Ok(RequestOutcome { request_id, started_at, elapsed, outputs })
    }

    /// Reconfigure a custom node in place. Requests in flight keep running;
    /// buffers they already hold stay valid.
    pub fn reload_node_params(&self, node: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let plugin = self.custom_plugin(node)?;
        plugin.reconfigure(params)?;
        info!(pipeline = %self.name, node = %node, params = params.len(), "node parameters reloaded");
        Ok(())
    }

    /// Declared input and output tensors of a custom node.
    pub fn node_info(&self, node: &str) -> Result<(Vec<TensorSpec>, Vec<TensorSpec>)> {
        let plugin = self.custom_plugin(node)?;
        Ok((plugin.inputs_info()?, plugin.outputs_info()?))
    }

    pub(crate) fn purge_request(&self, request_id: &str) -> usize {
        self.order.iter().map(|n| n.purge_request(request_id)).sum()
    }

    fn custom_plugin(&self, node: &str) -> Result<&Arc<dyn pipeflow_plugin::NodePlugin>> {
        let found = self
            .nodes
            .get(node)
            .ok_or_else(|| PipelineError::Structure(format!("unknown node '{node}'")))?;
        found
            .plugin()
            .ok_or_else(|| PipelineError::Structure(format!("node '{node}' is not a custom node")))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("nodes", &self.order.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

/// Reject definitions whose connections form a cycle (Kahn's algorithm).
fn check_acyclic(definition: &PipelineDefinition) -> Result<()> {
    let mut indegree: HashMap<&str, usize> =
        definition.nodes.iter().map(|n| (n.name.as_str(), 0)).collect();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &definition.connections {
        edges.entry(conn.from.as_str()).or_default().push(conn.to.as_str());
        *indegree.entry(conn.to.as_str()).or_default() += 1;
    }
    let mut queue: VecDeque<&str> =
        indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
    let mut visited = 0;
    while let Some(name) = queue.pop_front() {
        visited += 1;
        for next in edges.get(name).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
    }
    if visited != indegree.len() {
        return Err(PipelineError::Structure("connections form a cycle".into()));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    const ADD_ONE: &str = r#"{
        "name": "add_one",
        "nodes": [
            { "name": "request", "kind": { "type": "entry" } },
            { "name": "add", "kind": { "type": "custom", "library": "add_sub",
                                       "params": { "add_number": "1" } } },
            { "name": "response", "kind": { "type": "exit" } }
        ],
        "connections": [
            { "from": "request", "to": "add",
              "mapping": [ { "output": "in", "input": "input_numbers" } ] },
            { "from": "add", "to": "response",
              "mapping": [ { "output": "output_numbers", "input": "out" } ] }
        ]
    }"#;

    fn build(json: &str) -> Result<Pipeline> {
        let def = PipelineDefinition::from_json(json)?;
        Pipeline::build(&def, &LibraryRegistry::with_builtins(), &LocalBackend::default())
    }

    #[test]
    fn builds_and_wires_nodes() {
        let pipeline = build(ADD_ONE).unwrap();
        assert_eq!(pipeline.name(), "add_one");
        assert_eq!(pipeline.nodes().len(), 3);
        assert_eq!(pipeline.entry_node().name(), "request");
        let deps = pipeline.dependants("request");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].node.name(), "add");
        assert!(pipeline.dependants("response").is_empty());
        assert_eq!(pipeline.node("add").unwrap().input_count(), 1);
    }

    #[test]
    fn cycle_rejected() {
        let json = ADD_ONE.replace(
            r#""connections": ["#,
            r#""connections": [
            { "from": "add", "to": "add",
              "mapping": [ { "output": "output_numbers", "input": "loop" } ] },"#,
        );
        assert!(matches!(build(&json), Err(PipelineError::Structure(_))));
    }

    #[test]
    fn unknown_library_fails_load() {
        let json = ADD_ONE.replace(r#""library": "add_sub""#, r#""library": "missing""#);
        assert!(matches!(build(&json), Err(PipelineError::Plugin(_))));
    }

    #[test]
    fn unknown_model_fails_load() {
        let json = r#"{
            "name": "classify",
            "nodes": [
                { "name": "request", "kind": { "type": "entry" } },
                { "name": "net", "kind": { "type": "model", "model_name": "resnet" } },
                { "name": "response", "kind": { "type": "exit" } }
            ],
            "connections": [
                { "from": "request", "to": "net", "mapping": [ { "output": "in", "input": "x" } ] },
                { "from": "net", "to": "response", "mapping": [ { "output": "y", "input": "out" } ] }
            ]
        }"#;
        assert!(matches!(build(json), Err(PipelineError::UnknownModel(name)) if name == "resnet"));
    }

    #[test]
    fn node_info_and_reload() {
        let pipeline = build(ADD_ONE).unwrap();
        let (inputs, outputs) = pipeline.node_info("add").unwrap();
        assert_eq!(inputs[0].name, "input_numbers");
        assert_eq!(outputs[0].name, "output_numbers");
        let params = BTreeMap::from([("add_number".to_string(), "5".to_string())]);
        pipeline.reload_node_params("add", &params).unwrap();
        assert!(pipeline.reload_node_params("response", &params).is_err());
        assert!(pipeline.node_info("nope").is_err());
    }
}
