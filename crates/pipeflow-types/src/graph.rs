// Pipeline definitions.
//
// A definition is the already-validated graph handed over at load time: the
// node list plus the connection map saying which output of which node feeds
// which input of whom. Only light structural checks happen here; shape and
// precision compatibility is the validator's job.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{PipeflowError, Result};

// ── Node Kind ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Publishes the request inputs.
    Entry,
    /// Collects the response outputs.
    Exit,
    /// Runs a model on the inference backend.
    Model { model_name: String },
    /// Runs a plugin library.
    Custom {
        library: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Model { .. } => "model",
            Self::Custom { .. } => "custom",
        }
    }
}

// ── Demultiply Count ──────────────────────────────────────────────────────────

/// Fan-out setting of a node. Serialized as an integer: `-1` is dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum DemultiplyCount {
    Fixed(usize),
    Dynamic,
}

impl TryFrom<i64> for DemultiplyCount {
    type Error = String;

    fn try_from(v: i64) -> std::result::Result<Self, Self::Error> {
        match v {
            -1 => Ok(Self::Dynamic),
            n if n > 0 => Ok(Self::Fixed(n as usize)),
            n => Err(format!("invalid demultiply_count {n}: expected -1 or a positive count")),
        }
    }
}

impl From<DemultiplyCount> for i64 {
    fn from(v: DemultiplyCount) -> Self {
        match v {
            DemultiplyCount::Fixed(n) => n as i64,
            DemultiplyCount::Dynamic => -1,
        }
    }
}

// ── Node & Connection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub demultiply_count: Option<DemultiplyCount>,
    /// Names of upstream demultiplexers whose fan-out this node collapses.
    #[serde(default)]
    pub gather_from: BTreeSet<String>,
}

/// One `output → input` routing between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub output: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    pub mapping: Vec<Mapping>,
}

// ── Pipeline Definition ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl PipelineDefinition {
    pub fn from_json(text: &str) -> Result<Self> {
        let def: Self = serde_json::from_str(text)
            .map_err(|e| PipeflowError::Serialization(e.to_string()))?;
        def.check()?;
        Ok(def)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Number of input mappings feeding `node`.
    pub fn input_count(&self, node: &str) -> usize {
        self.connections
            .iter()
            .filter(|c| c.to == node)
            .map(|c| c.mapping.len())
            .sum()
    }

    pub fn entry(&self) -> Result<&NodeDefinition> {
        self.single_of(|k| matches!(k, NodeKind::Entry), "entry")
    }

    pub fn exit(&self) -> Result<&NodeDefinition> {
        self.single_of(|k| matches!(k, NodeKind::Exit), "exit")
    }

    /// Structural sanity: unique names, one entry, one exit, connections
    /// that reference known nodes.
    pub fn check(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(PipeflowError::Definition(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }
        self.entry()?;
        self.exit()?;
        for conn in &self.connections {
            for end in [&conn.from, &conn.to] {
                if !seen.contains(end.as_str()) {
                    return Err(PipeflowError::Definition(format!(
                        "connection references unknown node '{end}'"
                    )));
                }
            }
            if conn.mapping.is_empty() {
                return Err(PipeflowError::Definition(format!(
                    "connection {} → {} has no mapping",
                    conn.from, conn.to
                )));
            }
        }
        for node in &self.nodes {
            for gathered in &node.gather_from {
                let demux = self.node(gathered).ok_or_else(|| {
                    PipeflowError::Definition(format!(
                        "node '{}' gathers from unknown node '{gathered}'",
                        node.name
                    ))
                })?;
                if demux.demultiply_count.is_none() {
                    return Err(PipeflowError::Definition(format!(
                        "node '{}' gathers from '{gathered}' which does not demultiply",
                        node.name
                    )));
                }
            }
        }
        self.scheduler.validate()
    }

    fn single_of(
        &self,
        pred: impl Fn(&NodeKind) -> bool,
        what: &str,
    ) -> Result<&NodeDefinition> {
        let mut found = self.nodes.iter().filter(|n| pred(&n.kind));
        match (found.next(), found.next()) {
            (Some(node), None) => Ok(node),
            (None, _) => Err(PipeflowError::Definition(format!("missing {what} node"))),
            (Some(_), Some(_)) => {
                Err(PipeflowError::Definition(format!("more than one {what} node")))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn parses_definition() {
        let def = PipelineDefinition::from_json(ADD_ONE).unwrap();
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.entry().unwrap().name, "request");
        assert_eq!(def.exit().unwrap().name, "response");
        assert_eq!(def.input_count("add"), 1);
        assert_eq!(def.scheduler, SchedulerConfig::default());
        match &def.node("add").unwrap().kind {
            NodeKind::Custom { library, params } => {
                assert_eq!(library, "add_sub");
                assert_eq!(params.get("add_number").map(String::as_str), Some("1"));
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn demultiply_count_encoding() {
        let n: NodeDefinition = serde_json::from_str(
            r#"{ "name": "d", "kind": { "type": "entry" }, "demultiply_count": -1 }"#,
        )
        .unwrap();
        assert_eq!(n.demultiply_count, Some(DemultiplyCount::Dynamic));

        let bad = serde_json::from_str::<NodeDefinition>(
            r#"{ "name": "d", "kind": { "type": "entry" }, "demultiply_count": 0 }"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn rejects_unknown_connection_target() {
        let mut def = PipelineDefinition::from_json(ADD_ONE).unwrap();
        def.connections[0].to = "ghost".into();
        assert!(def.check().is_err());
    }

    #[test]
    fn rejects_gather_from_plain_node() {
        let mut def = PipelineDefinition::from_json(ADD_ONE).unwrap();
        def.nodes[2].gather_from.insert("add".into());
        assert!(def.check().is_err());
    }

    #[test]
    fn rejects_two_entries() {
        let mut def = PipelineDefinition::from_json(ADD_ONE).unwrap();
        def.nodes[1].kind = NodeKind::Entry;
        assert!(def.check().is_err());
    }
}
