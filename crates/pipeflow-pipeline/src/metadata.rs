//! Position of a request in the demultiply/gather tree.
//!
//! ```text
//! request 7f3a…                       key "7f3a…"
//!   └─ demux "split" ×3               keys "7f3a…/split:0" … "/split:2"
//!        └─ demux "crop" ×2           keys "7f3a…/split:1/crop:0" …
//! gather {"crop"}  → "7f3a…/split:1"          (2 shards collapsed)
//! gather {"split","crop"} → "7f3a…"           (3×2 shards collapsed)
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::error::{PipelineError, Result};

/// One demultiplexing level: which node fanned out, which shard this is,
/// and how many shards that node produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardLevel {
    pub node: String,
    pub index: usize,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    request_id: String,
    path: Vec<ShardLevel>,
}

/// What a gather collapsed, outermost level first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapseDetails {
    pub collapsed_nodes: Vec<String>,
    pub shard_counts: Vec<usize>,
}

impl CollapseDetails {
    /// Shards the gathering session waits for per input.
    pub fn total_shards(&self) -> usize {
        self.shard_counts.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.collapsed_nodes.is_empty()
    }
}

impl SessionMetadata {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), path: Vec::new() }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn path(&self) -> &[ShardLevel] {
        &self.path
    }

    /// Deterministic identity of this position, unique per request.
    pub fn session_key(&self) -> String {
        let mut key = self.request_id.clone();
        for level in &self.path {
            let _ = write!(key, "/{}:{}", level.node, level.index);
        }
        key
    }

    /// `count` children, each extending the path by `(node, i)`.
    pub fn generate_subsessions(&self, node: &str, count: usize) -> Result<Vec<SessionMetadata>> {
        if count == 0 {
            return Err(PipelineError::DemultiplyZeroShards { node: node.to_string() });
        }
        if self.path.iter().any(|l| l.node == node) {
            return Err(PipelineError::Demultiply {
                node: node.to_string(),
                reason: "node already appears in the shard path".into(),
            });
        }
        Ok((0..count)
            .map(|index| {
                let mut child = self.clone();
                child.path.push(ShardLevel { node: node.to_string(), index, count });
                child
            })
            .collect())
    }

    /// Drop the levels produced by the nodes in `gather`.
    ///
    /// The gathered levels must be the innermost ones: a gather can only
    /// close the most recent fan-outs.
    pub fn collapse(&self, gather: &BTreeSet<String>) -> Result<(SessionMetadata, CollapseDetails)> {
        if gather.is_empty() {
            return Ok((self.clone(), CollapseDetails::default()));
        }
        let depth = gather.len();
        let nesting = |reason: String| PipelineError::GatherNesting {
            key: self.session_key(),
            reason,
        };
        if depth > self.path.len() {
            return Err(nesting(format!(
                "gathering {depth} levels from a path of {}",
                self.path.len()
            )));
        }
        let split = self.path.len() - depth;
        let (kept, collapsed) = self.path.split_at(split);
        if let Some(level) = collapsed.iter().find(|l| !gather.contains(&l.node)) {
            return Err(nesting(format!(
                "level '{}' sits inside the gathered levels",
                level.node
            )));
        }
        let details = CollapseDetails {
            collapsed_nodes: collapsed.iter().map(|l| l.node.clone()).collect(),
            shard_counts: collapsed.iter().map(|l| l.count).collect(),
        };
        Ok((
            SessionMetadata { request_id: self.request_id.clone(), path: kept.to_vec() },
            details,
        ))
    }

    /// Row-major position of this shard among the collapsed levels.
    pub fn shard_id(&self, details: &CollapseDetails) -> usize {
        let depth = details.collapsed_nodes.len().min(self.path.len());
        self.path[self.path.len() - depth..]
            .iter()
            .fold(0, |acc, level| acc * level.count + level.index)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keys_are_deterministic() {
        let root = SessionMetadata::new("req");
        assert_eq!(root.session_key(), "req");
        let kids = root.generate_subsessions("split", 3).unwrap();
        assert_eq!(kids.len(), 3);
        assert_eq!(kids[2].session_key(), "req/split:2");
        let grand = kids[1].generate_subsessions("crop", 2).unwrap();
        assert_eq!(grand[0].session_key(), "req/split:1/crop:0");
        assert_eq!(grand[0].path().len(), 2);
    }

    #[test]
    fn zero_subsessions_rejected() {
        let err = SessionMetadata::new("req").generate_subsessions("split", 0).unwrap_err();
        assert!(matches!(err, PipelineError::DemultiplyZeroShards { .. }));
    }

    #[test]
    fn collapse_innermost_level() {
        let root = SessionMetadata::new("req");
        let shard = &root.generate_subsessions("split", 3).unwrap()[1]
            .generate_subsessions("crop", 2)
            .unwrap()[1];
        let (parent, details) = shard.collapse(&set(&["crop"])).unwrap();
        assert_eq!(parent.session_key(), "req/split:1");
        assert_eq!(details.shard_counts, vec![2]);
        assert_eq!(details.total_shards(), 2);
        assert_eq!(shard.shard_id(&details), 1);
    }

    #[test]
    fn collapse_two_levels_row_major() {
        let root = SessionMetadata::new("req");
        let shard = &root.generate_subsessions("split", 3).unwrap()[2]
            .generate_subsessions("crop", 2)
            .unwrap()[1];
        let (parent, details) = shard.collapse(&set(&["split", "crop"])).unwrap();
        assert_eq!(parent, root);
        assert_eq!(details.collapsed_nodes, vec!["split".to_string(), "crop".to_string()]);
        assert_eq!(details.total_shards(), 6);
        assert_eq!(shard.shard_id(&details), 5);
    }

    #[test]
    fn collapse_outer_level_only_is_a_nesting_error() {
        let root = SessionMetadata::new("req");
        let shard = &root.generate_subsessions("split", 2).unwrap()[0]
            .generate_subsessions("crop", 2)
            .unwrap()[0];
        let err = shard.collapse(&set(&["split"])).unwrap_err();
        assert!(matches!(err, PipelineError::GatherNesting { .. }));
    }

    #[test]
    fn empty_gather_is_identity() {
        let root = SessionMetadata::new("req");
        let (same, details) = root.collapse(&BTreeSet::new()).unwrap();
        assert_eq!(same, root);
        assert!(details.is_empty());
        assert_eq!(details.total_shards(), 1);
    }
}
