// Sorted Aggregate Structures
//
// One AggregateTree per tracked metric ("clients", "invoice_revenue", ...),
// each keyed by (tenant, bucket, at, entity_id). AggregateSet holds them all
// by name and is what gets checkpointed.

pub mod key;
pub mod tree;

pub use key::{AggregateKey, KeyRange};
pub use tree::{AggregateTree, RangeStats};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSet {
    trees: BTreeMap<String, AggregateTree>,
}

impl AggregateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&AggregateTree> {
        self.trees.get(name)
    }

    /// Tree for a metric, created empty on first use
    pub fn tree_mut(&mut self, name: &str) -> &mut AggregateTree {
        self.trees
            .entry(name.to_string())
            .or_insert_with(|| AggregateTree::new(name))
    }

    /// Install a tree (e.g. one loaded from a checkpoint), replacing any
    /// tree with the same name.
    pub fn install(&mut self, tree: AggregateTree) {
        self.trees.insert(tree.name().to_string(), tree);
    }

    pub fn trees(&self) -> impl Iterator<Item = &AggregateTree> {
        self.trees.values()
    }
}
