// 🌳 Sorted Aggregate Structure - order-statistics treap over an arena
//
// Nodes live in a Vec and point at each other by index. Every node carries
// the count and sum of its subtree, so a range query is two boundary
// descents: stats(keys <= range end) - stats(keys before range start).
//
// Priorities come from a splitmix64 state stored in the tree itself, so the
// whole structure (shape included) round-trips through serde.

use super::key::{AggregateKey, KeyRange};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ============================================================================
// RANGE STATS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeStats {
    pub count: u64,
    pub sum: i64,
}

impl RangeStats {
    fn plus(self, other: RangeStats) -> RangeStats {
        RangeStats {
            count: self.count + other.count,
            sum: self.sum + other.sum,
        }
    }

    fn minus(self, other: RangeStats) -> RangeStats {
        RangeStats {
            count: self.count - other.count,
            sum: self.sum - other.sum,
        }
    }
}

// ============================================================================
// NODE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    key: AggregateKey,
    value: i64,
    priority: u64,
    left: Option<usize>,
    right: Option<usize>,
    /// Nodes in this subtree (self included)
    count: u64,
    /// Sum of values in this subtree (self included)
    sum: i64,
}

// ============================================================================
// AGGREGATE TREE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateTree {
    name: String,
    nodes: Vec<Node>,
    /// Arena slots released by deletes, reused by inserts
    free: Vec<usize>,
    root: Option<usize>,
    rng_state: u64,
    /// Bumped on every successful mutation
    revision: u64,
}

impl AggregateTree {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let rng_state = seed_from(&name);

        AggregateTree {
            name,
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            rng_state,
            revision: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.subtree(self.root).count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, key: &AggregateKey) -> bool {
        self.find(key).is_some()
    }

    /// Value contribution stored for a key
    pub fn get(&self, key: &AggregateKey) -> Option<i64> {
        self.find(key).map(|i| self.nodes[i].value)
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    pub fn insert(&mut self, key: AggregateKey, value: i64) -> Result<(), EngineError> {
        if self.contains(&key) {
            return Err(EngineError::DuplicateKey {
                structure: self.name.clone(),
                key: key.to_string(),
            });
        }

        let (left, right) = self.split(self.root, &key);
        let node = self.alloc(key, value);
        let merged = self.merge(left, Some(node));
        self.root = self.merge(merged, right);
        self.revision += 1;
        Ok(())
    }

    /// Remove a key, returning the value it contributed.
    pub fn delete(&mut self, key: &AggregateKey) -> Result<i64, EngineError> {
        let Some(index) = self.find(key) else {
            return Err(self.missing(key));
        };

        let value = self.nodes[index].value;
        self.root = self.erase(self.root, key);
        self.revision += 1;
        Ok(value)
    }

    /// Delete `old` then insert `new`. Both preconditions are checked up
    /// front, so a failure leaves the tree untouched.
    pub fn replace(
        &mut self,
        old: &AggregateKey,
        new: AggregateKey,
        value: i64,
    ) -> Result<i64, EngineError> {
        if !self.contains(old) {
            return Err(self.missing(old));
        }
        if new != *old && self.contains(&new) {
            return Err(EngineError::DuplicateKey {
                structure: self.name.clone(),
                key: new.to_string(),
            });
        }

        let previous = self.delete(old)?;
        self.insert(new, value)?;
        Ok(previous)
    }

    /// Drop every node of a tenant; returns how many were removed.
    pub fn clear_tenant(&mut self, tenant: &str) -> usize {
        let keys = self.keys_in(&KeyRange::tenant(tenant));
        for key in &keys {
            self.root = self.erase(self.root, key);
        }
        if !keys.is_empty() {
            self.revision += 1;
        }
        keys.len()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn range(&self, range: &KeyRange) -> Result<RangeStats, EngineError> {
        range.validate()?;

        let through_end = self.prefix(|key| range.position(key) != Ordering::Greater);
        let before_start = self.prefix(|key| range.position(key) == Ordering::Less);
        Ok(through_end.minus(before_start))
    }

    pub fn range_sum(&self, range: &KeyRange) -> Result<i64, EngineError> {
        Ok(self.range(range)?.sum)
    }

    pub fn range_count(&self, range: &KeyRange) -> Result<u64, EngineError> {
        Ok(self.range(range)?.count)
    }

    /// Keys inside a range, in order
    pub fn keys_in(&self, range: &KeyRange) -> Vec<AggregateKey> {
        let mut out = Vec::new();
        self.collect(self.root, range, &mut out);
        out
    }

    /// Distinct tenants holding at least one node, in key order
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = Vec::new();
        let mut stack = Vec::new();
        let mut cursor = self.root;

        while cursor.is_some() || !stack.is_empty() {
            while let Some(i) = cursor {
                stack.push(i);
                cursor = self.nodes[i].left;
            }
            if let Some(i) = stack.pop() {
                let tenant = &self.nodes[i].key.tenant;
                if tenants.last() != Some(tenant) {
                    tenants.push(tenant.clone());
                }
                cursor = self.nodes[i].right;
            }
        }

        tenants
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn missing(&self, key: &AggregateKey) -> EngineError {
        EngineError::MissingKey {
            structure: self.name.clone(),
            key: key.to_string(),
        }
    }

    fn find(&self, key: &AggregateKey) -> Option<usize> {
        let mut cursor = self.root;
        while let Some(i) = cursor {
            cursor = match key.cmp(&self.nodes[i].key) {
                Ordering::Equal => return Some(i),
                Ordering::Less => self.nodes[i].left,
                Ordering::Greater => self.nodes[i].right,
            };
        }
        None
    }

    /// Stats over the leading run of keys for which `before` holds.
    /// `before` must be monotone: true for a prefix of the key order, then false.
    fn prefix<F>(&self, before: F) -> RangeStats
    where
        F: Fn(&AggregateKey) -> bool,
    {
        let mut acc = RangeStats::default();
        let mut cursor = self.root;

        while let Some(i) = cursor {
            let node = &self.nodes[i];
            if before(&node.key) {
                acc = acc.plus(self.subtree(node.left)).plus(RangeStats {
                    count: 1,
                    sum: node.value,
                });
                cursor = node.right;
            } else {
                cursor = node.left;
            }
        }

        acc
    }

    fn collect(&self, at: Option<usize>, range: &KeyRange, out: &mut Vec<AggregateKey>) {
        let Some(i) = at else { return };
        let node = &self.nodes[i];

        match range.position(&node.key) {
            Ordering::Less => self.collect(node.right, range, out),
            Ordering::Greater => self.collect(node.left, range, out),
            Ordering::Equal => {
                self.collect(node.left, range, out);
                out.push(node.key.clone());
                self.collect(node.right, range, out);
            }
        }
    }

    fn subtree(&self, at: Option<usize>) -> RangeStats {
        match at {
            Some(i) => RangeStats {
                count: self.nodes[i].count,
                sum: self.nodes[i].sum,
            },
            None => RangeStats::default(),
        }
    }

    fn pull(&mut self, i: usize) {
        let below = self
            .subtree(self.nodes[i].left)
            .plus(self.subtree(self.nodes[i].right));
        let node = &mut self.nodes[i];
        node.count = below.count + 1;
        node.sum = below.sum + node.value;
    }

    fn alloc(&mut self, key: AggregateKey, value: i64) -> usize {
        let node = Node {
            key,
            value,
            priority: self.next_priority(),
            left: None,
            right: None,
            count: 1,
            sum: value,
        };

        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Split into (keys < pivot, keys >= pivot)
    fn split(&mut self, at: Option<usize>, pivot: &AggregateKey) -> (Option<usize>, Option<usize>) {
        let Some(i) = at else {
            return (None, None);
        };

        if self.nodes[i].key < *pivot {
            let (left, right) = self.split(self.nodes[i].right, pivot);
            self.nodes[i].right = left;
            self.pull(i);
            (Some(i), right)
        } else {
            let (left, right) = self.split(self.nodes[i].left, pivot);
            self.nodes[i].left = right;
            self.pull(i);
            (left, Some(i))
        }
    }

    /// Join two treaps where every key of `a` sorts before every key of `b`
    fn merge(&mut self, a: Option<usize>, b: Option<usize>) -> Option<usize> {
        match (a, b) {
            (None, other) | (other, None) => other,
            (Some(x), Some(y)) => {
                if self.nodes[x].priority > self.nodes[y].priority {
                    let right = self.merge(self.nodes[x].right, Some(y));
                    self.nodes[x].right = right;
                    self.pull(x);
                    Some(x)
                } else {
                    let left = self.merge(Some(x), self.nodes[y].left);
                    self.nodes[y].left = left;
                    self.pull(y);
                    Some(y)
                }
            }
        }
    }

    fn erase(&mut self, at: Option<usize>, key: &AggregateKey) -> Option<usize> {
        let i = at?;

        match key.cmp(&self.nodes[i].key) {
            Ordering::Equal => {
                let (left, right) = (self.nodes[i].left, self.nodes[i].right);
                self.free.push(i);
                return self.merge(left, right);
            }
            Ordering::Less => {
                let left = self.erase(self.nodes[i].left, key);
                self.nodes[i].left = left;
            }
            Ordering::Greater => {
                let right = self.erase(self.nodes[i].right, key);
                self.nodes[i].right = right;
            }
        }

        self.pull(i);
        Some(i)
    }

    fn next_priority(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.rng_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

// FNV-1a over the structure name
fn seed_from(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tenant: &str, bucket: &str, at: i64, id: &str) -> AggregateKey {
        AggregateKey::new(tenant, bucket, at, id)
    }

    /// Walks the whole arena checking order, heap priority and augmentation.
    fn check_invariants(tree: &AggregateTree) {
        fn walk(
            tree: &AggregateTree,
            at: Option<usize>,
            lower: Option<&AggregateKey>,
            upper: Option<&AggregateKey>,
        ) -> RangeStats {
            let Some(i) = at else {
                return RangeStats::default();
            };
            let node = &tree.nodes[i];

            if let Some(lower) = lower {
                assert!(node.key > *lower, "order violated at {}", node.key);
            }
            if let Some(upper) = upper {
                assert!(node.key < *upper, "order violated at {}", node.key);
            }
            for child in [node.left, node.right].into_iter().flatten() {
                assert!(tree.nodes[child].priority <= node.priority);
            }

            let left = walk(tree, node.left, lower, Some(&node.key));
            let right = walk(tree, node.right, Some(&node.key), upper);
            let expected = RangeStats {
                count: left.count + right.count + 1,
                sum: left.sum + right.sum + node.value,
            };
            assert_eq!(node.count, expected.count);
            assert_eq!(node.sum, expected.sum);
            expected
        }

        walk(tree, tree.root, None, None);
    }

    #[test]
    fn test_insert_and_range_queries() {
        let mut tree = AggregateTree::new("invoice_revenue");

        tree.insert(key("t1", "paid", 100, "a"), 10_000).unwrap();
        tree.insert(key("t1", "paid", 200, "b"), 25_000).unwrap();
        tree.insert(key("t1", "sent", 150, "c"), 4_000).unwrap();
        tree.insert(key("t2", "paid", 100, "d"), 99_900).unwrap();

        check_invariants(&tree);
        assert_eq!(tree.len(), 4);

        let paid = KeyRange::tenant("t1").bucket("paid");
        assert_eq!(tree.range_sum(&paid).unwrap(), 35_000);
        assert_eq!(tree.range_count(&paid).unwrap(), 2);

        let window = KeyRange::tenant("t1").bucket("paid").between(150, 300);
        assert_eq!(tree.range_sum(&window).unwrap(), 25_000);

        assert_eq!(tree.range_count(&KeyRange::tenant("t1")).unwrap(), 3);
        assert_eq!(tree.range_sum(&KeyRange::tenant("t2")).unwrap(), 99_900);
        assert_eq!(tree.range_count(&KeyRange::tenant("t3")).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut tree = AggregateTree::new("clients");
        tree.insert(key("t1", "active", 1, "c1"), 0).unwrap();

        let err = tree.insert(key("t1", "active", 1, "c1"), 0).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateKey { .. }));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_delete_missing_key() {
        let mut tree = AggregateTree::new("clients");
        let err = tree.delete(&key("t1", "active", 1, "ghost")).unwrap_err();

        assert!(matches!(err, EngineError::MissingKey { .. }));
        assert_eq!(tree.revision(), 0);
    }

    #[test]
    fn test_replace_is_atomic_on_missing_old_key() {
        let mut tree = AggregateTree::new("invoice_count");
        tree.insert(key("t1", "sent", 1, "other"), 0).unwrap();
        let revision = tree.revision();

        let err = tree
            .replace(&key("t1", "sent", 1, "inv"), key("t1", "paid", 2, "inv"), 0)
            .unwrap_err();

        assert!(matches!(err, EngineError::MissingKey { .. }));
        assert_eq!(tree.revision(), revision);
        assert!(!tree.contains(&key("t1", "paid", 2, "inv")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_replace_moves_node() {
        let mut tree = AggregateTree::new("invoice_revenue");
        let old = key("t1", "sent", 1, "inv");
        tree.insert(old.clone(), 10_000).unwrap();

        let previous = tree.replace(&old, key("t1", "paid", 5, "inv"), 12_000).unwrap();

        assert_eq!(previous, 10_000);
        assert!(!tree.contains(&old));
        assert_eq!(tree.get(&key("t1", "paid", 5, "inv")), Some(12_000));
        assert_eq!(tree.range_sum(&KeyRange::tenant("t1")).unwrap(), 12_000);
    }

    #[test]
    fn test_many_mutations_keep_invariants() {
        let mut tree = AggregateTree::new("stress");
        let mut state: u64 = 42;
        let mut live: Vec<(AggregateKey, i64)> = Vec::new();

        for step in 0..2_000u64 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let roll = state >> 33;

            if roll % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove((roll as usize / 3) % live.len());
                assert_eq!(tree.delete(&victim.0).unwrap(), victim.1);
            } else {
                let k = key(
                    &format!("t{}", roll % 3),
                    ["draft", "sent", "paid"][(roll % 5 % 3) as usize],
                    (roll % 1000) as i64,
                    &format!("e{}", step),
                );
                let v = (roll % 10_000) as i64;
                tree.insert(k.clone(), v).unwrap();
                live.push((k, v));
            }
        }

        check_invariants(&tree);
        assert_eq!(tree.len(), live.len());

        for tenant in ["t0", "t1", "t2"] {
            let range = KeyRange::tenant(tenant).bucket("paid").between(100, 700);
            let expected: Vec<&(AggregateKey, i64)> =
                live.iter().filter(|(k, _)| range.contains(k)).collect();

            assert_eq!(tree.range_count(&range).unwrap(), expected.len() as u64);
            assert_eq!(
                tree.range_sum(&range).unwrap(),
                expected.iter().map(|(_, v)| v).sum::<i64>()
            );
            assert_eq!(tree.keys_in(&range).len(), expected.len());
        }
    }

    #[test]
    fn test_free_slots_are_reused() {
        let mut tree = AggregateTree::new("clients");
        tree.insert(key("t1", "active", 1, "a"), 0).unwrap();
        tree.insert(key("t1", "active", 2, "b"), 0).unwrap();
        tree.delete(&key("t1", "active", 1, "a")).unwrap();
        tree.insert(key("t1", "active", 3, "c"), 0).unwrap();

        assert_eq!(tree.nodes.len(), 2);
        check_invariants(&tree);
    }

    #[test]
    fn test_tenants_are_distinct_and_ordered() {
        let mut tree = AggregateTree::new("clients");
        for (tenant, id) in [("t2", "a"), ("t1", "b"), ("t2", "c"), ("t3", "d"), ("t1", "e")] {
            tree.insert(AggregateKey::new(tenant, "active", 1, id), 0).unwrap();
        }

        assert_eq!(tree.tenants(), vec!["t1", "t2", "t3"]);
        assert!(AggregateTree::new("empty").tenants().is_empty());
    }

    #[test]
    fn test_clear_tenant() {
        let mut tree = AggregateTree::new("clients");
        for i in 0..10 {
            tree.insert(key("t1", "active", i, &format!("c{}", i)), 0).unwrap();
            tree.insert(key("t2", "active", i, &format!("c{}", i)), 0).unwrap();
        }

        assert_eq!(tree.clear_tenant("t1"), 10);
        assert_eq!(tree.range_count(&KeyRange::tenant("t1")).unwrap(), 0);
        assert_eq!(tree.range_count(&KeyRange::tenant("t2")).unwrap(), 10);
        check_invariants(&tree);
    }

    #[test]
    fn test_serde_round_trip_preserves_shape() {
        let mut tree = AggregateTree::new("quotes");
        for i in 0..50 {
            tree.insert(key("t1", "sent", i, &format!("q{}", i)), i * 100).unwrap();
        }
        tree.delete(&key("t1", "sent", 7, "q7")).unwrap();

        let json = serde_json::to_string(&tree).unwrap();
        let mut restored: AggregateTree = serde_json::from_str(&json).unwrap();

        check_invariants(&restored);
        assert_eq!(restored.len(), 49);
        assert_eq!(
            restored.range_sum(&KeyRange::tenant("t1")).unwrap(),
            tree.range_sum(&KeyRange::tenant("t1")).unwrap()
        );

        // Keeps working after reload, free list included
        restored.insert(key("t1", "sent", 7, "q7"), 700).unwrap();
        check_invariants(&restored);
    }
}
