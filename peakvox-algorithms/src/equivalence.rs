//! Label equivalence resolution and blob merging.
//!
//! Labeling and collision detection both emit `(higher, lower)` pairs
//! meaning "the blob labelled `higher` belongs to `lower`". The resolver
//! turns a batch of such pairs into a label-to-target map and folds the
//! blobs accordingly.

use peakvox_core::Blob;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Blob label. `0` marks an unlabelled voxel.
pub type Label = u32;

/// Blobs keyed by label, iterated in ascending label order.
pub type BlobMap = BTreeMap<Label, Blob>;

/// Pairs `(higher, lower)` of labels known to belong together.
pub type EquivalenceList = Vec<(Label, Label)>;

/// Records that `a` and `b` belong together, ordered `(max, min)`.
pub fn register_equivalence(a: Label, b: Label, equivalences: &mut EquivalenceList) {
    if a > b {
        equivalences.push((a, b));
    } else {
        equivalences.push((b, a));
    }
}

/// How label chains are collapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResolveStrategy {
    /// Keep the first target per label, then re-point each label to its
    /// target's target in one ascending pass. A label registered with two
    /// different targets keeps only the lowest of them.
    #[default]
    SinglePass,
    /// Full transitive closure with union-find; every label maps to the
    /// lowest label of its class.
    UnionFind,
}

/// Sorts and deduplicates `equivalences`, keeping the first (lowest)
/// target registered for each label.
pub fn remove_duplicates(equivalences: &mut EquivalenceList) -> BTreeMap<Label, Label> {
    equivalences.sort_unstable();
    equivalences.dedup();
    let mut map = BTreeMap::new();
    for &(from, to) in equivalences.iter() {
        map.entry(from).or_insert(to);
    }
    map
}

/// Re-points every label to its target's target.
///
/// Labels are visited in ascending order and targets are always lower than
/// their label, so a target's own mapping is already final when read.
pub fn reassign_equivalences(map: &mut BTreeMap<Label, Label>) {
    let labels: Vec<Label> = map.keys().copied().collect();
    for label in labels {
        let Some(&target) = map.get(&label) else {
            continue;
        };
        if let Some(&next) = map.get(&target) {
            map.insert(label, next);
        }
    }
}

/// Union-find over labels.
struct UnionFind {
    parent: BTreeMap<Label, Label>,
    rank: BTreeMap<Label, u32>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: BTreeMap::new(),
            rank: BTreeMap::new(),
        }
    }

    fn find(&mut self, x: Label) -> Label {
        let parent = *self.parent.entry(x).or_insert(x);
        if parent == x {
            return x;
        }
        let root = self.find(parent);
        self.parent.insert(x, root);
        root
    }

    fn union(&mut self, x: Label, y: Label) {
        let px = self.find(x);
        let py = self.find(y);

        if px == py {
            return;
        }

        let rx = self.rank.get(&px).copied().unwrap_or(0);
        let ry = self.rank.get(&py).copied().unwrap_or(0);
        match rx.cmp(&ry) {
            std::cmp::Ordering::Less => {
                self.parent.insert(px, py);
            }
            std::cmp::Ordering::Greater => {
                self.parent.insert(py, px);
            }
            std::cmp::Ordering::Equal => {
                self.parent.insert(py, px);
                self.rank.insert(px, rx + 1);
            }
        }
    }
}

/// Maps every label that appears in `equivalences` to the lowest label of
/// its connected class. Labels that are already minimal are omitted.
#[must_use]
pub fn union_find_equivalences(equivalences: &[(Label, Label)]) -> BTreeMap<Label, Label> {
    let mut uf = UnionFind::new();
    for &(a, b) in equivalences {
        uf.union(a, b);
    }

    let labels: Vec<Label> = uf.parent.keys().copied().collect();
    let mut lowest: BTreeMap<Label, Label> = BTreeMap::new();
    // ascending, so the first label seen per root is its minimum
    for &label in &labels {
        let root = uf.find(label);
        lowest.entry(root).or_insert(label);
    }

    let mut map = BTreeMap::new();
    for label in labels {
        let root = uf.find(label);
        if let Some(&min) = lowest.get(&root) {
            if min != label {
                map.insert(label, min);
            }
        }
    }
    map
}

/// Folds every blob whose label is mapped into its target's blob.
///
/// A source whose target no longer exists is kept as is. Returns the
/// number of blobs removed.
pub fn merge_blobs(blobs: &mut BlobMap, map: &BTreeMap<Label, Label>) -> usize {
    let mut merged = 0;
    for (&from, &to) in map {
        if from == to || !blobs.contains_key(&to) {
            continue;
        }
        if let Some(source) = blobs.remove(&from) {
            if let Some(target) = blobs.get_mut(&to) {
                target.merge(&source);
                merged += 1;
            }
        }
    }
    merged
}

/// Resolves batches of equivalences against a blob map.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquivalenceResolver {
    strategy: ResolveStrategy,
}

impl EquivalenceResolver {
    /// Creates a resolver using `strategy`.
    #[must_use]
    pub fn new(strategy: ResolveStrategy) -> Self {
        Self { strategy }
    }

    /// The configured strategy.
    #[must_use]
    pub fn strategy(&self) -> ResolveStrategy {
        self.strategy
    }

    /// Label-to-target map for one batch of pairs.
    #[must_use]
    pub fn canonical_map(&self, equivalences: &mut EquivalenceList) -> BTreeMap<Label, Label> {
        match self.strategy {
            ResolveStrategy::SinglePass => {
                let mut map = remove_duplicates(equivalences);
                reassign_equivalences(&mut map);
                map
            }
            ResolveStrategy::UnionFind => union_find_equivalences(equivalences),
        }
    }

    /// Merges equivalent blobs and clears `equivalences`.
    ///
    /// Returns the number of blobs folded into others.
    pub fn resolve(&self, blobs: &mut BlobMap, equivalences: &mut EquivalenceList) -> usize {
        if equivalences.is_empty() {
            return 0;
        }
        let map = self.canonical_map(equivalences);
        equivalences.clear();
        merge_blobs(blobs, &map)
    }
}
