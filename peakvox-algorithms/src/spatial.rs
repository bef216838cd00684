//! Octree spatial index for collision discovery between shapes.
//!
//! Shapes live in an arena owned by the caller; the index borrows it and
//! refers to shapes by [`ShapeId`], their position in the arena. Leaves
//! store ids only, so a shape that straddles several leaves is referenced
//! from each of them without being copied.

use peakvox_core::{collide, Aabb, Error, QuadricTolerance, Result, Shape};
use std::collections::BTreeSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Deepest subdivision accepted by [`IndexConfig::validate`].
pub const MAX_DEPTH_LIMIT: usize = 10;

/// Octree tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndexConfig {
    /// Maximum subdivision depth (root is depth 0).
    pub max_depth: usize,
    /// Soft cap on shapes per leaf before it splits.
    pub max_storage: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_storage: 6,
        }
    }
}

impl IndexConfig {
    /// Sets the maximum depth.
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the leaf storage cap.
    #[must_use]
    pub fn with_max_storage(mut self, storage: usize) -> Self {
        self.max_storage = storage;
        self
    }

    /// Checks the parameter ranges.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `max_depth` is outside
    /// `1..=MAX_DEPTH_LIMIT` or `max_storage` is zero.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_DEPTH_LIMIT).contains(&self.max_depth) {
            return Err(Error::InvalidConfig(format!(
                "octree max_depth must be in 1..={MAX_DEPTH_LIMIT}, got {}",
                self.max_depth
            )));
        }
        if self.max_storage == 0 {
            return Err(Error::InvalidConfig(
                "octree max_storage must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Position of a shape in the arena an [`Octree`] borrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShapeId(usize);

impl ShapeId {
    /// Id of the arena slot `index`.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of the shape in the arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf(Vec<ShapeId>),
    Internal([usize; 8]),
}

#[derive(Debug, Clone)]
struct Node {
    bounds: Aabb,
    depth: usize,
    kind: NodeKind,
}

/// Octree over a fixed world box, indexing shapes of a borrowed arena.
#[derive(Debug, Clone)]
pub struct Octree<'a> {
    config: IndexConfig,
    tolerance: QuadricTolerance,
    nodes: Vec<Node>,
    shapes: &'a [Shape],
    indexed: Vec<bool>,
}

impl<'a> Octree<'a> {
    /// Creates an empty index over `world` for shapes of `shapes`.
    ///
    /// Nothing is indexed until [`add_data`](Self::add_data) or
    /// [`add_all`](Self::add_all) is called.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `config` is out of range.
    pub fn new(world: Aabb, config: IndexConfig, shapes: &'a [Shape]) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tolerance: QuadricTolerance::default(),
            nodes: vec![Node {
                bounds: world,
                depth: 0,
                kind: NodeKind::Leaf(Vec::new()),
            }],
            shapes,
            indexed: vec![false; shapes.len()],
        })
    }

    /// Overrides the ellipsoid root classification tolerances.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: QuadricTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Bounds of the root node.
    #[must_use]
    pub fn world(&self) -> &Aabb {
        &self.nodes[0].bounds
    }

    /// Tuning parameters.
    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The borrowed arena.
    #[must_use]
    pub fn arena(&self) -> &'a [Shape] {
        self.shapes
    }

    /// Number of shapes currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexed.iter().filter(|&&indexed| indexed).count()
    }

    /// Whether no shape is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an indexed shape.
    #[must_use]
    pub fn shape(&self, id: ShapeId) -> Option<&'a Shape> {
        if self.indexed.get(id.0).copied().unwrap_or(false) {
            self.shapes.get(id.0)
        } else {
            None
        }
    }

    /// Indexes arena shape `id` in every leaf its bounding box overlaps.
    ///
    /// Returns `false` if `id` is outside the arena, already indexed, or
    /// lies entirely outside the world box.
    pub fn add_data(&mut self, id: ShapeId) -> bool {
        let Some(shape) = self.shapes.get(id.0) else {
            return false;
        };
        let bounds = *shape.aabb();
        if self.indexed[id.0] || !self.world().intersects(&bounds) {
            return false;
        }
        self.indexed[id.0] = true;
        self.insert(0, id, &bounds);
        true
    }

    /// Indexes every arena shape and returns the ids that were accepted.
    pub fn add_all(&mut self) -> Vec<ShapeId> {
        (0..self.shapes.len())
            .map(ShapeId)
            .filter(|&id| self.add_data(id))
            .collect()
    }

    fn insert(&mut self, node: usize, id: ShapeId, bounds: &Aabb) {
        if !self.nodes[node].bounds.intersects(bounds) {
            return;
        }
        let children = match &mut self.nodes[node].kind {
            NodeKind::Internal(children) => *children,
            NodeKind::Leaf(ids) => {
                ids.push(id);
                let full = ids.len() > self.config.max_storage;
                // past max depth the cap is exceeded instead
                if full && self.nodes[node].depth < self.config.max_depth {
                    self.split(node);
                }
                return;
            }
        };
        for child in children {
            self.insert(child, id, bounds);
        }
    }

    fn split(&mut self, node: usize) {
        let bounds = self.nodes[node].bounds;
        let depth = self.nodes[node].depth + 1;
        let first = self.nodes.len();
        for sector in 0..8 {
            self.nodes.push(Node {
                bounds: bounds.octant(sector),
                depth,
                kind: NodeKind::Leaf(Vec::new()),
            });
        }
        let children = std::array::from_fn(|i| first + i);
        let previous = std::mem::replace(&mut self.nodes[node].kind, NodeKind::Internal(children));
        if let NodeKind::Leaf(ids) = previous {
            for id in ids {
                let shape_bounds = *self.shapes[id.0].aabb();
                for child in children {
                    self.insert(child, id, &shape_bounds);
                }
            }
        }
    }

    /// Removes a shape from the index. The arena is left untouched.
    ///
    /// Returns `false` if `id` was not indexed.
    pub fn remove_data(&mut self, id: ShapeId) -> bool {
        let Some(shape) = self.shape(id) else {
            return false;
        };
        let bounds = *shape.aabb();
        self.indexed[id.0] = false;
        for node in &mut self.nodes {
            if let NodeKind::Leaf(ids) = &mut node.kind {
                if node.bounds.intersects(&bounds) {
                    ids.retain(|&other| other != id);
                }
            }
        }
        true
    }

    /// All leaves with the ids they hold.
    pub fn leaves(&self) -> impl Iterator<Item = (&Aabb, &[ShapeId])> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            NodeKind::Leaf(ids) => Some((&node.bounds, ids.as_slice())),
            NodeKind::Internal(_) => None,
        })
    }

    /// Number of leaves.
    #[must_use]
    pub fn num_chambers(&self) -> usize {
        self.leaves().count()
    }

    /// Every colliding pair of indexed shapes, as `(lower id, higher id)`.
    ///
    /// Only shapes that share a leaf are tested, and each pair is tested
    /// once even when the two shapes share several leaves.
    #[must_use]
    pub fn get_collisions(&self) -> BTreeSet<(ShapeId, ShapeId)> {
        let mut tested = BTreeSet::new();
        let mut collisions = BTreeSet::new();
        for (_, ids) in self.leaves() {
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    let pair = (a.min(b), a.max(b));
                    if !tested.insert(pair) {
                        continue;
                    }
                    if collide(&self.shapes[a.0], &self.shapes[b.0], &self.tolerance) {
                        collisions.insert(pair);
                    }
                }
            }
        }
        collisions
    }

    /// Indexed shapes colliding with `shape`.
    #[must_use]
    pub fn get_collisions_with(&self, shape: &Shape) -> BTreeSet<ShapeId> {
        let mut found = BTreeSet::new();
        self.collect_collisions(0, shape, &mut found);
        found
    }

    fn collect_collisions(&self, node: usize, shape: &Shape, found: &mut BTreeSet<ShapeId>) {
        let node = &self.nodes[node];
        if !node.bounds.intersects(shape.aabb()) {
            return;
        }
        match &node.kind {
            NodeKind::Leaf(ids) => {
                for &id in ids {
                    if !found.contains(&id) && collide(shape, &self.shapes[id.0], &self.tolerance) {
                        found.insert(id);
                    }
                }
            }
            NodeKind::Internal(children) => {
                for &child in children {
                    self.collect_collisions(child, shape, found);
                }
            }
        }
    }

    /// Pairs where one shape scaled by `peak` overlaps the other scaled by
    /// `bkg`, as `(lower id, higher id)`.
    ///
    /// The background shapes are indexed under the same ids in a second
    /// tree over a scratch arena of scaled copies.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if a scale is not positive.
    pub fn get_collisions_scaled(&self, peak: f64, bkg: f64) -> Result<BTreeSet<(ShapeId, ShapeId)>> {
        if !(peak > 0.0 && bkg > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "collision scales must be positive, got peak {peak} and bkg {bkg}"
            )));
        }

        let scaled: Vec<Shape> = self.shapes.iter().map(|shape| shape.scaled(bkg)).collect();
        let mut backgrounds = Octree::new(*self.world(), self.config, &scaled)?.with_tolerance(self.tolerance);
        let indexed: Vec<usize> = (0..self.indexed.len()).filter(|&i| self.indexed[i]).collect();
        for &index in &indexed {
            backgrounds.add_data(ShapeId(index));
        }

        let mut collisions = BTreeSet::new();
        for index in indexed {
            let a = ShapeId(index);
            for b in backgrounds.get_collisions_with(&self.shapes[index].scaled(peak)) {
                if a != b {
                    collisions.insert((a.min(b), a.max(b)));
                }
            }
        }
        Ok(collisions)
    }

    /// First indexed shape containing `point`, if any.
    #[must_use]
    pub fn object_at(&self, point: &nalgebra::Vector3<f64>) -> Option<ShapeId> {
        let mut node = &self.nodes[0];
        if !node.bounds.contains_point(point) {
            return None;
        }
        loop {
            match &node.kind {
                NodeKind::Leaf(ids) => {
                    return ids
                        .iter()
                        .copied()
                        .find(|&id| self.shapes[id.0].contains_point(point));
                }
                NodeKind::Internal(children) => {
                    node = children
                        .iter()
                        .map(|&c| &self.nodes[c])
                        .find(|c| c.bounds.contains_point(point))?;
                }
            }
        }
    }

    /// Whether any indexed shape contains `point`.
    #[must_use]
    pub fn is_inside_object(&self, point: &nalgebra::Vector3<f64>) -> bool {
        self.object_at(point).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use peakvox_core::Sphere;

    fn world() -> Aabb {
        Aabb::new(Vector3::zeros(), Vector3::repeat(100.0)).unwrap()
    }

    fn sphere(x: f64, y: f64, z: f64, r: f64) -> Shape {
        Shape::Sphere(Sphere::new(Vector3::new(x, y, z), r).unwrap())
    }

    fn lcg(seed: &mut u64) -> f64 {
        *seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (*seed >> 11) as f64 / (1u64 << 53) as f64
    }

    #[test]
    fn test_config_validation() {
        assert!(IndexConfig::default().validate().is_ok());
        for bad in [
            IndexConfig::default().with_max_depth(0),
            IndexConfig::default().with_max_depth(11),
            IndexConfig::default().with_max_storage(0),
        ] {
            assert!(matches!(
                Octree::new(world(), bad, &[]),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_leaf_splits_past_storage() {
        let shapes: Vec<Shape> = (0..3)
            .map(|i| sphere(10.0 + 30.0 * f64::from(i), 10.0, 10.0, 1.0))
            .collect();
        let mut tree = Octree::new(world(), IndexConfig::default().with_max_storage(2), &shapes).unwrap();
        assert_eq!(tree.num_chambers(), 1);
        assert_eq!(tree.add_all().len(), 3);
        assert_eq!(tree.num_chambers(), 8);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_depth_cap_overfills_leaf() {
        let config = IndexConfig::default().with_max_depth(1).with_max_storage(1);
        let shapes: Vec<Shape> = (0..5)
            .map(|i| sphere(10.0 + f64::from(i), 10.0, 10.0, 0.1))
            .collect();
        let mut tree = Octree::new(world(), config, &shapes).unwrap();
        tree.add_all();
        assert_eq!(tree.num_chambers(), 8);
        let fullest = tree.leaves().map(|(_, ids)| ids.len()).max().unwrap();
        assert_eq!(fullest, 5);
    }

    #[test]
    fn test_rejected_ids() {
        let shapes = vec![sphere(-50.0, 10.0, 10.0, 1.0), sphere(10.0, 10.0, 10.0, 1.0)];
        let mut tree = Octree::new(world(), IndexConfig::default(), &shapes).unwrap();
        assert!(!tree.add_data(ShapeId::new(0)), "outside the world");
        assert!(!tree.add_data(ShapeId::new(2)), "outside the arena");
        assert!(tree.add_data(ShapeId::new(1)));
        assert!(!tree.add_data(ShapeId::new(1)), "already indexed");
        assert_eq!(tree.len(), 1);
        assert!(tree.shape(ShapeId::new(0)).is_none());
    }

    #[test]
    fn test_leaves_hold_arena_ids() {
        let shapes = vec![
            sphere(50.0, 50.0, 50.0, 3.0),
            sphere(52.0, 50.0, 50.0, 3.0),
            sphere(10.0, 10.0, 10.0, 1.0),
        ];
        let mut tree = Octree::new(world(), IndexConfig::default().with_max_storage(1), &shapes).unwrap();
        tree.add_all();
        assert!(std::ptr::eq(tree.arena(), shapes.as_slice()));
        assert!(std::ptr::eq(tree.shape(ShapeId::new(1)).unwrap(), &shapes[1]));
        assert!(tree
            .leaves()
            .flat_map(|(_, ids)| ids.iter())
            .all(|id| id.index() < shapes.len()));
    }

    #[test]
    fn test_straddling_pair_reported_once() {
        let shapes = vec![
            sphere(50.0, 50.0, 50.0, 3.0),
            sphere(52.0, 50.0, 50.0, 3.0),
            sphere(10.0, 10.0, 10.0, 1.0),
        ];
        let mut tree = Octree::new(world(), IndexConfig::default().with_max_storage(1), &shapes).unwrap();
        tree.add_all();
        assert!(tree.num_chambers() > 1);

        let collisions = tree.get_collisions();
        assert_eq!(collisions.len(), 1);
        assert!(collisions.contains(&(ShapeId::new(0), ShapeId::new(1))));
    }

    #[test]
    fn test_matches_brute_force() {
        let mut seed = 7;
        let shapes: Vec<Shape> = (0..200)
            .map(|_| {
                sphere(
                    100.0 * lcg(&mut seed),
                    100.0 * lcg(&mut seed),
                    100.0 * lcg(&mut seed),
                    1.0 + 4.0 * lcg(&mut seed),
                )
            })
            .collect();
        let mut tree = Octree::new(world(), IndexConfig::default(), &shapes).unwrap();
        assert_eq!(tree.add_all().len(), shapes.len());

        let mut expected = BTreeSet::new();
        for (i, sa) in shapes.iter().enumerate() {
            for (j, sb) in shapes.iter().enumerate().skip(i + 1) {
                if sa.collides(sb) {
                    expected.insert((ShapeId::new(i), ShapeId::new(j)));
                }
            }
        }
        assert!(!expected.is_empty());
        assert_eq!(tree.get_collisions(), expected);
    }

    #[test]
    fn test_query_and_remove() {
        let shapes = vec![sphere(20.0, 20.0, 20.0, 2.0), sphere(80.0, 80.0, 80.0, 2.0)];
        let mut tree = Octree::new(world(), IndexConfig::default().with_max_storage(1), &shapes).unwrap();
        tree.add_all();
        let (a, b) = (ShapeId::new(0), ShapeId::new(1));

        let query = sphere(21.0, 21.0, 21.0, 1.0);
        assert_eq!(tree.get_collisions_with(&query), BTreeSet::from([a]));
        assert!(tree.is_inside_object(&Vector3::new(80.5, 80.0, 80.0)));
        assert_eq!(tree.object_at(&Vector3::new(80.5, 80.0, 80.0)), Some(b));
        assert!(!tree.is_inside_object(&Vector3::new(50.0, 50.0, 50.0)));

        assert!(tree.remove_data(a));
        assert!(!tree.remove_data(a));
        assert!(tree.get_collisions_with(&query).is_empty());
        assert_eq!(tree.len(), 1);
        assert_eq!(shapes.len(), 2);
    }

    #[test]
    fn test_scaled_collisions() {
        let shapes = vec![
            sphere(50.0, 50.0, 50.0, 1.0),
            sphere(52.8, 50.0, 50.0, 1.0),
            sphere(51.0, 50.0, 50.0, 1.0),
        ];
        let mut tree = Octree::new(world(), IndexConfig::default(), &shapes).unwrap();
        // the middle sphere stays out of the index
        tree.add_data(ShapeId::new(0));
        tree.add_data(ShapeId::new(1));
        let (a, b) = (ShapeId::new(0), ShapeId::new(1));

        assert!(tree.get_collisions().is_empty());
        // peak radius 1 reaches a background of radius 2
        assert_eq!(
            tree.get_collisions_scaled(1.0, 2.0).unwrap(),
            BTreeSet::from([(a, b)])
        );
        assert!(tree.get_collisions_scaled(1.0, 1.5).unwrap().is_empty());
        assert!(tree.get_collisions_scaled(0.0, 1.5).is_err());
    }
}
