//! Incremental spatial hashing for boid neighborhood queries.
//!
//! The grid maps items to fixed-size cells over the projected x/y plane and
//! keeps a reverse item-to-cell map so that re-indexing an item whose cell
//! did not change is a no-op. Neighbor queries explore diamond-shaped rings
//! of increasing radius around the item's own cell; whole rings are
//! returned until the requested limit would overflow, and the final ring is
//! down-sampled uniformly so the result never exceeds the limit.

use std::collections::HashMap;
use std::hash::Hash;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by the spatial index.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Integer cell coordinates on the projected plane.
pub type CellKey = (i32, i32);

/// Ring exploration bounds for a neighbor query.
///
/// `min` and `max` are ring radii in cells; ring 0 is the item's own cell
/// excluding the item itself. `limit` caps the number of returned items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborQuery {
    pub min: u32,
    pub max: u32,
    pub limit: usize,
}

impl NeighborQuery {
    /// Construct a validated query.
    pub fn new(min: u32, max: u32, limit: usize) -> Result<Self, IndexError> {
        let query = Self { min, max, limit };
        query.validate()?;
        Ok(query)
    }

    /// Reject misconfigured queries; a zero limit or inverted radius range
    /// is a programmer error, not a runtime condition.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.limit == 0 {
            return Err(IndexError::InvalidConfig("neighbor limit must be non-zero"));
        }
        if self.min > self.max {
            return Err(IndexError::InvalidConfig(
                "minimum ring radius cannot exceed maximum",
            ));
        }
        Ok(())
    }
}

/// Incremental cell-hash index over a dynamic point set.
///
/// Items are opaque copyable keys (the core stores slot-map handles); the
/// grid never owns item state beyond its last known cell.
#[derive(Debug, Clone)]
pub struct SpatialHashGrid<K: Copy + Eq + Hash> {
    cell_size: (f32, f32),
    cell_radius: f32,
    buckets: HashMap<CellKey, Vec<K>>,
    cells: HashMap<K, CellKey>,
}

impl<K: Copy + Eq + Hash> SpatialHashGrid<K> {
    /// Create a grid with the given cell extents.
    pub fn new(cell_size: (f32, f32)) -> Result<Self, IndexError> {
        let (sx, sy) = cell_size;
        if !(sx > 0.0 && sy > 0.0) || !sx.is_finite() || !sy.is_finite() {
            return Err(IndexError::InvalidConfig(
                "cell sizes must be positive and finite",
            ));
        }
        Ok(Self {
            cell_size,
            cell_radius: ((sx * sx + sy * sy) / 2.0).sqrt().ceil(),
            buckets: HashMap::new(),
            cells: HashMap::new(),
        })
    }

    /// Characteristic neighbor radius: the half-diagonal of one cell,
    /// rounded up. Consumed by separation steering as a distance scale.
    #[must_use]
    pub fn cell_radius(&self) -> f32 {
        self.cell_radius
    }

    /// Number of tracked items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true when no items are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cell an item was last filed under, if tracked.
    #[must_use]
    pub fn cell_of(&self, item: K) -> Option<CellKey> {
        self.cells.get(&item).copied()
    }

    #[inline]
    fn cell_key(&self, x: f32, y: f32) -> CellKey {
        (
            (x / self.cell_size.0).floor() as i32,
            (y / self.cell_size.1).floor() as i32,
        )
    }

    /// Re-file `item` under the cell containing `(x, y)`.
    ///
    /// A no-op when the cell is unchanged; otherwise the item is swap-popped
    /// out of its old bucket and appended to the new one.
    pub fn update(&mut self, item: K, x: f32, y: f32) {
        let new_key = self.cell_key(x, y);
        if let Some(&old_key) = self.cells.get(&item) {
            if old_key == new_key {
                return;
            }
            self.detach(item, old_key);
        }
        self.buckets.entry(new_key).or_default().push(item);
        self.cells.insert(item, new_key);
    }

    /// Drop `item` from the index. Unknown items are ignored.
    pub fn remove(&mut self, item: K) {
        if let Some(old_key) = self.cells.remove(&item) {
            self.detach(item, old_key);
        }
    }

    /// Drop all buckets and cached cells.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.cells.clear();
    }

    fn detach(&mut self, item: K, key: CellKey) {
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return;
        };
        let Some(idx) = bucket.iter().position(|&k| k == item) else {
            return;
        };
        if bucket.len() == 1 {
            self.buckets.remove(&key);
            return;
        }
        // Swap with last and pop for O(1) removal.
        bucket.swap_remove(idx);
    }

    /// Collect neighbors of `item` within the query's ring range.
    ///
    /// Rings are visited in increasing radius order so closer neighbors are
    /// preferred when truncation occurs: every ring that fits under the
    /// remaining limit is returned whole, and the first ring that would
    /// overflow it is down-sampled with uniform reservoir sampling so the
    /// total is exactly `query.limit`. Untracked items yield an empty set.
    pub fn neighbors(&self, item: K, query: NeighborQuery, rng: &mut dyn RngCore) -> Vec<K> {
        debug_assert!(query.validate().is_ok(), "misconfigured neighbor query");
        if query.limit == 0 {
            return Vec::new();
        }
        let Some(&center) = self.cells.get(&item) else {
            return Vec::new();
        };

        let mut neighbors: Vec<K> = Vec::new();
        let mut remaining = query.limit;
        let mut ring: Vec<K> = Vec::new();

        for radius in query.min..=query.max {
            ring.clear();
            if radius == 0 {
                if let Some(bucket) = self.buckets.get(&center) {
                    ring.extend(bucket.iter().copied().filter(|&k| k != item));
                }
            } else {
                for (dx, dy) in diamond_ring(radius as i32) {
                    if let Some(bucket) = self.buckets.get(&(center.0 + dx, center.1 + dy)) {
                        ring.extend_from_slice(bucket);
                    }
                }
            }
            if ring.len() >= remaining {
                neighbors.extend(reservoir_sample(&ring, remaining, rng));
                return neighbors;
            }
            remaining -= ring.len();
            neighbors.append(&mut ring);
        }
        neighbors
    }
}

/// Visit the cells at Manhattan distance `radius` from the origin, walking
/// the diamond counter-clockwise from `(radius, 0)`. Each cell is yielded
/// exactly once.
fn diamond_ring(radius: i32) -> impl Iterator<Item = (i32, i32)> {
    debug_assert!(radius > 0);
    let east_north = (0..radius).map(move |i| (radius - i, i));
    let north_west = (0..radius).map(move |i| (-i, radius - i));
    let west_south = (0..radius).map(move |i| (i - radius, -i));
    let south_east = (0..radius).map(move |i| (i, i - radius));
    east_north
        .chain(north_west)
        .chain(west_south)
        .chain(south_east)
}

/// Uniform sample of `k` items without replacement via reservoir sampling.
fn reservoir_sample<K: Copy>(items: &[K], k: usize, rng: &mut dyn RngCore) -> Vec<K> {
    if k >= items.len() {
        return items.to_vec();
    }
    let mut reservoir: Vec<K> = items[..k].to_vec();
    for (i, &item) in items.iter().enumerate().skip(k) {
        let j = rng.random_range(0..=i);
        if j < k {
            reservoir[j] = item;
        }
    }
    reservoir
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::collections::HashSet;

    fn grid() -> SpatialHashGrid<u32> {
        SpatialHashGrid::new((10.0, 10.0)).expect("grid")
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0xC0FFEE)
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(SpatialHashGrid::<u32>::new((0.0, 10.0)).is_err());
        assert!(SpatialHashGrid::<u32>::new((10.0, -1.0)).is_err());
        assert!(SpatialHashGrid::<u32>::new((f32::NAN, 10.0)).is_err());
        assert!(NeighborQuery::new(0, 3, 0).is_err());
        assert!(NeighborQuery::new(3, 1, 5).is_err());
        assert!(NeighborQuery::new(0, 0, 1).is_ok());
    }

    #[test]
    fn update_is_incremental_and_single_bucket() {
        let mut grid = grid();
        grid.update(1, 5.0, 5.0);
        assert_eq!(grid.cell_of(1), Some((0, 0)));

        // Same cell: nothing changes.
        grid.update(1, 9.0, 9.9);
        assert_eq!(grid.cell_of(1), Some((0, 0)));
        assert_eq!(grid.len(), 1);

        // Crossing a cell boundary moves the item to exactly one bucket.
        grid.update(1, 15.0, -5.0);
        assert_eq!(grid.cell_of(1), Some((1, -1)));
        assert_eq!(grid.buckets.len(), 1);
        assert_eq!(grid.buckets[&(1, -1)], vec![1]);
    }

    #[test]
    fn remove_clears_reverse_map_and_empty_buckets() {
        let mut grid = grid();
        grid.update(1, 5.0, 5.0);
        grid.update(2, 6.0, 6.0);
        grid.remove(1);
        assert_eq!(grid.cell_of(1), None);
        assert_eq!(grid.buckets[&(0, 0)], vec![2]);
        grid.remove(2);
        assert!(grid.buckets.is_empty());
        assert!(grid.is_empty());

        // Removing an unknown item is a no-op.
        grid.remove(7);
        assert!(grid.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut grid = grid();
        for i in 0..10 {
            grid.update(i, i as f32 * 7.0, 3.0);
        }
        grid.clear();
        assert!(grid.is_empty());
        assert!(grid.buckets.is_empty());
    }

    #[test]
    fn ring_zero_excludes_self() {
        let mut grid = grid();
        let mut rng = rng();
        grid.update(1, 5.0, 5.0);
        grid.update(2, 6.0, 6.0);
        grid.update(3, 7.0, 7.0);

        let query = NeighborQuery::new(0, 0, 10).expect("query");
        let found = grid.neighbors(1, query, &mut rng);
        let found: HashSet<u32> = found.into_iter().collect();
        assert_eq!(found, HashSet::from([2, 3]));
    }

    #[test]
    fn diamond_rings_cover_manhattan_distance() {
        for radius in 1..6 {
            let cells: Vec<(i32, i32)> = diamond_ring(radius).collect();
            assert_eq!(cells.len(), (4 * radius) as usize);
            let unique: HashSet<(i32, i32)> = cells.iter().copied().collect();
            assert_eq!(unique.len(), cells.len(), "ring {radius} revisits a cell");
            for (dx, dy) in cells {
                assert_eq!(dx.abs() + dy.abs(), radius);
            }
        }
    }

    #[test]
    fn rings_are_preferred_in_increasing_order() {
        let mut grid = grid();
        let mut rng = rng();
        // One occupant in the center cell, three in ring 1, many in ring 2.
        grid.update(0, 5.0, 5.0);
        grid.update(1, 5.5, 5.5);
        grid.update(2, 15.0, 5.0);
        grid.update(3, 5.0, 15.0);
        grid.update(4, -5.0, 5.0);
        for i in 5..15 {
            grid.update(i, 25.0, 5.0 + (i as f32 - 5.0) * 0.1);
        }

        // Limit below the ring-2 total: rings 0 and 1 are returned whole,
        // ring 2 contributes the remainder.
        let query = NeighborQuery::new(0, 2, 6).expect("query");
        let found = grid.neighbors(0, query, &mut rng);
        assert_eq!(found.len(), 6);
        let found: HashSet<u32> = found.into_iter().collect();
        for inner in [1, 2, 3, 4] {
            assert!(found.contains(&inner), "inner ring item {inner} missing");
        }
    }

    #[test]
    fn neighbor_cap_is_exact() {
        let mut grid = grid();
        let mut rng = rng();
        for i in 0..20 {
            grid.update(i, 5.0 + i as f32 * 0.01, 5.0);
        }
        let query = NeighborQuery::new(0, 0, 8).expect("query");
        let found = grid.neighbors(0, query, &mut rng);
        assert_eq!(found.len(), 8);
        let unique: HashSet<u32> = found.iter().copied().collect();
        assert_eq!(unique.len(), 8, "sampling must be without replacement");
        assert!(!found.contains(&0));

        // With fewer available than the limit, everything is returned.
        let wide = NeighborQuery::new(0, 3, 100).expect("query");
        let all = grid.neighbors(0, wide, &mut rng);
        assert_eq!(all.len(), 19);
    }

    #[test]
    fn min_radius_skips_inner_rings() {
        let mut grid = grid();
        let mut rng = rng();
        grid.update(0, 5.0, 5.0);
        grid.update(1, 6.0, 6.0); // same cell
        grid.update(2, 15.0, 5.0); // ring 1
        let query = NeighborQuery::new(1, 1, 10).expect("query");
        let found = grid.neighbors(0, query, &mut rng);
        assert_eq!(found, vec![2]);
    }

    #[test]
    fn untracked_item_yields_no_neighbors() {
        let mut grid = grid();
        let mut rng = rng();
        grid.update(1, 5.0, 5.0);
        let query = NeighborQuery::new(0, 2, 4).expect("query");
        assert!(grid.neighbors(99, query, &mut rng).is_empty());
    }

    #[test]
    fn reservoir_sample_is_exact_and_member_preserving() {
        let mut rng = rng();
        let items: Vec<u32> = (0..100).collect();
        let sample = reservoir_sample(&items, 10, &mut rng);
        assert_eq!(sample.len(), 10);
        let unique: HashSet<u32> = sample.iter().copied().collect();
        assert_eq!(unique.len(), 10);
        assert!(sample.iter().all(|v| *v < 100));

        // k >= n copies the input.
        let all = reservoir_sample(&items, 200, &mut rng);
        assert_eq!(all, items);
    }

    #[test]
    fn negative_coordinates_floor_correctly() {
        let mut grid = grid();
        grid.update(1, -0.5, -0.5);
        assert_eq!(grid.cell_of(1), Some((-1, -1)));
        grid.update(2, -10.0, 0.0);
        assert_eq!(grid.cell_of(2), Some((-1, 0)));
    }
}
