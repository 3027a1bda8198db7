//! Flocking simulation core for the murmur background effect.
//!
//! Boids steer with classic local behaviors (cohesion, alignment,
//! separation, boundary return, centroid seeking) evaluated against
//! spatially-local neighbors each tick inside a polygonal flight zone with
//! a depth axis. The [`Simulation`] orchestrator owns the population and
//! the spatial index, adapting the boid count to a measured tick rate.
//! Rendering, input capture, and frame scheduling live outside this crate.

use murmur_index::{IndexError, NeighborQuery, SpatialHashGrid};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Vectors

/// Plain 3-component vector; x/y are the plane coordinates, z is depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    #[must_use]
    pub fn manhattan_length(self) -> f32 {
        self.x.abs() + self.y.abs() + self.z.abs()
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// z component of the cross product of the x/y projections; its sign is
    /// the rotation direction from `self` toward `other` in the plane.
    #[must_use]
    pub fn cross_z(self, other: Self) -> f32 {
        self.x * other.y - self.y * other.x
    }

    /// Unit vector in the same direction, or `None` for a zero-length
    /// input. Every steering path relies on this guard to keep NaNs out.
    #[must_use]
    pub fn normalized(self) -> Option<Self> {
        let length = self.length();
        if length <= f32::EPSILON {
            None
        } else {
            Some(Self::new(self.x / length, self.y / length, self.z / length))
        }
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

// ---------------------------------------------------------------------------
// Geometry

/// Worst-case inflation of the Manhattan distance over the Euclidean one
/// (reached at a 45 degree diagonal).
const DIAGONAL_SLACK: f32 = std::f32::consts::SQRT_2;

/// Minimum usable polygon edge length for [`validate_polygon`] callers.
pub const DEFAULT_MIN_EDGE_LENGTH: f32 = 10.0;

/// Even-odd ray-casting containment test on the x/y projection.
///
/// A horizontal ray is cast to the right; the point is inside when it
/// crosses an odd number of edges. Works as visually expected for convex
/// and concave polygons; self-intersecting shapes give arbitrary results.
/// Points exactly on an edge or vertex count as outside, and polygons with
/// fewer than three vertices contain nothing. The far-endpoint exclusion
/// is winding-sensitive at vertex level: an interior point whose y equals
/// a pass-through vertex's y can be reported outside for one winding of
/// the same shape and inside for the other.
#[must_use]
pub fn is_inside_polygon(point: Vec3, polygon: &[Vec3]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let (x, y) = (point.x, point.y);
    let mut inside = false;

    let mut j = n - 1;
    for i in 0..n {
        let (x1, y1) = (polygon[i].x, polygon[i].y);
        let (x2, y2) = (polygon[j].x, polygon[j].y);
        let y_diff = y2 - y1;

        if y_diff == 0.0 {
            // Flat edges never toggle; if the ray crosses here the adjacent
            // edge is counted instead. A point lying on the edge is outside.
            if (x1 <= x) == (x < x2) && y1 == y {
                return false;
            }
            j = i;
            continue;
        }

        // Half-open vertical range, excluding the far endpoint so shared
        // vertices are not double-toggled.
        if ((y1 <= y) == (y < y2)) && y != y2 {
            let x_cross = (x2 - x1) * (y - y1) / y_diff + x1;
            if x == x_cross {
                // On the edge itself.
                return false;
            }
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Remove duplicate vertices and collinear runs from a polygon.
///
/// A vertex is dropped when its edge to the next vertex is shorter than
/// `min_edge_length` (measured with Manhattan slack for diagonals), or when
/// its outgoing edge direction repeats the previous kept edge's direction.
/// Kept vertices preserve their original order. Returns `None` when fewer
/// than three vertices survive.
#[must_use]
pub fn validate_polygon(polygon: &[Vec3], min_edge_length: f32) -> Option<Vec<Vec3>> {
    let n = polygon.len();
    if n < 3 {
        return None;
    }
    let mut kept: Vec<Vec3> = Vec::with_capacity(n);
    let mut prev_dir: Option<(f32, f32)> = None;

    for idx in 0..n {
        let point = polygon[idx];
        let next = polygon[(idx + 1) % n];

        let manhattan = (point.x - next.x).abs() + (point.y - next.y).abs();
        if manhattan <= min_edge_length * DIAGONAL_SLACK {
            continue;
        }
        let dir = segment_direction(point, next);
        if prev_dir == Some(dir) {
            continue;
        }
        prev_dir = Some(dir);
        kept.push(point);
    }

    if kept.len() < 3 { None } else { Some(kept) }
}

/// Edge direction normalized by its dominant component, giving an exact
/// equality key for collinearity checks.
fn segment_direction(start: Vec3, end: Vec3) -> (f32, f32) {
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let max = dx.abs().max(dy.abs());
    (dx / max, dy / max)
}

/// Perpendicular offset from `position` to the nearest polygon edge,
/// treating edges as infinite lines and ranking by Manhattan magnitude.
///
/// Used to pick the initial "push back inside" direction when a boid first
/// exits the zone. Degenerate edges are skipped; a polygon with no usable
/// edge yields the zero vector, which callers drop via normalization.
#[must_use]
pub fn closest_orthogonal_direction(polygon: &[Vec3], position: Vec3) -> Vec3 {
    let n = polygon.len();
    let mut min_dist = f32::INFINITY;
    let mut closest = Vec3::ZERO;

    for i in 0..n {
        let start = polygon[i];
        let end = polygon[(i + 1) % n];

        let edge = (end.x - start.x, end.y - start.y);
        // Right-hand orthogonal.
        let ortho = (-edge.1, edge.0);

        // Parametric: start + t*edge = position + s*ortho, solved for t
        // with Cramer's rule. The determinant is the squared edge length.
        let det = edge.0 * ortho.1 - edge.1 * ortho.0;
        if det < 1e-6 {
            continue;
        }

        let dx = position.x - start.x;
        let dy = position.y - start.y;
        let t = (dx * ortho.1 - dy * ortho.0) / det;

        let offset = Vec3::new(
            start.x + t * edge.0 - position.x,
            start.y + t * edge.1 - position.y,
            0.0,
        );
        let manhattan = offset.x.abs() + offset.y.abs();
        if manhattan < min_dist {
            min_dist = manhattan;
            closest = offset;
        }
    }
    closest
}

// ---------------------------------------------------------------------------
// Steering limit

/// Bound the angular change a desired acceleration may apply to the
/// current heading.
///
/// When the angle between the current velocity direction and the desired
/// acceleration direction is within `max_angle_deg`, the desired vector
/// passes through unchanged. Otherwise the current direction is rotated in
/// the x/y plane by exactly `max_angle_deg` toward the desired direction
/// and rescaled to the desired magnitude. The capped output is planar: its
/// z component is zero, so depth steering only takes effect through the
/// uncapped path and the cap can never reinforce an existing depth drift.
/// Zero length on either side means "no constraint", and a pure-depth
/// heading has no planar direction to rotate, so in both cases the desired
/// acceleration passes through, never a NaN.
#[must_use]
pub fn limit_turn(velocity: Vec3, desired: Vec3, max_angle_deg: f32) -> Vec3 {
    let Some(heading) = velocity.normalized() else {
        return desired;
    };
    let Some(wanted) = desired.normalized() else {
        return desired;
    };

    let max_angle = max_angle_deg.to_radians();
    let angle = heading.dot(wanted).clamp(-1.0, 1.0).acos();
    if angle <= max_angle {
        return desired;
    }

    let sign = if heading.cross_z(wanted) >= 0.0 {
        1.0
    } else {
        -1.0
    };
    let (sin, cos) = (max_angle.sin() * sign, max_angle.cos());
    let rotated = Vec3::new(
        heading.x * cos - heading.y * sin,
        heading.x * sin + heading.y * cos,
        0.0,
    );
    match rotated.normalized() {
        Some(unit) => unit * desired.length(),
        None => desired,
    }
}

// ---------------------------------------------------------------------------
// Flight zone

/// Fraction of the smaller bounds dimension used to inset the default
/// polygon from the bounding box.
pub const ZONE_PADDING_RATIO: f32 = 0.15;

/// Axis-aligned bounding box described by origin and extent.
///
/// Equality is exact; [`FlightZone::resize`] relies on that to detect
/// no-op resizes without an epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn end_x(&self) -> f32 {
        self.x + self.width
    }

    #[must_use]
    pub fn end_y(&self) -> f32 {
        self.y + self.height
    }
}

/// The boids' intended operating volume: a 2-D polygon extruded over the
/// depth range `[0, max_depth]`, plus a transient set of attractor points
/// ("centroids") refreshed by the driver each tick.
#[derive(Debug, Clone)]
pub struct FlightZone {
    polygon: Vec<Vec3>,
    centroids: Vec<Vec3>,
    bounds: Bounds,
    max_depth: f32,
}

impl FlightZone {
    /// Build a zone with the default inward-padded rectangle polygon and a
    /// single centroid at its center.
    #[must_use]
    pub fn new(bounds: Bounds, max_depth: f32) -> Self {
        let mut zone = Self {
            polygon: Self::default_polygon(bounds),
            centroids: Vec::new(),
            bounds,
            max_depth,
        };
        zone.centroids.push(zone.center());
        zone
    }

    fn default_polygon(bounds: Bounds) -> Vec<Vec3> {
        let padding = bounds.width.min(bounds.height) * ZONE_PADDING_RATIO;
        vec![
            Vec3::new(bounds.x + padding, bounds.y + padding, 0.0),
            Vec3::new(bounds.end_x() - padding, bounds.y + padding, 0.0),
            Vec3::new(bounds.end_x() - padding, bounds.end_y() - padding, 0.0),
            Vec3::new(bounds.x + padding, bounds.end_y() - padding, 0.0),
        ]
    }

    /// Average of the polygon vertices on the projection plane.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        if self.polygon.is_empty() {
            return Vec3::ZERO;
        }
        let n = self.polygon.len() as f32;
        let sum = self
            .polygon
            .iter()
            .fold(Vec3::ZERO, |acc, v| acc + Vec3::new(v.x, v.y, 0.0));
        Vec3::new(sum.x / n, sum.y / n, 0.0)
    }

    /// True when the position's depth falls outside `[0, max_depth]` or its
    /// projection falls outside the polygon.
    #[must_use]
    pub fn is_outside(&self, position: Vec3) -> bool {
        position.z < 0.0
            || position.z > self.max_depth
            || !is_inside_polygon(position, &self.polygon)
    }

    /// Affinely remap every polygon vertex and centroid from the old
    /// bounding box into the new one. Exact-equality no-op.
    pub fn resize(&mut self, new_bounds: Bounds) {
        if self.bounds == new_bounds {
            return;
        }
        let scale_x = if new_bounds.width == self.bounds.width {
            1.0
        } else {
            new_bounds.width / self.bounds.width
        };
        let scale_y = if new_bounds.height == self.bounds.height {
            1.0
        } else {
            new_bounds.height / self.bounds.height
        };

        for point in self.polygon.iter_mut().chain(self.centroids.iter_mut()) {
            point.x = (point.x - self.bounds.x) * scale_x + new_bounds.x;
            point.y = (point.y - self.bounds.y) * scale_y + new_bounds.y;
        }
        self.bounds = new_bounds;
    }

    /// Replace the working polygon with an already-validated one.
    pub fn set_polygon(&mut self, polygon: Vec<Vec3>) {
        debug!(vertices = polygon.len(), "replacing flight zone polygon");
        self.polygon = polygon;
    }

    /// Restore the default padded-rectangle polygon.
    pub fn reset_polygon(&mut self) {
        self.polygon = Self::default_polygon(self.bounds);
    }

    /// Add an attractor point, clamping its depth into range.
    pub fn add_centroid(&mut self, mut point: Vec3) {
        point.z = point.z.clamp(0.0, self.max_depth);
        self.centroids.push(point);
    }

    /// Drop all attractor points, retaining capacity.
    pub fn clear_centroids(&mut self) {
        self.centroids.clear();
    }

    #[must_use]
    pub fn polygon(&self) -> &[Vec3] {
        &self.polygon
    }

    #[must_use]
    pub fn centroids(&self) -> &[Vec3] {
        &self.centroids
    }

    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    #[must_use]
    pub const fn max_depth(&self) -> f32 {
        self.max_depth
    }
}

// ---------------------------------------------------------------------------
// Boid

/// Ticks a return-to-zone maneuver keeps contributing acceleration.
pub const RETURN_MANEUVER_TICKS: u32 = 20;
/// Ticks a centroid-seek maneuver keeps contributing acceleration.
pub const SEEK_MANEUVER_TICKS: u32 = 10;

/// Extra turn freedom granted while pulling up from low terrain.
const PULL_UP_TURN_BONUS_DEG: f32 = 20.0;
/// Extra speed cap granted while pulling up from low terrain.
const PULL_UP_SPEED_BONUS: f32 = 1.0;
/// Below this integrated speed the boid coasts on its previous heading
/// instead of dividing by a near-zero norm.
const COAST_EPSILON: f32 = 1e-6;

/// Per-behavior acceleration weights. Gravity is positive because the
/// origin is the top-left corner and y grows downward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelWeights {
    pub back_to_flight_zone: f32,
    pub follow_centroids: f32,
    pub pull_up_terrain: f32,
    pub cohesion: f32,
    pub alignment: f32,
    pub separation: f32,
    pub center_of_mass: f32,
    pub gravity: f32,
}

impl Default for AccelWeights {
    fn default() -> Self {
        Self {
            back_to_flight_zone: 0.6,
            follow_centroids: 0.4,
            pull_up_terrain: 1.0,
            cohesion: 0.6,
            alignment: 1.0,
            separation: 1.2,
            center_of_mass: 0.05,
            gravity: 0.05,
        }
    }
}

/// Per-boid tunable parameters; each boid keeps its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoidConfig {
    pub min_speed: f32,
    pub max_speed: f32,
    pub max_turn_angle_deg: f32,
    pub accel: AccelWeights,
}

impl Default for BoidConfig {
    fn default() -> Self {
        Self {
            min_speed: 1.0,
            max_speed: 6.0,
            max_turn_angle_deg: 120.0,
            accel: AccelWeights::default(),
        }
    }
}

/// Time-boxed directional override contributing acceleration each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Maneuver {
    pub direction: Vec3,
    pub remaining_ticks: u32,
}

/// Read-only snapshot of a neighbor's kinematic state, taken before any
/// boid mutates during the tick.
#[derive(Debug, Clone, Copy)]
pub struct NeighborState {
    pub position: Vec3,
    pub velocity: Vec3,
}

/// Per-tick inputs to [`Boid::update`], assembled by the simulation.
#[derive(Debug)]
pub struct TickContext<'a> {
    /// Broad neighbor set for cohesion and alignment.
    pub neighbors: &'a [NeighborState],
    /// Tight neighbor set for separation.
    pub close_neighbors: &'a [NeighborState],
    /// Characteristic neighbor radius (one index cell half-diagonal).
    pub neighbor_radius: f32,
    pub zone: &'a FlightZone,
    /// Terrain line; boids at or below it pull up this tick.
    pub max_height: f32,
    /// Manhattan distance under which centroids become visible.
    pub visible_distance: f32,
    /// Depth filter for cohesion/alignment; `None` disables filtering.
    pub depth_window: Option<f32>,
    /// Shared per-tick random scalar in `[0, 1)`.
    pub random_seed: f32,
    /// Ambient acceleration direction, scaled by the gravity weight.
    pub gravity: Vec3,
    /// Flock-wide center of mass, when anchoring is enabled.
    pub flock_center: Option<Vec3>,
}

/// One simulated flocking agent.
#[derive(Debug, Clone)]
pub struct Boid {
    display_id: u64,
    position: Vec3,
    velocity: Vec3,
    acceleration: Vec3,
    config: BoidConfig,
    back_to_zone: Option<Maneuver>,
    seek_centroid: Option<Maneuver>,
    last_inside: Option<Vec3>,
    was_outside: bool,
}

impl Boid {
    /// Spawn with a random planar heading at full speed.
    pub fn new(display_id: u64, position: Vec3, config: BoidConfig, rng: &mut dyn RngCore) -> Self {
        let theta = rng.random_range(0.0..std::f32::consts::TAU);
        Self {
            display_id,
            position,
            velocity: Vec3::new(
                theta.cos() * config.max_speed,
                theta.sin() * config.max_speed,
                0.0,
            ),
            acceleration: Vec3::ZERO,
            config,
            back_to_zone: None,
            seek_centroid: None,
            last_inside: None,
            was_outside: false,
        }
    }

    #[must_use]
    pub const fn display_id(&self) -> u64 {
        self.display_id
    }

    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    #[must_use]
    pub const fn velocity(&self) -> Vec3 {
        self.velocity
    }

    #[must_use]
    pub const fn config(&self) -> &BoidConfig {
        &self.config
    }

    /// Active return-to-zone maneuver, if any.
    #[must_use]
    pub const fn return_maneuver(&self) -> Option<Maneuver> {
        self.back_to_zone
    }

    /// Active centroid-seek maneuver, if any.
    #[must_use]
    pub const fn seek_maneuver(&self) -> Option<Maneuver> {
        self.seek_centroid
    }

    /// Advance one tick: accumulate steering contributions, bound the turn,
    /// integrate velocity and position.
    pub fn update(&mut self, ctx: &TickContext<'_>) {
        let mut max_turn = self.config.max_turn_angle_deg;
        let mut max_speed = self.config.max_speed;
        let mut pulling_up = false;
        let mut steering = Vec3::ZERO;

        // Pull up if low terrain, with extra freedom to do so.
        if self.position.y >= ctx.max_height {
            steering.y -= self.config.accel.pull_up_terrain;
            max_turn += PULL_UP_TURN_BONUS_DEG;
            max_speed += PULL_UP_SPEED_BONUS;
            pulling_up = true;
        }

        // Boundary check: get back to the flight zone if outside.
        let outside = ctx.zone.is_outside(self.position);
        if outside {
            if self.back_to_zone.is_none() {
                if let Some(direction) = self.return_direction(ctx) {
                    self.back_to_zone = Some(Maneuver {
                        direction,
                        remaining_ticks: RETURN_MANEUVER_TICKS,
                    });
                }
            }
        } else {
            self.last_inside = Some(self.position);
            self.back_to_zone = None;
        }
        if let Some(maneuver) = &mut self.back_to_zone {
            steering += maneuver.direction * self.config.accel.back_to_flight_zone;
            maneuver.remaining_ticks -= 1;
            if maneuver.remaining_ticks == 0 {
                self.back_to_zone = None;
            }
        }
        self.was_outside = outside;

        // Seek visible centroids.
        if self.seek_centroid.is_none() && !ctx.zone.centroids().is_empty() {
            let mut pull = Vec3::ZERO;
            for centroid in ctx.zone.centroids() {
                let offset = *centroid - self.position;
                let distance = offset.manhattan_length();
                if distance >= ctx.visible_distance {
                    continue;
                }
                if let Some(direction) = offset.normalized() {
                    pull += direction * (ctx.visible_distance - distance);
                }
            }
            if let Some(direction) = pull.normalized() {
                self.seek_centroid = Some(Maneuver {
                    direction,
                    remaining_ticks: SEEK_MANEUVER_TICKS,
                });
            }
        }
        if let Some(maneuver) = &mut self.seek_centroid {
            steering += maneuver.direction * self.config.accel.follow_centroids;
            maneuver.remaining_ticks -= 1;
            if maneuver.remaining_ticks == 0 {
                self.seek_centroid = None;
            }
        }

        // Cohesion and alignment: stay with the flock. Suspended while
        // pulling up so the climb is not fought by the flock average.
        if !pulling_up {
            let mut cohesion = Vec3::ZERO;
            let mut alignment = Vec3::ZERO;
            for neighbor in ctx.neighbors {
                if let Some(window) = ctx.depth_window {
                    if (neighbor.position.z - self.position.z).abs() > window {
                        continue;
                    }
                }
                cohesion += neighbor.position - self.position;
                alignment += neighbor.velocity;
            }
            if let Some(direction) = cohesion.normalized() {
                steering += direction * self.config.accel.cohesion;
            }
            if let Some(direction) = alignment.normalized() {
                steering += direction * self.config.accel.alignment;
            }
        }

        // Separation: avoid collisions with close neighbors.
        let mut separation = Vec3::ZERO;
        for neighbor in ctx.close_neighbors {
            let offset = self.position - neighbor.position;
            let distance = offset.length();
            if distance <= f32::EPSILON {
                // Superposed neighbors get a seed-derived nudge apart.
                let angle = ctx.random_seed * std::f32::consts::TAU;
                separation += Vec3::new(angle.cos(), angle.sin(), 0.0);
                continue;
            }
            separation += offset * (ctx.neighbor_radius / distance);
        }
        if let Some(direction) = separation.normalized() {
            steering += direction * self.config.accel.separation;
        }

        // Gentle anchor toward the flock-wide center of mass.
        if self.config.accel.center_of_mass > 0.0 {
            if let Some(center) = ctx.flock_center {
                if let Some(direction) = (center - self.position).normalized() {
                    steering += direction * self.config.accel.center_of_mass;
                }
            }
        }

        // Bound the turn, then apply gravity unless outside the zone.
        self.acceleration = limit_turn(self.velocity, steering, max_turn);
        if !outside {
            self.acceleration += ctx.gravity * self.config.accel.gravity;
        }

        // Integrate velocity, clamping speed; coast when the result would
        // be numerically meaningless.
        let candidate = self.velocity + self.acceleration;
        let speed = candidate.length();
        if speed >= COAST_EPSILON {
            let clamped = speed.clamp(self.config.min_speed, max_speed);
            self.velocity = candidate * (clamped / speed);
        }

        self.position += self.velocity;
    }

    /// Direction for a fresh return-to-zone maneuver.
    fn return_direction(&self, ctx: &TickContext<'_>) -> Option<Vec3> {
        if !self.was_outside {
            // Just crossed inside-to-outside: push straight back toward
            // the nearest edge, and back into depth range when the exit
            // was through a depth bound.
            let mut offset = if is_inside_polygon(self.position, ctx.zone.polygon()) {
                Vec3::ZERO
            } else {
                closest_orthogonal_direction(ctx.zone.polygon(), self.position)
            };
            offset.z = depth_offset(self.position.z, ctx.zone.max_depth());
            return offset.normalized();
        }
        if let Some(anchor) = self.last_inside {
            // The remembered position must still test inside; the polygon
            // may have changed since it was recorded.
            if !ctx.zone.is_outside(anchor) {
                return (anchor - self.position).normalized();
            }
        }
        let polygon = ctx.zone.polygon();
        if polygon.is_empty() {
            return None;
        }
        let idx = ((ctx.random_seed * polygon.len() as f32) as usize).min(polygon.len() - 1);
        (polygon[idx] - self.position).normalized()
    }
}

/// Signed distance back inside the depth range; zero when already within.
fn depth_offset(z: f32, max_depth: f32) -> f32 {
    if z < 0.0 {
        -z
    } else if z > max_depth {
        max_depth - z
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Simulation

new_key_type! {
    /// Stable handle for boids backed by a generational slot map.
    pub struct BoidId;
}

/// Simulation clock (ticks processed since start).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Events emitted after processing a simulation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickEvents {
    pub tick: Tick,
    pub spawned: usize,
    pub removed: usize,
}

/// Errors raised when constructing a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Static configuration for a murmur simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Depth extent of the simulated volume.
    pub max_depth: f32,
    /// Spatial index cell extents (x, y).
    pub cell_size: (f32, f32),
    /// Broad ring query feeding cohesion/alignment.
    pub neighbor_query: NeighborQuery,
    /// Tight ring query feeding separation.
    pub close_query: NeighborQuery,
    /// Manhattan distance under which centroids attract boids.
    pub visible_distance: f32,
    /// Depth filter for cohesion/alignment; `None` disables it.
    pub depth_window: Option<f32>,
    /// Tick rate the population adapts toward.
    pub target_tick_rate: f32,
    /// How far below target the measured rate may fall before the
    /// population shrinks. Policy threshold, safe to retune.
    pub tick_rate_slack: f32,
    /// Ambient acceleration direction (unit-ish); scaled per boid by its
    /// gravity weight.
    pub gravity: Vec3,
    /// Parameter template copied to every spawned boid.
    pub boid: BoidConfig,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_depth: 100.0,
            cell_size: (80.0, 80.0),
            neighbor_query: NeighborQuery {
                min: 0,
                max: 3,
                limit: 12,
            },
            close_query: NeighborQuery {
                min: 0,
                max: 1,
                limit: 6,
            },
            visible_distance: 400.0,
            depth_window: Some(40.0),
            target_tick_rate: 60.0,
            tick_rate_slack: 8.0,
            gravity: Vec3::new(0.0, 1.0, 0.0),
            boid: BoidConfig::default(),
            rng_seed: None,
        }
    }
}

impl SimulationConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !(self.max_depth > 0.0) {
            return Err(SimulationError::InvalidConfig("max_depth must be positive"));
        }
        if !(self.cell_size.0 > 0.0 && self.cell_size.1 > 0.0) {
            return Err(SimulationError::InvalidConfig(
                "cell sizes must be positive",
            ));
        }
        if !(self.visible_distance > 0.0) {
            return Err(SimulationError::InvalidConfig(
                "visible_distance must be positive",
            ));
        }
        if !(self.target_tick_rate > 0.0) {
            return Err(SimulationError::InvalidConfig(
                "target_tick_rate must be positive",
            ));
        }
        if self.tick_rate_slack < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "tick_rate_slack must be non-negative",
            ));
        }
        if !(self.boid.min_speed > 0.0) || self.boid.max_speed < self.boid.min_speed {
            return Err(SimulationError::InvalidConfig(
                "boid speeds must satisfy 0 < min_speed <= max_speed",
            ));
        }
        if !(self.boid.max_turn_angle_deg > 0.0 && self.boid.max_turn_angle_deg <= 180.0) {
            return Err(SimulationError::InvalidConfig(
                "max_turn_angle_deg must be in (0, 180]",
            ));
        }
        self.neighbor_query.validate()?;
        self.close_query.validate()?;
        Ok(())
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Owns the boid population and the spatial index; runs one global tick at
/// a time, single-threaded and synchronous.
pub struct Simulation {
    config: SimulationConfig,
    bounds: Bounds,
    boids: SlotMap<BoidId, Boid>,
    handles: Vec<BoidId>,
    index: SpatialHashGrid<BoidId>,
    next_display_id: u64,
    target_population: usize,
    running: bool,
    tick: Tick,
    rng: SmallRng,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("bounds", &self.bounds)
            .field("boid_count", &self.boids.len())
            .field("target_population", &self.target_population)
            .field("running", &self.running)
            .field("tick", &self.tick)
            .finish()
    }
}

impl Simulation {
    /// Instantiate a stopped simulation over the given spawn bounds.
    pub fn new(config: SimulationConfig, bounds: Bounds) -> Result<Self, SimulationError> {
        config.validate()?;
        let index = SpatialHashGrid::new(config.cell_size)?;
        let rng = config.seeded_rng();
        Ok(Self {
            config,
            bounds,
            boids: SlotMap::with_key(),
            handles: Vec::new(),
            index,
            next_display_id: 0,
            target_population: 0,
            running: false,
            tick: Tick::zero(),
            rng,
        })
    }

    /// Spawn the initial population and begin accepting ticks.
    ///
    /// `initial_count` becomes the target population; the boid parameter
    /// template is replaced by `boid_config`. Starting an already-running
    /// simulation retunes those two, trimming any excess population so the
    /// count never exceeds the target; growth back toward a raised target
    /// is left to `update`'s rate policy.
    pub fn start(&mut self, initial_count: usize, boid_config: BoidConfig) {
        self.target_population = initial_count;
        self.config.boid = boid_config;
        if self.running {
            if self.boids.len() > self.target_population {
                self.remove_agents(self.boids.len() - self.target_population);
            }
            return;
        }
        for _ in 0..initial_count {
            self.spawn_boid();
        }
        self.running = true;
        debug!(count = initial_count, "simulation started");
    }

    /// Run one global tick: adapt the population to the measured tick
    /// rate, snapshot neighbor sets from the index, update every boid,
    /// then re-index boids whose cell changed.
    pub fn update(
        &mut self,
        zone: &FlightZone,
        max_height: f32,
        tick_rate: Option<f32>,
    ) -> TickEvents {
        if !self.running {
            return TickEvents::default();
        }

        let mut spawned = 0;
        let mut removed = 0;
        if let Some(rate) = tick_rate {
            if rate >= self.config.target_tick_rate {
                if self.add_agents_if_missing(1) {
                    spawned = 1;
                }
            } else if rate < self.config.target_tick_rate - self.config.tick_rate_slack {
                removed = self.remove_agents(1);
            }
        }

        let random_seed: f32 = self.rng.random();
        let flock_center = self.flock_center();
        let neighbor_radius = self.index.cell_radius();

        // Snapshot neighbor sets before any boid moves so every boid sees
        // the previous tick's positions (read-after-all-writes ordering).
        type Snapshot = SmallVec<[NeighborState; 16]>;
        let mut batches: Vec<(BoidId, Snapshot, Snapshot)> =
            Vec::with_capacity(self.handles.len());
        for &id in &self.handles {
            let broad = self
                .index
                .neighbors(id, self.config.neighbor_query, &mut self.rng);
            let close = self
                .index
                .neighbors(id, self.config.close_query, &mut self.rng);
            let snapshot = |ids: Vec<BoidId>, boids: &SlotMap<BoidId, Boid>| -> Snapshot {
                ids.into_iter()
                    .filter_map(|nid| boids.get(nid))
                    .map(|boid| NeighborState {
                        position: boid.position,
                        velocity: boid.velocity,
                    })
                    .collect()
            };
            batches.push((id, snapshot(broad, &self.boids), snapshot(close, &self.boids)));
        }

        for (id, broad, close) in &batches {
            let ctx = TickContext {
                neighbors: broad,
                close_neighbors: close,
                neighbor_radius,
                zone,
                max_height,
                visible_distance: self.config.visible_distance,
                depth_window: self.config.depth_window,
                random_seed,
                gravity: self.config.gravity,
                flock_center,
            };
            if let Some(boid) = self.boids.get_mut(*id) {
                boid.update(&ctx);
            }
        }

        for &id in &self.handles {
            if let Some(boid) = self.boids.get(id) {
                self.index.update(id, boid.position.x, boid.position.y);
            }
        }

        self.tick = self.tick.next();
        TickEvents {
            tick: self.tick,
            spawned,
            removed,
        }
    }

    /// Spawn up to `n` boids without exceeding the target population.
    /// Returns true when at least one was spawned.
    pub fn add_agents_if_missing(&mut self, n: usize) -> bool {
        let mut spawned = 0;
        while spawned < n && self.boids.len() < self.target_population {
            self.spawn_boid();
            spawned += 1;
        }
        if spawned > 0 {
            debug!(spawned, population = self.boids.len(), "population grown");
        }
        spawned > 0
    }

    /// Remove up to `n` most recently spawned boids from the population
    /// and the index. Returns the number removed.
    pub fn remove_agents(&mut self, n: usize) -> usize {
        let mut removed = 0;
        while removed < n {
            let Some(id) = self.handles.pop() else {
                break;
            };
            self.boids.remove(id);
            self.index.remove(id);
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, population = self.boids.len(), "population shrunk");
        }
        removed
    }

    /// Replace the spawn bounds after a display-geometry change. The
    /// flight zone is resized separately by its owner.
    pub fn resize(&mut self, new_bounds: Bounds) {
        self.bounds = new_bounds;
    }

    /// Stop issuing ticks and discard population and index state.
    pub fn stop(&mut self) {
        self.boids.clear();
        self.handles.clear();
        self.index.clear();
        self.target_population = 0;
        self.running = false;
        debug!("simulation stopped");
    }

    fn spawn_boid(&mut self) {
        // Spawn across a box 40% wider than the bounds so boids drift in
        // from beyond the visible edges.
        let x = self.bounds.x + self.bounds.width * (self.rng.random::<f32>() * 1.4 - 0.2);
        let y = self.bounds.y + self.bounds.height * (self.rng.random::<f32>() * 1.4 - 0.2);
        let z = self.rng.random_range(0.0..=self.config.max_depth);

        let display_id = self.next_display_id;
        self.next_display_id += 1;

        let boid = Boid::new(display_id, Vec3::new(x, y, z), self.config.boid, &mut self.rng);
        let position = boid.position();
        let id = self.boids.insert(boid);
        self.handles.push(id);
        self.index.update(id, position.x, position.y);
    }

    fn flock_center(&self) -> Option<Vec3> {
        if self.boids.is_empty() {
            return None;
        }
        let sum = self
            .handles
            .iter()
            .filter_map(|id| self.boids.get(*id))
            .fold(Vec3::ZERO, |acc, boid| acc + boid.position);
        Some(sum * (1.0 / self.boids.len() as f32))
    }

    /// Number of live boids.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.boids.len()
    }

    /// Number of items tracked by the spatial index.
    #[must_use]
    pub fn indexed_count(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub const fn target_population(&self) -> usize {
        self.target_population
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Iterate boids in stable spawn order.
    pub fn boids(&self) -> impl Iterator<Item = &Boid> {
        self.handles.iter().filter_map(|id| self.boids.get(*id))
    }

    /// Borrow a boid by handle.
    #[must_use]
    pub fn boid(&self, id: BoidId) -> Option<&Boid> {
        self.boids.get(id)
    }
}
