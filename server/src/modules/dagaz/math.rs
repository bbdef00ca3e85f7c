//! Vector, quad and ray primitives for the spatial partition.

use skein_shared::{QuadState, RayState, Vec3State};
use std::ops::{Add, Sub};

/// Positional tolerance for the in-bounds check of a ray-quad hit.
pub const POSITION_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    pub fn normalized(self) -> Vec3 {
        let length = self.length();
        if length == 0.0 {
            self
        } else {
            self.scale(1.0 / length)
        }
    }

    pub fn from_state(state: Vec3State) -> Self {
        Self::new(state.x, state.y, state.z)
    }

    pub fn to_state(self) -> Vec3State {
        Vec3State {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

pub fn equal_with_epsilon(a: f32, b: f32, epsilon: f32) -> bool {
    (a - b).abs() <= epsilon
}

fn in_range_with_epsilon(value: f32, min: f32, max: f32, epsilon: f32) -> bool {
    value + epsilon >= min && value - epsilon <= max
}

/// An axis-aligned horizontal planar patch. `extents` are half-extents; the
/// normal is implicit, computed at construction from the edge cross product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub center: Vec3,
    pub extents: Vec3,
    pub normal: Vec3,
    pub merge_count: u32,
}

impl Quad {
    pub fn new(center: Vec3, extents: Vec3) -> Self {
        Self {
            center,
            extents,
            normal: calculate_normal(center, extents),
            merge_count: 0,
        }
    }

    pub fn from_state(state: QuadState) -> Self {
        let center = Vec3::from_state(state.center);
        let extents = Vec3::from_state(state.extents);
        Self {
            center,
            extents,
            normal: calculate_normal(center, extents),
            merge_count: state.merge_count,
        }
    }

    pub fn to_state(self) -> QuadState {
        QuadState {
            center: self.center.to_state(),
            extents: self.extents.to_state(),
            merge_count: self.merge_count,
        }
    }

    pub fn min_point(self) -> Vec3 {
        self.center - self.extents
    }

    pub fn max_point(self) -> Vec3 {
        self.center + self.extents
    }
}

fn calculate_normal(center: Vec3, extents: Vec3) -> Vec3 {
    let point_a = center + Vec3::new(extents.x, extents.y, 0.0);
    let point_b = center + Vec3::new(0.0, extents.y, extents.z);
    let edge_a = point_a - center;
    let edge_b = point_b - center;
    edge_b.cross(edge_a).normalized()
}

/// A segment ray; hit parameters are reported in `[0, 1]` along `to - from`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub from: Vec3,
    pub to: Vec3,
}

impl Ray {
    pub fn new(from: Vec3, to: Vec3) -> Self {
        Self { from, to }
    }

    pub fn from_state(state: RayState) -> Self {
        Self {
            from: Vec3::from_state(state.from),
            to: Vec3::from_state(state.to),
        }
    }

    pub fn direction(self) -> Vec3 {
        self.to - self.from
    }
}

/// Whether two horizontal quads overlap in their xz-footprints. Edge contact
/// does not count as overlap.
pub fn horizontal_overlap(a: &Quad, b: &Quad) -> bool {
    let min_a = a.min_point();
    let max_a = a.max_point();
    let min_b = b.min_point();
    let max_b = b.max_point();

    min_a.x < max_b.x && max_a.x > min_b.x && min_a.z < max_b.z && max_a.z > min_b.z
}

/// Plane intersection against the quad's implicit normal. The hit is accepted
/// when the parameter lies in `[0, 1]` and the hit point falls inside the box
/// `center ± extents`, padded by [`POSITION_EPSILON`].
pub fn intersect_ray_quad(ray: &Ray, quad: &Quad) -> Option<f32> {
    let direction = ray.direction();

    let denominator = quad.normal.dot(direction);
    if denominator == 0.0 {
        return None;
    }

    let t = (quad.normal.dot(quad.center) - quad.normal.dot(ray.from)) / denominator;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }

    let hit = ray.from + direction.scale(t);
    let min = quad.min_point();
    let max = quad.max_point();
    if in_range_with_epsilon(hit.x, min.x, max.x, POSITION_EPSILON)
        && in_range_with_epsilon(hit.y, min.y, max.y, POSITION_EPSILON)
        && in_range_with_epsilon(hit.z, min.z, max.z, POSITION_EPSILON)
    {
        Some(t)
    } else {
        None
    }
}
