//! Uniform 2D grid of horizontal quads with merge-on-insert.
//!
//! The grid is keyed on the xz plane; every quad is referenced by each cell
//! its xz-footprint overlaps and the bounds always contain every quad. Quads
//! keep a single identity across merges: merging moves the surviving quad 20%
//! toward the incoming candidate and updates cell membership along the edges
//! that changed.

use super::math::{equal_with_epsilon, horizontal_overlap, intersect_ray_quad, Quad, Ray, Vec3};
use std::collections::HashSet;

/// Two quads merge when their center heights differ by no more than this.
pub const MERGE_EPSILON: f32 = 0.6;

/// Length of the vertical probe rays shot during the merge loop.
const MERGE_PROBE_LENGTH: f32 = MERGE_EPSILON + 1.0;

/// Fraction a surviving quad moves toward the merge candidate.
const MERGE_STEP: f32 = 0.2;

/// The fixed-epsilon probe with a partial step is not guaranteed to converge
/// for adversarial inputs, so the chain is cut here and logged.
const MAX_MERGE_ITERATIONS: usize = 32;

/// Inclusive cell rectangle: (row0, row1, col0, col1).
type CellRect = (usize, usize, usize, usize);

#[derive(Debug, Clone, PartialEq)]
pub struct DebugInfo {
    pub resolution: u32,
    pub row_count: u32,
    pub col_count: u32,
    pub plane_count: u32,
    pub merge_count: u32,
    pub min: Vec3,
    pub max: Vec3,
    /// Per-cell reference counts, row-major.
    pub occupancy: Vec<u32>,
}

pub struct RegularGrid {
    resolution: u32,
    plane_count: u32,
    merge_count: u32,
    min: Vec3,
    max: Vec3,
    /// Quad arena; merged-away candidates are never added, so entries are
    /// live for the lifetime of the grid and indices are stable identities.
    quads: Vec<Quad>,
    /// cells[row][col] -> indices into `quads`, row along z, column along x.
    cells: Vec<Vec<Vec<usize>>>,
}

impl Default for RegularGrid {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl RegularGrid {
    pub fn new(rows: u32, cols: u32, resolution: u32) -> Self {
        let rows = rows.max(1) as usize;
        let cols = cols.max(1) as usize;
        let resolution = resolution.max(1);

        Self {
            resolution,
            plane_count: 0,
            merge_count: 0,
            min: Vec3::default(),
            max: Vec3::new(
                (cols as u32 * resolution) as f32,
                0.0,
                (rows as u32 * resolution) as f32,
            ),
            quads: Vec::new(),
            cells: vec![vec![Vec::new(); cols]; rows],
        }
    }

    pub fn plane_count(&self) -> u32 {
        self.plane_count
    }

    pub fn merge_count(&self) -> u32 {
        self.merge_count
    }

    pub fn min(&self) -> Vec3 {
        self.min
    }

    pub fn max(&self) -> Vec3 {
        self.max
    }

    fn rows(&self) -> usize {
        self.cells.len()
    }

    fn cols(&self) -> usize {
        self.cells[0].len()
    }

    fn col_of(&self, x: f32) -> i64 {
        ((x - self.min.x) / self.resolution as f32).floor() as i64
    }

    fn row_of(&self, z: f32) -> i64 {
        ((z - self.min.z) / self.resolution as f32).floor() as i64
    }

    /// Inclusive, clamped cell rectangle covered by an xz-footprint.
    fn cell_rect(&self, min_point: Vec3, max_point: Vec3) -> CellRect {
        let clamp_col = |v: i64| v.clamp(0, self.cols() as i64 - 1) as usize;
        let clamp_row = |v: i64| v.clamp(0, self.rows() as i64 - 1) as usize;
        (
            clamp_row(self.row_of(min_point.z)),
            clamp_row(self.row_of(max_point.z)),
            clamp_col(self.col_of(min_point.x)),
            clamp_col(self.col_of(max_point.x)),
        )
    }

    fn rect_contains(rect: CellRect, row: usize, col: usize) -> bool {
        row >= rect.0 && row <= rect.1 && col >= rect.2 && col <= rect.3
    }

    /// Inserts a quad, merging it into an existing one when the vertical
    /// probe finds a neighbour within the epsilon band whose footprint
    /// overlaps. Without a merge the quad is appended to every cell its
    /// footprint covers.
    pub fn insert_quad(&mut self, quad: Quad) {
        self.expand_to_fit(quad.min_point());
        self.expand_to_fit(quad.max_point());

        let mut candidate = quad;
        let mut candidate_idx: Option<usize> = None;

        for iteration in 0.. {
            if iteration == MAX_MERGE_ITERATIONS {
                log::debug!("merge loop stopped at iteration cap");
                break;
            }

            let origin = candidate.center;
            let up = Ray::new(origin, origin + Vec3::new(0.0, MERGE_PROBE_LENGTH, 0.0));
            let down = Ray::new(origin, origin - Vec3::new(0.0, MERGE_PROBE_LENGTH, 0.0));

            let hit_up = self.intersect_excluding(&up, candidate_idx);
            let hit_down = self.intersect_excluding(&down, candidate_idx);
            let hit = match (hit_up, hit_down) {
                (Some((up_idx, up_t)), Some((down_idx, down_t))) => {
                    if down_t < up_t {
                        Some((down_idx, down_t))
                    } else {
                        Some((up_idx, up_t))
                    }
                }
                (up, down) => up.or(down),
            };

            let Some((target_idx, _)) = hit else { break };
            let target = self.quads[target_idx];
            if !equal_with_epsilon(target.center.y, origin.y, MERGE_EPSILON)
                || !horizontal_overlap(&target, &candidate)
            {
                break;
            }

            self.merge_into(target_idx, &candidate);

            if self.quads[target_idx].center == candidate.center {
                candidate_idx = Some(target_idx);
                break;
            }

            candidate = self.quads[target_idx];
            candidate_idx = Some(target_idx);
        }

        // No merge happened: the original quad enters the grid.
        if candidate_idx.is_none() {
            let idx = self.quads.len();
            self.quads.push(quad);

            let rect = self.cell_rect(quad.min_point(), quad.max_point());
            for row in rect.0..=rect.1 {
                for col in rect.2..=rect.3 {
                    self.cells[row][col].push(idx);
                }
            }
            self.plane_count += 1;
        }
    }

    /// Moves the surviving quad 20% toward the incoming candidate and updates
    /// cell membership as the difference between the old and new footprints.
    fn merge_into(&mut self, idx: usize, incoming: &Quad) {
        let old = self.quads[idx];
        let old_rect = self.cell_rect(old.min_point(), old.max_point());

        let mut updated = old;
        updated.center = old.center + (incoming.center - old.center).scale(MERGE_STEP);
        updated.extents = old.extents + (incoming.extents - old.extents).scale(MERGE_STEP);
        updated.merge_count += 1;
        self.quads[idx] = updated;

        let new_rect = self.cell_rect(updated.min_point(), updated.max_point());

        for row in old_rect.0..=old_rect.1 {
            for col in old_rect.2..=old_rect.3 {
                if !Self::rect_contains(new_rect, row, col) {
                    self.cells[row][col].retain(|&i| i != idx);
                }
            }
        }
        for row in new_rect.0..=new_rect.1 {
            for col in new_rect.2..=new_rect.3 {
                if !Self::rect_contains(old_rect, row, col) {
                    self.cells[row][col].push(idx);
                }
            }
        }

        self.merge_count += 1;
    }

    /// Finds the closest quad hit by the ray. The xz-projection of the ray
    /// decides which cells are visited: a zero-length projection tests only
    /// the origin's cell, anything else walks the covered cells from grid
    /// entry to exit. The full 3D ray-quad test decides hits within a cell
    /// and the first cell containing a hit wins.
    pub fn intersect(&self, ray: &Ray) -> Option<(Quad, f32)> {
        self.intersect_excluding(ray, None)
            .map(|(idx, t)| (self.quads[idx], t))
    }

    fn intersect_excluding(&self, ray: &Ray, exclude: Option<usize>) -> Option<(usize, f32)> {
        let direction3 = ray.direction();
        let direction = Vec3::new(direction3.x, 0.0, direction3.z);
        let from = Vec3::new(ray.from.x, 0.0, ray.from.z);

        if direction.length() == 0.0 {
            let col = self.col_of(from.x);
            let row = self.row_of(from.z);
            if col < 0 || row < 0 || col >= self.cols() as i64 || row >= self.rows() as i64 {
                return None;
            }
            return self.closest_hit_in_cell(ray, row as usize, col as usize, exclude);
        }

        // Clip the projected segment against the grid bounds.
        let mut t_enter = 0.0f32;
        let mut t_exit = 1.0f32;
        for (origin, delta, lo, hi) in [
            (from.x, direction.x, self.min.x, self.max.x),
            (from.z, direction.z, self.min.z, self.max.z),
        ] {
            if delta == 0.0 {
                if origin < lo || origin >= hi {
                    return None;
                }
            } else {
                let t0 = (lo - origin) / delta;
                let t1 = (hi - origin) / delta;
                let (near, far) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
                t_enter = t_enter.max(near);
                t_exit = t_exit.min(far);
            }
        }
        if t_enter > t_exit {
            return None;
        }

        let resolution = self.resolution as f32;
        let entry = from + direction.scale(t_enter);
        let mut col = self.col_of(entry.x).clamp(0, self.cols() as i64 - 1);
        let mut row = self.row_of(entry.z).clamp(0, self.rows() as i64 - 1);

        let step_col: i64 = if direction.x > 0.0 {
            1
        } else if direction.x < 0.0 {
            -1
        } else {
            0
        };
        let step_row: i64 = if direction.z > 0.0 {
            1
        } else if direction.z < 0.0 {
            -1
        } else {
            0
        };

        let t_delta_col = if direction.x != 0.0 {
            resolution / direction.x.abs()
        } else {
            f32::INFINITY
        };
        let t_delta_row = if direction.z != 0.0 {
            resolution / direction.z.abs()
        } else {
            f32::INFINITY
        };

        // Parameter at which the ray crosses into the next cell per axis.
        let mut t_max_col = if direction.x > 0.0 {
            (self.min.x + (col + 1) as f32 * resolution - from.x) / direction.x
        } else if direction.x < 0.0 {
            (self.min.x + col as f32 * resolution - from.x) / direction.x
        } else {
            f32::INFINITY
        };
        let mut t_max_row = if direction.z > 0.0 {
            (self.min.z + (row + 1) as f32 * resolution - from.z) / direction.z
        } else if direction.z < 0.0 {
            (self.min.z + row as f32 * resolution - from.z) / direction.z
        } else {
            f32::INFINITY
        };

        loop {
            if let Some(hit) = self.closest_hit_in_cell(ray, row as usize, col as usize, exclude)
            {
                return Some(hit);
            }

            if t_max_col < t_max_row {
                if t_max_col > t_exit {
                    break;
                }
                col += step_col;
                if col < 0 || col >= self.cols() as i64 {
                    break;
                }
                t_max_col += t_delta_col;
            } else {
                if t_max_row > t_exit {
                    break;
                }
                row += step_row;
                if row < 0 || row >= self.rows() as i64 {
                    break;
                }
                t_max_row += t_delta_row;
            }
        }

        None
    }

    fn closest_hit_in_cell(
        &self,
        ray: &Ray,
        row: usize,
        col: usize,
        exclude: Option<usize>,
    ) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for &idx in &self.cells[row][col] {
            if Some(idx) == exclude {
                continue;
            }
            if let Some(t) = intersect_ray_quad(ray, &self.quads[idx]) {
                if best.map_or(true, |(_, best_t)| t < best_t) {
                    best = Some((idx, t));
                }
            }
        }
        best
    }

    /// Returns the distinct quads referenced by cells covered by the clamped
    /// xz-range.
    pub fn get_region(&self, min: Vec3, max: Vec3) -> Vec<Quad> {
        let min = Vec3::new(min.x.max(self.min.x), 0.0, min.z.max(self.min.z));
        let max = Vec3::new(max.x.min(self.max.x), 0.0, max.z.min(self.max.z));

        let rect = self.cell_rect(min, max);
        let mut seen = HashSet::new();
        let mut quads = Vec::new();
        for row in rect.0..=rect.1 {
            for col in rect.2..=rect.3 {
                for &idx in &self.cells[row][col] {
                    if seen.insert(idx) {
                        quads.push(self.quads[idx]);
                    }
                }
            }
        }
        quads
    }

    pub fn debug_info(&self) -> DebugInfo {
        let rows = self.rows();
        let cols = self.cols();
        let mut occupancy = Vec::with_capacity(rows * cols);
        for row in &self.cells {
            for cell in row {
                occupancy.push(cell.len() as u32);
            }
        }

        DebugInfo {
            resolution: self.resolution,
            row_count: rows as u32,
            col_count: cols as u32,
            plane_count: self.plane_count,
            merge_count: self.merge_count,
            min: self.min,
            max: self.max,
            occupancy,
        }
    }

    /// Per-cell reference count, used by tests.
    #[cfg(test)]
    fn occupancy_at(&self, row: usize, col: usize) -> usize {
        self.cells[row][col].len()
    }

    /// Grows the grid in whole-resolution cell multiples until the point
    /// falls inside `[min, max)` on both grid axes.
    fn expand_to_fit(&mut self, point: Vec3) {
        let resolution = self.resolution as f32;

        if point.x >= self.min.x
            && point.x < self.max.x
            && point.z >= self.min.z
            && point.z < self.max.z
        {
            return;
        }

        if point.x < self.min.x {
            let add = ((self.min.x - point.x) / resolution).ceil() as usize;
            for row in &mut self.cells {
                let mut grown: Vec<Vec<usize>> = (0..add).map(|_| Vec::new()).collect();
                grown.append(row);
                *row = grown;
            }
            self.min.x -= add as f32 * resolution;
        } else if point.x >= self.max.x {
            let add = ((point.x - self.max.x) / resolution).floor() as usize + 1;
            for row in &mut self.cells {
                row.extend((0..add).map(|_| Vec::new()));
            }
            self.max.x += add as f32 * resolution;
        }

        let cols = self.cols();
        if point.z < self.min.z {
            let add = ((self.min.z - point.z) / resolution).ceil() as usize;
            let mut grown: Vec<Vec<Vec<usize>>> =
                (0..add).map(|_| vec![Vec::new(); cols]).collect();
            grown.append(&mut self.cells);
            self.cells = grown;
            self.min.z -= add as f32 * resolution;
        } else if point.z >= self.max.z {
            let add = ((point.z - self.max.z) / resolution).floor() as usize + 1;
            self.cells.extend((0..add).map(|_| vec![Vec::new(); cols]));
            self.max.z += add as f32 * resolution;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn quad(center: (f32, f32, f32), extents: (f32, f32, f32)) -> Quad {
        Quad::new(
            Vec3::new(center.0, center.1, center.2),
            Vec3::new(extents.0, extents.1, extents.2),
        )
    }

    #[test]
    fn test_creation_defaults() {
        let grid = RegularGrid::new(0, 0, 0);
        assert_eq!(grid.plane_count(), 0);
        assert_eq!(grid.merge_count(), 0);
        assert_eq!(grid.min(), Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(grid.max(), Vec3::new(1.0, 0.0, 1.0));
        assert_eq!(grid.rows(), 1);
        assert_eq!(grid.cols(), 1);
    }

    #[test]
    fn test_insertion_grows_and_merges() {
        let mut grid = RegularGrid::new(1, 1, 1);

        grid.insert_quad(quad((0.0, 0.0, 0.0), (1.0, 0.0, 1.0)));
        assert_eq!(grid.plane_count(), 1);
        assert_eq!(grid.merge_count(), 0);
        assert_eq!(grid.min(), Vec3::new(-1.0, 0.0, -1.0));
        assert_eq!(grid.max(), Vec3::new(2.0, 0.0, 2.0));
        assert_eq!(grid.rows(), 3);
        assert_eq!(grid.cols(), 3);

        // Inserting the same quad again merges instead of appending.
        grid.insert_quad(quad((0.0, 0.0, 0.0), (1.0, 0.0, 1.0)));
        assert_eq!(grid.plane_count(), 1);
        assert_eq!(grid.merge_count(), 1);
        assert_eq!(grid.rows(), 3);
        assert_eq!(grid.cols(), 3);

        // A distinct quad away from the first one is appended.
        grid.insert_quad(quad((2.0, 0.0, 0.0), (0.1, 0.0, 0.1)));
        assert_eq!(grid.plane_count(), 2);
        assert_eq!(grid.merge_count(), 1);
        assert_eq!(grid.max(), Vec3::new(3.0, 0.0, 2.0));
        assert_eq!(grid.cols(), 4);
    }

    #[test]
    fn test_merge_collapses_footprint() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((0.0, 0.0, 0.0), (2.0, 0.0, 2.0)));
        assert_eq!(grid.occupancy_at(0, 4), 1);

        grid.insert_quad(quad((0.0, 0.0, 0.0), (0.001, 0.0, 0.001)));

        assert_eq!(grid.plane_count(), 1);
        assert_eq!(grid.merge_count(), 1);
        // The merged quad shrank toward the tiny candidate, so the outermost
        // cells lost their reference.
        assert_eq!(grid.occupancy_at(0, 4), 0);
    }

    #[test]
    fn test_quads_outside_the_epsilon_band_do_not_merge() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((0.0, 0.0, 0.0), (1.0, 0.0, 1.0)));
        grid.insert_quad(quad((0.0, 1.0, 0.0), (1.0, 0.0, 1.0)));

        assert_eq!(grid.plane_count(), 2);
        assert_eq!(grid.merge_count(), 0);
    }

    #[test]
    fn test_vertical_intersection() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((0.0, 0.0, 0.0), (1.0, 0.0, 1.0)));

        let ray = Ray::new(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, -1.0, 0.0));
        let (hit, t) = grid.intersect(&ray).unwrap();
        assert_approx_eq!(t, 0.5);
        assert_eq!(hit.center, Vec3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_intersection_misses_off_footprint() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((0.0, 0.0, 0.0), (1.0, 0.0, 1.0)));

        let ray = Ray::new(Vec3::new(10.0, 1.0, 0.0), Vec3::new(0.0, -1.0, 0.0));
        assert!(grid.intersect(&ray).is_none());
    }

    #[test]
    fn test_slanted_ray_walks_to_the_hit() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((4.0, 0.0, 4.0), (0.5, 0.0, 0.5)));

        let ray = Ray::new(Vec3::new(0.0, 2.0, 0.0), Vec3::new(8.0, -2.0, 8.0));
        let (hit, t) = grid.intersect(&ray).unwrap();
        assert_eq!(hit.center, Vec3::new(4.0, 0.0, 4.0));
        assert_approx_eq!(t, 0.5, 1e-3);
    }

    #[test]
    fn test_get_region_returns_distinct_quads() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((-2.0, 0.0, -2.0), (1.0, 0.0, 1.0)));
        let quads = grid.get_region(Vec3::new(-10.0, -10.0, -10.0), Vec3::new(10.0, 10.0, 10.0));
        assert_eq!(quads.len(), 1);

        grid.insert_quad(quad((2.0, 0.0, 2.0), (1.0, 0.0, 1.0)));
        let quads = grid.get_region(Vec3::new(0.0, 0.0, 0.0), Vec3::new(10.0, 10.0, 10.0));
        assert_eq!(quads.len(), 1);
    }

    #[test]
    fn test_full_region_matches_plane_count() {
        let mut grid = RegularGrid::new(1, 1, 1);
        let positions = [
            (0.0, 0.0, 0.0),
            (5.0, 0.0, 5.0),
            (-3.0, 2.0, 7.0),
            (9.0, -1.5, -4.0),
            (0.5, 5.0, 0.5),
        ];
        for center in positions {
            grid.insert_quad(quad(center, (0.4, 0.0, 0.4)));
        }

        let all = grid.get_region(grid.min(), grid.max());
        assert_eq!(all.len() as u32, grid.plane_count());
    }

    #[test]
    fn test_debug_info_shape() {
        let mut grid = RegularGrid::new(1, 1, 1);
        grid.insert_quad(quad((0.0, 0.0, 0.0), (1.0, 0.0, 1.0)));

        let info = grid.debug_info();
        assert_eq!(info.resolution, 1);
        assert_eq!(info.row_count, 3);
        assert_eq!(info.col_count, 3);
        assert_eq!(info.plane_count, 1);
        assert_eq!(info.merge_count, 0);
        assert_eq!(info.occupancy.len(), 9);
        assert_eq!(info.occupancy.iter().sum::<u32>(), 9);
    }
}
