//! Sparse log-odds occupancy grid.
//!
//! Cells carry a bounded log-odds scalar: positive means likely occupied,
//! negative likely free, absent (or zero) unknown. Updates are Bayesian
//! additions clamped to `[-L_MAX, L_MAX]`, so a stale wall erodes under
//! repeated free evidence instead of flapping: a cell at `L_OCC` needs
//! `ceil(L_OCC / L_FREE)` traversing rays to drop below zero.
//!
//! The grid is unbounded; storage is a hash map keyed by cell.

use std::collections::HashMap;

use crate::core::{GridCell, WorldPoint, CELL_SIZE};
use crate::raycast::BresenhamLine;

/// Log-odds magnitude bound for any cell.
pub const L_MAX: f32 = 3.5;
/// Evidence added to the endpoint cell of an accepted reading.
pub const L_OCC: f32 = 0.85;
/// Evidence subtracted from cells a ray passes through.
pub const L_FREE: f32 = 0.15;
/// At or above this a cell is reported occupied.
pub const OCC_THRESH: f32 = 0.4;
/// At or below this a cell is reported free.
pub const FREE_THRESH: f32 = -0.4;
/// Stricter bar for refusing to drive through a cell.
pub const NAV_BLOCK_THRESH: f32 = 1.5;

/// Accepted range band in metres. Readings outside are ultrasonic noise or
/// amplify heading drift too much to fuse.
pub const RANGE_MIN_M: f32 = 0.10;
pub const RANGE_MAX_M: f32 = 0.80;

/// Minimum spacing between consecutive trail points.
const TRAIL_SPACING_M: f32 = 0.10;

/// Occupancy classification of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Occupied,
    Free,
    Unknown,
}

/// Result of a single range fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Ray traced and cells updated.
    Applied,
    /// Range outside the accepted band; nothing changed.
    OutOfRange,
}

/// Sparse log-odds occupancy grid with a display trail.
#[derive(Debug, Clone, Default)]
pub struct OccupancyGrid {
    cells: HashMap<GridCell, f32>,
    trail: Vec<WorldPoint>,
    /// World position of the last accepted endpoint, NaN-pair when the most
    /// recent reading was rejected.
    last_hit: Option<WorldPoint>,
}

impl OccupancyGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cell_size(&self) -> f32 {
        CELL_SIZE
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Log-odds of a cell; absent cells are unknown and read as 0.
    pub fn log_odds(&self, cell: GridCell) -> f32 {
        self.cells.get(&cell).copied().unwrap_or(0.0)
    }

    /// Whether the cell has ever been observed.
    pub fn is_known(&self, cell: GridCell) -> bool {
        self.cells.contains_key(&cell)
    }

    pub fn state(&self, cell: GridCell) -> CellState {
        let v = self.log_odds(cell);
        if v >= OCC_THRESH {
            CellState::Occupied
        } else if v <= FREE_THRESH {
            CellState::Free
        } else {
            CellState::Unknown
        }
    }

    /// Fuse one range reading taken at `position` facing `heading`.
    ///
    /// Traces a Bresenham ray from the robot cell to the endpoint cell:
    /// the endpoint gains `L_OCC`, the cell immediately before it is left
    /// alone (the ray would otherwise chew the wall it just placed), every
    /// other cell loses `L_FREE`. All values clamp to `[-L_MAX, L_MAX]`.
    pub fn update(&mut self, position: WorldPoint, heading: f32, range_m: f32) -> UpdateOutcome {
        self.push_trail(position);

        if !(RANGE_MIN_M..=RANGE_MAX_M).contains(&range_m) {
            self.last_hit = None;
            return UpdateOutcome::OutOfRange;
        }

        let endpoint = WorldPoint::new(
            position.x + range_m * heading.cos(),
            position.z + range_m * heading.sin(),
        );
        self.last_hit = Some(endpoint);

        let start_cell = position.cell();
        let end_cell = endpoint.cell();

        let ray: Vec<GridCell> = BresenhamLine::new(start_cell, end_cell).collect();
        let n = ray.len();
        for (i, cell) in ray.into_iter().enumerate() {
            if cell == end_cell {
                self.add(cell, L_OCC);
            } else if i + 2 == n {
                // Cell immediately before the endpoint: skip.
            } else {
                self.add(cell, -L_FREE);
            }
        }

        UpdateOutcome::Applied
    }

    fn add(&mut self, cell: GridCell, delta: f32) {
        let entry = self.cells.entry(cell).or_insert(0.0);
        *entry = (*entry + delta).clamp(-L_MAX, L_MAX);
    }

    fn push_trail(&mut self, position: WorldPoint) {
        let far_enough = match self.trail.last() {
            Some(last) => last.distance(&position) > TRAIL_SPACING_M,
            None => true,
        };
        if far_enough {
            self.trail.push(position);
        }
    }

    /// Remove every cell and reset the trail.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.trail.clear();
        self.last_hit = None;
    }

    /// Look-ahead clearance test used by the motion controllers.
    ///
    /// Casts three parallel rays of length `dist_m` from `position` along
    /// `heading`: the centre ray plus two offset by `half_width_m`
    /// perpendicular to it. Returns false if any cell along any ray has
    /// log-odds at or above [`NAV_BLOCK_THRESH`].
    pub fn is_path_clear(
        &self,
        position: WorldPoint,
        heading: f32,
        dist_m: f32,
        half_width_m: f32,
    ) -> bool {
        let (sin_h, cos_h) = heading.sin_cos();
        // Perpendicular on the ground plane.
        let perp = WorldPoint::new(-sin_h, cos_h);

        for lateral in [-half_width_m, 0.0, half_width_m] {
            let start = WorldPoint::new(
                position.x + perp.x * lateral,
                position.z + perp.z * lateral,
            );
            let end = WorldPoint::new(start.x + dist_m * cos_h, start.z + dist_m * sin_h);
            for cell in BresenhamLine::new(start.cell(), end.cell()) {
                if self.log_odds(cell) >= NAV_BLOCK_THRESH {
                    return false;
                }
            }
        }
        true
    }

    /// World position of the last accepted endpoint, if the most recent
    /// reading was fused.
    pub fn last_hit(&self) -> Option<WorldPoint> {
        self.last_hit
    }

    pub fn trail(&self) -> &[WorldPoint] {
        &self.trail
    }

    /// Copy-on-read snapshot of the raw cell map for planners.
    pub fn snapshot_cells(&self) -> HashMap<GridCell, f32> {
        self.cells.clone()
    }

    /// Iterate over known cells.
    pub fn iter(&self) -> impl Iterator<Item = (&GridCell, &f32)> {
        self.cells.iter()
    }

    /// Cells currently at or above the occupied threshold.
    pub fn occupied_cells(&self) -> Vec<GridCell> {
        self.cells
            .iter()
            .filter(|(_, &v)| v >= OCC_THRESH)
            .map(|(&c, _)| c)
            .collect()
    }

    /// Cells currently at or below the free threshold.
    pub fn free_cells(&self) -> Vec<GridCell> {
        self.cells
            .iter()
            .filter(|(_, &v)| v <= FREE_THRESH)
            .map(|(&c, _)| c)
            .collect()
    }

    /// Restore a cell value directly (snapshot loading). Clamped.
    pub(crate) fn restore(&mut self, cell: GridCell, value: f32) {
        self.cells.insert(cell, value.clamp(-L_MAX, L_MAX));
    }

    pub(crate) fn restore_trail(&mut self, trail: Vec<WorldPoint>) {
        self.trail = trail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_update(grid: &mut OccupancyGrid, range_m: f32) -> UpdateOutcome {
        grid.update(WorldPoint::ZERO, 0.0, range_m)
    }

    #[test]
    fn test_single_hit_in_front() {
        // Pose at origin facing +X, reading 30cm: endpoint cell (3,0) gets
        // one hit, (2,0) is skipped, (0,0) and (1,0) accumulate free
        // evidence and cross the threshold after three identical updates.
        let mut grid = OccupancyGrid::new();
        for _ in 0..3 {
            assert_eq!(forward_update(&mut grid, 0.30), UpdateOutcome::Applied);
        }

        assert_eq!(grid.state(GridCell::new(0, 0)), CellState::Free);
        assert_eq!(grid.state(GridCell::new(1, 0)), CellState::Free);
        assert!(!grid.is_known(GridCell::new(2, 0)));
        assert_eq!(grid.state(GridCell::new(3, 0)), CellState::Occupied);
    }

    #[test]
    fn test_one_reading_one_occupied_cell() {
        let mut grid = OccupancyGrid::new();
        forward_update(&mut grid, 0.30);
        assert_eq!(grid.occupied_cells(), vec![GridCell::new(3, 0)]);
    }

    #[test]
    fn test_range_boundaries() {
        let mut grid = OccupancyGrid::new();
        assert_eq!(forward_update(&mut grid, 0.10), UpdateOutcome::Applied);
        assert_eq!(forward_update(&mut grid, 0.80), UpdateOutcome::Applied);
        assert_eq!(forward_update(&mut grid, 0.81), UpdateOutcome::OutOfRange);
        assert_eq!(forward_update(&mut grid, 0.09), UpdateOutcome::OutOfRange);
        assert!(grid.last_hit().is_none());
    }

    #[test]
    fn test_wall_erosion() {
        // Place a wall at (3,0), then drive "through" it with longer
        // readings. Six traversing rays erode one hit below zero.
        let mut grid = OccupancyGrid::new();
        forward_update(&mut grid, 0.30);
        assert_eq!(grid.state(GridCell::new(3, 0)), CellState::Occupied);

        for _ in 0..6 {
            forward_update(&mut grid, 0.60);
        }
        assert!(grid.log_odds(GridCell::new(3, 0)) < 0.0);
        // A few more and it reads as confidently free.
        for _ in 0..3 {
            forward_update(&mut grid, 0.60);
        }
        assert_eq!(grid.state(GridCell::new(3, 0)), CellState::Free);
    }

    #[test]
    fn test_log_odds_stays_bounded() {
        let mut grid = OccupancyGrid::new();
        for _ in 0..100 {
            forward_update(&mut grid, 0.30);
        }
        for (_, &v) in grid.iter() {
            assert!((-L_MAX..=L_MAX).contains(&v));
        }
        assert!((grid.log_odds(GridCell::new(3, 0)) - L_MAX).abs() < 1e-5);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut grid = OccupancyGrid::new();
        forward_update(&mut grid, 0.30);
        grid.update(WorldPoint::new(1.0, 1.0), 0.0, 0.30);
        assert!(!grid.is_empty());
        assert!(!grid.trail().is_empty());

        grid.clear();
        assert!(grid.is_empty());
        assert!(grid.trail().is_empty());
        assert!(grid.last_hit().is_none());

        // Repeated clear is a no-op.
        grid.clear();
        assert!(grid.is_empty());
    }

    #[test]
    fn test_endpoint_cell_matches_floor_of_range() {
        let mut grid = OccupancyGrid::new();
        forward_update(&mut grid, 0.45);
        assert_eq!(grid.state(GridCell::new(4, 0)), CellState::Occupied);
    }

    #[test]
    fn test_path_clear_blocked_by_strong_wall() {
        let mut grid = OccupancyGrid::new();
        // Two hits push the endpoint past NAV_BLOCK_THRESH (1.7 > 1.5).
        forward_update(&mut grid, 0.30);
        forward_update(&mut grid, 0.30);

        assert!(!grid.is_path_clear(WorldPoint::ZERO, 0.0, 0.5, 0.1));
        // A single hit (0.85) is occupied but not nav-blocking.
        let mut weak = OccupancyGrid::new();
        forward_update(&mut weak, 0.30);
        assert!(weak.is_path_clear(WorldPoint::ZERO, 0.0, 0.5, 0.1));
        // Sideways is clear in both.
        assert!(grid.is_path_clear(WorldPoint::ZERO, std::f32::consts::FRAC_PI_2, 0.5, 0.1));
    }

    #[test]
    fn test_trail_spacing() {
        let mut grid = OccupancyGrid::new();
        grid.update(WorldPoint::ZERO, 0.0, 0.30);
        grid.update(WorldPoint::new(0.05, 0.0), 0.0, 0.30);
        assert_eq!(grid.trail().len(), 1);
        grid.update(WorldPoint::new(0.15, 0.0), 0.0, 0.30);
        assert_eq!(grid.trail().len(), 2);
    }
}
