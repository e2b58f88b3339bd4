//! Map snapshot persistence.
//!
//! Serialises the grid plus mapper bookkeeping to JSON. The `log_odds`
//! list carries the full cell values, so a reload reconstructs the
//! occupied and free sets exactly; `occupied` and `free` are redundant
//! projections kept for consumers that only render the classified map.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{GridCell, WorldPoint, CELL_SIZE};
use crate::grid::OccupancyGrid;
use crate::mapper::{Mapper, RawReading};

/// Serialised map state written on `stop_map`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub cell_size: f32,
    pub occupied: Vec<(i32, i32)>,
    pub free: Vec<(i32, i32)>,
    pub log_odds: Vec<(i32, i32, f32)>,
    pub trail: Vec<(f32, f32)>,
    pub updates: u64,
    pub rejected: u64,
    pub corrections: u64,
    pub raw_log: Vec<(f32, f32, f32, i32, bool, u64)>,
}

impl MapSnapshot {
    /// Capture the mapper's current grid and counters.
    pub fn capture(mapper: &Mapper) -> Self {
        let grid = mapper.grid();
        let stats = mapper.stats();

        let mut log_odds: Vec<(i32, i32, f32)> = grid
            .iter()
            .map(|(c, &v)| (c.ix, c.iz, v))
            .collect();
        // Deterministic output ordering for diffable files.
        log_odds.sort_by_key(|&(ix, iz, _)| (ix, iz));

        Self {
            cell_size: CELL_SIZE,
            occupied: sorted_pairs(grid.occupied_cells()),
            free: sorted_pairs(grid.free_cells()),
            log_odds,
            trail: grid.trail().iter().map(|p| (p.x, p.z)).collect(),
            updates: stats.updates,
            rejected: stats.rejected,
            corrections: stats.corrections,
            raw_log: mapper
                .raw_log()
                .map(|r| (r.x, r.z, r.heading, r.dist_cm, r.accepted, r.pose_ts))
                .collect(),
        }
    }

    /// Rebuild a grid from the snapshot.
    pub fn restore_grid(&self) -> OccupancyGrid {
        let mut grid = OccupancyGrid::new();
        for &(ix, iz, v) in &self.log_odds {
            grid.restore(GridCell::new(ix, iz), v);
        }
        grid.restore_trail(
            self.trail
                .iter()
                .map(|&(x, z)| WorldPoint::new(x, z))
                .collect(),
        );
        grid
    }

    pub fn raw_readings(&self) -> Vec<RawReading> {
        self.raw_log
            .iter()
            .map(|&(x, z, heading, dist_cm, accepted, pose_ts)| RawReading {
                x,
                z,
                heading,
                dist_cm,
                accepted,
                pose_ts,
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Write the snapshot to `<dir>/map_YYYYMMDD_HHmmss.json`.
    pub fn save_timestamped(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let name = format!("map_{}.json", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, json)?;
        log::info!(
            "map snapshot saved to {} ({} cells)",
            path.display(),
            self.log_odds.len()
        );
        Ok(path)
    }
}

fn sorted_pairs(cells: Vec<GridCell>) -> Vec<(i32, i32)> {
    let mut pairs: Vec<(i32, i32)> = cells.into_iter().map(|c| (c.ix, c.iz)).collect();
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Pose;
    use crate::grid::CellState;

    fn build_mapper() -> Mapper {
        let mut mapper = Mapper::new();
        for i in 0..4u64 {
            mapper.on_pose(Pose::at(0.0, 0.0, i * 100_000_000));
            mapper.on_range(30);
        }
        mapper.on_pose(Pose::facing(0.0, 0.0, std::f32::consts::FRAC_PI_2, 500_000_000));
        mapper.on_range(50);
        mapper
    }

    #[test]
    fn test_round_trip_preserves_classified_sets() {
        let mapper = build_mapper();
        let snapshot = MapSnapshot::capture(&mapper);

        let json = snapshot.to_json().unwrap();
        let reloaded = MapSnapshot::from_json(&json).unwrap();
        let grid = reloaded.restore_grid();

        for &(ix, iz) in &snapshot.occupied {
            assert_eq!(grid.state(GridCell::new(ix, iz)), CellState::Occupied);
        }
        for &(ix, iz) in &snapshot.free {
            assert_eq!(grid.state(GridCell::new(ix, iz)), CellState::Free);
        }
        assert_eq!(grid.len(), mapper.grid().len());
        for (cell, &v) in mapper.grid().iter() {
            assert!((grid.log_odds(*cell) - v).abs() < 1e-6);
        }
    }

    #[test]
    fn test_snapshot_carries_counters_and_raw_log() {
        let mapper = build_mapper();
        let snapshot = MapSnapshot::capture(&mapper);
        assert_eq!(snapshot.updates, mapper.stats().updates);
        assert_eq!(snapshot.raw_log.len(), mapper.raw_log().count());
        assert_eq!(snapshot.raw_readings().len(), snapshot.raw_log.len());
        assert!((snapshot.cell_size - 0.10).abs() < 1e-6);
    }

    #[test]
    fn test_trail_round_trip() {
        let mut mapper = Mapper::new();
        mapper.on_pose(Pose::at(0.0, 0.0, 0));
        mapper.on_range(30);
        mapper.on_pose(Pose::at(0.5, 0.5, 100_000_000));
        mapper.on_range(30);

        let snapshot = MapSnapshot::capture(&mapper);
        let grid = snapshot.restore_grid();
        assert_eq!(grid.trail().len(), mapper.grid().trail().len());
    }

    #[test]
    fn test_json_field_names() {
        let snapshot = MapSnapshot::capture(&build_mapper());
        let json = snapshot.to_json().unwrap();
        for key in [
            "cell_size",
            "occupied",
            "free",
            "log_odds",
            "trail",
            "updates",
            "rejected",
            "corrections",
            "raw_log",
        ] {
            assert!(json.contains(&format!("\"{}\"", key)), "missing {}", key);
        }
    }

    #[test]
    fn test_save_timestamped_writes_file() {
        let dir = std::env::temp_dir().join("yantra_map_persist_test");
        let _ = fs::remove_dir_all(&dir);

        let snapshot = MapSnapshot::capture(&build_mapper());
        let path = snapshot.save_timestamped(&dir).unwrap();
        assert!(path.exists());
        let reloaded = MapSnapshot::from_json(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.log_odds, snapshot.log_odds);

        let _ = fs::remove_dir_all(&dir);
    }
}
