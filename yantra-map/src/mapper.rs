//! Pose/range fusion front-end for the occupancy grid.
//!
//! The mapper owns the grid and everything needed to keep it honest while
//! the pose source drifts or glitches:
//!
//! - a drift offset added to every incoming pose, updated only by
//!   successful scan matches
//! - a velocity gate that drops range updates while the pose is moving
//!   implausibly fast, with baseline re-adoption after repeated rejects
//! - scan recording for the rotation profiles used by drift correction
//! - a bounded raw-reading log for diagnostics and dataset export

use std::collections::VecDeque;

use crate::core::{Pose, WorldPoint};
use crate::grid::{OccupancyGrid, UpdateOutcome, RANGE_MAX_M, RANGE_MIN_M};
use crate::scan_match::{match_profiles, ScanProfile, ScanReading, PROFILE_MIN_READINGS};

/// Reject a range update when the pose moved faster than this between
/// consecutive updates.
pub const MAX_SPEED_M_S: f32 = 1.0;
/// Consecutive velocity rejects before the new position is adopted as the
/// baseline (the pose source has probably re-initialised).
pub const BASELINE_ADOPT_REJECTS: u32 = 5;
/// Raw reading log capacity.
pub const RAW_LOG_CAPACITY: usize = 5000;
/// Drift corrections smaller than this are applied but not counted.
pub const CORRECTION_MIN_M: f32 = 0.01;

/// Sentinel for "no reading yet" on the range input.
pub const RANGE_SENTINEL: i32 = -1;

/// One entry of the bounded raw-reading log.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RawReading {
    pub x: f32,
    pub z: f32,
    pub heading: f32,
    pub dist_cm: i32,
    pub accepted: bool,
    pub pose_ts: u64,
}

/// Counters surfaced in status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperStats {
    pub updates: u64,
    pub rejected: u64,
    pub corrections: u64,
    /// Times the velocity gate gave up and adopted a new baseline.
    pub baseline_resets: u64,
}

/// Pose/range fusion state machine. Mutated from the mapping task only;
/// readers take snapshots.
pub struct Mapper {
    grid: OccupancyGrid,

    latest_pose: Option<Pose>,
    drift_offset: WorldPoint,

    // Velocity gate.
    last_accepted_pos: Option<WorldPoint>,
    last_accepted_ts: u64,
    consecutive_rejects: u32,

    // Scan recording.
    recording: bool,
    scan_buffer: Vec<ScanReading>,
    reference_profile: Option<ScanProfile>,

    raw_log: VecDeque<RawReading>,
    stats: MapperStats,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    pub fn new() -> Self {
        Self {
            grid: OccupancyGrid::new(),
            latest_pose: None,
            drift_offset: WorldPoint::ZERO,
            last_accepted_pos: None,
            last_accepted_ts: 0,
            consecutive_rejects: 0,
            recording: false,
            scan_buffer: Vec::new(),
            reference_profile: None,
            raw_log: VecDeque::with_capacity(RAW_LOG_CAPACITY),
            stats: MapperStats::default(),
        }
    }

    /// Ingest a pose sample. The drift offset is applied before storing, so
    /// every consumer downstream sees corrected coordinates.
    pub fn on_pose(&mut self, pose: Pose) {
        let mut corrected = pose;
        corrected.tx += self.drift_offset.x;
        corrected.tz += self.drift_offset.z;
        self.latest_pose = Some(corrected);
    }

    /// Ingest a range reading in centimetres. Fuses against the latest
    /// pose; there is no back-dating. Returns true when the grid changed.
    pub fn on_range(&mut self, dist_cm: i32) -> bool {
        if dist_cm == RANGE_SENTINEL || dist_cm < 0 {
            return false;
        }
        let pose = match self.latest_pose {
            Some(p) => p,
            None => return false,
        };

        let position = pose.ground();
        let heading = pose.heading();
        let range_m = dist_cm as f32 / 100.0;

        let gate_ok = self.velocity_gate(position, pose.timestamp_ns);
        let in_band = (RANGE_MIN_M..=RANGE_MAX_M).contains(&range_m);
        let accepted = gate_ok && in_band;

        self.push_raw(RawReading {
            x: position.x,
            z: position.z,
            heading,
            dist_cm,
            accepted,
            pose_ts: pose.timestamp_ns,
        });

        if !gate_ok {
            self.stats.rejected += 1;
            return false;
        }

        let applied = match self.grid.update(position, heading, range_m) {
            UpdateOutcome::Applied => {
                self.stats.updates += 1;
                true
            }
            UpdateOutcome::OutOfRange => {
                self.stats.rejected += 1;
                false
            }
        };

        if applied && self.recording {
            self.scan_buffer.push(ScanReading {
                heading,
                range_m,
                hit: self.grid.last_hit().unwrap_or(WorldPoint::ZERO),
            });
        }

        applied
    }

    /// Velocity gate between consecutive range updates. The first update
    /// always passes; after [`BASELINE_ADOPT_REJECTS`] consecutive rejects
    /// the new position is adopted as the baseline.
    fn velocity_gate(&mut self, position: WorldPoint, ts: u64) -> bool {
        let (last_pos, last_ts) = match self.last_accepted_pos {
            Some(p) => (p, self.last_accepted_ts),
            None => {
                self.last_accepted_pos = Some(position);
                self.last_accepted_ts = ts;
                return true;
            }
        };

        let dt_s = ts.saturating_sub(last_ts) as f32 / 1e9;
        let speed = if dt_s > 0.0 {
            last_pos.distance(&position) / dt_s
        } else {
            0.0
        };

        if speed > MAX_SPEED_M_S {
            self.consecutive_rejects += 1;
            if self.consecutive_rejects >= BASELINE_ADOPT_REJECTS {
                log::warn!(
                    "velocity gate: {} consecutive rejects, adopting ({:.2}, {:.2}) as new baseline",
                    self.consecutive_rejects,
                    position.x,
                    position.z
                );
                self.last_accepted_pos = Some(position);
                self.last_accepted_ts = ts;
                self.consecutive_rejects = 0;
                self.stats.baseline_resets += 1;
                return true;
            }
            return false;
        }

        self.consecutive_rejects = 0;
        self.last_accepted_pos = Some(position);
        self.last_accepted_ts = ts;
        true
    }

    fn push_raw(&mut self, reading: RawReading) {
        if self.raw_log.len() == RAW_LOG_CAPACITY {
            self.raw_log.pop_front();
        }
        self.raw_log.push_back(reading);
    }

    /// Begin collecting accepted readings into a scan profile.
    pub fn start_scan_recording(&mut self) {
        self.recording = true;
        self.scan_buffer.clear();
    }

    /// Finish the current scan. Short scans are discarded; the first saved
    /// profile becomes the reference, later ones are matched against it and
    /// a successful match moves the drift offset.
    ///
    /// Returns the applied correction, if any.
    pub fn stop_scan_recording(&mut self) -> Option<WorldPoint> {
        self.recording = false;
        let readings = std::mem::take(&mut self.scan_buffer);
        if readings.len() < PROFILE_MIN_READINGS {
            log::debug!("scan discarded: only {} readings", readings.len());
            return None;
        }
        let profile = ScanProfile::new(readings);

        let reference = match &self.reference_profile {
            None => {
                log::info!("reference scan saved ({} readings)", profile.len());
                self.reference_profile = Some(profile);
                return None;
            }
            Some(r) => r,
        };

        let m = match match_profiles(reference, &profile) {
            Some(m) => m,
            None => {
                log::debug!("scan match failed ({} readings)", profile.len());
                return None;
            }
        };

        // The candidate hits sit where the drifted pose put them; shifting
        // future poses by the negated offset pulls them back onto the
        // reference map.
        let correction = WorldPoint::new(-m.dx, -m.dz);
        self.drift_offset.x += correction.x;
        self.drift_offset.z += correction.z;

        let magnitude = (correction.x * correction.x + correction.z * correction.z).sqrt();
        if magnitude > CORRECTION_MIN_M {
            self.stats.corrections += 1;
            log::info!(
                "drift corrected by ({:.3}, {:.3}) m from {} pairs",
                correction.x,
                correction.z,
                m.pairs
            );
        }
        Some(correction)
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn has_reference_scan(&self) -> bool {
        self.reference_profile.is_some()
    }

    /// Drop the map, the trail and the fusion state, keeping the drift
    /// offset and reference scan (clearing the map does not mean the pose
    /// source stopped drifting).
    pub fn clear(&mut self) {
        self.grid.clear();
        self.last_accepted_pos = None;
        self.last_accepted_ts = 0;
        self.consecutive_rejects = 0;
        self.raw_log.clear();
        self.stats = MapperStats::default();
    }

    /// At least one update has been fused (controllers wait on this).
    pub fn is_ready(&self) -> bool {
        self.stats.updates > 0
    }

    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }

    pub fn latest_pose(&self) -> Option<Pose> {
        self.latest_pose
    }

    pub fn drift_offset(&self) -> WorldPoint {
        self.drift_offset
    }

    pub fn stats(&self) -> MapperStats {
        self.stats
    }

    pub fn raw_log(&self) -> impl Iterator<Item = &RawReading> {
        self.raw_log.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GridCell;

    const MS: u64 = 1_000_000;

    fn pose_at(x: f32, z: f32, ts_ms: u64) -> Pose {
        Pose::at(x, z, ts_ms * MS)
    }

    #[test]
    fn test_first_update_accepted() {
        let mut mapper = Mapper::new();
        mapper.on_pose(pose_at(0.0, 0.0, 0));
        assert!(mapper.on_range(30));
        assert!(mapper.is_ready());
        assert_eq!(mapper.stats().updates, 1);
    }

    #[test]
    fn test_range_without_pose_is_ignored() {
        let mut mapper = Mapper::new();
        assert!(!mapper.on_range(30));
        assert_eq!(mapper.stats().updates, 0);
    }

    #[test]
    fn test_sentinel_ignored() {
        let mut mapper = Mapper::new();
        mapper.on_pose(pose_at(0.0, 0.0, 0));
        assert!(!mapper.on_range(RANGE_SENTINEL));
        assert_eq!(mapper.stats().updates, 0);
        assert_eq!(mapper.stats().rejected, 0);
    }

    #[test]
    fn test_velocity_gate_rejects_fast_motion() {
        let mut mapper = Mapper::new();
        mapper.on_pose(pose_at(0.0, 0.0, 0));
        assert!(mapper.on_range(30));

        // 2 metres in 100ms = 20 m/s.
        mapper.on_pose(pose_at(2.0, 0.0, 100));
        assert!(!mapper.on_range(30));
        assert_eq!(mapper.stats().rejected, 1);

        // Slow motion from the old baseline passes.
        mapper.on_pose(pose_at(0.05, 0.0, 200));
        assert!(mapper.on_range(30));
    }

    #[test]
    fn test_velocity_gate_adopts_baseline_after_five_rejects() {
        let mut mapper = Mapper::new();
        mapper.on_pose(pose_at(0.0, 0.0, 0));
        assert!(mapper.on_range(30));

        // Pose source jumped; every update is far from the baseline.
        for i in 0..4 {
            mapper.on_pose(pose_at(5.0, 5.0, 100 + i * 100));
            assert!(!mapper.on_range(30), "reject #{}", i + 1);
        }
        // Fifth consecutive reject adopts the new position.
        mapper.on_pose(pose_at(5.0, 5.0, 500));
        assert!(mapper.on_range(30));
        assert_eq!(mapper.stats().baseline_resets, 1);

        // And updates near the new baseline keep flowing.
        mapper.on_pose(pose_at(5.05, 5.0, 600));
        assert!(mapper.on_range(30));
    }

    #[test]
    fn test_out_of_band_counts_rejected_and_logs() {
        let mut mapper = Mapper::new();
        mapper.on_pose(pose_at(0.0, 0.0, 0));
        assert!(!mapper.on_range(90)); // 0.90m > 0.80m
        assert_eq!(mapper.stats().rejected, 1);
        let raw: Vec<_> = mapper.raw_log().collect();
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].accepted);
        assert_eq!(raw[0].dist_cm, 90);
    }

    #[test]
    fn test_drift_offset_applied_to_poses() {
        let mut mapper = Mapper::new();

        // Build a reference profile directly through the recording path.
        mapper.start_scan_recording();
        for i in 0..12 {
            let heading = i as f32 / 12.0 * std::f32::consts::TAU;
            mapper.on_pose(Pose::facing(0.0, 0.0, heading, i * 100 * MS));
            assert!(mapper.on_range(50));
        }
        assert!(mapper.stop_scan_recording().is_none());
        assert!(mapper.has_reference_scan());

        // Candidate scan with the pose source drifted +0.2m in x.
        mapper.start_scan_recording();
        for i in 0..12 {
            let heading = i as f32 / 12.0 * std::f32::consts::TAU;
            mapper.on_pose(Pose::facing(0.2, 0.0, heading, (2000 + i * 100) * MS));
            mapper.on_range(50);
        }
        let correction = mapper.stop_scan_recording().expect("match should succeed");
        assert!((correction.x + 0.2).abs() < 0.05, "dx was {}", correction.x);
        assert_eq!(mapper.stats().corrections, 1);

        // The offset now cancels the drift on incoming poses.
        mapper.on_pose(pose_at(0.2, 0.0, 5000));
        let p = mapper.latest_pose().unwrap();
        assert!(p.tx.abs() < 0.05);
    }

    #[test]
    fn test_short_scan_discarded() {
        let mut mapper = Mapper::new();
        mapper.start_scan_recording();
        for i in 0..5 {
            mapper.on_pose(pose_at(0.0, 0.0, i * 100));
            mapper.on_range(50);
        }
        assert!(mapper.stop_scan_recording().is_none());
        assert!(!mapper.has_reference_scan());
    }

    #[test]
    fn test_raw_log_bounded() {
        let mut mapper = Mapper::new();
        for i in 0..(RAW_LOG_CAPACITY as u64 + 100) {
            mapper.on_pose(pose_at(0.0, 0.0, i * 100));
            mapper.on_range(30);
        }
        assert_eq!(mapper.raw_log().count(), RAW_LOG_CAPACITY);
    }

    #[test]
    fn test_clear_resets_map_and_stats() {
        let mut mapper = Mapper::new();
        mapper.on_pose(pose_at(0.0, 0.0, 0));
        mapper.on_range(30);
        assert!(mapper.grid().is_known(GridCell::new(3, 0)));

        mapper.clear();
        assert!(mapper.grid().is_empty());
        assert!(!mapper.is_ready());
        assert_eq!(mapper.stats(), MapperStats::default());
        assert_eq!(mapper.raw_log().count(), 0);
    }
}
