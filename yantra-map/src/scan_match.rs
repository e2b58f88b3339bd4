//! Rotation scan profiles and translation-only scan matching.
//!
//! While the robot spins in place, accepted range readings are collected
//! into a [`ScanProfile`]. The first completed profile becomes the
//! reference; later profiles are matched against it to estimate how far the
//! pose source has drifted since the reference was taken.
//!
//! Matching pairs each candidate reading with the reference reading of
//! nearest heading, then takes the per-axis median of the hit-point
//! differences. No rotation is estimated; rotational drift therefore leaks
//! into the translation estimate, which is why the spread gate below is
//! conservative.

use crate::core::{normalize_angle, WorldPoint};

/// Maximum heading difference for a candidate/reference pairing.
pub const MATCH_MAX_HEADING_DIFF: f32 = 15.0 * std::f32::consts::PI / 180.0;
/// Minimum matched pairs for a usable estimate.
pub const MATCH_MIN_PAIRS: usize = 8;
/// Maximum per-axis spread (max - min) across pair offsets, metres.
pub const MATCH_MAX_SPREAD_M: f32 = 0.40;
/// Minimum readings for a profile to be saved at all.
pub const PROFILE_MIN_READINGS: usize = 10;

/// One range observation taken during an in-place rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanReading {
    /// Robot heading when the reading was taken.
    pub heading: f32,
    /// Accepted range in metres.
    pub range_m: f32,
    /// World position of the ray endpoint.
    pub hit: WorldPoint,
}

/// An ordered set of readings covering roughly a full rotation.
#[derive(Debug, Clone, Default)]
pub struct ScanProfile {
    pub readings: Vec<ScanReading>,
}

impl ScanProfile {
    pub fn new(readings: Vec<ScanReading>) -> Self {
        Self { readings }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Estimated drift between a candidate profile and the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanMatch {
    pub dx: f32,
    pub dz: f32,
    /// Number of reading pairs behind the estimate.
    pub pairs: usize,
}

/// Match `candidate` against `reference`.
///
/// Returns `None` when fewer than [`MATCH_MIN_PAIRS`] readings pair up
/// within [`MATCH_MAX_HEADING_DIFF`], or when either axis's offset spread
/// exceeds [`MATCH_MAX_SPREAD_M`] (the profiles disagree about the room
/// shape and a median would be meaningless).
pub fn match_profiles(reference: &ScanProfile, candidate: &ScanProfile) -> Option<ScanMatch> {
    let mut dxs: Vec<f32> = Vec::with_capacity(candidate.len());
    let mut dzs: Vec<f32> = Vec::with_capacity(candidate.len());

    for reading in &candidate.readings {
        let nearest = reference.readings.iter().min_by(|a, b| {
            let da = normalize_angle(a.heading - reading.heading).abs();
            let db = normalize_angle(b.heading - reading.heading).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })?;

        let diff = normalize_angle(nearest.heading - reading.heading).abs();
        if diff > MATCH_MAX_HEADING_DIFF {
            continue;
        }

        dxs.push(reading.hit.x - nearest.hit.x);
        dzs.push(reading.hit.z - nearest.hit.z);
    }

    if dxs.len() < MATCH_MIN_PAIRS {
        return None;
    }

    if spread(&dxs) > MATCH_MAX_SPREAD_M || spread(&dzs) > MATCH_MAX_SPREAD_M {
        return None;
    }

    Some(ScanMatch {
        dx: median(&mut dxs),
        dz: median(&mut dzs),
        pairs: dzs.len(),
    })
}

fn spread(values: &[f32]) -> f32 {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
    }
    max - min
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn ring_profile(offset_x: f32, offset_z: f32, n: usize) -> ScanProfile {
        // Readings around a circle of radius 0.5m, hit points shifted by
        // the given offset.
        let readings = (0..n)
            .map(|i| {
                let heading = normalize_angle(i as f32 / n as f32 * 2.0 * PI);
                ScanReading {
                    heading,
                    range_m: 0.5,
                    hit: WorldPoint::new(
                        0.5 * heading.cos() + offset_x,
                        0.5 * heading.sin() + offset_z,
                    ),
                }
            })
            .collect();
        ScanProfile::new(readings)
    }

    #[test]
    fn test_identical_profiles_match_with_zero_offset() {
        let reference = ring_profile(0.0, 0.0, 12);
        let m = match_profiles(&reference, &reference).unwrap();
        assert!(m.dx.abs() < 1e-6);
        assert!(m.dz.abs() < 1e-6);
        assert_eq!(m.pairs, 12);
    }

    #[test]
    fn test_uniform_shift_is_recovered() {
        let reference = ring_profile(0.0, 0.0, 16);
        let candidate = ring_profile(0.12, -0.07, 16);
        let m = match_profiles(&reference, &candidate).unwrap();
        assert!((m.dx - 0.12).abs() < 1e-3);
        assert!((m.dz + 0.07).abs() < 1e-3);
    }

    #[test]
    fn test_too_few_pairs_rejected() {
        let reference = ring_profile(0.0, 0.0, 12);
        let candidate = ring_profile(0.1, 0.0, 4);
        assert!(match_profiles(&reference, &candidate).is_none());
    }

    #[test]
    fn test_wide_spread_rejected() {
        let reference = ring_profile(0.0, 0.0, 12);
        let mut candidate = ring_profile(0.0, 0.0, 12);
        // Corrupt half the hits far away so the x spread blows past 0.40m.
        for r in candidate.readings.iter_mut().step_by(2) {
            r.hit.x += 1.0;
        }
        assert!(match_profiles(&reference, &candidate).is_none());
    }

    #[test]
    fn test_median_robust_to_single_outlier() {
        let reference = ring_profile(0.0, 0.0, 13);
        let mut candidate = ring_profile(0.05, 0.0, 13);
        candidate.readings[0].hit.x += 0.3; // within spread, off the median
        let m = match_profiles(&reference, &candidate).unwrap();
        assert!((m.dx - 0.05).abs() < 0.02);
    }

    #[test]
    fn test_empty_reference_matches_nothing() {
        let reference = ScanProfile::default();
        let candidate = ring_profile(0.0, 0.0, 12);
        assert!(match_profiles(&reference, &candidate).is_none());
    }
}
