//! Core geometric types shared across the mapping stack.
//!
//! The ground plane is (X, Z): the pose source reports full 6-DOF poses, but
//! mapping happens in 2D. Heading is derived by rotating the body-forward
//! axis by the pose quaternion and projecting onto (X, Z).

use serde::{Deserialize, Serialize};

/// Side length of a grid cell in metres.
pub const CELL_SIZE: f32 = 0.10;

/// A 6-DOF pose sample from the external pose source.
///
/// Immutable once constructed; `timestamp_ns` is monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub tx: f32,
    pub ty: f32,
    pub tz: f32,
    pub qx: f32,
    pub qy: f32,
    pub qz: f32,
    pub qw: f32,
    pub timestamp_ns: u64,
}

impl Pose {
    pub fn new(tx: f32, ty: f32, tz: f32, qx: f32, qy: f32, qz: f32, qw: f32, ts: u64) -> Self {
        Self {
            tx,
            ty,
            tz,
            qx,
            qy,
            qz,
            qw,
            timestamp_ns: ts,
        }
    }

    /// Identity-orientation pose at a ground position (tests and defaults).
    pub fn at(tx: f32, tz: f32, ts: u64) -> Self {
        Self::new(tx, 0.0, tz, 0.0, 0.0, 0.0, 1.0, ts)
    }

    /// Pose at a ground position facing `heading` radians on the (X, Z)
    /// plane (rotation about the +Y axis).
    pub fn facing(tx: f32, tz: f32, heading: f32, ts: u64) -> Self {
        let half = heading / 2.0;
        // A rotation of -heading about +Y maps body-forward (+X) to
        // (cos h, 0, sin h), matching the atan2(fwd_z, fwd_x) convention.
        Self::new(tx, 0.0, tz, 0.0, -half.sin(), 0.0, half.cos(), ts)
    }

    /// Heading on the ground plane.
    ///
    /// Rotates the body-forward axis (+X) by the unit quaternion and takes
    /// `atan2(fwd_z, fwd_x)` of the projection onto (X, Z).
    pub fn heading(&self) -> f32 {
        let (qx, qy, qz, qw) = (self.qx, self.qy, self.qz, self.qw);
        // Rows of the rotation matrix applied to (1, 0, 0).
        let fwd_x = 1.0 - 2.0 * (qy * qy + qz * qz);
        let fwd_z = 2.0 * (qx * qz - qw * qy);
        fwd_z.atan2(fwd_x)
    }

    /// Ground-plane position.
    pub fn ground(&self) -> WorldPoint {
        WorldPoint::new(self.tx, self.tz)
    }
}

/// A point on the ground plane in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldPoint {
    pub x: f32,
    pub z: f32,
}

impl WorldPoint {
    pub const ZERO: WorldPoint = WorldPoint { x: 0.0, z: 0.0 };

    pub fn new(x: f32, z: f32) -> Self {
        Self { x, z }
    }

    pub fn distance(&self, other: &WorldPoint) -> f32 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }

    pub fn distance_sq(&self, other: &WorldPoint) -> f32 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        dx * dx + dz * dz
    }

    /// Cell containing this point (`floor(v / CELL_SIZE)` per axis).
    pub fn cell(&self) -> GridCell {
        GridCell::new(
            (self.x / CELL_SIZE).floor() as i32,
            (self.z / CELL_SIZE).floor() as i32,
        )
    }
}

/// Integer grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub ix: i32,
    pub iz: i32,
}

impl GridCell {
    pub fn new(ix: i32, iz: i32) -> Self {
        Self { ix, iz }
    }

    /// Centre of the cell in world coordinates.
    pub fn center(&self) -> WorldPoint {
        WorldPoint::new(
            (self.ix as f32 + 0.5) * CELL_SIZE,
            (self.iz as f32 + 0.5) * CELL_SIZE,
        )
    }

    /// The four edge-adjacent neighbours.
    pub fn neighbors_4(&self) -> [GridCell; 4] {
        [
            GridCell::new(self.ix - 1, self.iz),
            GridCell::new(self.ix + 1, self.iz),
            GridCell::new(self.ix, self.iz - 1),
            GridCell::new(self.ix, self.iz + 1),
        ]
    }

    pub fn chebyshev(&self, other: &GridCell) -> i32 {
        (self.ix - other.ix).abs().max((self.iz - other.iz).abs())
    }
}

/// Normalize an angle to [-π, π].
pub fn normalize_angle(angle: f32) -> f32 {
    let mut a = angle;
    while a > std::f32::consts::PI {
        a -= 2.0 * std::f32::consts::PI;
    }
    while a < -std::f32::consts::PI {
        a += 2.0 * std::f32::consts::PI;
    }
    a
}
