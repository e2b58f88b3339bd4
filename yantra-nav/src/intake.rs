//! Platform intake: the seam where the host platform feeds the runtime.
//!
//! Pose tracking, the phone IMU and the camera are external
//! collaborators. They push samples through [`PlatformIntake`]; the
//! runtime consumes them from [`PlatformStreams`] and routes them to the
//! mapper, the wire hub and the dataset recorder. The daemon runs fine
//! with nothing attached; the affected features simply stay idle.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;
use yantra_map::Pose;

/// One phone IMU sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub ts_ns: u64,
    /// Accelerometer, m/s².
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    /// Gyroscope, rad/s.
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl ImuSample {
    /// JSON line for the `/imu` wire endpoint.
    pub fn to_json_line(&self) -> String {
        json!({
            "ts": self.ts_ns,
            "ax": self.ax,
            "ay": self.ay,
            "az": self.az,
            "gx": self.gx,
            "gy": self.gy,
            "gz": self.gz,
        })
        .to_string()
    }
}

/// One whole camera JPEG frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub ts_ns: u64,
    pub jpeg: Vec<u8>,
}

/// Producer half, handed to the embedding platform.
#[derive(Clone)]
pub struct PlatformIntake {
    pose_tx: Sender<Pose>,
    imu_tx: Sender<ImuSample>,
    camera_tx: Sender<CameraFrame>,
}

impl PlatformIntake {
    pub fn submit_pose(&self, pose: Pose) {
        let _ = self.pose_tx.send(pose);
    }

    pub fn submit_imu(&self, sample: ImuSample) {
        let _ = self.imu_tx.send(sample);
    }

    pub fn submit_camera_frame(&self, frame: CameraFrame) {
        let _ = self.camera_tx.send(frame);
    }
}

/// Consumer half, owned by the runtime.
pub struct PlatformStreams {
    pub poses: Receiver<Pose>,
    pub imu: Receiver<ImuSample>,
    pub camera: Receiver<CameraFrame>,
}

/// Create a connected intake pair.
pub fn platform_channels() -> (PlatformIntake, PlatformStreams) {
    let (pose_tx, poses) = unbounded();
    let (imu_tx, imu) = unbounded();
    let (camera_tx, camera) = unbounded();
    (
        PlatformIntake {
            pose_tx,
            imu_tx,
            camera_tx,
        },
        PlatformStreams { poses, imu, camera },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intake_delivers_to_streams() {
        let (intake, streams) = platform_channels();
        intake.submit_pose(Pose::at(1.0, 2.0, 42));
        intake.submit_imu(ImuSample {
            ts_ns: 7,
            ax: 0.0,
            ay: 0.0,
            az: 9.8,
            gx: 0.1,
            gy: 0.2,
            gz: 0.3,
        });
        intake.submit_camera_frame(CameraFrame {
            ts_ns: 9,
            jpeg: vec![0xFF, 0xD8],
        });

        assert_eq!(streams.poses.try_recv().unwrap().timestamp_ns, 42);
        assert_eq!(streams.imu.try_recv().unwrap().ts_ns, 7);
        assert_eq!(streams.camera.try_recv().unwrap().jpeg, vec![0xFF, 0xD8]);
    }

    #[test]
    fn test_imu_json_line_fields() {
        let sample = ImuSample {
            ts_ns: 123,
            ax: 1.0,
            ay: 2.0,
            az: 3.0,
            gx: 4.0,
            gy: 5.0,
            gz: 6.0,
        };
        let parsed: serde_json::Value = serde_json::from_str(&sample.to_json_line()).unwrap();
        assert_eq!(parsed["ts"], 123);
        assert_eq!(parsed["gz"], 6.0);
    }
}
