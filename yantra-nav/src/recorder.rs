//! Dataset recording.
//!
//! Writes the layout downstream tooling expects:
//!
//! ```text
//! dataset_YYYYMMDD_HHmmss/
//!   cam0/<timestamp_ns>.jpg
//!   imu0.csv      #timestamp_ns,wx,wy,wz,ax,ay,az
//!   poses.csv     #timestamp_ns,tx,ty,tz,qx,qy,qz,qw
//!   metadata.json
//! ```
//!
//! A single writer thread drains one channel so file writes never block
//! the producers.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use serde_json::json;
use yantra_map::Pose;

use crate::error::Result;
use crate::intake::{CameraFrame, ImuSample};

/// Items the recorder persists.
pub enum RecordItem {
    Camera(CameraFrame),
    Imu(ImuSample),
    Pose(Pose),
}

/// Running dataset recording session.
pub struct Recorder {
    tx: Sender<RecordItem>,
    dir: PathBuf,
    worker: Option<JoinHandle<RecorderCounts>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RecorderCounts {
    frames: u64,
    imu_samples: u64,
    poses: u64,
}

impl Recorder {
    /// Create `dataset_YYYYMMDD_HHmmss` under `base_dir` and start the
    /// writer thread.
    pub fn start(base_dir: &Path) -> Result<Self> {
        let name = format!("dataset_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let dir = base_dir.join(name);
        fs::create_dir_all(dir.join("cam0"))?;

        let mut imu_csv = BufWriter::new(File::create(dir.join("imu0.csv"))?);
        writeln!(imu_csv, "#timestamp_ns,wx,wy,wz,ax,ay,az")?;
        let mut poses_csv = BufWriter::new(File::create(dir.join("poses.csv"))?);
        writeln!(poses_csv, "#timestamp_ns,tx,ty,tz,qx,qy,qz,qw")?;

        let metadata = json!({
            "created": chrono::Local::now().to_rfc3339(),
            "app_version": env!("CARGO_PKG_VERSION"),
        });
        fs::write(dir.join("metadata.json"), metadata.to_string())?;

        let (tx, rx) = unbounded::<RecordItem>();
        let worker_dir = dir.clone();
        let worker = thread::Builder::new()
            .name("dataset-recorder".to_string())
            .spawn(move || {
                let mut counts = RecorderCounts::default();
                for item in rx {
                    match item {
                        RecordItem::Camera(frame) => {
                            let path = worker_dir.join("cam0").join(format!("{}.jpg", frame.ts_ns));
                            if let Err(e) = fs::write(&path, &frame.jpeg) {
                                log::warn!("dropping camera frame: {}", e);
                            } else {
                                counts.frames += 1;
                            }
                        }
                        RecordItem::Imu(s) => {
                            if writeln!(
                                imu_csv,
                                "{},{},{},{},{},{},{}",
                                s.ts_ns, s.gx, s.gy, s.gz, s.ax, s.ay, s.az
                            )
                            .is_ok()
                            {
                                counts.imu_samples += 1;
                            }
                        }
                        RecordItem::Pose(p) => {
                            if writeln!(
                                poses_csv,
                                "{},{},{},{},{},{},{},{}",
                                p.timestamp_ns, p.tx, p.ty, p.tz, p.qx, p.qy, p.qz, p.qw
                            )
                            .is_ok()
                            {
                                counts.poses += 1;
                            }
                        }
                    }
                }
                let _ = imu_csv.flush();
                let _ = poses_csv.flush();
                counts
            })?;

        log::info!("dataset recording started: {}", dir.display());
        Ok(Self {
            tx,
            dir,
            worker: Some(worker),
        })
    }

    pub fn sender(&self) -> Sender<RecordItem> {
        self.tx.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush everything and finalise metadata with item counts.
    pub fn stop(mut self) {
        drop(self.tx);
        let counts = self
            .worker
            .take()
            .and_then(|w| w.join().ok())
            .unwrap_or_default();

        let metadata = json!({
            "created": chrono::Local::now().to_rfc3339(),
            "app_version": env!("CARGO_PKG_VERSION"),
            "camera_frames": counts.frames,
            "imu_samples": counts.imu_samples,
            "poses": counts.poses,
        });
        if let Err(e) = fs::write(self.dir.join("metadata.json"), metadata.to_string()) {
            log::warn!("failed to finalise dataset metadata: {}", e);
        }
        log::info!(
            "dataset recording stopped: {} frames, {} imu, {} poses",
            counts.frames,
            counts.imu_samples,
            counts.poses
        );
    }
}
