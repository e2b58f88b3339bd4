//! YantraMap - occupancy mapping and planning for the robot runtime
//!
//! This crate turns a stream of 6-DOF poses and ultrasonic range readings
//! into a persistent 2D map and plans exploration over it:
//!
//! - [`grid::OccupancyGrid`]: sparse log-odds grid updated with Bresenham
//!   ray casting
//! - [`mapper::Mapper`]: pose/range fusion with a velocity gate, drift
//!   correction and scan recording
//! - [`frontier`]: free/unknown boundary detection and clustering
//! - [`astar`]: 4-connected grid search with a node budget
//! - [`persist`]: JSON snapshot save/load

pub mod astar;
pub mod core;
pub mod frontier;
pub mod grid;
pub mod mapper;
pub mod persist;
pub mod raycast;
pub mod scan_match;

pub use crate::core::{GridCell, Pose, WorldPoint};
pub use crate::grid::OccupancyGrid;
pub use crate::mapper::Mapper;
