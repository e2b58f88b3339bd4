//! Explore: frontier-driven coverage of unknown space.
//!
//! Each cycle snapshots the grid, clusters the frontier cells and tries
//! the clusters nearest-first until one yields a usable plan. Path
//! following rotates toward a lookahead waypoint and bursts forward
//! while re-checking the ultrasonic and grid clearance; a target is
//! abandoned after three re-plans. When no frontiers remain, or five
//! consecutive targets fail, exploration is complete.

use yantra_map::astar;
use yantra_map::core::{normalize_angle, GridCell};
use yantra_map::frontier::{find_frontiers, order_by_distance};

use super::motor::{MotorDrive, TurnDirection};
use super::{rotate_full_scan, wait_for_mapper, ControllerCtx};

/// Waypoints to look ahead along the path.
const LOOKAHEAD_CELLS: usize = 3;
/// Heading alignment tolerance before driving.
const HEADING_TOLERANCE: f32 = 15.0 * std::f32::consts::PI / 180.0;
/// Rotation steps allowed per alignment.
const MAX_ALIGN_STEPS: u32 = 15;
/// Re-plans per target before abandoning it.
const MAX_REPLANS: u32 = 3;
/// Consecutive failed targets before declaring completion.
const MAX_FAILED_TARGETS: u32 = 5;

/// Entry point for the explore controller thread.
pub fn run_explore(ctx: ControllerCtx) {
    log::info!("explore controller started");
    let drive = MotorDrive::new(
        std::sync::Arc::clone(&ctx.bridge),
        ctx.motion.forward_speed,
        ctx.motion.turn_speed,
        std::sync::Arc::clone(&ctx.cancel),
    );

    wait_for_mapper(&ctx);
    if !ctx.cancelled() {
        rotate_full_scan(&ctx, &drive, TurnDirection::Left);
    }

    let mut failed_targets = 0u32;

    while !ctx.cancelled() {
        let Some((position, _)) = ctx.pose() else {
            if !ctx.sleep_ms(500) {
                break;
            }
            continue;
        };

        let snapshot = ctx.mapper.lock().grid().snapshot_cells();
        let mut clusters = find_frontiers(&snapshot);
        if clusters.is_empty() {
            log::info!("no frontiers remain, exploration complete");
            ctx.status
                .set(&ctx.status.exploration_complete, true);
            break;
        }
        order_by_distance(&mut clusters, position);
        log::debug!("{} frontier clusters, nearest first", clusters.len());

        let robot_cell = position.cell();
        let mut reached = false;
        for cluster in &clusters {
            if ctx.cancelled() {
                break;
            }
            let goal = cluster.centroid_cell();
            let path = match astar::plan(&snapshot, robot_cell, goal) {
                Ok(path) if path.len() >= 2 => path,
                _ => continue,
            };
            log::info!(
                "driving to frontier at ({}, {}), {} waypoints",
                goal.ix,
                goal.iz,
                path.len()
            );
            if follow_path(&ctx, &drive, &path) {
                reached = true;
                // Arrived: sweep the new surroundings into the map.
                rotate_full_scan(&ctx, &drive, TurnDirection::Left);
                break;
            }
            break; // a started-but-failed target counts once per cycle
        }

        if ctx.cancelled() {
            break;
        }
        if reached {
            failed_targets = 0;
        } else {
            failed_targets += 1;
            log::debug!("target failed ({} consecutive)", failed_targets);
            if failed_targets >= MAX_FAILED_TARGETS {
                log::warn!(
                    "{} consecutive targets failed, exploration complete",
                    failed_targets
                );
                ctx.status.set(&ctx.status.exploration_complete, true);
                break;
            }
        }
    }

    drive.stop();
    log::info!("explore controller stopped");
}

/// Follow a planned path. True when the robot arrives within one cell of
/// the final waypoint; false when the target is abandoned.
fn follow_path(ctx: &ControllerCtx, drive: &MotorDrive, initial_path: &[GridCell]) -> bool {
    let mut path = initial_path.to_vec();
    let goal = *path.last().expect("planned paths are non-empty");
    let mut replans = 0u32;

    while !ctx.cancelled() {
        let Some((position, heading)) = ctx.pose() else {
            return false;
        };
        let robot_cell = position.cell();

        if robot_cell.chebyshev(&goal) <= 1 {
            return true;
        }

        let target = lookahead_target(&path, robot_cell);
        let target_world = target.center();
        let desired = (target_world.z - position.z).atan2(target_world.x - position.x);

        if !align_heading(ctx, drive, desired) {
            // Could not line up; treat like an obstruction.
            if !replan(ctx, &mut path, goal, &mut replans) {
                return false;
            }
            continue;
        }

        // Burst forward only while both sensors agree the way is open.
        let Some((position, _)) = ctx.pose() else {
            return false;
        };
        let distance_cm = ctx.bridge.last_distance_cm();
        let clear = {
            let mapper = ctx.mapper.lock();
            mapper.grid().is_path_clear(
                position,
                desired,
                ctx.motion.lookahead_m,
                ctx.motion.half_width_m,
            )
        };
        if distance_cm > ctx.motion.obstacle_near_cm && clear {
            drive.burst_forward();
        } else if !replan(ctx, &mut path, goal, &mut replans) {
            return false;
        }
    }
    false
}

/// Re-plan to the same goal from the current position. False when the
/// re-plan budget is spent or no path exists any more.
fn replan(ctx: &ControllerCtx, path: &mut Vec<GridCell>, goal: GridCell, replans: &mut u32) -> bool {
    *replans += 1;
    if *replans >= MAX_REPLANS {
        log::debug!("abandoning target after {} re-plans", replans);
        return false;
    }
    let Some((position, _)) = ctx.pose() else {
        return false;
    };
    let snapshot = ctx.mapper.lock().grid().snapshot_cells();
    match astar::plan(&snapshot, position.cell(), goal) {
        Ok(new_path) if new_path.len() >= 2 => {
            log::debug!("re-planned with {} waypoints", new_path.len());
            *path = new_path;
            true
        }
        _ => false,
    }
}

/// Rotate in place until the heading error drops inside tolerance.
fn align_heading(ctx: &ControllerCtx, drive: &MotorDrive, desired: f32) -> bool {
    for _ in 0..MAX_ALIGN_STEPS {
        if ctx.cancelled() {
            return false;
        }
        let Some((_, heading)) = ctx.pose() else {
            return false;
        };
        let error = normalize_angle(desired - heading);
        if error.abs() < HEADING_TOLERANCE {
            return true;
        }
        let direction = if error > 0.0 {
            TurnDirection::Left
        } else {
            TurnDirection::Right
        };
        drive.rotate_step(direction);
    }
    false
}

/// Choose the waypoint to steer toward: the farthest one inside a
/// three-cell window past the closest point on the path.
pub fn lookahead_target(path: &[GridCell], robot_cell: GridCell) -> GridCell {
    let closest = closest_path_index(path, robot_cell);
    let target = (closest + LOOKAHEAD_CELLS).min(path.len() - 1);
    path[target]
}

fn closest_path_index(path: &[GridCell], robot_cell: GridCell) -> usize {
    let mut best = 0;
    let mut best_dist = i64::MAX;
    for (i, cell) in path.iter().enumerate() {
        let dx = (cell.ix - robot_cell.ix) as i64;
        let dz = (cell.iz - robot_cell.iz) as i64;
        let dist = dx * dx + dz * dz;
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best
}
