//! Wander: reactive random walk with clearance checks.
//!
//! After an initial 360° scan, the loop is: if the way ahead is open on
//! both the ultrasonic and the grid, take a forward burst; otherwise
//! step-rotate toward whichever side looks clear. Fifteen fruitless turn
//! steps mean the robot is boxed in: back out and flip the preferred
//! turn direction.

use rand::Rng;
use yantra_map::OccupancyGrid;
use yantra_map::WorldPoint;

use super::motor::{MotorDrive, TurnDirection};
use super::{rotate_full_scan, wait_for_mapper, ControllerCtx};

/// Turn steps without clearance before the escape manoeuvre.
const MAX_TURN_STEPS: u32 = 15;

/// Entry point for the wander controller thread.
pub fn run_wander(ctx: ControllerCtx) {
    log::info!("wander controller started");
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

    let mut preferred = if rand::thread_rng().gen_bool(0.5) {
        TurnDirection::Left
    } else {
        TurnDirection::Right
    };
    let mut turn_steps = 0u32;

    while !ctx.cancelled() {
        let Some((position, heading)) = ctx.pose() else {
            // No pose source; nothing sensible to do but wait.
            if !ctx.sleep_ms(500) {
                break;
            }
            continue;
        };

        let distance_cm = ctx.bridge.last_distance_cm();
        let ahead_clear = {
            let mapper = ctx.mapper.lock();
            path_is_open(
                mapper.grid(),
                position,
                heading,
                ctx.motion.lookahead_m,
                ctx.motion.half_width_m,
            )
        };

        if distance_cm > ctx.motion.obstacle_near_cm && ahead_clear {
            drive.burst_forward();
            turn_steps = 0;
            continue;
        }

        // Blocked: rotate toward a side that looks open.
        let direction = {
            let mapper = ctx.mapper.lock();
            choose_turn_direction(
                mapper.grid(),
                position,
                heading,
                ctx.motion.lookahead_m,
                ctx.motion.half_width_m,
                preferred,
            )
        };
        drive.rotate_step(direction);
        turn_steps += 1;

        if turn_steps >= MAX_TURN_STEPS {
            log::info!("wander boxed in after {} turn steps, reversing", turn_steps);
            drive.burst_reverse();
            preferred = preferred.flipped();
            turn_steps = 0;
        }
    }

    drive.stop();
    log::info!("wander controller stopped");
}

/// Clearance check used before every forward burst.
pub fn path_is_open(
    grid: &OccupancyGrid,
    position: WorldPoint,
    heading: f32,
    lookahead_m: f32,
    half_width_m: f32,
) -> bool {
    grid.is_path_clear(position, heading, lookahead_m, half_width_m)
}

/// Pick a rotation direction by probing clearance at ±90°. The preferred
/// side wins when it is open; an open opposite side overrides; with both
/// blocked the preferred side is kept (the step-count escape handles it).
pub fn choose_turn_direction(
    grid: &OccupancyGrid,
    position: WorldPoint,
    heading: f32,
    lookahead_m: f32,
    half_width_m: f32,
    preferred: TurnDirection,
) -> TurnDirection {
    let open = |dir: TurnDirection| {
        grid.is_path_clear(
            position,
            heading + dir.heading_offset(),
            lookahead_m,
            half_width_m,
        )
    };

    if open(preferred) {
        preferred
    } else if open(preferred.flipped()) {
        preferred.flipped()
    } else {
        preferred
    }
}
