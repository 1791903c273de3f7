//! C7 — Entity Motion.
//!
//! Dead-reckoning: predicts where an entity is *right now* from the last
//! authoritative pose plus however much time has passed, instead of waiting
//! for the next update op. Grounded on
//! `original_source/src/Eris/Entity.cpp`'s `updatePredictedState`, scaled by
//! [`crate::config::ClientConfig::simulation_speed`] for time dilation.

use std::time::Duration;

use crate::value::{Quaternion, Vector3};

/// Below this squared magnitude, velocity/angular velocity reads as
/// stationary rather than moving (spec.md P6).
const MOVING_EPSILON: f64 = 1e-3;

/// The authoritative pose an entity last reported, plus its current motion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub position: Vector3,
    pub velocity: Vector3,
    pub acceleration: Vector3,
    pub orientation: Quaternion,
    pub angular_velocity: Vector3,
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            position: Vector3::ZERO,
            velocity: Vector3::ZERO,
            acceleration: Vector3::ZERO,
            orientation: Quaternion::IDENTITY,
            angular_velocity: Vector3::ZERO,
        }
    }
}

/// Predicts a pose `elapsed` wall-clock time after it was last authoritative,
/// with `elapsed` scaled by `simulation_speed` before being applied.
///
/// Position integrates velocity plus the constant-acceleration term
/// `0.5 * a * t^2`; velocity integrates acceleration linearly; orientation
/// integrates angular velocity as a small-angle axis-angle rotation composed
/// onto the last known orientation.
pub fn predict(last: &Pose, elapsed: Duration, simulation_speed: f64) -> Pose {
    let dt = elapsed.as_secs_f64() * simulation_speed;
    if dt <= 0.0 {
        return *last;
    }

    let position = last
        .position
        .add(&last.velocity.scale(dt))
        .add(&last.acceleration.scale(0.5 * dt * dt));
    let velocity = last.velocity.add(&last.acceleration.scale(dt));

    let orientation = if last.angular_velocity.is_zero() {
        last.orientation
    } else {
        let angle = last.angular_velocity.mag() * dt;
        let delta = Quaternion::from_axis_angle(last.angular_velocity, angle);
        delta.mul(&last.orientation)
    };

    Pose { position, velocity, acceleration: last.acceleration, orientation, angular_velocity: last.angular_velocity }
}

/// Tracks whether an entity is currently predicted to be moving, firing a
/// `Moving(bool)` transition only on edges, never on every poll.
#[derive(Default)]
pub struct MovingState {
    moving: bool,
}

impl MovingState {
    pub fn new() -> Self {
        MovingState::default()
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Updates from a fresh authoritative pose, returning `Some(bool)` only
    /// when the moving/stationary state actually flips. A squared-magnitude
    /// epsilon, not exact zero, gates the transition (P6): a velocity with
    /// `mag_sq()` below `MOVING_EPSILON` still reads as stationary.
    pub fn update(&mut self, pose: &Pose) -> Option<bool> {
        let now_moving = pose.velocity.mag_sq() > MOVING_EPSILON || pose.angular_velocity.mag_sq() > MOVING_EPSILON;
        if now_moving == self.moving {
            return None;
        }
        self.moving = now_moving;
        Some(now_moving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stationary_pose_predicts_unchanged() {
        let pose = Pose::default();
        let predicted = predict(&pose, Duration::from_secs(5), 1.0);
        assert_eq!(predicted.position, Vector3::ZERO);
    }

    #[test]
    fn constant_velocity_integrates_linearly() {
        let pose = Pose { velocity: Vector3::new(1.0, 0.0, 0.0), ..Pose::default() };
        let predicted = predict(&pose, Duration::from_secs(2), 1.0);
        assert_eq!(predicted.position, Vector3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn acceleration_adds_the_quadratic_term() {
        let pose = Pose { acceleration: Vector3::new(2.0, 0.0, 0.0), ..Pose::default() };
        let predicted = predict(&pose, Duration::from_secs(2), 1.0);
        // 0.5 * 2.0 * 2^2 = 4.0
        assert_eq!(predicted.position, Vector3::new(4.0, 0.0, 0.0));
        assert_eq!(predicted.velocity, Vector3::new(4.0, 0.0, 0.0));
    }

    #[test]
    fn simulation_speed_scales_elapsed_time() {
        let pose = Pose { velocity: Vector3::new(1.0, 0.0, 0.0), ..Pose::default() };
        let predicted = predict(&pose, Duration::from_secs(1), 2.0);
        assert_eq!(predicted.position, Vector3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn tiny_velocity_below_epsilon_reads_as_stationary() {
        let mut state = MovingState::new();
        let barely = Pose { velocity: Vector3::new(0.01, 0.0, 0.0), ..Pose::default() };
        assert_eq!(state.update(&barely), None);
        assert!(!state.is_moving());
    }

    #[test]
    fn moving_state_only_fires_on_edges() {
        let mut state = MovingState::new();
        let still = Pose::default();
        let moving = Pose { velocity: Vector3::new(1.0, 0.0, 0.0), ..Pose::default() };
        assert_eq!(state.update(&still), None);
        assert_eq!(state.update(&moving), Some(true));
        assert_eq!(state.update(&moving), None);
        assert_eq!(state.update(&still), Some(false));
    }
}
