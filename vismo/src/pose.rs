//! # Per-frame pose snapshots
//!
//! Every processed frame carries an immutable bundle of the robot state at
//! capture time plus the ground-to-image homography valid for that pose.
//! Two snapshots are retained at a time (current and previous) and swapped
//! each frame; they are replaced, never mutated.

use crate::ground::GroundPlaneRegion;
use nalgebra as na;

fn angle_diff(a: f32, b: f32) -> f32 {
    let d = (a - b) % (2.0 * std::f32::consts::PI);
    if d > std::f32::consts::PI {
        d - 2.0 * std::f32::consts::PI
    } else if d < -std::f32::consts::PI {
        d + 2.0 * std::f32::consts::PI
    } else {
        d
    }
}

/// Robot state as reported for a capture timestamp.
#[derive(Clone, Copy, Debug, Default)]
pub struct RobotState {
    /// Body position in world coordinates, millimetres.
    pub x_mm: f32,
    pub y_mm: f32,
    /// Body heading, radians.
    pub heading_rad: f32,
    /// Head angle relative to the body, radians.
    pub head_angle_rad: f32,
    /// Lift height, millimetres.
    pub lift_height_mm: f32,
    /// Whether the camera was physically moving at capture time.
    pub camera_moving: bool,
}

impl RobotState {
    /// Whether the head angle changed less than `max_rad` between states.
    pub fn head_angle_same(&self, other: &RobotState, max_rad: f32) -> bool {
        angle_diff(self.head_angle_rad, other.head_angle_rad).abs() < max_rad
    }

    /// Whether the body pose (position and heading) stayed within the given
    /// bounds between states.
    ///
    /// # Arguments
    ///
    /// * `other` - state to compare against.
    /// * `max_angle_rad` - maximum allowed heading change.
    /// * `max_dist_mm` - maximum allowed planar position change.
    pub fn body_pose_same(&self, other: &RobotState, max_angle_rad: f32, max_dist_mm: f32) -> bool {
        let dx = self.x_mm - other.x_mm;
        let dy = self.y_mm - other.y_mm;
        angle_diff(self.heading_rad, other.heading_rad).abs() < max_angle_rad
            && (dx * dx + dy * dy) < max_dist_mm * max_dist_mm
    }
}

/// Immutable per-frame pose bundle handed to every detector call.
#[derive(Clone, Debug)]
pub struct PoseSnapshot {
    pub timestamp_ms: u32,
    /// Robot state at capture time.
    pub state: RobotState,
    /// Camera pose derived from the robot state.
    pub camera_pose: na::Isometry3<f32>,
    /// Whether the ground plane is within the camera's view for this pose.
    pub ground_plane_visible: bool,
    /// Ground-to-image homography valid for this pose.
    pub homography: na::Matrix3<f32>,
    pub ground_plane: GroundPlaneRegion,
}

/// External collaborator that builds pose snapshots for captured frames.
///
/// Camera calibration and the head-angle-to-homography solve live behind
/// this trait; the pipeline only consumes the result.
pub trait PoseProvider {
    fn snapshot(&mut self, state: &RobotState, timestamp_ms: u32) -> PoseSnapshot;
}

impl<F: FnMut(&RobotState, u32) -> PoseSnapshot> PoseProvider for F {
    fn snapshot(&mut self, state: &RobotState, timestamp_ms: u32) -> PoseSnapshot {
        (self)(state, timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_gate_uses_wrapped_angle() {
        let a = RobotState {
            head_angle_rad: 3.14,
            ..Default::default()
        };
        let b = RobotState {
            head_angle_rad: -3.14,
            ..Default::default()
        };

        // Only ~0.0032 rad apart across the wrap.
        assert!(a.head_angle_same(&b, 0.01));
        assert!(!a.head_angle_same(&b, 0.001));
    }

    #[test]
    fn body_gate_checks_distance_and_heading() {
        let a = RobotState::default();
        let moved = RobotState {
            x_mm: 0.4,
            y_mm: 0.2,
            ..Default::default()
        };
        let turned = RobotState {
            heading_rad: 0.05,
            ..Default::default()
        };

        assert!(a.body_pose_same(&moved, 0.002, 0.5));
        assert!(!a.body_pose_same(&turned, 0.002, 0.5));
    }
}
