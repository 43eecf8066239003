//! # Visual Motion Sensing Library
//!
//! This library provides the visual motion sensing core of a small mobile
//! robot: frame-differencing motion detection with ground-plane reasoning, a
//! double-buffered frame mailbox between the capture and processing threads,
//! and duty-cycle scheduling of vision processing modes.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use vismo::prelude::v1::*;
//! ```
//!
//! You may need [`nalgebra`](https://crates.io/crates/nalgebra) to make use
//! of the geometric functionality.

pub mod frame;
pub mod ground;
pub mod mailbox;
pub mod motion;
pub mod pipeline;
pub mod pose;
pub mod schedule;
pub mod viz;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            frame::{Frame, FrameBuf, Plane, Rgb},
            ground::GroundPlaneRegion,
            mailbox::FrameMailbox,
            motion::{MotionConfig, MotionDetector, MotionObservation, PeripheralConfig},
            pipeline::{VisionPipeline, VisionResult},
            pose::{PoseProvider, PoseSnapshot, RobotState},
            schedule::{DutyCycle, ModeSchedule, ModeScheduler, ModeSet, VisionMode},
            viz::DebugImageList,
        };
        pub use anyhow::{anyhow, Error, Result};
    }
}
