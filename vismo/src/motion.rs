//! # Temporal motion detection
//!
//! Frame-differencing motion detector. Each call compares the incoming frame
//! against the previously stored one, extracts a robust whole-image centroid
//! and a ground-plane centroid of the changed area, and feeds a three-zone
//! impulse-decay classifier watching the image periphery.
//!
//! Detection only runs when the robot held still between the two frames;
//! camera motion makes the whole image "change" and would be reported as
//! scene motion otherwise.

use crate::frame::{
    close, connected_components, fill_convex_poly, gaussian_blur, open, percentile_centroid,
    ratio_mask, Frame, FrameBuf, Plane,
};
use crate::ground::quad_area;
use crate::pose::PoseSnapshot;
use crate::viz::DebugImageList;
use anyhow::Result;
use nalgebra as na;

/// Tunables for the peripheral zone classifier.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct PeripheralConfig {
    /// Fraction of the image width assigned to each of the left and right
    /// bands. At most 0.5.
    pub horizontal_size: f32,
    /// Fraction of the image height assigned to the top band. At most 0.5.
    pub vertical_size: f32,
    /// Impulse gain applied to a component's area fraction.
    pub increase_factor: f32,
    /// Constant per-frame decay.
    pub decrease_factor: f32,
    /// Response ceiling; a zone is activated once its response reaches it.
    pub max_value: f32,
    /// Smoothing factor of the per-zone centroid moving average.
    pub centroid_alpha: f32,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            horizontal_size: 0.25,
            vertical_size: 0.25,
            increase_factor: 10.0,
            decrease_factor: 0.1,
            max_value: 1.0,
            centroid_alpha: 0.6,
        }
    }
}

/// Motion detector tunables.
///
/// Loaded externally and passed in at construction; there is no global
/// mutable configuration.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct MotionConfig {
    /// Pixels at or below this intensity never participate in the ratio
    /// test. Darker pixels are inherently noisier. Must be positive.
    pub min_brightness: u8,
    /// Main sensitivity parameter: higher requires more image difference to
    /// register a change.
    pub ratio_threshold: f32,
    /// Fraction of the image that must change before a whole-image centroid
    /// is reported.
    pub min_area_fraction: f32,
    /// Whole-image centroid percentiles, image coordinates.
    pub centroid_percentile_x: f32,
    pub centroid_percentile_y: f32,
    /// Ground centroid percentiles, robot coordinates. The X percentile is
    /// the important one for reacting to motion: it selects how close to
    /// the robot the reported point lies.
    pub ground_centroid_percentile_x: f32,
    pub ground_centroid_percentile_y: f32,
    /// Minimum interval between reported motions. Cannot get too small or
    /// residual image change right after motion is re-reported.
    pub cooldown_ms: u32,
    /// Maximum pose change between the two frames for detection to run.
    pub max_head_angle_change_deg: f32,
    pub max_body_angle_change_deg: f32,
    pub max_pose_change_mm: f32,
    /// Pre-blur kernel width; below 3 disables the blur.
    pub blur_kernel_px: usize,
    /// Opening kernel, removes isolated marked pixels.
    pub open_kernel_px: usize,
    /// Closing kernel, merges nearby fragments. Too small fragments motion
    /// areas, too big invents artificially large ones.
    pub close_kernel_px: usize,
    /// Components smaller than this never reach the zone classifier.
    pub min_component_area_px: usize,
    pub peripheral: PeripheralConfig,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_brightness: 10,
            ratio_threshold: 1.25,
            min_area_fraction: 1.0 / 225.0,
            centroid_percentile_x: 0.5,
            centroid_percentile_y: 0.5,
            ground_centroid_percentile_x: 0.05,
            ground_centroid_percentile_y: 0.5,
            cooldown_ms: 500,
            max_head_angle_change_deg: 0.1,
            max_body_angle_change_deg: 0.1,
            max_pose_change_mm: 0.5,
            blur_kernel_px: 21,
            open_kernel_px: 5,
            close_kernel_px: 20,
            min_component_area_px: 500,
            peripheral: PeripheralConfig::default(),
        }
    }
}

/// State of one peripheral zone in a motion observation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct ZoneObservation {
    pub activated: bool,
    /// Impulse-decay response, not an area.
    pub response: f32,
    /// Smoothed centroid of the activations, image coordinates.
    pub x: f32,
    pub y: f32,
}

/// One reported motion event.
///
/// Image and ground fields are zero when the respective pathway found
/// nothing; at least one pathway fired for the observation to exist at all.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct MotionObservation {
    pub timestamp_ms: u32,
    /// Whole-image centroid, image coordinates.
    pub img_x: f32,
    pub img_y: f32,
    /// Changed area as a fraction of the image.
    pub img_area: f32,
    /// Ground-plane centroid, robot coordinates, millimetres.
    pub ground_x_mm: i16,
    pub ground_y_mm: i16,
    /// Changed area as a fraction of the ground quad.
    pub ground_area: f32,
    pub top: ZoneObservation,
    pub left: ZoneObservation,
    pub right: ZoneObservation,
}

/// Bounded accumulator that rises on activation and decays otherwise.
#[derive(Clone, Copy, Debug)]
struct ImpulseDecay {
    increase_factor: f32,
    decrease_factor: f32,
    max_value: f32,
    value: f32,
}

impl ImpulseDecay {
    fn new(increase_factor: f32, decrease_factor: f32, max_value: f32) -> Self {
        Self {
            increase_factor,
            decrease_factor,
            max_value,
            value: 0.0,
        }
    }

    fn update(&mut self, value: f32) -> f32 {
        self.value = (self.value + self.increase_factor * value - self.decrease_factor)
            .clamp(0.0, self.max_value);
        self.value
    }

    fn decay(&mut self) -> f32 {
        self.update(0.0)
    }

    fn value(&self) -> f32 {
        self.value
    }

    fn activated(&self) -> bool {
        self.value >= self.max_value
    }
}

#[derive(Clone, Copy, Debug)]
struct Zone {
    response: ImpulseDecay,
    // (-1, -1) until the first activation
    centroid: na::Point2<f32>,
}

impl Zone {
    fn new(cfg: &PeripheralConfig) -> Self {
        Self {
            response: ImpulseDecay::new(cfg.increase_factor, cfg.decrease_factor, cfg.max_value),
            centroid: na::Point2::new(-1.0, -1.0),
        }
    }

    fn touch(&mut self, point: na::Point2<f32>, value: f32, alpha: f32) {
        self.response.update(value);
        self.centroid = if self.centroid.x < 0.0 {
            point
        } else {
            // Exponential moving average towards the new activation
            na::Point2::from(point.coords * alpha + self.centroid.coords * (1.0 - alpha))
        };
    }
}

/// Divides the image into top, left and right sections and accumulates
/// motion that falls inside them under an impulse/decay model. Left and
/// right are mutually exclusive; top is independent of both.
#[derive(Clone, Debug)]
struct PeripheralZones {
    left_margin: f32,
    right_margin: f32,
    upper_margin: f32,
    image_area: f32,
    alpha: f32,
    top: Zone,
    left: Zone,
    right: Zone,
}

impl PeripheralZones {
    fn new(width: usize, height: usize, cfg: &PeripheralConfig) -> Self {
        assert!(
            cfg.horizontal_size <= 0.5 && cfg.vertical_size <= 0.5,
            "peripheral bands cannot exceed half of the image"
        );

        let left_margin = width as f32 * cfg.horizontal_size;

        Self {
            left_margin,
            right_margin: width as f32 - left_margin,
            upper_margin: height as f32 * cfg.vertical_size,
            image_area: (width * height) as f32,
            alpha: cfg.centroid_alpha,
            top: Zone::new(cfg),
            left: Zone::new(cfg),
            right: Zone::new(cfg),
        }
    }

    fn update(&mut self, point: na::Point2<f32>, area_px: f32) {
        // The activation value is the component's fraction of the image
        let value = area_px / self.image_area;

        if point.y <= self.upper_margin {
            self.top.touch(point, value, self.alpha);
        } else {
            self.top.response.decay();
        }

        if point.x <= self.left_margin {
            self.right.response.decay();
            self.left.touch(point, value, self.alpha);
        } else if point.x >= self.right_margin {
            self.left.response.decay();
            self.right.touch(point, value, self.alpha);
        } else {
            self.left.response.decay();
            self.right.response.decay();
        }
    }

    fn decay(&mut self) {
        self.top.response.decay();
        self.left.response.decay();
        self.right.response.decay();
    }

    /// Motion overlay for visualisation: the mask with the band margins
    /// drawn in mid-gray and a cross at each activated zone's centroid.
    fn annotate(&self, mask: &Plane<u8>) -> Plane<u8> {
        let mut out = mask.clone();
        let (width, height) = out.dim();

        let vline = |out: &mut Plane<u8>, x: usize| {
            for y in 0..height {
                out.put(x, y, out.get(x, y).max(128));
            }
        };
        vline(&mut out, (self.left_margin as usize).min(width - 1));
        vline(&mut out, (self.right_margin as usize).min(width - 1));
        let uy = (self.upper_margin as usize).min(height - 1);
        for x in 0..width {
            out.put(x, uy, out.get(x, uy).max(128));
        }

        for zone in [&self.top, &self.left, &self.right] {
            if !zone.response.activated() || zone.centroid.x < 0.0 {
                continue;
            }
            let (cx, cy) = (zone.centroid.x as isize, zone.centroid.y as isize);
            for d in -3..=3isize {
                for (x, y) in [(cx + d, cy), (cx, cy + d)] {
                    if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
                        out.put(x as usize, y as usize, 255);
                    }
                }
            }
        }

        out
    }
}

#[derive(Clone, Debug)]
struct PrevFrame {
    buf: FrameBuf,
    blurred: bool,
}

fn blur_buf(buf: &FrameBuf, ksize: usize) -> FrameBuf {
    match buf {
        FrameBuf::Gray(p) => FrameBuf::Gray(gaussian_blur(p, ksize)),
        FrameBuf::Color(p) => FrameBuf::Color(gaussian_blur(p, ksize)),
    }
}

fn ratio_buf(crnt: &FrameBuf, prev: &FrameBuf, floor: u8, threshold: f32) -> (Plane<u8>, usize) {
    match (crnt, prev) {
        (FrameBuf::Gray(c), FrameBuf::Gray(p)) => ratio_mask(c, p, floor, threshold),
        (FrameBuf::Color(c), FrameBuf::Color(p)) => ratio_mask(c, p, floor, threshold),
        _ => unreachable!("ratio test across pixel formats"),
    }
}

/// Solve `homography * ground = point` for the ground coordinates of an
/// image point. Fails on a singular homography or a non-positive projected
/// depth, both of which indicate the homography is degenerate rather than
/// that motion is absent.
fn project_to_ground(
    homography: &na::Matrix3<f32>,
    point: na::Point2<f32>,
) -> Option<na::Point2<f32>> {
    let sol = homography
        .lu()
        .solve(&na::Vector3::new(point.x, point.y, 1.0))?;
    if sol.z <= 0.0 {
        None
    } else {
        Some(na::Point2::new(sol.x / sol.z, sol.y / sol.z))
    }
}

/// Frame-differencing motion detector with per-frame gating.
pub struct MotionDetector {
    config: MotionConfig,
    prev: Option<PrevFrame>,
    last_motion_ms: u32,
    // Built lazily; the image size is unknown until the first frame
    zones: Option<PeripheralZones>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        assert!(config.min_brightness > 0, "minimum brightness must be positive");

        Self {
            config,
            prev: None,
            last_motion_ms: 0,
            zones: None,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Detect motion between this frame and the previously stored one.
    ///
    /// Detection is skipped (with the frame still stored for next time)
    /// unless the head and body pose stayed put, a previous frame of the
    /// same pixel format exists, the camera was not moving, and the cooldown
    /// since the last report has elapsed.
    ///
    /// # Arguments
    ///
    /// * `frame` - incoming frame.
    /// * `crnt` - pose snapshot for this frame.
    /// * `prev` - pose snapshot of the previously processed frame.
    /// * `debug` - optional sink for named debug rasters.
    pub fn detect(
        &mut self,
        frame: &Frame,
        crnt: &PoseSnapshot,
        prev: &PoseSnapshot,
        mut debug: Option<&mut DebugImageList>,
    ) -> Result<Vec<MotionObservation>> {
        let cfg = self.config.clone();
        let mut observations = vec![];

        let head_same = crnt
            .state
            .head_angle_same(&prev.state, cfg.max_head_angle_change_deg.to_radians());
        let pose_same = crnt.state.body_pose_same(
            &prev.state,
            cfg.max_body_angle_change_deg.to_radians(),
            cfg.max_pose_change_mm,
        );
        let have_prev = self
            .prev
            .as_ref()
            .map(|p| p.buf.same_format(&frame.buf))
            .unwrap_or(false);
        // Often false
        let cooled_down =
            frame.timestamp_ms.saturating_sub(self.last_motion_ms) > cfg.cooldown_ms;

        let mut store = None;

        if head_same && pose_same && have_prev && !crnt.state.camera_moving && cooled_down {
            self.last_motion_ms = frame.timestamp_ms;

            // Suppress sensor noise before differencing. The stored previous
            // frame is blurred at most once.
            let do_blur = cfg.blur_kernel_px >= 3;
            let crnt_buf = if do_blur {
                blur_buf(&frame.buf, cfg.blur_kernel_px)
            } else {
                frame.buf.clone()
            };
            if do_blur {
                let stored = self.prev.as_mut().expect("previous frame checked above");
                if !stored.blurred {
                    stored.buf = blur_buf(&stored.buf, cfg.blur_kernel_px);
                    stored.blurred = true;
                }
            }

            let prev_buf = &self.prev.as_ref().expect("previous frame checked above").buf;
            let (raw_mask, marked) =
                ratio_buf(&crnt_buf, prev_buf, cfg.min_brightness, cfg.ratio_threshold);

            // Opening kills lone marked pixels, closing merges the remaining
            // fragments into coherent blobs. The centroid pathways and the
            // zone classifier all consume this one mask.
            let mask = close(&open(&raw_mask, cfg.open_kernel_px), cfg.close_kernel_px);

            let image_area = mask.area();
            let mut obs = MotionObservation {
                timestamp_ms: frame.timestamp_ms,
                ..Default::default()
            };
            let mut found = false;

            // Whole-image centroid
            let min_area = (image_area as f32 * cfg.min_area_fraction).round() as usize;
            if marked > min_area {
                let (area, centroid) = percentile_centroid(
                    &mask,
                    cfg.centroid_percentile_x,
                    cfg.centroid_percentile_y,
                );
                if area > 0 {
                    obs.img_x = centroid.x;
                    obs.img_y = centroid.y;
                    obs.img_area = area as f32 / image_area as f32;
                    found = true;
                }
            }

            // Ground-plane centroid, when there is a ground plane to reason
            // about on both ends of the differencing pair
            if crnt.ground_plane_visible && prev.ground_plane_visible {
                if let Some((ground, area)) = Self::ground_plane_motion(&cfg, &mask, crnt) {
                    obs.ground_x_mm = ground.x.round() as i16;
                    obs.ground_y_mm = ground.y.round() as i16;
                    obs.ground_area = area;
                    found = true;
                }
            }

            // Peripheral zones
            let (width, height) = mask.dim();
            let zones = self
                .zones
                .get_or_insert_with(|| PeripheralZones::new(width, height, &cfg.peripheral));

            let mut touched = false;
            for stat in connected_components(&mask)
                .into_iter()
                .filter(|s| s.area >= cfg.min_component_area_px)
            {
                touched = true;
                zones.update(stat.centroid, stat.area as f32);
            }
            if !touched {
                zones.decay();
            }

            for (zone, out) in [
                (&zones.top, &mut obs.top),
                (&zones.left, &mut obs.left),
                (&zones.right, &mut obs.right),
            ] {
                if zone.response.activated() {
                    out.activated = true;
                    out.response = zone.response.value();
                    out.x = zone.centroid.x;
                    out.y = zone.centroid.y;
                    found = true;
                }
            }

            if found {
                observations.push(obs);
            }

            if let Some(debug) = debug.as_deref_mut() {
                debug.push("RatioImg", mask.clone());
                if crnt.ground_plane_visible {
                    debug.push(
                        "RatioImgGround",
                        crnt.ground_plane.overhead_image(&mask, &crnt.homography),
                    );
                }
                debug.push("PeripheralMotion", zones.annotate(&mask));
            }

            store = Some(PrevFrame {
                buf: crnt_buf,
                blurred: do_blur,
            });
        }

        // Store the current frame for next time whether or not detection ran
        self.prev = Some(store.unwrap_or_else(|| PrevFrame {
            buf: frame.buf.clone(),
            blurred: false,
        }));

        Ok(observations)
    }

    /// Centroid of the motion restricted to the ground ROI.
    ///
    /// Returns the centroid in robot coordinates and the changed area as a
    /// fraction of the projected quad, or `None` when the quad holds no
    /// motion or the homography cannot be inverted for the centroid.
    fn ground_plane_motion(
        cfg: &MotionConfig,
        mask: &Plane<u8>,
        crnt: &PoseSnapshot,
    ) -> Option<(na::Point2<f32>, f32)> {
        let quad = crnt.ground_plane.image_quad(&crnt.homography);
        let (width, height) = mask.dim();

        // Bounding rectangle of the quad, clamped to the mask
        let min_x = quad.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
        let min_y = quad.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
        let max_x = quad.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
        let max_y = quad.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);

        let x0 = min_x.floor().max(0.0) as usize;
        let y0 = min_y.floor().max(0.0) as usize;
        let x1 = (max_x.ceil().min(width as f32)) as usize;
        let y1 = (max_y.ceil().min(height as f32)) as usize;
        if x0 >= x1 || y0 >= y1 {
            return None;
        }

        let (roi_w, roi_h) = (x1 - x0, y1 - y0);
        let mut roi = Plane::new(roi_w, roi_h);
        for y in 0..roi_h {
            roi.row_mut(y).copy_from_slice(&mask.row(y0 + y)[x0..x1]);
        }

        // Zero out everything that is inside the bounding box but outside
        // the quad itself
        let local: Vec<_> = quad
            .iter()
            .map(|p| na::Point2::new(p.x - x0 as f32, p.y - y0 as f32))
            .collect();
        let mut quad_mask = Plane::new(roi_w, roi_h);
        fill_convex_poly(&mut quad_mask, &local, 255);
        for y in 0..roi_h {
            for x in 0..roi_w {
                if quad_mask.get(x, y) == 0 {
                    roi.put(x, y, 0);
                }
            }
        }

        // The percentiles are swapped and mirrored: small x on the ground
        // corresponds to large y in the image, where the centroid is
        // actually computed.
        let (area, centroid) = percentile_centroid(
            &roi,
            cfg.ground_centroid_percentile_y,
            1.0 - cfg.ground_centroid_percentile_x,
        );
        if area == 0 {
            return None;
        }

        // Back from ROI to full-image coordinates
        let centroid = na::Point2::new(centroid.x + x0 as f32, centroid.y + y0 as f32);

        let quad_px = quad_area(&quad);
        assert!(quad_px > 0.0, "ground quad with zero area");
        let area_fraction = area as f32 / quad_px;

        match project_to_ground(&crnt.homography, centroid) {
            Some(ground) => Some((ground, area_fraction)),
            None => {
                log::warn!(
                    "failed to project motion centroid ({:.1}, {:.1}) to the ground plane; \
                     degenerate homography at head angle {:.3} rad?",
                    centroid.x,
                    centroid.y,
                    crnt.state.head_angle_rad
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ground::GroundPlaneRegion;
    use crate::pose::RobotState;

    /// Camera `height` above the ground looking along +x.
    fn homography(f: f32, cx: f32, cy: f32, height: f32) -> na::Matrix3<f32> {
        na::matrix![
            cx, -f, 0.0;
            cy, 0.0, f * height;
            1.0, 0.0, 0.0
        ]
    }

    fn snapshot(state: RobotState, timestamp_ms: u32, visible: bool) -> PoseSnapshot {
        PoseSnapshot {
            timestamp_ms,
            state,
            camera_pose: na::Isometry3::identity(),
            ground_plane_visible: visible,
            homography: homography(60.0, 50.0, 10.0, 40.0),
            ground_plane: GroundPlaneRegion::new(60.0, 240.0, 130.0, 300.0),
        }
    }

    fn test_config() -> MotionConfig {
        MotionConfig {
            blur_kernel_px: 1,
            open_kernel_px: 3,
            close_kernel_px: 5,
            ..Default::default()
        }
    }

    fn gray_frame(timestamp_ms: u32, square: Option<(usize, usize, u8)>) -> Frame {
        let mut plane = Plane::new(100, 100);
        plane.fill(100u8);
        if let Some((x0, y0, value)) = square {
            for y in y0..y0 + 10 {
                for x in x0..x0 + 10 {
                    plane.put(x, y, value);
                }
            }
        }
        Frame::gray(timestamp_ms, plane)
    }

    #[test]
    fn moving_square_detected_once() {
        let mut det = MotionDetector::new(test_config());

        let s0 = snapshot(RobotState::default(), 1000, true);
        let s1 = snapshot(RobotState::default(), 1100, true);

        // Dim square at the old position, bright at the new one; only the
        // new position clears the ratio threshold.
        let first = gray_frame(1000, Some((30, 45, 110)));
        let second = gray_frame(1100, Some((50, 45, 220)));

        let obs = det.detect(&first, &s0, &s0, None).unwrap();
        assert!(obs.is_empty(), "no previous frame yet");

        let obs = det.detect(&second, &s1, &s0, None).unwrap();
        assert_eq!(obs.len(), 1);

        let m = &obs[0];
        assert_eq!(m.timestamp_ms, 1100);
        // 10x10 square out of 100x100 pixels, give or take morphology
        assert!((m.img_area - 0.01).abs() < 0.005, "area {}", m.img_area);
        assert!(
            m.img_x >= 50.0 && m.img_x < 60.0 && m.img_y >= 45.0 && m.img_y < 55.0,
            "centroid ({}, {}) outside the square",
            m.img_x,
            m.img_y
        );
    }

    #[test]
    fn body_pose_change_gates_detection() {
        let mut det = MotionDetector::new(test_config());

        let s0 = snapshot(RobotState::default(), 1000, true);
        let moved = RobotState {
            x_mm: 5.0,
            ..Default::default()
        };
        let s1 = snapshot(moved, 1100, true);

        let first = gray_frame(1000, Some((30, 45, 110)));
        let second = gray_frame(1100, Some((50, 45, 220)));

        det.detect(&first, &s0, &s0, None).unwrap();
        let obs = det.detect(&second, &s1, &s0, None).unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn camera_moving_gates_detection() {
        let mut det = MotionDetector::new(test_config());

        let s0 = snapshot(RobotState::default(), 1000, true);
        let moving = RobotState {
            camera_moving: true,
            ..Default::default()
        };
        let s1 = snapshot(moving, 1100, true);

        det.detect(&gray_frame(1000, None), &s0, &s0, None).unwrap();
        let obs = det
            .detect(&gray_frame(1100, Some((50, 45, 220))), &s1, &s0, None)
            .unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn cooldown_suppresses_back_to_back_reports() {
        let mut det = MotionDetector::new(test_config());
        let s = |ts| snapshot(RobotState::default(), ts, false);

        det.detect(&gray_frame(1000, None), &s(1000), &s(1000), None)
            .unwrap();
        let obs = det
            .detect(&gray_frame(1100, Some((50, 45, 220))), &s(1100), &s(1000), None)
            .unwrap();
        assert_eq!(obs.len(), 1);

        // 100 ms later is still within the 500 ms cooldown
        let obs = det
            .detect(&gray_frame(1200, Some((70, 45, 220))), &s(1200), &s(1100), None)
            .unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn format_switch_skips_detection() {
        let mut det = MotionDetector::new(test_config());
        let s = |ts| snapshot(RobotState::default(), ts, false);

        det.detect(&gray_frame(1000, None), &s(1000), &s(1000), None)
            .unwrap();

        // Colour frame cannot be differenced against a gray one
        let mut plane = Plane::new(100, 100);
        plane.fill(crate::frame::Rgb::new(220, 220, 220));
        let color = Frame::color(1100, plane);

        let obs = det.detect(&color, &s(1100), &s(1000), None).unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn large_blob_activates_top_and_left_zones() {
        let mut det = MotionDetector::new(test_config());
        let s = |ts| snapshot(RobotState::default(), ts, false);

        let mut prev = Plane::new(100, 100);
        prev.fill(100u8);
        let mut crnt = prev.clone();
        for y in 0..30 {
            for x in 0..40 {
                crnt.put(x, y, 220);
            }
        }

        det.detect(&Frame::gray(1000, prev), &s(1000), &s(1000), None)
            .unwrap();
        let obs = det
            .detect(&Frame::gray(1100, crnt), &s(1100), &s(1000), None)
            .unwrap();

        assert_eq!(obs.len(), 1);
        let m = &obs[0];
        assert!(m.top.activated);
        assert!(m.left.activated);
        assert!(!m.right.activated);
        assert!((m.top.x - 19.5).abs() < 3.0 && (m.top.y - 14.5).abs() < 3.0);
    }

    #[test]
    fn impulse_decay_charges_and_drains() {
        let mut id = ImpulseDecay::new(10.0, 0.1, 1.0);

        assert_eq!(id.value(), 0.0);
        id.update(0.05); // +0.5 - 0.1
        assert!((id.value() - 0.4).abs() < 1e-6);
        id.update(0.05);
        assert!((id.value() - 0.8).abs() < 1e-6);
        id.update(0.05);
        assert!(id.activated(), "clamped at max");

        for _ in 0..10 {
            id.decay();
        }
        assert_eq!(id.value(), 0.0);
    }

    #[test]
    fn zone_bands_route_updates() {
        let cfg = PeripheralConfig::default();
        let mut zones = PeripheralZones::new(100, 100, &cfg);

        // Top-left corner touches top and left, decays right
        zones.update(na::Point2::new(10.0, 10.0), 3000.0);
        assert!(zones.top.response.value() > 0.0);
        assert!(zones.left.response.value() > 0.0);
        assert_eq!(zones.right.response.value(), 0.0);

        // Centre point decays everything
        let before = zones.top.response.value();
        zones.update(na::Point2::new(50.0, 50.0), 3000.0);
        assert!(zones.top.response.value() < before);
    }

    #[test]
    fn zone_centroid_smoothing() {
        let cfg = PeripheralConfig::default();
        let mut zone = Zone::new(&cfg);

        // Sentinel is replaced wholesale on the first touch
        zone.touch(na::Point2::new(10.0, 10.0), 0.1, cfg.centroid_alpha);
        assert_eq!(zone.centroid, na::Point2::new(10.0, 10.0));

        zone.touch(na::Point2::new(20.0, 10.0), 0.1, cfg.centroid_alpha);
        assert!((zone.centroid.x - 16.0).abs() < 1e-4);
    }

    #[test]
    fn ground_projection_rejects_singular_homography() {
        let singular = na::matrix![
            1.0, 0.0, 0.0;
            1.0, 0.0, 0.0;
            0.0, 0.0, 1.0
        ];
        assert!(project_to_ground(&singular, na::Point2::new(10.0, 10.0)).is_none());

        let good = homography(60.0, 50.0, 10.0, 40.0);
        let ground = project_to_ground(&good, na::Point2::new(50.0, 40.0)).unwrap();
        // Round trip back to the image
        let img = good * na::Vector3::new(ground.x, ground.y, 1.0);
        assert!((img.x / img.z - 50.0).abs() < 1e-2);
        assert!((img.y / img.z - 40.0).abs() < 1e-2);
    }

    #[test]
    fn ground_observation_reported_for_motion_inside_quad() {
        let mut det = MotionDetector::new(test_config());

        let s0 = snapshot(RobotState::default(), 1000, true);
        let s1 = snapshot(RobotState::default(), 1100, true);

        // Place the bright square inside the projected ground quad
        let quad = s1.ground_plane.image_quad(&s1.homography);
        let cx: f32 = quad.iter().map(|p| p.x).sum::<f32>() / 4.0;
        let cy: f32 = quad.iter().map(|p| p.y).sum::<f32>() / 4.0;
        let (x0, y0) = (cx as usize - 5, cy as usize - 5);

        let first = gray_frame(1000, None);
        let second = gray_frame(1100, Some((x0, y0, 220)));

        det.detect(&first, &s0, &s0, None).unwrap();
        let obs = det.detect(&second, &s1, &s0, None).unwrap();

        assert_eq!(obs.len(), 1);
        let m = &obs[0];
        assert!(m.ground_area > 0.0);
        // The centroid must land inside the ground trapezoid
        assert!(m.ground_x_mm >= 60 && m.ground_x_mm <= 300);
        assert!(m.ground_y_mm.abs() <= 150);
    }

    #[test]
    fn debug_rasters_are_captured() {
        let mut det = MotionDetector::new(test_config());
        let s = |ts| snapshot(RobotState::default(), ts, true);

        let mut debug = DebugImageList::default();
        det.detect(&gray_frame(1000, None), &s(1000), &s(1000), None)
            .unwrap();
        det.detect(
            &gray_frame(1100, Some((50, 45, 220))),
            &s(1100),
            &s(1000),
            Some(&mut debug),
        )
        .unwrap();

        let names: Vec<_> = debug.iter().map(|(n, _)| n.to_string()).collect();
        assert!(names.contains(&"RatioImg".to_string()));
        assert!(names.contains(&"RatioImgGround".to_string()));
        assert!(names.contains(&"PeripheralMotion".to_string()));
    }
}
