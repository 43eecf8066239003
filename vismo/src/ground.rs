//! # Ground-plane region of interest
//!
//! A fixed trapezoid on the floor in front of the robot, reasoned about in
//! three spaces: robot coordinates (millimetres), image coordinates (through
//! the ground-to-image homography) and a rectified overhead raster.

use crate::frame::{fill_convex_poly, Plane};
use nalgebra as na;
use once_cell::sync::OnceCell;

/// Four corners in the image plane, perimeter order.
pub type Quad2 = [na::Point2<f32>; 4];
/// Four corners in robot coordinates, perimeter order.
pub type Quad3 = [na::Point3<f32>; 4];

/// Area of a quad via the shoelace formula.
pub fn quad_area(quad: &Quad2) -> f32 {
    let mut sum = 0.0;
    for i in 0..4 {
        let p = quad[i];
        let q = quad[(i + 1) % 4];
        sum += p.x * q.y - q.x * p.y;
    }
    (sum * 0.5).abs()
}

/// Robot-centric ground trapezoid, narrow end nearest the robot.
///
/// All scalars are millimetres. The near edge sits `distance` ahead of the
/// robot origin and is `width_near` wide; the far edge sits `distance +
/// length` ahead and is `width_far` wide. Corner ordering is near-right,
/// near-left, far-left, far-right, and the same winding is used for the
/// ground quad, the image quad and the overhead mask.
#[derive(Clone, Debug)]
pub struct GroundPlaneRegion {
    pub distance: f32,
    pub length: f32,
    pub width_near: f32,
    pub width_far: f32,
    mask: OnceCell<Plane<u8>>,
}

impl GroundPlaneRegion {
    /// Create a new region.
    ///
    /// # Arguments
    ///
    /// * `distance` - gap between the robot origin and the near edge.
    /// * `length` - extent of the trapezoid along the robot's forward axis.
    /// * `width_near` - width of the edge nearest the robot.
    /// * `width_far` - width of the far edge.
    pub fn new(distance: f32, length: f32, width_near: f32, width_far: f32) -> Self {
        assert!(length > 0.0, "ground plane region length must be positive");
        assert!(
            width_far >= width_near && width_near >= 0.0,
            "ground plane region widths must satisfy far >= near >= 0"
        );

        Self {
            distance,
            length,
            width_near,
            width_far,
            mask: OnceCell::new(),
        }
    }

    /// Corners of the trapezoid in robot coordinates at height `z`.
    ///
    /// Robot x points forward, y to the left.
    pub fn ground_quad(&self, z: f32) -> Quad3 {
        let near = self.distance;
        let far = self.distance + self.length;
        [
            na::Point3::new(near, -self.width_near * 0.5, z), // near-right
            na::Point3::new(near, self.width_near * 0.5, z),  // near-left
            na::Point3::new(far, self.width_far * 0.5, z),    // far-left
            na::Point3::new(far, -self.width_far * 0.5, z),   // far-right
        ]
    }

    /// Project the trapezoid into the image plane.
    ///
    /// The ground quad is taken at z = 1 because the homography already
    /// absorbs the ground plane's z = 0 assumption. A non-positive projected
    /// depth means the caller handed in a degenerate homography, which is a
    /// contract violation rather than a recoverable error.
    pub fn image_quad(&self, homography: &na::Matrix3<f32>) -> Quad2 {
        self.ground_quad(1.0).map(|corner| {
            let p = homography * na::Vector3::new(corner.x, corner.y, corner.z);
            assert!(
                p.z > 0.0,
                "non-positive projected depth {}; degenerate ground homography",
                p.z
            );
            na::Point2::new(p.x / p.z, p.y / p.z)
        })
    }

    fn overhead_dim(&self) -> (usize, usize) {
        (
            self.length.round() as usize,
            self.width_far.round() as usize,
        )
    }

    /// Ground point for overhead-raster pixel `(u, v)`.
    ///
    /// Composition of a shift (the ROI origin is not the image top-left)
    /// and a lateral mirror (so the raster reads as looking down at the
    /// floor).
    fn overhead_to_ground(&self, u: f32, v: f32) -> na::Point2<f32> {
        na::Point2::new(u + self.distance, self.width_far * 0.5 - v)
    }

    /// Robot-coordinate point corresponding to overhead pixel (0, 0), under
    /// the mirrored-y convention of the overhead raster.
    pub fn overhead_image_origin(&self) -> na::Point2<f32> {
        na::Point2::new(self.distance, -self.width_far * 0.5)
    }

    /// Warp an image into the rectified overhead view of the trapezoid.
    ///
    /// The output raster is `length` wide and `width_far` tall, one pixel
    /// per millimetre. Every overhead pixel is mapped to the ground, pushed
    /// through the homography, and sampled nearest-neighbour; pixels that
    /// land outside the source image, project behind the camera, or fall
    /// outside the cached trapezoid mask are zero.
    pub fn overhead_image(&self, image: &Plane<u8>, homography: &na::Matrix3<f32>) -> Plane<u8> {
        let (out_w, out_h) = self.overhead_dim();
        let (img_w, img_h) = image.dim();
        let mask = self.overhead_mask();
        let mut out = Plane::new(out_w, out_h);

        for v in 0..out_h {
            for u in 0..out_w {
                if mask.get(u, v) == 0 {
                    continue;
                }
                let g = self.overhead_to_ground(u as f32, v as f32);
                let p = homography * na::Vector3::new(g.x, g.y, 1.0);
                if p.z <= 0.0 {
                    continue;
                }
                let x = (p.x / p.z).round();
                let y = (p.y / p.z).round();
                if x >= 0.0 && y >= 0.0 && (x as usize) < img_w && (y as usize) < img_h {
                    out.put(u, v, image.get(x as usize, y as usize));
                }
            }
        }

        out
    }

    /// Binary trapezoid mask of the overhead raster.
    ///
    /// Computed on first call and cached for the life of the value; later
    /// mutation of the scalar fields does not invalidate it.
    pub fn overhead_mask(&self) -> &Plane<u8> {
        self.mask.get_or_init(|| {
            let (w, h) = self.overhead_dim();
            let half_span = (self.width_far - self.width_near) * 0.5;
            let corners = [
                na::Point2::new(0.0, self.width_far * 0.5 + self.width_near * 0.5), // near-right
                na::Point2::new(0.0, half_span),                                    // near-left
                na::Point2::new(self.length, 0.0),                                  // far-left
                na::Point2::new(self.length, self.width_far),                       // far-right
            ];
            let mut mask = Plane::new(w, h);
            fill_convex_poly(&mut mask, &corners, 255);
            mask
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Pinhole-style homography for a camera `height` above the ground,
    /// looking along +x: u = cx - f*y/x, v = cy + f*height/x.
    pub(crate) fn test_homography(f: f32, cx: f32, cy: f32, height: f32) -> na::Matrix3<f32> {
        na::matrix![
            cx, -f, 0.0;
            cy, 0.0, f * height;
            1.0, 0.0, 0.0
        ]
    }

    fn region() -> GroundPlaneRegion {
        GroundPlaneRegion::new(60.0, 240.0, 130.0, 300.0)
    }

    #[test]
    fn ground_quad_winding() {
        let quad = region().ground_quad(0.0);

        // near-right, near-left, far-left, far-right
        assert_approx_eq!(quad[0].x, 60.0);
        assert_approx_eq!(quad[0].y, -65.0);
        assert_approx_eq!(quad[1].y, 65.0);
        assert_approx_eq!(quad[2].x, 300.0);
        assert_approx_eq!(quad[2].y, 150.0);
        assert_approx_eq!(quad[3].y, -150.0);
    }

    #[test]
    fn image_quad_matches_ground_winding() {
        let roi = region();
        let h = test_homography(100.0, 50.0, 10.0, 40.0);
        let quad = roi.image_quad(&h);

        // Right side of the robot lands on the right side of the image
        // (larger u), near corners below (larger v) the far corners.
        assert!(quad[0].x > quad[1].x);
        assert!(quad[3].x > quad[2].x);
        assert!(quad[0].y > quad[3].y);
    }

    #[test]
    #[should_panic(expected = "degenerate")]
    fn image_quad_rejects_nonpositive_depth() {
        let roi = region();
        // Bottom row maps every ground point to depth -x.
        let h = na::matrix![
            50.0, -100.0, 0.0;
            10.0, 0.0, 4000.0;
            -1.0, 0.0, 0.0
        ];
        let _ = roi.image_quad(&h);
    }

    #[test]
    fn mask_idempotent_and_cache_fixed() {
        let mut roi = region();
        let first = roi.overhead_mask().clone();

        // Mutating the scalars must not change the cached raster.
        roi.width_near = 0.0;
        roi.length = 120.0;
        let second = roi.overhead_mask().clone();

        assert_eq!(first, second);
    }

    #[test]
    fn mask_covers_trapezoid_interior_only() {
        let roi = region();
        let mask = roi.overhead_mask();

        assert_eq!(mask.dim(), (240, 300));
        // Centre of the raster is well inside the trapezoid.
        assert_eq!(mask.get(120, 150), 255);
        // Near corners of the raster lie outside the narrow end.
        assert_eq!(mask.get(0, 0), 0);
        assert_eq!(mask.get(0, 299), 0);
    }

    #[test]
    fn ground_round_trip() {
        let h = test_homography(300.0, 160.0, 120.0, 45.0);

        for &(x, y) in &[(80.0f32, 0.0f32), (150.0, 60.0), (290.0, -140.0)] {
            let img = h * na::Vector3::new(x, y, 1.0);
            assert!(img.z > 0.0);
            let img = na::Point2::new(img.x / img.z, img.y / img.z);

            let sol = h
                .lu()
                .solve(&na::Vector3::new(img.x, img.y, 1.0))
                .expect("homography solve failed");
            assert!(sol.z > 0.0);

            assert_approx_eq!(sol.x / sol.z, x, 0.1);
            assert_approx_eq!(sol.y / sol.z, y, 0.1);
        }
    }

    #[test]
    fn overhead_origin() {
        let roi = region();
        let origin = roi.overhead_image_origin();
        assert_approx_eq!(origin.x, 60.0);
        assert_approx_eq!(origin.y, -150.0);
    }

    #[test]
    fn overhead_image_warps_ground_point() {
        let roi = region();
        let h = test_homography(100.0, 160.0, 20.0, 40.0);

        // Light up the image pixel that ground point (180, 0) projects to.
        let p = h * na::Vector3::new(180.0, 0.0, 1.0);
        let (ix, iy) = ((p.x / p.z).round(), (p.y / p.z).round());

        let mut image = Plane::new(320, 240);
        image.put(ix as usize, iy as usize, 255u8);

        let overhead = roi.overhead_image(&image, &h);

        // Ground (180, 0) is overhead pixel (120, 150).
        assert_eq!(overhead.get(120, 150), 255);
    }
}
