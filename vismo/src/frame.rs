//! # Frame buffers and raster primitives
//!
//! This module holds exactly the raster support the motion detector needs:
//! owned planes, the grayscale/colour frame variant, the intensity ratio
//! test, Gaussian pre-blur, binary morphology, connected components, convex
//! polygon fill and percentile coordinate selection.

use bytemuck::{Pod, Zeroable};
use nalgebra as na;

/// Owned row-major raster of `width * height` pixels.
///
/// `Plane<u8>` doubles as the binary mask type used throughout detection,
/// where marked pixels are 255 and everything else is 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plane<P> {
    width: usize,
    height: usize,
    data: Vec<P>,
}

impl<P: Copy + Default> Plane<P> {
    /// Create a zero-filled plane.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![P::default(); width * height],
        }
    }

    /// Wrap an existing buffer.
    ///
    /// # Arguments
    ///
    /// * `width` - width of the plane.
    /// * `height` - height of the plane.
    /// * `data` - row-major pixel data of exactly `width * height` elements.
    pub fn from_vec(width: usize, height: usize, data: Vec<P>) -> Self {
        assert_eq!(data.len(), width * height, "plane buffer size mismatch");
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Get width and height as a tuple.
    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Total number of pixels.
    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn get(&self, x: usize, y: usize) -> P {
        self.data[y * self.width + x]
    }

    pub fn put(&mut self, x: usize, y: usize, p: P) {
        self.data[y * self.width + x] = p;
    }

    pub fn row(&self, y: usize) -> &[P] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [P] {
        &mut self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn as_slice(&self) -> &[P] {
        &self.data
    }

    pub fn fill(&mut self, p: P) {
        self.data.iter_mut().for_each(|v| *v = p);
    }
}

/// Packed 8-bit colour pixel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Per-pixel operations the shared detection algorithm is parameterised over.
///
/// The detector runs one code path for grayscale and colour input; the only
/// difference between the two is how a single pixel answers the brightness
/// floor test and the temporal ratio test.
pub trait MotionPixel: Copy + Default + 'static {
    const CHANNELS: usize;

    /// Read one channel. `idx` must be below [`Self::CHANNELS`].
    fn channel(&self, idx: usize) -> u8;

    /// Build a pixel back from per-channel values.
    fn from_channels(ch: [u8; 3]) -> Self;

    /// Whether the pixel clears the minimum-brightness floor.
    ///
    /// Dark pixels are inherently noisy and never participate in the ratio
    /// test.
    fn brighter_than(&self, floor: u8) -> bool;
}

impl MotionPixel for u8 {
    const CHANNELS: usize = 1;

    fn channel(&self, _idx: usize) -> u8 {
        *self
    }

    fn from_channels(ch: [u8; 3]) -> Self {
        ch[0]
    }

    fn brighter_than(&self, floor: u8) -> bool {
        *self > floor
    }
}

impl MotionPixel for Rgb {
    const CHANNELS: usize = 3;

    fn channel(&self, idx: usize) -> u8 {
        match idx {
            0 => self.r,
            1 => self.g,
            _ => self.b,
        }
    }

    fn from_channels(ch: [u8; 3]) -> Self {
        Self::new(ch[0], ch[1], ch[2])
    }

    fn brighter_than(&self, floor: u8) -> bool {
        self.r.max(self.g).max(self.b) > floor
    }
}

/// Grayscale or colour pixel buffer. At most one representation exists per
/// frame.
#[derive(Clone, Debug)]
pub enum FrameBuf {
    Gray(Plane<u8>),
    Color(Plane<Rgb>),
}

impl FrameBuf {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            FrameBuf::Gray(p) => p.dim(),
            FrameBuf::Color(p) => p.dim(),
        }
    }

    pub fn is_color(&self) -> bool {
        matches!(self, FrameBuf::Color(_))
    }

    /// Whether two buffers share the same pixel format.
    pub fn same_format(&self, other: &FrameBuf) -> bool {
        self.is_color() == other.is_color()
    }
}

/// A captured camera frame with its timestamp.
#[derive(Clone, Debug)]
pub struct Frame {
    pub timestamp_ms: u32,
    pub buf: FrameBuf,
}

impl Frame {
    pub fn gray(timestamp_ms: u32, plane: Plane<u8>) -> Self {
        Self {
            timestamp_ms,
            buf: FrameBuf::Gray(plane),
        }
    }

    pub fn color(timestamp_ms: u32, plane: Plane<Rgb>) -> Self {
        Self {
            timestamp_ms,
            buf: FrameBuf::Color(plane),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.buf.dim()
    }

    pub fn area(&self) -> usize {
        let (w, h) = self.buf.dim();
        w * h
    }
}

/// Ratio between the larger and the smaller of two intensities.
///
/// Symmetric in its arguments. The divisor is clamped to 1 so that the
/// brightness floor is the only thing keeping near-black pixels out.
pub fn intensity_ratio(a: u8, b: u8) -> f32 {
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    f32::from(hi) / f32::from(lo).max(1.0)
}

/// Frame-differencing ratio test.
///
/// Marks every pixel pair whose intensities both clear `floor` and whose
/// larger-over-smaller ratio exceeds `threshold` on any channel. Returns the
/// binary mask and the number of marked pixels.
///
/// # Arguments
///
/// * `crnt` - current frame plane.
/// * `prev` - previous frame plane, same size and format.
/// * `floor` - minimum brightness for a pixel to participate.
/// * `threshold` - ratio above which a pixel counts as changed.
pub fn ratio_mask<P: MotionPixel>(
    crnt: &Plane<P>,
    prev: &Plane<P>,
    floor: u8,
    threshold: f32,
) -> (Plane<u8>, usize) {
    assert_eq!(crnt.dim(), prev.dim(), "ratio test plane size mismatch");

    let (width, height) = crnt.dim();
    let mut mask = Plane::new(width, height);
    let mut marked = 0;

    for y in 0..height {
        let crnt_row = crnt.row(y);
        let prev_row = prev.row(y);
        let mask_row = mask.row_mut(y);
        for x in 0..width {
            let (a, b) = (crnt_row[x], prev_row[x]);
            if a.brighter_than(floor) && b.brighter_than(floor) {
                let changed = (0..P::CHANNELS)
                    .any(|c| intensity_ratio(a.channel(c), b.channel(c)) > threshold);
                if changed {
                    // 255 so the mask displays as-is
                    mask_row[x] = 255;
                    marked += 1;
                }
            }
        }
    }

    (mask, marked)
}

fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    // Sigma derived from kernel size the same way OpenCV does it.
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (ksize / 2) as isize;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Separable Gaussian blur with a replicated border.
///
/// Kernel sizes below 3 leave the plane untouched.
pub fn gaussian_blur<P: MotionPixel>(plane: &Plane<P>, ksize: usize) -> Plane<P> {
    if ksize < 3 {
        return plane.clone();
    }

    let kernel = gaussian_kernel(ksize);
    let half = (kernel.len() / 2) as isize;
    let (width, height) = plane.dim();

    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    // Horizontal pass into a float buffer, then vertical back to 8 bits.
    let mut tmp = vec![[0f32; 3]; width * height];
    for y in 0..height {
        let row = plane.row(y);
        for x in 0..width {
            let mut acc = [0f32; 3];
            for (i, k) in kernel.iter().enumerate() {
                let sx = clamp(x as isize + i as isize - half, width);
                for (c, a) in acc.iter_mut().enumerate().take(P::CHANNELS) {
                    *a += k * f32::from(row[sx].channel(c));
                }
            }
            tmp[y * width + x] = acc;
        }
    }

    let mut out = Plane::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0f32; 3];
            for (i, k) in kernel.iter().enumerate() {
                let sy = clamp(y as isize + i as isize - half, height);
                let src = tmp[sy * width + x];
                for (c, a) in acc.iter_mut().enumerate().take(P::CHANNELS) {
                    *a += k * src[c];
                }
            }
            let mut ch = [0u8; 3];
            for c in 0..P::CHANNELS {
                ch[c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
            out.put(x, y, P::from_channels(ch));
        }
    }

    out
}

fn ellipse_offsets(size: usize) -> Vec<(isize, isize)> {
    let r = (size / 2) as isize;
    if r == 0 {
        return vec![(0, 0)];
    }
    let rf = r as f32;
    let mut offs = vec![];
    for dy in -r..=r {
        for dx in -r..=r {
            let (fx, fy) = (dx as f32 / rf, dy as f32 / rf);
            if fx * fx + fy * fy <= 1.0 + f32::EPSILON {
                offs.push((dx, dy));
            }
        }
    }
    offs
}

fn morph(mask: &Plane<u8>, offs: &[(isize, isize)], dilating: bool) -> Plane<u8> {
    let (width, height) = mask.dim();
    let mut out = Plane::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let mut hit = !dilating;
            for &(dx, dy) in offs {
                let (sx, sy) = (x as isize + dx, y as isize + dy);
                if sx < 0 || sy < 0 || sx >= width as isize || sy >= height as isize {
                    continue;
                }
                let on = mask.get(sx as usize, sy as usize) != 0;
                if dilating && on {
                    hit = true;
                    break;
                } else if !dilating && !on {
                    hit = false;
                    break;
                }
            }
            if hit {
                out.put(x, y, 255);
            }
        }
    }

    out
}

/// Binary dilation with an elliptical structuring element.
pub fn dilate(mask: &Plane<u8>, size: usize) -> Plane<u8> {
    morph(mask, &ellipse_offsets(size), true)
}

/// Binary erosion with an elliptical structuring element.
pub fn erode(mask: &Plane<u8>, size: usize) -> Plane<u8> {
    morph(mask, &ellipse_offsets(size), false)
}

/// Morphological opening. Removes isolated specks smaller than the element.
pub fn open(mask: &Plane<u8>, size: usize) -> Plane<u8> {
    dilate(&erode(mask, size), size)
}

/// Morphological closing. Bridges gaps smaller than the element.
pub fn close(mask: &Plane<u8>, size: usize) -> Plane<u8> {
    erode(&dilate(mask, size), size)
}

/// Area and centroid of one connected component.
#[derive(Clone, Copy, Debug)]
pub struct ComponentStats {
    pub area: usize,
    pub centroid: na::Point2<f32>,
}

/// Label 8-connected components of a binary mask.
///
/// Iterative flood fill; returns per-component statistics in scan order.
pub fn connected_components(mask: &Plane<u8>) -> Vec<ComponentStats> {
    let (width, height) = mask.dim();
    let mut visited = vec![false; width * height];
    let mut stats = vec![];

    for y in 0..height {
        for x in 0..width {
            if mask.get(x, y) == 0 || visited[y * width + x] {
                continue;
            }

            let mut area = 0usize;
            let (mut sum_x, mut sum_y) = (0f64, 0f64);

            visited[y * width + x] = true;
            let mut to_fill = vec![(x, y)];

            while let Some((x, y)) = to_fill.pop() {
                area += 1;
                sum_x += x as f64;
                sum_y += y as f64;

                let neighbor_offs = (-1..=1).flat_map(|x| (-1..=1).map(move |y| (x, y)));

                for (x, y) in neighbor_offs
                    .map(|(ox, oy)| (x as isize + ox, y as isize + oy))
                    .filter(|&(ox, oy)| {
                        (0..width as isize).contains(&ox) && (0..height as isize).contains(&oy)
                    })
                    .map(|(x, y)| (x as usize, y as usize))
                {
                    if mask.get(x, y) != 0 && !visited[y * width + x] {
                        visited[y * width + x] = true;
                        to_fill.push((x, y));
                    }
                }
            }

            stats.push(ComponentStats {
                area,
                centroid: na::Point2::new(
                    (sum_x / area as f64) as f32,
                    (sum_y / area as f64) as f32,
                ),
            });
        }
    }

    stats
}

/// Scanline-fill a convex polygon into the mask.
///
/// # Arguments
///
/// * `mask` - destination plane.
/// * `corners` - polygon corners in perimeter order.
/// * `value` - value to write inside the polygon.
pub fn fill_convex_poly(mask: &mut Plane<u8>, corners: &[na::Point2<f32>], value: u8) {
    let (width, height) = mask.dim();

    for y in 0..height {
        let yc = y as f32 + 0.5;
        let mut xs: Vec<f32> = vec![];

        for i in 0..corners.len() {
            let p = corners[i];
            let q = corners[(i + 1) % corners.len()];
            if (p.y <= yc) != (q.y <= yc) {
                let t = (yc - p.y) / (q.y - p.y);
                xs.push(p.x + t * (q.x - p.x));
            }
        }

        if xs.len() < 2 {
            continue;
        }

        let lo = xs.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        // Both bounds clamp to the mask; a span entirely outside leaves the
        // row untouched rather than producing an inverted slice.
        let x0 = lo.round().clamp(0.0, width as f32) as usize;
        let x1 = hi.round().clamp(0.0, width as f32) as usize;
        if x0 >= x1 {
            continue;
        }
        for v in &mut mask.row_mut(y)[x0..x1] {
            *v = value;
        }
    }
}

/// Select the value at `percentile` of the slice via a partial order
/// statistic, without fully sorting.
///
/// The slice is reordered in place. Percentile 0 selects the minimum,
/// percentile 1 the maximum.
pub fn percentile_select(values: &mut [i32], percentile: f32) -> i32 {
    assert!(!values.is_empty(), "percentile of empty slice");
    assert!(
        (0.0..=1.0).contains(&percentile),
        "percentile out of range"
    );
    let idx = (percentile * (values.len() - 1) as f32).round() as usize;
    let (_, v, _) = values.select_nth_unstable(idx);
    *v
}

/// Robust "centroid" of the marked pixels of a mask.
///
/// The x and y coordinates are selected independently at the given
/// percentiles among marked pixel coordinates, which keeps the estimate
/// robust to outlier blobs at the cost of x/y not being a single real point.
/// Returns the marked area and the centroid, or zeroes when nothing is
/// marked.
pub fn percentile_centroid(
    mask: &Plane<u8>,
    x_percentile: f32,
    y_percentile: f32,
) -> (usize, na::Point2<f32>) {
    let (width, height) = mask.dim();
    let mut xs = vec![];
    let mut ys = vec![];

    for y in 0..height {
        let row = mask.row(y);
        for (x, v) in row.iter().enumerate() {
            if *v != 0 {
                xs.push(x as i32);
                ys.push(y as i32);
            }
        }
    }

    if xs.is_empty() {
        (0, na::Point2::new(0.0, 0.0))
    } else {
        let cx = percentile_select(&mut xs, x_percentile);
        let cy = percentile_select(&mut ys, y_percentile);
        (xs.len(), na::Point2::new(cx as f32, cy as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with(width: usize, height: usize, marked: &[(usize, usize)]) -> Plane<u8> {
        let mut mask = Plane::new(width, height);
        for &(x, y) in marked {
            mask.put(x, y, 255);
        }
        mask
    }

    #[test]
    fn ratio_test_symmetric() {
        for a in 0..=255u16 {
            for b in 0..=255u16 {
                let r1 = intensity_ratio(a as u8, b as u8);
                let r2 = intensity_ratio(b as u8, a as u8);
                assert_eq!(r1, r2, "asymmetric at ({}, {})", a, b);
            }
        }
    }

    #[test]
    fn ratio_mask_honors_brightness_floor() {
        let crnt = Plane::from_vec(2, 1, vec![200u8, 8]);
        let prev = Plane::from_vec(2, 1, vec![100u8, 200]);

        let (mask, marked) = ratio_mask(&crnt, &prev, 10, 1.25);

        // Second pair has one side below the floor and must never mark.
        assert_eq!(mask.get(0, 0), 255);
        assert_eq!(mask.get(1, 0), 0);
        assert_eq!(marked, 1);
    }

    #[test]
    fn ratio_mask_color_any_channel() {
        let crnt = Plane::from_vec(1, 1, vec![Rgb::new(100, 100, 200)]);
        let prev = Plane::from_vec(1, 1, vec![Rgb::new(100, 100, 100)]);

        let (mask, marked) = ratio_mask(&crnt, &prev, 10, 1.25);
        assert_eq!(mask.get(0, 0), 255);
        assert_eq!(marked, 1);
    }

    #[test]
    fn percentile_monotonic() {
        let mask = mask_with(64, 1, &[(3, 0), (10, 0), (20, 0), (40, 0), (63, 0)]);

        let mut prev = i32::MIN;
        for i in 0..=100 {
            let p = i as f32 / 100.0;
            let (_, c) = percentile_centroid(&mask, p, 0.5);
            assert!(c.x as i32 >= prev, "centroid went down at percentile {}", p);
            prev = c.x as i32;
        }
    }

    #[test]
    fn percentile_extremes() {
        let mut values = vec![5, 1, 9, 3, 7];
        assert_eq!(percentile_select(&mut values, 0.0), 1);
        let mut values = vec![5, 1, 9, 3, 7];
        assert_eq!(percentile_select(&mut values, 1.0), 9);
        let mut values = vec![5, 1, 9, 3, 7];
        assert_eq!(percentile_select(&mut values, 0.5), 5);
    }

    #[test]
    fn open_removes_isolated_pixel() {
        let mut mask = mask_with(20, 20, &[(10, 10)]);
        // A solid block survives opening, the lone pixel does not.
        for y in 2..8 {
            for x in 2..8 {
                mask.put(x, y, 255);
            }
        }

        let opened = open(&mask, 3);
        assert_eq!(opened.get(10, 10), 0);
        assert_eq!(opened.get(4, 4), 255);
    }

    #[test]
    fn close_bridges_small_gap() {
        let mut mask = Plane::new(20, 5);
        for y in 1..4 {
            for x in 0..9 {
                mask.put(x, y, 255);
            }
            for x in 11..20 {
                mask.put(x, y, 255);
            }
        }

        let closed = close(&mask, 5);
        assert_eq!(closed.get(9, 2), 255);
        assert_eq!(closed.get(10, 2), 255);
    }

    #[test]
    fn components_split_and_counted() {
        let mut mask = Plane::new(30, 30);
        for y in 1..4 {
            for x in 1..4 {
                mask.put(x, y, 255);
            }
        }
        for y in 20..25 {
            for x in 20..25 {
                mask.put(x, y, 255);
            }
        }

        let mut stats = connected_components(&mask);
        stats.sort_by_key(|s| s.area);

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].area, 9);
        assert_eq!(stats[1].area, 25);
        assert!((stats[1].centroid.x - 22.0).abs() < 1e-5);
        assert!((stats[1].centroid.y - 22.0).abs() < 1e-5);
    }

    #[test]
    fn convex_fill_covers_rect() {
        let mut mask = Plane::new(10, 10);
        let corners = [
            na::Point2::new(2.0, 2.0),
            na::Point2::new(8.0, 2.0),
            na::Point2::new(8.0, 8.0),
            na::Point2::new(2.0, 8.0),
        ];
        fill_convex_poly(&mut mask, &corners, 255);

        assert_eq!(mask.get(5, 5), 255);
        assert_eq!(mask.get(0, 0), 0);
        assert_eq!(mask.get(9, 9), 0);
    }

    #[test]
    fn convex_fill_clips_to_mask() {
        // Quad lying partially past the right edge fills only in-bounds
        // pixels.
        let mut mask = Plane::new(10, 10);
        let corners = [
            na::Point2::new(7.0, 2.0),
            na::Point2::new(20.0, 2.0),
            na::Point2::new(20.0, 8.0),
            na::Point2::new(7.0, 8.0),
        ];
        fill_convex_poly(&mut mask, &corners, 255);
        assert_eq!(mask.get(8, 5), 255);
        assert_eq!(mask.get(6, 5), 0);

        // A quad whose lower scanlines lie entirely right of the mask must
        // leave those rows untouched instead of panicking.
        let mut mask = Plane::new(100, 100);
        let corners = [
            na::Point2::new(90.0, 0.0),
            na::Point2::new(140.0, 0.0),
            na::Point2::new(160.0, 99.0),
            na::Point2::new(110.0, 99.0),
        ];
        fill_convex_poly(&mut mask, &corners, 255);
        assert_eq!(mask.get(95, 0), 255);
        assert!(mask.row(99).iter().all(|&v| v == 0));
    }

    #[test]
    fn blur_preserves_flat_regions() {
        let mut plane = Plane::new(32, 32);
        plane.fill(128u8);
        let blurred = gaussian_blur(&plane, 21);
        assert!(blurred.as_slice().iter().all(|&v| v == 128));
    }

    #[test]
    fn blur_spreads_impulse() {
        let mut plane = Plane::new(31, 31);
        plane.put(15, 15, 255u8);
        let blurred = gaussian_blur(&plane, 5);
        assert!(blurred.get(15, 15) < 255);
        assert!(blurred.get(16, 15) > 0);
    }
}
