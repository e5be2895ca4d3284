//! Crop placement.
//!
//! Turns a normalized focus point into an integer crop rectangle of an exact
//! target size. This is a *placement* solver: the output always has the
//! requested width and height, only its position varies. Callers pre-scale
//! the source with [`compute_prescale_for_crop`](super::compute_prescale_for_crop)
//! so the target fits; when they don't, the rectangle is pinned to 0 on the
//! short axis instead of failing.
//!
//! # Coordinate System
//!
//! - Focus points are normalized: (0.0, 0.0) top-left, (1.0, 1.0) bottom-right.
//! - Rectangles are in pixels of the *scaled* source.

use super::params::Rect;
use serde::{Deserialize, Serialize};

/// Normalized point of interest in `[0, 1] x [0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusPoint {
    pub x: f64,
    pub y: f64,
}

impl FocusPoint {
    pub const CENTER: FocusPoint = FocusPoint { x: 0.5, y: 0.5 };

    /// Build a point, clamping both coordinates into `[0, 1]`.
    pub fn new(x: f64, y: f64) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) };
        Self {
            x: clamp(x),
            y: clamp(y),
        }
    }
}

/// Final crop rectangle, in scaled-source pixels.
pub type CropPlacement = Rect;

/// The four interior intersections of a 3x3 grid over `width` x `height`.
pub fn thirds_anchors(width: f64, height: f64) -> [(f64, f64); 4] {
    let (x1, x2) = (width / 3.0, width * 2.0 / 3.0);
    let (y1, y2) = (height / 3.0, height * 2.0 / 3.0);
    [(x1, y1), (x2, y1), (x1, y2), (x2, y2)]
}

/// Nearest rule-of-thirds anchor to `(fx, fy)` by Euclidean distance.
///
/// Ties resolve to the first anchor in [`thirds_anchors`] order.
fn nearest_anchor(fx: f64, fy: f64, width: f64, height: f64) -> (f64, f64) {
    let mut best = (fx, fy);
    let mut best_dist = f64::INFINITY;
    for (ax, ay) in thirds_anchors(width, height) {
        let dist = (ax - fx).hypot(ay - fy);
        if dist < best_dist {
            best_dist = dist;
            best = (ax, ay);
        }
    }
    best
}

/// Center a `size`-long span on `center`, clamped into `[0, extent - size]`.
fn place_span(center: f64, size: u32, extent: u32) -> u32 {
    let max_start = extent.saturating_sub(size);
    let start = (center - size as f64 / 2.0).round();
    if start <= 0.0 {
        0
    } else {
        (start as u32).min(max_start)
    }
}

/// Place a `target` crop over a `scaled` image around `focus`.
///
/// With `snap` set, the focus is first moved to the nearest rule-of-thirds
/// intersection.
///
/// # Example
///
/// ```
/// use imagetask::imaging::{solve_crop, FocusPoint};
///
/// // 900x600, 300x300 crop, subject near the upper-left third
/// let r = solve_crop(FocusPoint::new(0.3, 0.3), (900, 600), (300, 300), true);
/// assert_eq!((r.x, r.y, r.width, r.height), (150, 50, 300, 300));
/// ```
pub fn solve_crop(
    focus: FocusPoint,
    scaled: (u32, u32),
    target: (u32, u32),
    snap: bool,
) -> CropPlacement {
    let (sw, sh) = (scaled.0 as f64, scaled.1 as f64);
    let (mut fx, mut fy) = (focus.x * sw, focus.y * sh);

    if snap {
        (fx, fy) = nearest_anchor(fx, fy, sw, sh);
    }

    Rect {
        x: place_span(fx, target.0, scaled.0),
        y: place_span(fy, target.1, scaled.1),
        width: target.0,
        height: target.1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_focus_without_snap_is_centered() {
        let r = solve_crop(FocusPoint::CENTER, (1000, 500), (800, 500), false);
        assert_eq!(r, Rect { x: 100, y: 0, width: 800, height: 500 });
    }

    #[test]
    fn snap_moves_to_nearest_third() {
        // focus (270, 180) → anchor (300, 200)
        let r = solve_crop(FocusPoint::new(0.3, 0.3), (900, 600), (300, 300), true);
        assert_eq!((r.x, r.y), (150, 50));
    }

    #[test]
    fn snap_picks_lower_right_anchor() {
        // focus (810, 540) → anchor (600, 400) → x = 450, y = 250
        let r = solve_crop(FocusPoint::new(0.9, 0.9), (900, 600), (300, 300), true);
        assert_eq!((r.x, r.y), (450, 250));
    }

    #[test]
    fn edge_focus_clamps_inside() {
        let r = solve_crop(FocusPoint::new(1.0, 1.0), (1000, 800), (400, 300), false);
        assert_eq!((r.x, r.y), (600, 500));
        let r = solve_crop(FocusPoint::new(0.0, 0.0), (1000, 800), (400, 300), false);
        assert_eq!((r.x, r.y), (0, 0));
    }

    #[test]
    fn oversized_target_pins_to_origin() {
        let r = solve_crop(FocusPoint::new(0.8, 0.8), (300, 200), (400, 250), true);
        assert_eq!((r.x, r.y, r.width, r.height), (0, 0, 400, 250));
    }

    #[test]
    fn size_always_matches_target() {
        let r = solve_crop(FocusPoint::new(0.1, 0.7), (1234, 987), (321, 123), true);
        assert_eq!((r.width, r.height), (321, 123));
    }

    #[test]
    fn crop_is_contained_for_all_valid_inputs() {
        let scaled_sizes = [(100, 100), (1000, 500), (333, 777), (1920, 1080)];
        let steps = [0.0, 0.13, 0.33, 0.5, 0.66, 0.87, 1.0];
        for scaled in scaled_sizes {
            for target in [(1, 1), (50, 50), (100, 40), (scaled.0, scaled.1)] {
                if target.0 > scaled.0 || target.1 > scaled.1 {
                    continue;
                }
                for &x in &steps {
                    for &y in &steps {
                        for snap in [false, true] {
                            let r = solve_crop(FocusPoint::new(x, y), scaled, target, snap);
                            assert!(r.right() <= scaled.0, "{:?} {:?} {:?}", r, scaled, target);
                            assert!(r.bottom() <= scaled.1, "{:?} {:?} {:?}", r, scaled, target);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn focus_point_clamps_and_rejects_nan() {
        assert_eq!(FocusPoint::new(-1.0, 2.0), FocusPoint { x: 0.0, y: 1.0 });
        assert_eq!(FocusPoint::new(f64::NAN, 0.2), FocusPoint { x: 0.5, y: 0.2 });
    }
}
