//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.
//!
//! Rounding is `f64::round` (half away from zero) and is applied to the
//! dominant side only. The other side is always re-derived from the *integer*
//! dominant side, never from the original float ratio, so feeding a result
//! back in with the same request returns the same dimensions.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which edge a resize `dimension` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    Width,
    Height,
    /// Longest edge: landscape and square sources resize by width,
    /// portrait sources by height.
    #[default]
    #[serde(alias = "longest")]
    Auto,
}

/// An image axis, used to name the side that violated a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Width,
    Height,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Width => f.write_str("width"),
            Axis::Height => f.write_str("height"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DimensionError {
    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),
    #[error(
        "Upscaling not allowed: {axis} would grow from {}x{} to {}x{}",
        .from.0, .from.1, .to.0, .to.1
    )]
    UpscaleNotAllowed {
        axis: Axis,
        from: (u32, u32),
        to: (u32, u32),
    },
}

/// A fully-specified resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeRequest {
    pub dimension: u32,
    pub mode: ResizeMode,
    pub preserve_aspect: bool,
    pub force_square: bool,
    pub upscale: bool,
    /// Upper bound for either side; `None` or `Some(0)` disables it.
    pub max_dimension: Option<u32>,
}

impl ResizeRequest {
    pub fn new(dimension: u32, mode: ResizeMode) -> Self {
        Self {
            dimension,
            mode,
            preserve_aspect: true,
            force_square: false,
            upscale: false,
            max_dimension: None,
        }
    }
}

/// Derive the non-dominant side from the integer dominant side.
fn derive_side(other_source: u32, dominant_source: u32, dominant_target: u32) -> u32 {
    let v = other_source as f64 * dominant_target as f64 / dominant_source as f64;
    (v.round() as u32).max(1)
}

fn scale_side(value: u32, scale: f64) -> u32 {
    ((value as f64 * scale).round() as u32).max(1)
}

/// Compute the output size of a resize step.
///
/// # Arguments
/// * `source` - Current image dimensions (width, height)
/// * `request` - Dimension, mode and policy flags
///
/// # Returns
/// * `(width, height)` - Target dimensions, or an error when the request is
///   invalid or would upscale while `upscale` is off.
///
/// # Examples
/// ```
/// # use imagetask::imaging::{compute_resize_target, ResizeMode, ResizeRequest};
/// let req = ResizeRequest::new(1000, ResizeMode::Auto);
/// assert_eq!(compute_resize_target((4000, 2000), &req), Ok((1000, 500)));
/// ```
pub fn compute_resize_target(
    source: (u32, u32),
    request: &ResizeRequest,
) -> Result<(u32, u32), DimensionError> {
    let (src_w, src_h) = source;
    if src_w == 0 || src_h == 0 {
        return Err(DimensionError::InvalidDimensions(format!(
            "source is {}x{}",
            src_w, src_h
        )));
    }
    let d = request.dimension;
    if d == 0 {
        return Err(DimensionError::InvalidDimensions(
            "resize dimension must be positive".into(),
        ));
    }

    let dominant = match request.mode {
        ResizeMode::Width => Axis::Width,
        ResizeMode::Height => Axis::Height,
        ResizeMode::Auto if src_w >= src_h => Axis::Width,
        ResizeMode::Auto => Axis::Height,
    };
    let derives = request.preserve_aspect && !request.force_square;

    let (mut w, mut h) = if request.force_square {
        (d, d)
    } else {
        match (dominant, derives) {
            (Axis::Width, true) => (d, derive_side(src_h, src_w, d)),
            (Axis::Height, true) => (derive_side(src_w, src_h, d), d),
            (_, false) => (d, d),
        }
    };
    w = w.max(1);
    h = h.max(1);

    if let Some(max) = request.max_dimension.filter(|&m| m > 0) {
        if w > max || h > max {
            let scale = (max as f64 / w as f64).min(max as f64 / h as f64);
            (w, h) = match (dominant, derives) {
                (Axis::Width, true) => {
                    let nw = scale_side(w, scale);
                    (nw, derive_side(src_h, src_w, nw))
                }
                (Axis::Height, true) => {
                    let nh = scale_side(h, scale);
                    (derive_side(src_w, src_h, nh), nh)
                }
                (_, false) => (scale_side(w, scale), scale_side(h, scale)),
            };
            w = w.min(max);
            h = h.min(max);
        }
    }

    if !request.upscale {
        if w > src_w {
            return Err(DimensionError::UpscaleNotAllowed {
                axis: Axis::Width,
                from: source,
                to: (w, h),
            });
        }
        if h > src_h {
            return Err(DimensionError::UpscaleNotAllowed {
                axis: Axis::Height,
                from: source,
                to: (w, h),
            });
        }
    }

    Ok((w, h))
}

/// Uniform scale applied before cropping so the image covers the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prescale {
    pub scale: f64,
    /// Scaled source width (>= target width).
    pub width: u32,
    /// Scaled source height (>= target height).
    pub height: u32,
}

/// Calculate the scale-to-cover factor for a crop target.
///
/// Returns `max(target_w / source_w, target_h / source_h)` and the scaled
/// source dimensions. One side matches the target exactly, the other may
/// exceed it.
pub fn compute_prescale_for_crop(source: (u32, u32), target: (u32, u32)) -> Prescale {
    let src_w = source.0.max(1) as f64;
    let src_h = source.1.max(1) as f64;
    let scale = (target.0 as f64 / src_w).max(target.1 as f64 / src_h);

    Prescale {
        scale,
        width: ((src_w * scale).round() as u32).max(target.0),
        height: ((src_h * scale).round() as u32).max(target.1),
    }
}

/// Check that a fixed-size target fits inside the current dimensions.
///
/// Crop-like steps refuse to invent pixels unless `upscale` is set.
pub fn check_crop_fits(
    current: (u32, u32),
    target: (u32, u32),
    upscale: bool,
) -> Result<(), DimensionError> {
    if target.0 == 0 || target.1 == 0 {
        return Err(DimensionError::InvalidDimensions(format!(
            "crop target is {}x{}",
            target.0, target.1
        )));
    }
    if upscale {
        return Ok(());
    }
    if target.0 > current.0 {
        return Err(DimensionError::UpscaleNotAllowed {
            axis: Axis::Width,
            from: current,
            to: target,
        });
    }
    if target.1 > current.1 {
        return Err(DimensionError::UpscaleNotAllowed {
            axis: Axis::Height,
            from: current,
            to: target,
        });
    }
    Ok(())
}
