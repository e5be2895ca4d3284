//! Image processing, pure Rust.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** | `image` decoders, `avif-parse` + `rav1d` for AVIF |
//! | **Identify** | `image::image_dimensions`, `avif-parse` for AVIF |
//! | **Render** | `crop_imm` + Lanczos3 `resize_exact` |
//! | **Encode** | `image` codecs (JPEG, PNG, WebP, AVIF, ICO) |
//! | **Entropy analysis** | grayscale histogram per grid cell |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Crop**: Pure crop placement around a focus point
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Entropy**: the built-in [`EntropyAnalyzer`](entropy::EntropyAnalyzer)

pub mod backend;
mod calculations;
mod crop;
pub mod entropy;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend};
pub use calculations::{
    Axis, DimensionError, Prescale, ResizeMode, ResizeRequest, check_crop_fits,
    compute_prescale_for_crop, compute_resize_target,
};
pub use crop::{CropPlacement, FocusPoint, solve_crop, thirds_anchors};
pub use entropy::EntropyAnalyzer;
pub use params::{EncodeParams, OutputFormat, Quality, Rect, RenderParams};
pub use rust_backend::{RustBackend, supported_input_extensions};
