//! # imagetask
//!
//! Batch image pipelines. A [`task::Task`] is an ordered list of processing
//! steps (resize, crop, optimize, rename, template, favicon); the
//! [`orchestrator::Orchestrator`] runs it over a set of images and reports
//! per-image outcomes.
//!
//! # Architecture
//!
//! ```text
//! Task (steps, options, metadata)
//!   │
//!   ├─ validate ──→ ValidationReport (errors, warnings, simulated dimensions)
//!   │
//!   └─ Orchestrator::run(images)
//!        │  per image: normalize → validate → execute → copy outputs
//!        ├─ imaging::ImageBackend     pixel work (render, encode, identify)
//!        └─ detect::RegionDetector    focus points for smart crops
//! ```
//!
//! The pixel work sits behind the [`imaging::ImageBackend`] trait and region
//! detection behind [`detect::RegionAnalyzer`], so everything above them is
//! tested with recording mocks. Production uses [`imaging::RustBackend`]
//! (the `image` crate) and [`imaging::EntropyAnalyzer`].
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`imaging`] | Dimension math, crop placement, backend trait and the `image` crate backend |
//! | [`detect`] | Capability probing, detection cascade, confidence fallbacks |
//! | [`step`] | Processor kinds, typed options and their normalization |
//! | [`task`] | Ordered step lists, derived metadata, JSON import/export |
//! | [`validate`] | Per-step and cross-step checks, dimension simulation |
//! | [`naming`] | Rename pattern parsing and expansion |
//! | [`orchestrator`] | Execution order, per-image state, batch scheduling |
//! | [`config`] | `config.toml` loading, validation and merging |
//! | [`output`] | CLI output formatting |
//!
//! # Execution Order
//!
//! Steps always run resize, crop, optimize, rename, then template and
//! favicon in the order they were authored. A task that crops before it
//! resizes on paper still resizes first; the validator simulates that same
//! order, so a task it accepts for an image will not hit a dimension error
//! while running on it.

pub mod config;
pub mod detect;
pub mod imaging;
pub mod naming;
pub mod orchestrator;
pub mod output;
pub mod step;
pub mod task;
pub mod validate;
