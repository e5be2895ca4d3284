//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait is the rendering primitive the pipeline is built
//! on: probe dimensions, render a source rectangle to an exact size, and
//! re-encode. Everything above it (dimension math, crop placement, step
//! ordering) is backend-agnostic.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend): pure Rust, statically
//! linked.

use super::params::{EncodeParams, RenderParams};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Result of an identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn as_tuple(self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl From<(u32, u32)> for Dimensions {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Trait for image processing backends.
///
/// A failed render must surface as `Err`, never as an empty artifact.
pub trait ImageBackend: Sync {
    /// Get image dimensions (the metadata probe).
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError>;

    /// Extract `params.source_rect` and resample it to `params.width` x
    /// `params.height`. Covers both same-aspect resize (full rect) and crop.
    fn render(&self, params: &RenderParams) -> Result<(), BackendError>;

    /// Re-encode without changing geometry.
    fn encode(&self, params: &EncodeParams) -> Result<(), BackendError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::imaging::params::{OutputFormat, Quality, Rect};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock backend that records operations without touching pixels.
    /// Uses Mutex (not RefCell) so it is Sync and works with rayon's par_iter.
    ///
    /// Render and encode write a small placeholder file so later pipeline
    /// stages can copy the artifact around.
    #[derive(Default)]
    pub struct MockBackend {
        /// Dimensions by file name.
        pub dimensions: Mutex<HashMap<String, Dimensions>>,
        /// Any operation whose source path contains one of these fails.
        pub fail_sources: Mutex<Vec<String>>,
        pub operations: Mutex<Vec<RecordedOp>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Identify(String),
        Render {
            source: String,
            output: String,
            rect: Rect,
            width: u32,
            height: u32,
            format: OutputFormat,
        },
        Encode {
            source: String,
            output: String,
            format: OutputFormat,
            quality: u32,
            flatten: bool,
        },
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_dimensions(dims: &[(&str, u32, u32)]) -> Self {
            let map = dims
                .iter()
                .map(|(name, w, h)| (name.to_string(), Dimensions::new(*w, *h)))
                .collect();
            Self {
                dimensions: Mutex::new(map),
                ..Self::default()
            }
        }

        pub fn fail_on(self, needle: &str) -> Self {
            self.fail_sources.lock().unwrap().push(needle.to_string());
            self
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        fn check_failure(&self, source: &Path) -> Result<(), BackendError> {
            let source = source.to_string_lossy();
            if self
                .fail_sources
                .lock()
                .unwrap()
                .iter()
                .any(|n| source.contains(n.as_str()))
            {
                return Err(BackendError::ProcessingFailed(format!(
                    "mock failure for {}",
                    source
                )));
            }
            Ok(())
        }

        fn write_placeholder(path: &Path) -> Result<(), BackendError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, b"mock")?;
            Ok(())
        }
    }

    impl ImageBackend for MockBackend {
        fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Identify(path.to_string_lossy().to_string()));

            self.dimensions
                .lock()
                .unwrap()
                .get(&file_name(path))
                .copied()
                .ok_or_else(|| BackendError::ProcessingFailed("No mock dimensions".to_string()))
        }

        fn render(&self, params: &RenderParams) -> Result<(), BackendError> {
            self.check_failure(&params.source)?;
            self.operations.lock().unwrap().push(RecordedOp::Render {
                source: params.source.to_string_lossy().to_string(),
                output: params.output.to_string_lossy().to_string(),
                rect: params.source_rect,
                width: params.width,
                height: params.height,
                format: params.format,
            });
            Self::write_placeholder(&params.output)
        }

        fn encode(&self, params: &EncodeParams) -> Result<(), BackendError> {
            self.check_failure(&params.source)?;
            self.operations.lock().unwrap().push(RecordedOp::Encode {
                source: params.source.to_string_lossy().to_string(),
                output: params.output.to_string_lossy().to_string(),
                format: params.format,
                quality: params.quality.value(),
                flatten: params.flatten,
            });
            Self::write_placeholder(&params.output)
        }
    }

    #[test]
    fn mock_records_identify() {
        let backend = MockBackend::with_dimensions(&[("image.jpg", 800, 600)]);

        let result = backend.identify(Path::new("/test/image.jpg")).unwrap();
        assert_eq!(result, Dimensions::new(800, 600));

        let ops = backend.get_operations();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], RecordedOp::Identify(p) if p == "/test/image.jpg"));
    }

    #[test]
    fn mock_identify_unknown_errors() {
        let backend = MockBackend::new();
        assert!(backend.identify(Path::new("/nope.png")).is_err());
    }

    #[test]
    fn mock_records_render_and_writes_placeholder() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = tmp.path().join("out/resized.png");
        let backend = MockBackend::new();

        backend
            .render(&RenderParams {
                source: "/source.jpg".into(),
                output: output.clone(),
                source_rect: Rect::full(1600, 1200),
                width: 800,
                height: 600,
                format: OutputFormat::Png,
                quality: Quality::new(90),
            })
            .unwrap();

        assert!(output.exists());
        let ops = backend.get_operations();
        assert!(matches!(
            &ops[0],
            RecordedOp::Render {
                width: 800,
                height: 600,
                format: OutputFormat::Png,
                ..
            }
        ));
    }

    #[test]
    fn mock_fails_on_matching_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = MockBackend::new().fail_on("broken");
        let result = backend.encode(&EncodeParams {
            source: "/in/broken.jpg".into(),
            output: tmp.path().join("x.webp"),
            format: OutputFormat::Webp,
            quality: Quality::default(),
            flatten: false,
        });
        assert!(matches!(result, Err(BackendError::ProcessingFailed(_))));
        assert!(backend.get_operations().is_empty());
    }
}
