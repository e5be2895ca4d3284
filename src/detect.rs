//! Region-of-interest detection for smart cropping.
//!
//! A [`RegionDetector`] wraps a [`RegionAnalyzer`] (face, object, saliency and
//! entropy heuristics supplied by the platform) and turns whatever it finds
//! into a single [`DetectionResult`]: a normalized focus point plus a
//! confidence score.
//!
//! ## Modes
//!
//! | Mode | Behaviour |
//! |---|---|
//! | `smart` | try every available capability, face → object → saliency → entropy |
//! | `face`, `object`, `saliency`, `entropy` | try only that capability |
//! | `center`, `top`, `bottom`, `left`, `right`, corners | fixed anchor, no detection |
//!
//! ## Merging
//!
//! The first capability (in priority order) that returns candidates wins.
//! Its focus is the confidence-weighted centroid of the candidate box
//! centers; its confidence is the best single candidate's.
//!
//! ## Fallbacks
//!
//! Detection never fails. Three situations fall back to dead center with
//! confidence 0.5, each with its own [`FallbackReason`]:
//!
//! - no requested capability is available (`NoCapability`)
//! - the merged confidence is below the step's threshold (`LowConfidence`)
//! - the probe or an analyzer returned an error (`Error`, plus the
//!   `error-fallback` source marker and the message as a diagnostic)
//!
//! The first two both carry the `fallback-center` marker, so consumers that
//! only look at `sources` see them the same way.

use crate::imaging::FocusPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Confidence reported by every center fallback.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Default `confidenceThreshold`, in percent.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 70.0;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("{0} detection is not available")]
    Unavailable(Capability),
    #[error("Detection failed: {0}")]
    Failed(String),
    #[error("Image processing failed: {0}")]
    Backend(#[from] crate::imaging::BackendError),
}

/// A heuristic detector kind, in merge priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Face,
    Object,
    Saliency,
    Entropy,
}

impl Capability {
    pub const PRIORITY: [Capability; 4] = [
        Capability::Face,
        Capability::Object,
        Capability::Saliency,
        Capability::Entropy,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Face => "face",
            Capability::Object => "object",
            Capability::Saliency => "saliency",
            Capability::Entropy => "entropy",
        };
        f.write_str(s)
    }
}

/// Which capabilities the platform offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub face: bool,
    pub object: bool,
    pub saliency: bool,
    pub entropy: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            face: true,
            object: true,
            saliency: true,
            entropy: true,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Face => self.face,
            Capability::Object => self.object,
            Capability::Saliency => self.saliency,
            Capability::Entropy => self.entropy,
        }
    }
}

/// Crop placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CropMode {
    #[default]
    Smart,
    Face,
    Object,
    Saliency,
    Entropy,
    Center,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl CropMode {
    /// Fixed focus for anchor modes; `None` for heuristic modes.
    pub fn anchor(self) -> Option<FocusPoint> {
        let (x, y) = match self {
            CropMode::Center => (0.5, 0.5),
            CropMode::Top => (0.5, 0.25),
            CropMode::Bottom => (0.5, 0.75),
            CropMode::Left => (0.25, 0.5),
            CropMode::Right => (0.75, 0.5),
            CropMode::TopLeft => (0.25, 0.25),
            CropMode::TopRight => (0.75, 0.25),
            CropMode::BottomLeft => (0.25, 0.75),
            CropMode::BottomRight => (0.75, 0.75),
            _ => return None,
        };
        Some(FocusPoint { x, y })
    }

    pub fn is_heuristic(self) -> bool {
        self.anchor().is_none()
    }

    /// Capabilities this mode asks for, in priority order.
    pub fn requested(self) -> &'static [Capability] {
        match self {
            CropMode::Smart => &Capability::PRIORITY,
            CropMode::Face => &[Capability::Face],
            CropMode::Object => &[Capability::Object],
            CropMode::Saliency => &[Capability::Saliency],
            CropMode::Entropy => &[Capability::Entropy],
            _ => &[],
        }
    }
}

/// One region reported by an analyzer, normalized to image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
}

impl Candidate {
    /// A zero-size candidate centered on `(x, y)`.
    pub fn at(x: f64, y: f64, confidence: f64) -> Self {
        Self {
            x,
            y,
            width: 0.0,
            height: 0.0,
            confidence,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// The capability probe and detectors, supplied by the platform.
///
/// Implementations must be `Sync`: one analyzer is shared by every worker in
/// a parallel batch.
pub trait RegionAnalyzer: Sync {
    /// Report which capabilities exist. Queried once per batch.
    fn capabilities(&self) -> Result<Capabilities, DetectError>;

    /// Run one capability against an image. `objects` lists the object
    /// classes to look for and only matters for [`Capability::Object`].
    fn analyze(
        &self,
        image: &Path,
        capability: Capability,
        objects: &[String],
    ) -> Result<Vec<Candidate>, DetectError>;
}

/// Analyzer for platforms without any detection capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnalyzer;

impl RegionAnalyzer for NullAnalyzer {
    fn capabilities(&self) -> Result<Capabilities, DetectError> {
        Ok(Capabilities::default())
    }

    fn analyze(
        &self,
        _image: &Path,
        capability: Capability,
        _objects: &[String],
    ) -> Result<Vec<Candidate>, DetectError> {
        Err(DetectError::Unavailable(capability))
    }
}

/// What contributed to a [`DetectionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionSource {
    Face,
    Object,
    Saliency,
    Entropy,
    FallbackCenter,
    ErrorFallback,
}

impl From<Capability> for DetectionSource {
    fn from(capability: Capability) -> Self {
        match capability {
            Capability::Face => DetectionSource::Face,
            Capability::Object => DetectionSource::Object,
            Capability::Saliency => DetectionSource::Saliency,
            Capability::Entropy => DetectionSource::Entropy,
        }
    }
}

/// Why a result fell back to the center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum FallbackReason {
    NoCapability,
    LowConfidence { observed: f64 },
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub focus: FocusPoint,
    pub confidence: f64,
    pub sources: BTreeSet<DetectionSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl DetectionResult {
    fn center(reason: FallbackReason, sources: BTreeSet<DetectionSource>) -> Self {
        Self {
            focus: FocusPoint::CENTER,
            confidence: FALLBACK_CONFIDENCE,
            sources,
            fallback: Some(reason),
            diagnostic: None,
        }
    }

    fn error_fallback(message: String) -> Self {
        let mut result = Self::center(
            FallbackReason::Error,
            BTreeSet::from([DetectionSource::ErrorFallback]),
        );
        result.diagnostic = Some(message);
        result
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Confidence-weighted centroid of candidate centers, plus the best
/// single confidence.
pub fn merge_candidates(candidates: &[Candidate]) -> (FocusPoint, f64) {
    let weight = |c: &Candidate| c.confidence.clamp(0.0, 1.0);
    let total: f64 = candidates.iter().map(weight).sum();
    let best = candidates.iter().map(weight).fold(0.0, f64::max);

    if candidates.is_empty() {
        return (FocusPoint::CENTER, 0.0);
    }
    if total <= 0.0 {
        let n = candidates.len() as f64;
        let (sx, sy) = candidates.iter().fold((0.0, 0.0), |(ax, ay), c| {
            let (cx, cy) = c.center();
            (ax + cx, ay + cy)
        });
        return (FocusPoint::new(sx / n, sy / n), 0.0);
    }

    let (sx, sy) = candidates.iter().fold((0.0, 0.0), |(ax, ay), c| {
        let (cx, cy) = c.center();
        let w = weight(c);
        (ax + cx * w, ay + cy * w)
    });
    (FocusPoint::new(sx / total, sy / total), best)
}

/// Focus chosen for a crop, with the detection that produced it (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct Focus {
    pub point: FocusPoint,
    pub detection: Option<DetectionResult>,
}

impl Focus {
    /// Whether crop placement should snap to a rule-of-thirds anchor.
    ///
    /// Only genuine detections snap; anchors and center fallbacks are
    /// placed exactly where they point.
    pub fn snaps(&self) -> bool {
        self.detection.as_ref().is_some_and(|d| !d.is_fallback())
    }
}

/// Detector over a probed analyzer. Cheap to share across threads.
pub struct RegionDetector<'a> {
    analyzer: &'a dyn RegionAnalyzer,
    capabilities: Result<Capabilities, String>,
}

impl<'a> RegionDetector<'a> {
    /// Probe the analyzer once and cache the answer.
    pub fn probe(analyzer: &'a dyn RegionAnalyzer) -> Self {
        let capabilities = analyzer.capabilities().map_err(|e| {
            log::warn!("capability probe failed: {}", e);
            e.to_string()
        });
        if let Ok(caps) = &capabilities {
            log::debug!("detection capabilities: {:?}", caps);
        }
        Self {
            analyzer,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.as_ref().ok().copied()
    }

    /// Resolve the focus for a crop mode: fixed anchors bypass detection.
    pub fn locate(
        &self,
        image: &Path,
        mode: CropMode,
        threshold_percent: f64,
        objects: &[String],
    ) -> Focus {
        match mode.anchor() {
            Some(point) => Focus {
                point,
                detection: None,
            },
            None => {
                let detection = self.detect(image, mode, threshold_percent, objects);
                Focus {
                    point: detection.focus,
                    detection: Some(detection),
                }
            }
        }
    }

    /// Run heuristic detection. Never fails.
    pub fn detect(
        &self,
        image: &Path,
        mode: CropMode,
        threshold_percent: f64,
        objects: &[String],
    ) -> DetectionResult {
        let caps = match &self.capabilities {
            Ok(caps) => *caps,
            Err(message) => return DetectionResult::error_fallback(message.clone()),
        };

        let mut ran = false;
        let mut winner = None;
        for &capability in mode.requested() {
            if !caps.has(capability) {
                continue;
            }
            ran = true;
            match self.analyzer.analyze(image, capability, objects) {
                Ok(candidates) if candidates.is_empty() => continue,
                Ok(candidates) => {
                    winner = Some((capability, merge_candidates(&candidates)));
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "{} detection failed for {}: {}",
                        capability,
                        image.display(),
                        e
                    );
                    return DetectionResult::error_fallback(e.to_string());
                }
            }
        }

        let fallback_sources = |extra: Option<Capability>| {
            let mut sources = BTreeSet::from([DetectionSource::FallbackCenter]);
            sources.extend(extra.map(DetectionSource::from));
            sources
        };

        let Some((capability, (focus, confidence))) = winner else {
            let reason = if ran {
                FallbackReason::LowConfidence { observed: 0.0 }
            } else {
                FallbackReason::NoCapability
            };
            log::debug!("no detection for {}: {:?}", image.display(), reason);
            return DetectionResult::center(reason, fallback_sources(None));
        };

        let threshold = threshold_percent.clamp(0.0, 100.0) / 100.0;
        if confidence < threshold {
            log::debug!(
                "{} confidence {:.2} below threshold {:.2} for {}",
                capability,
                confidence,
                threshold,
                image.display()
            );
            return DetectionResult::center(
                FallbackReason::LowConfidence {
                    observed: confidence,
                },
                fallback_sources(Some(capability)),
            );
        }

        DetectionResult {
            focus,
            confidence,
            sources: BTreeSet::from([DetectionSource::from(capability)]),
            fallback: None,
            diagnostic: None,
        }
    }
}
