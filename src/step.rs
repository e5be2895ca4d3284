//! Pipeline steps and their options.
//!
//! A step is one operation in a task: a processor plus a fully-populated,
//! typed set of options. Options never hold raw caller input: every step is
//! built by [`normalize`], which
//!
//! 1. merges the caller's JSON object over the processor's defaults,
//! 2. applies raw coercions that can't be expressed as typed values
//!    (non-array `objectsToDetect`, unknown `browserSupport` entries,
//!    out-of-range `quality`),
//! 3. deserializes into the processor's options struct (unknown keys are
//!    rejected), and
//! 4. applies typed coercions.
//!
//! | Processor | Coercions |
//! |---|---|
//! | resize | mode alias `longest` → `auto` |
//! | crop / template | heuristic modes: `confidenceThreshold` clamped to [0, 100] |
//! | optimize | `jpg` + `preserveTransparency` → `png`; quality clamped to [1, 100], capped at 63 for `avif`; empty `browserSupport` → `[modern, legacy]` |
//! | rename | malformed pattern rejected; pattern without `{name}` or `{index}` → `{name}-{index}` |
//! | favicon | sizes deduplicated, sorted, filtered to [16, 512]; empty formats → `[png]` |

use crate::detect::{CropMode, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::imaging::rust_backend::ICO_MAX_EDGE;
use crate::imaging::{OutputFormat, ResizeMode, ResizeRequest};
use crate::naming::{DEFAULT_PATTERN, RenamePattern};
use crate::task::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Highest AVIF quality the optimize step will use.
pub const AVIF_MAX_QUALITY: u32 = 63;

pub const FAVICON_MIN_SIZE: u32 = 16;
pub const FAVICON_MAX_SIZE: u32 = 512;

// ============================================================================
// Processor kinds and ids
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Resize,
    Crop,
    Optimize,
    Rename,
    Template,
    Favicon,
}

impl ProcessorKind {
    pub const ALL: [ProcessorKind; 6] = [
        ProcessorKind::Resize,
        ProcessorKind::Crop,
        ProcessorKind::Optimize,
        ProcessorKind::Rename,
        ProcessorKind::Template,
        ProcessorKind::Favicon,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessorKind::Resize => "resize",
            ProcessorKind::Crop => "crop",
            ProcessorKind::Optimize => "optimize",
            ProcessorKind::Rename => "rename",
            ProcessorKind::Template => "template",
            ProcessorKind::Favicon => "favicon",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ProcessorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| TaskError::UnknownProcessor(s.to_string()))
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque unique token: 16 hex chars of
/// `sha256(prefix, nanos since epoch, process-wide counter)`.
pub(crate) fn generate_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(count.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn generate(kind: ProcessorKind) -> Self {
        Self(generate_id(kind.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ResizeOptions {
    pub dimension: u32,
    pub mode: ResizeMode,
    pub preserve_aspect_ratio: bool,
    pub force_square: bool,
    pub upscale: bool,
    /// Upper bound for either side; 0 disables it.
    pub max_dimension: u32,
}

impl Default for ResizeOptions {
    fn default() -> Self {
        Self {
            dimension: 1080,
            mode: ResizeMode::Auto,
            preserve_aspect_ratio: true,
            force_square: false,
            upscale: false,
            max_dimension: 8192,
        }
    }
}

impl ResizeOptions {
    pub fn request(&self) -> ResizeRequest {
        ResizeRequest {
            dimension: self.dimension,
            mode: self.mode,
            preserve_aspect: self.preserve_aspect_ratio,
            force_square: self.force_square,
            upscale: self.upscale,
            max_dimension: Some(self.max_dimension),
        }
    }
}

fn default_objects() -> Vec<String> {
    ["person", "face", "animal"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CropOptions {
    pub width: u32,
    pub height: u32,
    pub mode: CropMode,
    /// Percent; detections below it fall back to the center.
    pub confidence_threshold: f64,
    pub objects_to_detect: Vec<String>,
    pub upscale: bool,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1080,
            mode: CropMode::Smart,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            objects_to_detect: default_objects(),
            upscale: false,
        }
    }
}

/// Crop to a named template's explicit size. The template catalog itself
/// lives outside this crate; only its resolved dimensions are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TemplateOptions {
    pub template_id: String,
    pub width: u32,
    pub height: u32,
    pub mode: CropMode,
    pub confidence_threshold: f64,
    pub objects_to_detect: Vec<String>,
    pub upscale: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            template_id: String::new(),
            width: 1080,
            height: 1080,
            mode: CropMode::Smart,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            objects_to_detect: default_objects(),
            upscale: false,
        }
    }
}

/// What a crop-like step asks for, shared by crop and template.
#[derive(Debug, Clone, PartialEq)]
pub struct CropSpec {
    pub width: u32,
    pub height: u32,
    pub mode: CropMode,
    pub confidence_threshold: f64,
    pub objects: Vec<String>,
    pub upscale: bool,
}

impl From<&CropOptions> for CropSpec {
    fn from(o: &CropOptions) -> Self {
        Self {
            width: o.width,
            height: o.height,
            mode: o.mode,
            confidence_threshold: o.confidence_threshold,
            objects: o.objects_to_detect.clone(),
            upscale: o.upscale,
        }
    }
}

impl From<&TemplateOptions> for CropSpec {
    fn from(o: &TemplateOptions) -> Self {
        Self {
            width: o.width,
            height: o.height,
            mode: o.mode,
            confidence_threshold: o.confidence_threshold,
            objects: o.objects_to_detect.clone(),
            upscale: o.upscale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserSupport {
    Modern,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Balanced,
    Aggressive,
    Lossless,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct OptimizeOptions {
    pub format: OutputFormat,
    /// Encoder quality for jpg and avif. WebP is always written lossless,
    /// so it ignores this.
    pub quality: u32,
    pub preserve_transparency: bool,
    pub browser_support: Vec<BrowserSupport>,
    pub compression: Compression,
    pub analyze_content: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Webp,
            quality: 80,
            preserve_transparency: false,
            browser_support: vec![BrowserSupport::Modern, BrowserSupport::Legacy],
            compression: Compression::Balanced,
            analyze_content: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameOptions {
    pub pattern: String,
    pub start_index: u64,
    pub zero_pad: usize,
}

impl Default for RenameOptions {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            start_index: 1,
            zero_pad: 0,
        }
    }
}

impl RenameOptions {
    pub fn parsed(&self) -> Result<RenamePattern, crate::naming::PatternError> {
        RenamePattern::parse(&self.pattern)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaviconFormat {
    Png,
    Ico,
}

impl FaviconFormat {
    pub fn output_format(self) -> OutputFormat {
        match self {
            FaviconFormat::Png => OutputFormat::Png,
            FaviconFormat::Ico => OutputFormat::Ico,
        }
    }

    /// Whether this format can hold a `size`px icon.
    pub fn holds(self, size: u32) -> bool {
        match self {
            FaviconFormat::Png => true,
            FaviconFormat::Ico => size <= ICO_MAX_EDGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FaviconOptions {
    pub sizes: Vec<u32>,
    pub formats: Vec<FaviconFormat>,
}

impl Default for FaviconOptions {
    fn default() -> Self {
        Self {
            sizes: vec![16, 32, 48, 180, 192, 512],
            formats: vec![FaviconFormat::Png],
        }
    }
}

impl FaviconOptions {
    /// Every (size, format) pair that will be rendered.
    pub fn renditions(&self) -> Vec<(u32, FaviconFormat)> {
        self.sizes
            .iter()
            .flat_map(|&size| {
                self.formats
                    .iter()
                    .filter(move |f| f.holds(size))
                    .map(move |&f| (size, f))
            })
            .collect()
    }
}

/// Typed options, one variant per processor.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOptions {
    Resize(ResizeOptions),
    Crop(CropOptions),
    Optimize(OptimizeOptions),
    Rename(RenameOptions),
    Template(TemplateOptions),
    Favicon(FaviconOptions),
}

impl StepOptions {
    pub fn defaults(kind: ProcessorKind) -> Self {
        match kind {
            ProcessorKind::Resize => StepOptions::Resize(ResizeOptions::default()),
            ProcessorKind::Crop => StepOptions::Crop(CropOptions::default()),
            ProcessorKind::Optimize => StepOptions::Optimize(OptimizeOptions::default()),
            ProcessorKind::Rename => StepOptions::Rename(RenameOptions::default()),
            ProcessorKind::Template => StepOptions::Template(TemplateOptions::default()),
            ProcessorKind::Favicon => StepOptions::Favicon(FaviconOptions::default()),
        }
    }

    pub fn kind(&self) -> ProcessorKind {
        match self {
            StepOptions::Resize(_) => ProcessorKind::Resize,
            StepOptions::Crop(_) => ProcessorKind::Crop,
            StepOptions::Optimize(_) => ProcessorKind::Optimize,
            StepOptions::Rename(_) => ProcessorKind::Rename,
            StepOptions::Template(_) => ProcessorKind::Template,
            StepOptions::Favicon(_) => ProcessorKind::Favicon,
        }
    }

    /// The options as a camelCase JSON object.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            StepOptions::Resize(o) => serde_json::to_value(o),
            StepOptions::Crop(o) => serde_json::to_value(o),
            StepOptions::Optimize(o) => serde_json::to_value(o),
            StepOptions::Rename(o) => serde_json::to_value(o),
            StepOptions::Template(o) => serde_json::to_value(o),
            StepOptions::Favicon(o) => serde_json::to_value(o),
        }
    }

    /// Crop parameters for crop-like steps.
    pub fn crop_spec(&self) -> Option<CropSpec> {
        match self {
            StepOptions::Crop(o) => Some(o.into()),
            StepOptions::Template(o) => Some(o.into()),
            _ => None,
        }
    }

    /// Heuristic crop modes run detection and cost more.
    pub fn uses_detection(&self) -> bool {
        self.crop_spec().is_some_and(|c| c.mode.is_heuristic())
    }

    fn coerced(self) -> Result<Self, TaskError> {
        Ok(match self {
            StepOptions::Resize(o) => StepOptions::Resize(o),
            StepOptions::Crop(mut o) => {
                if o.mode.is_heuristic() {
                    o.confidence_threshold = o.confidence_threshold.clamp(0.0, 100.0);
                }
                StepOptions::Crop(o)
            }
            StepOptions::Template(mut o) => {
                if o.mode.is_heuristic() {
                    o.confidence_threshold = o.confidence_threshold.clamp(0.0, 100.0);
                }
                o.template_id = o.template_id.trim().to_string();
                StepOptions::Template(o)
            }
            StepOptions::Optimize(mut o) => {
                if o.format == OutputFormat::Jpg && o.preserve_transparency {
                    o.format = OutputFormat::Png;
                }
                o.quality = o.quality.clamp(1, 100);
                if o.format == OutputFormat::Avif {
                    o.quality = o.quality.min(AVIF_MAX_QUALITY);
                }
                o.browser_support.sort();
                o.browser_support.dedup();
                if o.browser_support.is_empty() {
                    o.browser_support = OptimizeOptions::default().browser_support;
                }
                StepOptions::Optimize(o)
            }
            StepOptions::Rename(mut o) => {
                let pattern = o.parsed()?;
                if !pattern.is_unique() {
                    log::debug!(
                        "rename pattern {:?} has no unique placeholder, using {}",
                        o.pattern,
                        DEFAULT_PATTERN
                    );
                    o.pattern = DEFAULT_PATTERN.to_string();
                }
                StepOptions::Rename(o)
            }
            StepOptions::Favicon(mut o) => {
                o.sizes
                    .retain(|s| (FAVICON_MIN_SIZE..=FAVICON_MAX_SIZE).contains(s));
                o.sizes.sort_unstable();
                o.sizes.dedup();
                o.formats.sort();
                o.formats.dedup();
                if o.formats.is_empty() {
                    o.formats = FaviconOptions::default().formats;
                }
                StepOptions::Favicon(o)
            }
        })
    }
}

/// Coercions applied to the merged JSON object before deserializing.
fn coerce_raw(kind: ProcessorKind, map: &mut Map<String, Value>) {
    match kind {
        ProcessorKind::Crop | ProcessorKind::Template => {
            match map.get_mut("objectsToDetect") {
                Some(Value::Array(items)) => items.retain(Value::is_string),
                Some(_) => {
                    map.remove("objectsToDetect");
                }
                None => {}
            }
        }
        ProcessorKind::Optimize => {
            match map.get_mut("browserSupport") {
                Some(Value::Array(items)) => {
                    let known: Vec<Value> = items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_ascii_lowercase)
                        .filter(|s| s == "modern" || s == "legacy")
                        .map(Value::String)
                        .collect();
                    *items = known;
                }
                Some(_) => {
                    map.remove("browserSupport");
                }
                None => {}
            }
            if let Some(q) = map.get("quality").and_then(Value::as_f64) {
                let clamped = q.round().clamp(1.0, 100.0) as u64;
                map.insert("quality".into(), Value::from(clamped));
            }
        }
        ProcessorKind::Favicon => {
            if let Some(Value::Array(items)) = map.get_mut("formats") {
                for item in items.iter_mut() {
                    if let Some(s) = item.as_str() {
                        *item = Value::String(s.to_ascii_lowercase());
                    }
                }
            }
        }
        ProcessorKind::Resize | ProcessorKind::Rename => {}
    }
}

/// Merge `raw` over the defaults for `kind` and coerce the result.
///
/// `raw` must be a JSON object or `null`. `null` values inside it mean
/// "use the default".
///
/// ```
/// use imagetask::step::{normalize, ProcessorKind, StepOptions};
/// use serde_json::json;
///
/// let opts = normalize(ProcessorKind::Favicon, &json!({ "sizes": [64, 16, 16, 1024] })).unwrap();
/// let StepOptions::Favicon(f) = opts else { unreachable!() };
/// assert_eq!(f.sizes, vec![16, 64]);
/// ```
pub fn normalize(kind: ProcessorKind, raw: &Value) -> Result<StepOptions, TaskError> {
    let invalid = |message: String| TaskError::InvalidOptions {
        processor: kind,
        message,
    };

    let overrides = match raw {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => return Err(invalid(format!("expected an object, got {}", other))),
    };

    let mut merged = match StepOptions::defaults(kind).to_value()? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in overrides {
        if !value.is_null() {
            merged.insert(key, value);
        }
    }
    coerce_raw(kind, &mut merged);

    let value = Value::Object(merged);
    let parse_err = |e: serde_json::Error| invalid(e.to_string());
    let options = match kind {
        ProcessorKind::Resize => {
            StepOptions::Resize(serde_json::from_value(value).map_err(parse_err)?)
        }
        ProcessorKind::Crop => StepOptions::Crop(serde_json::from_value(value).map_err(parse_err)?),
        ProcessorKind::Optimize => {
            StepOptions::Optimize(serde_json::from_value(value).map_err(parse_err)?)
        }
        ProcessorKind::Rename => {
            StepOptions::Rename(serde_json::from_value(value).map_err(parse_err)?)
        }
        ProcessorKind::Template => {
            StepOptions::Template(serde_json::from_value(value).map_err(parse_err)?)
        }
        ProcessorKind::Favicon => {
            StepOptions::Favicon(serde_json::from_value(value).map_err(parse_err)?)
        }
    };
    options.coerced()
}

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Single,
    Multiple,
}

/// Derived facts about a step, recomputed whenever its options change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetadata {
    pub output_type: OutputType,
    pub outputs_per_image: usize,
    pub batchable: bool,
}

impl StepMetadata {
    pub fn derive(options: &StepOptions) -> Self {
        match options {
            StepOptions::Favicon(f) => Self {
                output_type: OutputType::Multiple,
                outputs_per_image: f.renditions().len(),
                batchable: false,
            },
            _ => Self {
                output_type: OutputType::Single,
                outputs_per_image: 1,
                batchable: true,
            },
        }
    }
}

/// One step of a [`Task`](crate::task::Task).
///
/// Only the task mutates steps, which keeps `order` contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub(crate) id: StepId,
    pub(crate) options: StepOptions,
    pub(crate) order: usize,
    pub(crate) enabled: bool,
    pub(crate) metadata: StepMetadata,
}

impl StepSpec {
    pub(crate) fn new(options: StepOptions, order: usize) -> Self {
        Self {
            id: StepId::generate(options.kind()),
            metadata: StepMetadata::derive(&options),
            options,
            order,
            enabled: true,
        }
    }

    pub(crate) fn set_options(&mut self, options: StepOptions) {
        self.metadata = StepMetadata::derive(&options);
        self.options = options;
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn processor(&self) -> ProcessorKind {
        self.options.kind()
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    /// 1-based authoring position.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn metadata(&self) -> StepMetadata {
        self.metadata
    }

    pub fn to_record(&self) -> Result<StepRecord, serde_json::Error> {
        Ok(StepRecord {
            id: self.id.clone(),
            processor: self.processor(),
            options: self.options.to_value()?,
            enabled: self.enabled,
            order: self.order,
            metadata: self.metadata,
        })
    }
}

/// Serialized form of a step inside a task export.
///
/// Everything but `processor` may be omitted in hand-written files: missing
/// ids are generated, steps are enabled, and order falls back to position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    #[serde(default)]
    pub id: StepId,
    pub processor: ProcessorKind,
    #[serde(default)]
    pub options: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub order: usize,
    #[serde(default)]
    pub metadata: StepMetadata,
}

fn default_enabled() -> bool {
    true
}
