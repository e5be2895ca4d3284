//! Batch execution of a [`Task`] against many images.
//!
//! ## Execution order
//!
//! Steps run in [`CANONICAL_ORDER`] (resize, crop, optimize, rename), then
//! any remaining processors (favicon, template) in their authored relative
//! order. Authoring order only matters within one processor kind. Disabled
//! steps are skipped.
//!
//! ## Per image
//!
//! ```text
//! Pending → Validating → Executing(step 1) → … → Completed
//!                      ↘                   ↘
//!                        Failed              Failed
//! ```
//!
//! 1. The source is normalized into an [`ImageHandle`], probing its
//!    dimensions through the backend when the caller didn't supply them.
//! 2. The task is validated against those dimensions. Any error fails the
//!    image before a single pixel is touched.
//! 3. Each step reads the previous step's artifact and writes its own into a
//!    private work directory (`<output>/.work/<index>-<stem>/`), appending an
//!    [`OperationRecord`] to the image's history.
//! 4. Only when every step succeeded are the final artifacts copied to the
//!    output directory, so a failed image leaves nothing behind.
//!
//! Outputs are published in input order, even when a parallel group
//! executed out of order. An output name already taken by an earlier image
//! of the same batch gets `-{position}` appended (`photo-2.jpg`), and the
//! image carries a warning saying so.
//!
//! Step failures are wrapped as `Step {order} ({processor}) failed: …`.
//! [`Orchestrator::process`] returns them; [`Orchestrator::run`] turns them
//! into failed [`ImageReport`]s and keeps going.
//!
//! ## Output layout
//!
//! ```text
//! output/
//! ├── dawn.webp                  # main artifact, named by the last rename
//! ├── dawn-favicon-16.png        # favicon renditions
//! └── dawn-favicon-32.ico
//! ```
//!
//! ## Scheduling
//!
//! [`Schedule::Parallel`] processes images in fixed-size groups: groups run
//! one after another, images inside a group run concurrently on rayon.
//! Reports always come back in input order.

use crate::detect::{DetectionResult, RegionAnalyzer, RegionDetector};
use crate::imaging::{
    BackendError, DimensionError, Dimensions, EncodeParams, ImageBackend, OutputFormat, Quality,
    Rect, RenderParams, check_crop_fits, compute_prescale_for_crop, compute_resize_target,
    solve_crop,
};
use crate::naming::{NameContext, file_stem};
use crate::step::{Compression, CropSpec, ProcessorKind, StepId, StepOptions, StepSpec};
use crate::task::Task;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Processors that run first, in this order.
pub const CANONICAL_ORDER: [ProcessorKind; 4] = [
    ProcessorKind::Resize,
    ProcessorKind::Crop,
    ProcessorKind::Optimize,
    ProcessorKind::Rename,
];

/// Name of the per-batch scratch directory inside the output directory.
pub const WORK_DIR: &str = ".work";

/// Enabled steps in execution order.
pub fn execution_plan(steps: &[StepSpec]) -> Vec<&StepSpec> {
    let enabled = || steps.iter().filter(|s| s.enabled());
    let mut plan = Vec::with_capacity(steps.len());
    for kind in CANONICAL_ORDER {
        plan.extend(enabled().filter(|s| s.processor() == kind));
    }
    plan.extend(enabled().filter(|s| !CANONICAL_ORDER.contains(&s.processor())));
    plan
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Step {order} ({processor}) failed: {message}")]
    Step {
        order: usize,
        processor: ProcessorKind,
        message: String,
    },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Cannot read {path}: {message}")]
    Probe { path: PathBuf, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    fn step(step: &StepSpec, err: impl fmt::Display) -> Self {
        PipelineError::Step {
            order: step.order(),
            processor: step.processor(),
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Inputs and options
// ============================================================================

/// An input image, optionally with known dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub path: PathBuf,
    pub dimensions: Option<Dimensions>,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dimensions: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some(Dimensions::new(width, height));
        self
    }
}

impl From<PathBuf> for SourceImage {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for SourceImage {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// A source image after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHandle {
    /// Position in the batch, 0-based.
    pub index: usize,
    pub path: PathBuf,
    pub stem: String,
    pub dimensions: Dimensions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    #[default]
    Sequential,
    Parallel { group_size: usize },
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Sequential => f.write_str("sequential"),
            Schedule::Parallel { group_size } => write!(f, "parallel, groups of {}", group_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub schedule: Schedule,
    /// Quality for intermediate renders (resize, crop, favicon).
    pub quality: Quality,
    pub keep_work_files: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            schedule: Schedule::Sequential,
            quality: Quality::new(90),
            keep_work_files: false,
        }
    }
}

// ============================================================================
// Reports and events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ImageState {
    Pending,
    Validating,
    Executing { step: usize },
    Completed,
    Failed,
}

/// One executed step in an image's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// 1-based position in the execution plan.
    pub sequence: usize,
    pub step_id: StepId,
    /// The step's authoring order.
    pub order: usize,
    pub processor: ProcessorKind,
    pub before: Dimensions,
    pub after: Dimensions,
    /// Output name (file stem) after this step.
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionResult>,
}

/// A successfully processed image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOutput {
    pub source: PathBuf,
    /// The main artifact, absent for favicon-only tasks.
    pub output: Option<PathBuf>,
    /// Favicon renditions.
    pub extra_outputs: Vec<PathBuf>,
    pub dimensions: Dimensions,
    pub history: Vec<OperationRecord>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReport {
    pub index: usize,
    pub source: PathBuf,
    pub success: bool,
    pub state: ImageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_outputs: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    pub history: Vec<OperationRecord>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ImageReport {
    fn completed(index: usize, out: ImageOutput, duration_ms: u64) -> Self {
        Self {
            index,
            source: out.source,
            success: true,
            state: ImageState::Completed,
            output: out.output,
            extra_outputs: out.extra_outputs,
            dimensions: Some(out.dimensions),
            history: out.history,
            warnings: out.warnings,
            error: None,
            duration_ms,
        }
    }

    fn failed(index: usize, source: PathBuf, error: String, duration_ms: u64) -> Self {
        Self {
            index,
            source,
            success: false,
            state: ImageState::Failed,
            output: None,
            extra_outputs: Vec::new(),
            dimensions: None,
            history: Vec::new(),
            warnings: Vec::new(),
            error: Some(error),
            duration_ms,
        }
    }

    /// Number of files this image produced.
    pub fn output_count(&self) -> usize {
        usize::from(self.output.is_some()) + self.extra_outputs.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outputs: usize,
    /// Task-level validation warnings.
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Everything a batch run produced. Serialized as `report.json` by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub task_id: String,
    pub task_name: String,
    pub schedule: Schedule,
    pub images: Vec<ImageReport>,
    pub summary: BatchSummary,
}

/// Progress events sent while a batch runs.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started {
        total: usize,
        schedule: Schedule,
    },
    StepCompleted {
        index: usize,
        source: PathBuf,
        record: OperationRecord,
    },
    ImageCompleted {
        index: usize,
        total: usize,
        source: PathBuf,
        outputs: Vec<PathBuf>,
        warnings: usize,
    },
    ImageFailed {
        index: usize,
        total: usize,
        source: PathBuf,
        error: String,
    },
    Finished {
        summary: BatchSummary,
    },
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Where one image's run is reporting to.
struct RunContext<'a> {
    output_dir: &'a Path,
    timestamp: u64,
    total: usize,
    progress: Option<&'a Sender<BatchEvent>>,
}

impl RunContext<'_> {
    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = self.progress {
            tx.send(event).ok();
        }
    }
}

/// An image whose steps all ran. Its artifacts still sit in the work dir.
struct Staged {
    handle: ImageHandle,
    work_dir: PathBuf,
    name: String,
    /// Final artifact of the main chain, if any main-chain step ran.
    main: Option<Artifact>,
    favicons: Vec<(u32, OutputFormat, PathBuf)>,
    dimensions: Dimensions,
    history: Vec<OperationRecord>,
    warnings: Vec<String>,
}

impl Staged {
    /// Output paths this image would take under `name`.
    fn destinations(&self, dir: &Path, name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(self.favicons.len() + 1);
        if let Some(main) = &self.main {
            paths.push(dir.join(format!("{}.{}", name, main.ext)));
        }
        for (size, format, _) in &self.favicons {
            paths.push(dir.join(format!("{}-favicon-{}.{}", name, size, format.extension())));
        }
        paths
    }
}

/// The artifact currently flowing through an image's steps.
#[derive(Debug, Clone)]
struct Artifact {
    path: PathBuf,
    /// Extension the file actually has on disk.
    ext: String,
    /// Format new renders are written in.
    format: OutputFormat,
    dims: Dimensions,
}

pub struct Orchestrator<'a> {
    backend: &'a dyn ImageBackend,
    detector: RegionDetector<'a>,
    options: RunOptions,
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

impl<'a> Orchestrator<'a> {
    /// Build an orchestrator. The analyzer's capabilities are probed here,
    /// once, and shared by every image.
    pub fn new(
        backend: &'a dyn ImageBackend,
        analyzer: &'a dyn RegionAnalyzer,
        options: RunOptions,
    ) -> Self {
        Self {
            backend,
            detector: RegionDetector::probe(analyzer),
            options,
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run a single image, propagating the first error.
    pub fn process(
        &self,
        task: &Task,
        image: &SourceImage,
        output_dir: &Path,
    ) -> Result<ImageOutput, PipelineError> {
        let ctx = RunContext {
            output_dir,
            timestamp: unix_seconds(),
            total: 1,
            progress: None,
        };
        let staged = self.stage(task, image, 0, &ctx)?;
        self.publish(staged, &mut HashSet::new(), &ctx)
    }

    /// Run every image. Per-image failures become failed reports; only
    /// task-level problems (validation errors, an unwritable output
    /// directory) fail the batch.
    pub fn run(
        &self,
        task: &Task,
        images: &[SourceImage],
        output_dir: &Path,
        progress: Option<Sender<BatchEvent>>,
    ) -> Result<BatchReport, PipelineError> {
        let started = Instant::now();
        let validation = task.validate(None);
        if !validation.is_valid() {
            return Err(PipelineError::Validation(validation.error_message()));
        }
        std::fs::create_dir_all(output_dir)?;

        let schedule = self.options.schedule;
        log::info!(
            "running task {:?} on {} images ({})",
            task.name(),
            images.len(),
            schedule
        );
        let ctx = RunContext {
            output_dir,
            timestamp: unix_seconds(),
            total: images.len(),
            progress: progress.as_ref(),
        };
        ctx.emit(BatchEvent::Started {
            total: images.len(),
            schedule,
        });

        let mut claimed = HashSet::new();
        let reports: Vec<ImageReport> = match schedule {
            Schedule::Sequential => images
                .iter()
                .enumerate()
                .map(|(i, image)| {
                    let staged = self.stage_timed(task, image, i, &ctx);
                    self.finish_one(image, i, staged, &mut claimed, &ctx)
                })
                .collect(),
            Schedule::Parallel { group_size } => {
                let group_size = group_size.max(1);
                let mut reports = Vec::with_capacity(images.len());
                for (g, group) in images.chunks(group_size).enumerate() {
                    let base = g * group_size;
                    let staged: Vec<_> = group
                        .par_iter()
                        .enumerate()
                        .map(|(j, image)| self.stage_timed(task, image, base + j, &ctx))
                        .collect();
                    for (j, (image, staged)) in group.iter().zip(staged).enumerate() {
                        reports.push(self.finish_one(image, base + j, staged, &mut claimed, &ctx));
                    }
                }
                reports
            }
        };

        if !self.options.keep_work_files {
            let work = output_dir.join(WORK_DIR);
            if work.exists() {
                std::fs::remove_dir_all(&work).ok();
            }
        }

        let succeeded = reports.iter().filter(|r| r.success).count();
        let summary = BatchSummary {
            total: reports.len(),
            succeeded,
            failed: reports.len() - succeeded,
            outputs: reports.iter().map(ImageReport::output_count).sum(),
            warnings: validation.warning_messages(),
            duration_ms: elapsed_ms(started),
        };
        log::info!(
            "batch finished: {} succeeded, {} failed",
            summary.succeeded,
            summary.failed
        );
        ctx.emit(BatchEvent::Finished {
            summary: summary.clone(),
        });

        Ok(BatchReport {
            task_id: task.id().to_string(),
            task_name: task.name().to_string(),
            schedule,
            images: reports,
            summary,
        })
    }

    fn stage_timed(
        &self,
        task: &Task,
        image: &SourceImage,
        index: usize,
        ctx: &RunContext<'_>,
    ) -> (Instant, Result<Staged, PipelineError>) {
        let started = Instant::now();
        (started, self.stage(task, image, index, ctx))
    }

    /// Publish a staged image and turn the outcome into its report.
    fn finish_one(
        &self,
        image: &SourceImage,
        index: usize,
        (started, staged): (Instant, Result<Staged, PipelineError>),
        claimed: &mut HashSet<PathBuf>,
        ctx: &RunContext<'_>,
    ) -> ImageReport {
        let result = staged.and_then(|staged| self.publish(staged, claimed, ctx));
        match result {
            Ok(out) => {
                let mut outputs: Vec<PathBuf> = out.output.iter().cloned().collect();
                outputs.extend(out.extra_outputs.iter().cloned());
                ctx.emit(BatchEvent::ImageCompleted {
                    index,
                    total: ctx.total,
                    source: image.path.clone(),
                    outputs,
                    warnings: out.warnings.len(),
                });
                ImageReport::completed(index, out, elapsed_ms(started))
            }
            Err(e) => {
                log::warn!("{}: {}", image.path.display(), e);
                ctx.emit(BatchEvent::ImageFailed {
                    index,
                    total: ctx.total,
                    source: image.path.clone(),
                    error: e.to_string(),
                });
                ImageReport::failed(index, image.path.clone(), e.to_string(), elapsed_ms(started))
            }
        }
    }

    fn normalize(&self, image: &SourceImage, index: usize) -> Result<ImageHandle, PipelineError> {
        let dimensions = match image.dimensions {
            Some(d) => d,
            None => self
                .backend
                .identify(&image.path)
                .map_err(|e| PipelineError::Probe {
                    path: image.path.clone(),
                    message: e.to_string(),
                })?,
        };
        Ok(ImageHandle {
            index,
            path: image.path.clone(),
            stem: file_stem(&image.path),
            dimensions,
        })
    }

    fn set_state(handle: &ImageHandle, state: ImageState) {
        log::debug!("{} → {:?}", handle.path.display(), state);
    }

    /// Normalize, validate and execute one image into its work dir.
    fn stage(
        &self,
        task: &Task,
        image: &SourceImage,
        index: usize,
        ctx: &RunContext<'_>,
    ) -> Result<Staged, PipelineError> {
        let handle = self.normalize(image, index)?;
        Self::set_state(&handle, ImageState::Pending);

        Self::set_state(&handle, ImageState::Validating);
        let validation = task.validate(Some(handle.dimensions));
        if !validation.is_valid() {
            Self::set_state(&handle, ImageState::Failed);
            return Err(PipelineError::Validation(validation.error_message()));
        }

        let work_dir = ctx
            .output_dir
            .join(WORK_DIR)
            .join(format!("{:04}-{}", index, handle.stem));
        std::fs::create_dir_all(&work_dir)?;

        match self.execute(task, &handle, &work_dir, ctx) {
            Ok(mut staged) => {
                staged.warnings = validation.warning_messages();
                Ok(staged)
            }
            Err(e) => {
                self.clean_work_dir(&work_dir);
                Self::set_state(&handle, ImageState::Failed);
                Err(e)
            }
        }
    }

    /// Copy a staged image's artifacts to the output directory under a name
    /// no earlier image of the batch has claimed.
    fn publish(
        &self,
        mut staged: Staged,
        claimed: &mut HashSet<PathBuf>,
        ctx: &RunContext<'_>,
    ) -> Result<ImageOutput, PipelineError> {
        let position = staged.handle.index + 1;
        let mut name = staged.name.clone();
        let mut attempt = 1;
        let destinations = loop {
            let paths = staged.destinations(ctx.output_dir, &name);
            if !paths.iter().any(|p| claimed.contains(p)) {
                break paths;
            }
            name = if attempt == 1 {
                format!("{}-{}", staged.name, position)
            } else {
                format!("{}-{}-{}", staged.name, position, attempt)
            };
            attempt += 1;
        };
        if name != staged.name {
            log::warn!(
                "{}: output name {:?} already used in this batch, writing {:?}",
                staged.handle.path.display(),
                staged.name,
                name
            );
            staged.warnings.push(format!(
                "output name \"{}\" was already used in this batch; written as \"{}\"",
                staged.name, name
            ));
        }

        let sources = staged
            .main
            .iter()
            .map(|a| &a.path)
            .chain(staged.favicons.iter().map(|(_, _, path)| path));
        let copied: Result<(), std::io::Error> = sources
            .zip(&destinations)
            .try_for_each(|(from, to)| std::fs::copy(from, to).map(|_| ()));
        self.clean_work_dir(&staged.work_dir);
        if let Err(e) = copied {
            Self::set_state(&staged.handle, ImageState::Failed);
            return Err(e.into());
        }
        claimed.extend(destinations.iter().cloned());

        let mut destinations = destinations.into_iter();
        let output = staged.main.as_ref().and_then(|_| destinations.next());
        Self::set_state(&staged.handle, ImageState::Completed);
        Ok(ImageOutput {
            source: staged.handle.path,
            output,
            extra_outputs: destinations.collect(),
            dimensions: staged.dimensions,
            history: staged.history,
            warnings: staged.warnings,
        })
    }

    fn clean_work_dir(&self, work_dir: &Path) {
        if !self.options.keep_work_files {
            std::fs::remove_dir_all(work_dir).ok();
        }
    }

    fn execute(
        &self,
        task: &Task,
        handle: &ImageHandle,
        work_dir: &Path,
        ctx: &RunContext<'_>,
    ) -> Result<Staged, PipelineError> {
        let source_ext = handle
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let mut current = Artifact {
            path: handle.path.clone(),
            format: OutputFormat::from_extension(&source_ext).unwrap_or(OutputFormat::Png),
            ext: source_ext,
            dims: handle.dimensions,
        };
        let mut name = handle.stem.clone();
        let mut main_chain = false;
        let mut favicons: Vec<(u32, OutputFormat, PathBuf)> = Vec::new();
        let mut history = Vec::new();

        for (i, step) in execution_plan(task.steps()).into_iter().enumerate() {
            let sequence = i + 1;
            Self::set_state(handle, ImageState::Executing { step: step.order() });
            let before = current.dims;
            let mut record = OperationRecord {
                sequence,
                step_id: step.id().clone(),
                order: step.order(),
                processor: step.processor(),
                before,
                after: before,
                name: name.clone(),
                artifacts: Vec::new(),
                crop: None,
                detection: None,
            };

            match step.options() {
                StepOptions::Resize(o) => {
                    main_chain = true;
                    let (w, h) = compute_resize_target(before.as_tuple(), &o.request())
                        .map_err(|e| PipelineError::step(step, e))?;
                    let output = work_dir.join(format!(
                        "{:02}-resize.{}",
                        sequence,
                        current.format.extension()
                    ));
                    let full = Rect::full(before.width, before.height);
                    self.render(step, &current, full, (w, h), &output)?;
                    current = self.advance(current, output, (w, h));
                    record.artifacts.push(current.path.clone());
                }
                StepOptions::Crop(_) | StepOptions::Template(_) => {
                    main_chain = true;
                    let Some(spec) = step.options().crop_spec() else {
                        continue;
                    };
                    let output = work_dir.join(format!(
                        "{:02}-{}.{}",
                        sequence,
                        step.processor(),
                        current.format.extension()
                    ));
                    let (rect, detection) = self.place_crop(step, &current, &spec)?;
                    let target = (spec.width, spec.height);
                    self.render(step, &current, rect, target, &output)?;
                    current = self.advance(current, output, target);
                    record.artifacts.push(current.path.clone());
                    record.crop = Some(rect);
                    record.detection = detection;
                }
                StepOptions::Optimize(o) => {
                    main_chain = true;
                    let output =
                        work_dir.join(format!("{:02}-optimize.{}", sequence, o.format.extension()));
                    let quality = if o.compression == Compression::Lossless {
                        Quality::new(100)
                    } else {
                        Quality::new(o.quality)
                    };
                    self.backend
                        .encode(&EncodeParams {
                            source: current.path.clone(),
                            output: output.clone(),
                            format: o.format,
                            quality,
                            flatten: !(o.preserve_transparency && o.format.supports_alpha()),
                        })
                        .map_err(|e| PipelineError::step(step, e))?;
                    current.format = o.format;
                    current = self.advance(current, output, before.as_tuple());
                    record.artifacts.push(current.path.clone());
                }
                StepOptions::Rename(o) => {
                    main_chain = true;
                    let pattern = o.parsed().map_err(|e| PipelineError::step(step, e))?;
                    name = pattern.expand(&NameContext {
                        name: &handle.stem,
                        index: o.start_index + handle.index as u64,
                        zero_pad: o.zero_pad,
                        timestamp: ctx.timestamp,
                        width: before.width,
                        height: before.height,
                        ext: &current.ext,
                    });
                    record.name = name.clone();
                }
                StepOptions::Favicon(o) => {
                    let side = before.width.min(before.height);
                    let rect = Rect {
                        x: (before.width - side) / 2,
                        y: (before.height - side) / 2,
                        width: side,
                        height: side,
                    };
                    for (size, format) in o.renditions() {
                        let format = format.output_format();
                        let output = work_dir.join(format!(
                            "{:02}-favicon-{}.{}",
                            sequence,
                            size,
                            format.extension()
                        ));
                        self.backend
                            .render(&RenderParams {
                                source: current.path.clone(),
                                output: output.clone(),
                                source_rect: rect,
                                width: size,
                                height: size,
                                format,
                                quality: self.options.quality,
                            })
                            .map_err(|e| PipelineError::step(step, e))?;
                        record.artifacts.push(output.clone());
                        favicons.push((size, format, output));
                    }
                    record.crop = Some(rect);
                }
            }

            record.after = current.dims;
            log::debug!(
                "{}: step {} ({}) {}x{} → {}x{}",
                handle.path.display(),
                step.order(),
                step.processor(),
                before.width,
                before.height,
                record.after.width,
                record.after.height
            );
            ctx.emit(BatchEvent::StepCompleted {
                index: handle.index,
                source: handle.path.clone(),
                record: record.clone(),
            });
            history.push(record);
        }

        Ok(Staged {
            handle: handle.clone(),
            work_dir: work_dir.to_path_buf(),
            name,
            dimensions: current.dims,
            main: main_chain.then_some(current),
            favicons,
            history,
            warnings: Vec::new(),
        })
    }

    fn advance(&self, current: Artifact, output: PathBuf, dims: (u32, u32)) -> Artifact {
        Artifact {
            path: output,
            ext: current.format.extension().to_string(),
            format: current.format,
            dims: dims.into(),
        }
    }

    fn render(
        &self,
        step: &StepSpec,
        current: &Artifact,
        rect: Rect,
        size: (u32, u32),
        output: &Path,
    ) -> Result<(), PipelineError> {
        self.backend
            .render(&RenderParams {
                source: current.path.clone(),
                output: output.to_path_buf(),
                source_rect: rect,
                width: size.0,
                height: size.1,
                format: current.format,
                quality: self.options.quality,
            })
            .map_err(|e: BackendError| PipelineError::step(step, e))
    }

    /// Choose the source rectangle for a crop-like step.
    ///
    /// The image is notionally scaled to cover the target, the crop is
    /// placed in scaled coordinates, and the placement is mapped back onto
    /// the unscaled artifact so the backend does one resample.
    fn place_crop(
        &self,
        step: &StepSpec,
        current: &Artifact,
        spec: &CropSpec,
    ) -> Result<(Rect, Option<DetectionResult>), PipelineError> {
        let dims = current.dims.as_tuple();
        let target = (spec.width, spec.height);
        check_crop_fits(dims, target, spec.upscale)
            .map_err(|e: DimensionError| PipelineError::step(step, e))?;

        let prescale = compute_prescale_for_crop(dims, target);
        let focus = self.detector.locate(
            &current.path,
            spec.mode,
            spec.confidence_threshold,
            &spec.objects,
        );
        if let Some(d) = focus.detection.as_ref().filter(|d| d.is_fallback()) {
            log::warn!(
                "{}: {:?} crop fell back to center ({:?})",
                current.path.display(),
                spec.mode,
                d.fallback
            );
        }
        let placement = solve_crop(
            focus.point,
            (prescale.width, prescale.height),
            target,
            focus.snaps(),
        );
        Ok((
            unscale_rect(placement, prescale.scale, dims),
            focus.detection,
        ))
    }
}

/// Map a rectangle in scaled coordinates back to the unscaled image,
/// clamped inside `bounds`.
fn unscale_rect(rect: Rect, scale: f64, bounds: (u32, u32)) -> Rect {
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let unscale = |v: u32| (v as f64 / scale).round() as u32;
    let width = unscale(rect.width).clamp(1, bounds.0.max(1));
    let height = unscale(rect.height).clamp(1, bounds.1.max(1));
    Rect {
        x: unscale(rect.x).min(bounds.0.saturating_sub(width)),
        y: unscale(rect.y).min(bounds.1.saturating_sub(height)),
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::tests::MockAnalyzer;
    use crate::detect::{Candidate, Capabilities, Capability, DetectionSource, NullAnalyzer};
    use crate::imaging::backend::tests::{MockBackend, RecordedOp};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn task_with(steps: &[(&str, serde_json::Value)]) -> Task {
        let mut task = Task::new("test");
        for (processor, options) in steps {
            task.add_step(processor, options.clone()).unwrap();
        }
        task
    }

    /// Create empty source files so the final copy has something to copy.
    fn sources(dir: &Path, names: &[&str]) -> Vec<SourceImage> {
        names
            .iter()
            .map(|n| {
                let path = dir.join(n);
                std::fs::write(&path, b"src").unwrap();
                SourceImage::new(path)
            })
            .collect()
    }

    fn processors(history: &[OperationRecord]) -> Vec<ProcessorKind> {
        history.iter().map(|r| r.processor).collect()
    }

    fn renders(backend: &MockBackend) -> Vec<RecordedOp> {
        backend
            .get_operations()
            .into_iter()
            .filter(|op| matches!(op, RecordedOp::Render { .. }))
            .collect()
    }

    // =========================================================================
    // Execution plan
    // =========================================================================

    #[test]
    fn plan_follows_canonical_order() {
        let task = task_with(&[
            ("template", json!({ "templateId": "og", "width": 100, "height": 100 })),
            ("rename", json!({})),
            ("favicon", json!({})),
            ("optimize", json!({})),
            ("crop", json!({})),
            ("resize", json!({})),
        ]);
        let plan: Vec<ProcessorKind> = execution_plan(task.steps())
            .iter()
            .map(|s| s.processor())
            .collect();
        assert_eq!(
            plan,
            vec![
                ProcessorKind::Resize,
                ProcessorKind::Crop,
                ProcessorKind::Optimize,
                ProcessorKind::Rename,
                ProcessorKind::Template,
                ProcessorKind::Favicon,
            ]
        );
    }

    #[test]
    fn plan_keeps_authored_order_within_kind_and_skips_disabled() {
        let mut task = task_with(&[
            ("optimize", json!({ "format": "png" })),
            ("resize", json!({})),
            ("optimize", json!({ "format": "webp" })),
            ("crop", json!({})),
        ]);
        task.set_step_enabled(3, false);
        let plan = execution_plan(task.steps());
        let orders: Vec<usize> = plan.iter().map(|s| s.order()).collect();
        assert_eq!(orders, vec![2, 1, 3]);
    }

    // =========================================================================
    // Single image
    // =========================================================================

    #[test]
    fn history_runs_in_canonical_order_regardless_of_authoring() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["photo.jpg"]);
        let backend = MockBackend::with_dimensions(&[("photo.jpg", 4000, 3000)]);
        let task = task_with(&[
            ("rename", json!({ "pattern": "out-{index}" })),
            ("optimize", json!({ "format": "webp" })),
            ("crop", json!({ "width": 600, "height": 600, "mode": "center" })),
            ("resize", json!({ "dimension": 1200 })),
        ]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let out = orch
            .process(&task, &images[0], &tmp.path().join("out"))
            .unwrap();

        assert_eq!(
            processors(&out.history),
            vec![
                ProcessorKind::Resize,
                ProcessorKind::Crop,
                ProcessorKind::Optimize,
                ProcessorKind::Rename
            ]
        );
        let sequences: Vec<usize> = out.history.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(out.history[0].after, Dimensions::new(1200, 900));
        assert_eq!(out.history[1].after, Dimensions::new(600, 600));
        assert_eq!(out.dimensions, Dimensions::new(600, 600));

        let output = out.output.unwrap();
        assert_eq!(output.file_name().unwrap(), "out-1.webp");
        assert!(output.exists());
    }

    #[test]
    fn crop_rect_is_mapped_back_to_source_pixels() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["wide.png"]);
        let backend = MockBackend::with_dimensions(&[("wide.png", 2000, 1000)]);
        let task = task_with(&[("crop", json!({ "width": 500, "height": 500, "mode": "center" }))]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let out = orch
            .process(&task, &images[0], &tmp.path().join("out"))
            .unwrap();

        // cover scale 0.5 → 1000x500, centered at x=250 → source x=500
        let expected = Rect {
            x: 500,
            y: 0,
            width: 1000,
            height: 1000,
        };
        assert_eq!(out.history[0].crop, Some(expected));
        assert!(matches!(
            &renders(&backend)[0],
            RecordedOp::Render { rect, width: 500, height: 500, format: OutputFormat::Png, .. }
                if *rect == expected
        ));
        assert!(out.history[0].detection.is_none());
    }

    #[test]
    fn smart_crop_snaps_genuine_detection() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["wide.jpg"]);
        let backend = MockBackend::with_dimensions(&[("wide.jpg", 2000, 1000)]);
        let analyzer = MockAnalyzer::new(Capabilities::all())
            .with(Capability::Face, vec![Candidate::at(0.3, 0.3, 0.9)]);
        let task = task_with(&[("crop", json!({ "width": 500, "height": 500 }))]);

        let orch = Orchestrator::new(&backend, &analyzer, RunOptions::default());
        let out = orch
            .process(&task, &images[0], &tmp.path().join("out"))
            .unwrap();

        // scaled 1000x500, focus (300, 150) snaps to (333.3, 166.7)
        // → x = 83, y = 0 → source (166, 0, 1000, 1000)
        let record = &out.history[0];
        assert_eq!(
            record.crop,
            Some(Rect {
                x: 166,
                y: 0,
                width: 1000,
                height: 1000
            })
        );
        let detection = record.detection.as_ref().unwrap();
        assert_eq!(detection.sources, BTreeSet::from([DetectionSource::Face]));
    }

    #[test]
    fn failing_analyzer_still_crops_at_center() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["sq.jpg"]);
        let backend = MockBackend::with_dimensions(&[("sq.jpg", 1000, 1000)]);
        let analyzer = MockAnalyzer::failing_probe("no gpu");
        let task = task_with(&[("crop", json!({ "width": 400, "height": 200 }))]);

        let orch = Orchestrator::new(&backend, &analyzer, RunOptions::default());
        let out = orch
            .process(&task, &images[0], &tmp.path().join("out"))
            .unwrap();

        let record = &out.history[0];
        // scale 0.4 → 400x400, centered y = 100 → source y = 250
        assert_eq!(
            record.crop,
            Some(Rect {
                x: 0,
                y: 250,
                width: 1000,
                height: 500
            })
        );
        let detection = record.detection.as_ref().unwrap();
        assert!(detection.sources.contains(&DetectionSource::ErrorFallback));
        assert_eq!(detection.confidence, 0.5);
    }

    #[test]
    fn resize_then_crop_upscale_is_rejected_before_execution() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["pano.jpg"]);
        let backend = MockBackend::with_dimensions(&[("pano.jpg", 4000, 2000)]);
        let task = task_with(&[
            ("resize", json!({ "dimension": 1000, "mode": "longest" })),
            ("crop", json!({ "width": 800, "height": 800, "mode": "center" })),
        ]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let out_dir = tmp.path().join("out");
        let err = orch.process(&task, &images[0], &out_dir).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Step 2 (crop)"), "{message}");
        assert!(message.contains("height would grow from 1000x500"), "{message}");
        assert!(renders(&backend).is_empty());
    }

    #[test]
    fn optimize_encodes_with_normalized_options() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["a.png"]);
        let backend = MockBackend::with_dimensions(&[("a.png", 640, 480)]);
        let task = task_with(&[("optimize", json!({ "format": "avif", "quality": 90 }))]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let out = orch
            .process(&task, &images[0], &tmp.path().join("out"))
            .unwrap();

        let ops = backend.get_operations();
        assert!(ops.iter().any(|op| matches!(
            op,
            RecordedOp::Encode { format: OutputFormat::Avif, quality: 63, flatten: true, .. }
        )));
        assert_eq!(out.output.unwrap().file_name().unwrap(), "a.avif");
        assert_eq!(out.dimensions, Dimensions::new(640, 480));
    }

    #[test]
    fn rename_only_copies_source_under_new_name() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["scan.tiff"]);
        let backend = MockBackend::new();
        let task = task_with(&[(
            "rename",
            json!({ "pattern": "archive-{index}-{width}", "startIndex": 7, "zeroPad": 3 }),
        )]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let image = images[0].clone().with_dimensions(300, 200);
        let out = orch.process(&task, &image, &tmp.path().join("out")).unwrap();

        let output = out.output.unwrap();
        assert_eq!(output.file_name().unwrap(), "archive-007-300.tiff");
        assert_eq!(std::fs::read(&output).unwrap(), b"src");
        assert!(backend.get_operations().is_empty());
    }

    #[test]
    fn favicon_renders_every_rendition() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["logo.png"]);
        let backend = MockBackend::with_dimensions(&[("logo.png", 600, 400)]);
        let task = task_with(&[(
            "favicon",
            json!({ "sizes": [16, 32, 512], "formats": ["png", "ico"] }),
        )]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let out = orch
            .process(&task, &images[0], &tmp.path().join("out"))
            .unwrap();

        assert!(out.output.is_none());
        let names: Vec<String> = out
            .extra_outputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "logo-favicon-16.png",
                "logo-favicon-16.ico",
                "logo-favicon-32.png",
                "logo-favicon-32.ico",
                "logo-favicon-512.png",
            ]
        );
        assert!(out.extra_outputs.iter().all(|p| p.exists()));
        assert!(renders(&backend).iter().all(|op| matches!(
            op,
            RecordedOp::Render { rect: Rect { x: 100, y: 0, width: 400, height: 400 }, .. }
        )));
        assert!(out.warnings.iter().any(|w| w.contains("not square")));
    }

    #[test]
    fn dimensions_are_probed_when_missing() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["known.jpg", "unknown.jpg"]);
        let backend = MockBackend::with_dimensions(&[("known.jpg", 800, 600)]);
        let task = task_with(&[("optimize", json!({}))]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let out_dir = tmp.path().join("out");
        assert!(orch.process(&task, &images[0], &out_dir).is_ok());
        assert!(matches!(
            backend.get_operations()[0],
            RecordedOp::Identify(_)
        ));

        let err = orch.process(&task, &images[1], &out_dir).unwrap_err();
        assert!(matches!(err, PipelineError::Probe { .. }));
    }

    #[test]
    fn work_files_are_removed_unless_kept() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["a.jpg"]);
        let backend = MockBackend::with_dimensions(&[("a.jpg", 800, 600)]);
        let task = task_with(&[("resize", json!({ "dimension": 400 }))]);
        let out_dir = tmp.path().join("out");

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        orch.process(&task, &images[0], &out_dir).unwrap();
        assert!(!out_dir.join(WORK_DIR).join("0000-a").exists());

        let keep = RunOptions {
            keep_work_files: true,
            ..RunOptions::default()
        };
        let orch = Orchestrator::new(&backend, &NullAnalyzer, keep);
        orch.process(&task, &images[0], &out_dir).unwrap();
        assert!(out_dir.join(WORK_DIR).join("0000-a/01-resize.jpg").exists());
    }

    // =========================================================================
    // Batches
    // =========================================================================

    #[test]
    fn batch_isolates_failures() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["good.jpg", "broken.jpg", "fine.jpg"]);
        let backend = MockBackend::with_dimensions(&[
            ("good.jpg", 1600, 1200),
            ("broken.jpg", 1600, 1200),
            ("fine.jpg", 1200, 1600),
        ])
        .fail_on("broken");
        let task = task_with(&[("resize", json!({ "dimension": 800 }))]);
        let out_dir = tmp.path().join("out");

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let report = orch.run(&task, &images, &out_dir, None).unwrap();

        assert_eq!(report.images.len(), 3);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);

        let failed = &report.images[1];
        assert!(!failed.success);
        assert_eq!(failed.state, ImageState::Failed);
        assert!(
            failed
                .error
                .as_deref()
                .unwrap()
                .starts_with("Step 1 (resize) failed:")
        );
        assert!(!out_dir.join("broken.jpg").exists());
        assert!(out_dir.join("good.jpg").exists());
        assert_eq!(report.images[2].dimensions, Some(Dimensions::new(600, 800)));
        assert!(!out_dir.join(WORK_DIR).exists());
    }

    fn files_in(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn timestamp_rename_writes_one_file_per_image() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["a.jpg", "b.jpg", "c.jpg"]);
        let backend = MockBackend::with_dimensions(&[
            ("a.jpg", 800, 600),
            ("b.jpg", 800, 600),
            ("c.jpg", 800, 600),
        ]);
        let task = task_with(&[("rename", json!({ "pattern": "photo-{timestamp}" }))]);
        let out_dir = tmp.path().join("out");

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let report = orch.run(&task, &images, &out_dir, None).unwrap();

        assert_eq!(report.summary.succeeded, 3);
        let outputs: BTreeSet<PathBuf> = report
            .images
            .iter()
            .map(|r| r.output.clone().unwrap())
            .collect();
        assert_eq!(outputs.len(), 3);
        assert_eq!(
            files_in(&out_dir),
            BTreeSet::from(["a-1.jpg".to_string(), "b-2.jpg".into(), "c-3.jpg".into()])
        );
    }

    #[test]
    fn same_stem_sources_get_distinct_outputs() {
        for schedule in [Schedule::Sequential, Schedule::Parallel { group_size: 3 }] {
            let tmp = TempDir::new().unwrap();
            let images: Vec<SourceImage> = ["x", "y", "z"]
                .iter()
                .map(|dir| {
                    let dir = tmp.path().join(dir);
                    std::fs::create_dir_all(&dir).unwrap();
                    sources(&dir, &["photo.jpg"]).remove(0)
                })
                .collect();
            let backend = MockBackend::with_dimensions(&[("photo.jpg", 1000, 800)]);
            let task = task_with(&[("resize", json!({ "dimension": 500 }))]);
            let out_dir = tmp.path().join("out");

            let options = RunOptions {
                schedule,
                ..RunOptions::default()
            };
            let orch = Orchestrator::new(&backend, &NullAnalyzer, options);
            let report = orch.run(&task, &images, &out_dir, None).unwrap();

            assert_eq!(report.summary.succeeded, 3, "{schedule}");
            let names: Vec<String> = report
                .images
                .iter()
                .map(|r| file_name_of(r.output.as_ref().unwrap()))
                .collect();
            assert_eq!(names, vec!["photo.jpg", "photo-2.jpg", "photo-3.jpg"], "{schedule}");
            assert_eq!(files_in(&out_dir).len(), 3, "{schedule}");
            let renamed = |i: usize| {
                report.images[i]
                    .warnings
                    .iter()
                    .any(|w| w.contains("already used"))
            };
            assert!(!renamed(0));
            assert!(renamed(1) && renamed(2));
            assert!(report.images[1].warnings.iter().any(|w| w.contains("\"photo-2\"")));
        }
    }

    #[test]
    fn favicon_names_are_claimed_too() {
        let tmp = TempDir::new().unwrap();
        let images: Vec<SourceImage> = ["x", "y"]
            .iter()
            .map(|dir| {
                let dir = tmp.path().join(dir);
                std::fs::create_dir_all(&dir).unwrap();
                sources(&dir, &["logo.png"]).remove(0)
            })
            .collect();
        let backend = MockBackend::with_dimensions(&[("logo.png", 64, 64)]);
        let task = task_with(&[("favicon", json!({ "sizes": [16], "formats": ["png"] }))]);
        let out_dir = tmp.path().join("out");

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let report = orch.run(&task, &images, &out_dir, None).unwrap();

        assert_eq!(
            files_in(&out_dir),
            BTreeSet::from([
                "logo-favicon-16.png".to_string(),
                "logo-2-favicon-16.png".into(),
            ])
        );
        assert_eq!(report.summary.outputs, 2);
    }

    fn file_name_of(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn invalid_task_fails_the_batch() {
        let tmp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let result = orch.run(&Task::new("empty"), &[], tmp.path(), None);
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn parallel_groups_preserve_input_order() {
        let tmp = TempDir::new().unwrap();
        let names: Vec<String> = (0..7).map(|i| format!("img{i}.jpg")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let images = sources(tmp.path(), &name_refs);
        let dims: Vec<(&str, u32, u32)> = name_refs.iter().map(|n| (*n, 1000, 800)).collect();
        let backend = MockBackend::with_dimensions(&dims);
        let task = task_with(&[
            ("resize", json!({ "dimension": 500 })),
            ("rename", json!({ "pattern": "{index}-{name}" })),
        ]);

        let options = RunOptions {
            schedule: Schedule::Parallel { group_size: 3 },
            ..RunOptions::default()
        };
        let orch = Orchestrator::new(&backend, &NullAnalyzer, options);
        let report = orch
            .run(&task, &images, &tmp.path().join("out"), None)
            .unwrap();

        assert_eq!(report.summary.succeeded, 7);
        for (i, image) in report.images.iter().enumerate() {
            assert_eq!(image.index, i);
            assert_eq!(image.source, images[i].path);
            let expected = format!("{}-img{}.jpg", i + 1, i);
            assert_eq!(
                image.output.as_ref().unwrap().file_name().unwrap(),
                expected.as_str()
            );
        }
    }

    #[test]
    fn events_are_reported_in_order() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["a.jpg", "b.jpg"]);
        let backend =
            MockBackend::with_dimensions(&[("a.jpg", 800, 600), ("b.jpg", 800, 600)])
                .fail_on("b.jpg");
        let task = task_with(&[("resize", json!({ "dimension": 400 }))]);

        let (tx, rx) = std::sync::mpsc::channel();
        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        orch.run(&task, &images, &tmp.path().join("out"), Some(tx))
            .unwrap();
        let events: Vec<BatchEvent> = rx.into_iter().collect();

        assert!(matches!(events[0], BatchEvent::Started { total: 2, .. }));
        assert!(matches!(events[1], BatchEvent::StepCompleted { index: 0, .. }));
        assert!(matches!(events[2], BatchEvent::ImageCompleted { index: 0, .. }));
        assert!(matches!(events[3], BatchEvent::ImageFailed { index: 1, .. }));
        assert!(matches!(
            &events[4],
            BatchEvent::Finished { summary } if summary.failed == 1
        ));
    }

    #[test]
    fn batch_summary_carries_task_warnings() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["a.jpg"]);
        let backend = MockBackend::with_dimensions(&[("a.jpg", 800, 800)]);
        let task = task_with(&[("crop", json!({ "width": 100, "height": 100, "mode": "top" }))]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let report = orch
            .run(&task, &images, &tmp.path().join("out"), None)
            .unwrap();

        assert!(report.summary.warnings.iter().any(|w| w.contains("crop without a resize")));
        assert_eq!(report.images[0].warnings, report.summary.warnings);
        assert_eq!(report.summary.outputs, 1);
    }

    #[test]
    fn report_serializes_camel_case() {
        let tmp = TempDir::new().unwrap();
        let images = sources(tmp.path(), &["a.jpg"]);
        let backend = MockBackend::with_dimensions(&[("a.jpg", 800, 600)]);
        let task = task_with(&[("resize", json!({ "dimension": 400 }))]);

        let orch = Orchestrator::new(&backend, &NullAnalyzer, RunOptions::default());
        let report = orch
            .run(&task, &images, &tmp.path().join("out"), None)
            .unwrap();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["summary"]["succeeded"], 1);
        assert_eq!(value["images"][0]["history"][0]["stepId"], task.steps()[0].id().as_str());
        assert_eq!(value["images"][0]["state"]["state"], "completed");
        assert_eq!(value["schedule"]["kind"], "sequential");
    }

    #[test]
    fn unscale_rect_stays_in_bounds() {
        let r = unscale_rect(
            Rect {
                x: 999,
                y: 0,
                width: 3,
                height: 3,
            },
            0.3,
            (3333, 10),
        );
        assert!(r.x + r.width <= 3333);
        assert!(r.height <= 10);
    }
}
