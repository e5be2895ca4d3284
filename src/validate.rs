//! Task validation.
//!
//! Errors block execution; warnings are advisory and travel with every
//! report. Three layers of checks:
//!
//! - per-step option checks
//! - cross-step advice about how authoring order relates to execution order
//! - with image dimensions, a dry run of the execution plan that surfaces
//!   upscale violations before any pixels are touched

use crate::detect::CropMode;
use crate::imaging::rust_backend::ICO_MAX_EDGE;
use crate::imaging::{Dimensions, OutputFormat, check_crop_fits, compute_resize_target};
use crate::orchestrator::execution_plan;
use crate::step::{
    BrowserSupport, FAVICON_MAX_SIZE, FAVICON_MIN_SIZE, FaviconFormat, ProcessorKind, StepOptions,
    StepSpec,
};
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// 1-based order of the step the issue is about; `None` for the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<ProcessorKind>,
    pub message: String,
}

impl ValidationIssue {
    fn task(message: impl Into<String>) -> Self {
        Self {
            step: None,
            processor: None,
            message: message.into(),
        }
    }

    fn step(step: &StepSpec, message: impl Into<String>) -> Self {
        Self {
            step: Some(step.order()),
            processor: Some(step.processor()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.step, self.processor) {
            (Some(order), Some(processor)) => {
                write!(f, "Step {} ({}): {}", order, processor, self.message)
            }
            _ => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All error messages joined with `"; "`.
    pub fn error_message(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }
}

pub fn validate_task(task: &Task, image: Option<Dimensions>) -> ValidationReport {
    let mut report = ValidationReport::default();
    let enabled: Vec<&StepSpec> = task.steps().iter().filter(|s| s.enabled()).collect();

    if enabled.is_empty() {
        report
            .errors
            .push(ValidationIssue::task("Task has no enabled steps"));
    }
    for step in &enabled {
        check_step(step, &mut report);
    }
    check_sequence(&enabled, &mut report);
    if let Some(dims) = image {
        simulate(task.steps(), dims, &mut report);
    }
    report
}

fn check_crop_target(step: &StepSpec, width: u32, height: u32, report: &mut ValidationReport) {
    if width == 0 || height == 0 {
        report.errors.push(ValidationIssue::step(
            step,
            format!("crop size must be positive, got {}x{}", width, height),
        ));
    }
}

fn check_step(step: &StepSpec, report: &mut ValidationReport) {
    match step.options() {
        StepOptions::Resize(o) => {
            if o.dimension == 0 {
                report.errors.push(ValidationIssue::step(
                    step,
                    "dimension must be positive",
                ));
            }
            if o.max_dimension == 0 {
                report.errors.push(ValidationIssue::step(
                    step,
                    "maxDimension must be positive",
                ));
            }
        }
        StepOptions::Crop(o) => {
            check_crop_target(step, o.width, o.height, report);
            if o.mode == CropMode::Object && o.objects_to_detect.is_empty() {
                report.warnings.push(ValidationIssue::step(
                    step,
                    "object mode with no objectsToDetect will fall back to the center",
                ));
            }
        }
        StepOptions::Template(o) => {
            if o.template_id.is_empty() {
                report
                    .errors
                    .push(ValidationIssue::step(step, "templateId must not be empty"));
            }
            check_crop_target(step, o.width, o.height, report);
            if o.mode == CropMode::Object && o.objects_to_detect.is_empty() {
                report.warnings.push(ValidationIssue::step(
                    step,
                    "object mode with no objectsToDetect will fall back to the center",
                ));
            }
        }
        StepOptions::Optimize(o) => {
            if o.format == OutputFormat::Ico {
                report.errors.push(ValidationIssue::step(
                    step,
                    "ico output is only produced by favicon steps",
                ));
            }
            if o.format == OutputFormat::Avif && o.browser_support.contains(&BrowserSupport::Legacy)
            {
                report.warnings.push(ValidationIssue::step(
                    step,
                    "avif is not supported by legacy browsers",
                ));
            }
        }
        StepOptions::Rename(o) => {
            if let Err(e) = o.parsed() {
                report
                    .errors
                    .push(ValidationIssue::step(step, format!("invalid pattern: {}", e)));
            }
        }
        StepOptions::Favicon(o) => {
            if o.sizes.is_empty() {
                report.errors.push(ValidationIssue::step(
                    step,
                    format!(
                        "no favicon sizes within [{}, {}]",
                        FAVICON_MIN_SIZE, FAVICON_MAX_SIZE
                    ),
                ));
            } else if o.renditions().is_empty() {
                report.errors.push(ValidationIssue::step(
                    step,
                    format!(
                        "no favicon renditions: ico holds at most {}px and png is not requested",
                        ICO_MAX_EDGE
                    ),
                ));
            } else if o.formats.contains(&FaviconFormat::Ico) {
                let skipped: Vec<String> = o
                    .sizes
                    .iter()
                    .filter(|&&s| s > ICO_MAX_EDGE)
                    .map(|s| format!("{}px", s))
                    .collect();
                if !skipped.is_empty() {
                    let fate = if o.formats.contains(&FaviconFormat::Png) {
                        "only written as png"
                    } else {
                        "skipped"
                    };
                    report.warnings.push(ValidationIssue::step(
                        step,
                        format!("ico cannot hold {}; those sizes are {}", skipped.join(", "), fate),
                    ));
                }
            }
        }
    }
}

fn check_sequence(enabled: &[&StepSpec], report: &mut ValidationReport) {
    let position = |kind: ProcessorKind| enabled.iter().position(|s| s.processor() == kind);
    let count = |kind: ProcessorKind| enabled.iter().filter(|s| s.processor() == kind).count();

    if let Some(i) = position(ProcessorKind::Crop) {
        if count(ProcessorKind::Resize) == 0 {
            report.warnings.push(ValidationIssue::step(
                enabled[i],
                "crop without a resize step works on the full-resolution source",
            ));
        }
    }

    let optimizes = count(ProcessorKind::Optimize);
    if optimizes > 1 {
        report.warnings.push(ValidationIssue::task(format!(
            "{} optimize steps; each one re-encodes the previous output",
            optimizes
        )));
    }

    if let Some(favicon) = position(ProcessorKind::Favicon) {
        if let Some(step) = enabled[favicon + 1..]
            .iter()
            .find(|s| s.processor() == ProcessorKind::Optimize)
        {
            report.warnings.push(ValidationIssue::step(
                step,
                "optimize is authored after favicon but always runs before it",
            ));
        }
    }

    if let Some(rename) = position(ProcessorKind::Rename) {
        let later = enabled[rename + 1..]
            .iter()
            .any(|s| s.processor() != ProcessorKind::Rename);
        if later {
            report.warnings.push(ValidationIssue::step(
                enabled[rename],
                "rename is applied after the image steps regardless of its position",
            ));
        }
    }
}

/// Thread `image` through the execution plan, recording the first
/// dimension error.
fn simulate(steps: &[StepSpec], image: Dimensions, report: &mut ValidationReport) {
    if image.width == 0 || image.height == 0 {
        report.errors.push(ValidationIssue::task(format!(
            "image has invalid dimensions {}x{}",
            image.width, image.height
        )));
        return;
    }

    let mut current = image.as_tuple();
    for step in execution_plan(steps) {
        match step.options() {
            StepOptions::Resize(o) => match compute_resize_target(current, &o.request()) {
                Ok(next) => current = next,
                Err(e) => {
                    report.errors.push(ValidationIssue::step(step, e.to_string()));
                    return;
                }
            },
            StepOptions::Crop(_) | StepOptions::Template(_) => {
                let Some(spec) = step.options().crop_spec() else {
                    continue;
                };
                let target = (spec.width, spec.height);
                if let Err(e) = check_crop_fits(current, target, spec.upscale) {
                    report.errors.push(ValidationIssue::step(step, e.to_string()));
                    return;
                }
                current = target;
            }
            StepOptions::Favicon(o) => {
                let (w, h) = current;
                if w != h {
                    report.warnings.push(ValidationIssue::step(
                        step,
                        format!("source is {}x{}, not square; favicons are center-cropped", w, h),
                    ));
                }
                if let Some(&largest) = o.sizes.last() {
                    if w.min(h) < largest {
                        report.warnings.push(ValidationIssue::step(
                            step,
                            format!(
                                "source is {}x{}, smaller than the {}px favicon",
                                w, h, largest
                            ),
                        ));
                    }
                }
            }
            StepOptions::Optimize(_) | StepOptions::Rename(_) => {}
        }
    }
}
