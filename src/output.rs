//! CLI output formatting.
//!
//! Every formatter returns `Vec<String>` and does no I/O. The binary prints
//! the lines; tests assert on them.
//!
//! # Output Format
//!
//! ## Task
//!
//! ```text
//! Task: Instagram export (4 steps, Mixed)
//!     1 resize   dimension=1080 mode=Auto
//!     2 crop     1080x1080 Smart
//!     4 rename   {name}-{index}
//!     3 optimize (disabled)
//! ```
//!
//! Steps are listed in the order they execute, disabled ones last.
//!
//! ## Run
//!
//! ```text
//! Processing 3 images (sequential)
//! 001 dawn.jpg: resize 4000x3000 → 1080x810
//! 001 dawn.jpg: crop 1080x810 → 1080x1080 [face 92%]
//! [1/3] dawn.jpg
//!     → out/dawn-1.webp
//! [2/3] night.jpg FAILED
//!     Step 1 (resize) failed: ...
//! Done: 2 succeeded, 1 failed, 2 files in 1.4s
//! ```

use crate::detect::{DetectionResult, DetectionSource};
use crate::orchestrator::{BatchEvent, BatchReport, execution_plan};
use crate::step::{StepOptions, StepSpec};
use crate::task::{Task, TimeEstimate};
use crate::validate::ValidationReport;
use std::path::Path;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Human duration: milliseconds below one second, tenths of seconds up to a
/// minute, minutes and seconds after that.
///
/// ```text
/// 350ms
/// 1.4s
/// 2m 05s
/// ```
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

fn detection_label(d: &DetectionResult) -> String {
    let sources: Vec<&str> = d
        .sources
        .iter()
        .map(|s| match s {
            DetectionSource::Face => "face",
            DetectionSource::Object => "object",
            DetectionSource::Saliency => "saliency",
            DetectionSource::Entropy => "entropy",
            DetectionSource::FallbackCenter => "fallback-center",
            DetectionSource::ErrorFallback => "error-fallback",
        })
        .collect();
    format!("{} {:.0}%", sources.join("+"), d.confidence * 100.0)
}

/// One-line summary of a step's options.
fn step_detail(step: &StepSpec) -> String {
    match step.options() {
        StepOptions::Resize(o) => format!("dimension={} mode={:?}", o.dimension, o.mode),
        StepOptions::Crop(o) => format!("{}x{} {:?}", o.width, o.height, o.mode),
        StepOptions::Template(o) => {
            format!("{} {}x{} {:?}", o.template_id, o.width, o.height, o.mode)
        }
        StepOptions::Optimize(o) => format!("{} q{}", o.format, o.quality),
        StepOptions::Rename(o) => o.pattern.clone(),
        StepOptions::Favicon(o) => format!("{} renditions", o.renditions().len()),
    }
}

// ============================================================================
// Task
// ============================================================================

pub fn format_task(task: &Task) -> Vec<String> {
    let mut lines = vec![format!(
        "Task: {} ({} steps, {:?})",
        task.name(),
        task.len(),
        task.category()
    )];
    if !task.description().is_empty() {
        lines.push(format!("{}{}", indent(1), task.description()));
    }

    let width = task
        .steps()
        .iter()
        .map(|s| s.processor().as_str().len())
        .max()
        .unwrap_or(0);
    for step in execution_plan(task.steps()) {
        lines.push(format!(
            "{}{} {:<width$} {}",
            indent(1),
            step.order(),
            step.processor().as_str(),
            step_detail(step),
            width = width
        ));
    }
    for step in task.steps().iter().filter(|s| !s.enabled()) {
        lines.push(format!(
            "{}{} {} (disabled)",
            indent(1),
            step.order(),
            step.processor()
        ));
    }
    lines
}

pub fn format_estimate(task: &Task, estimate: &TimeEstimate) -> Vec<String> {
    vec![
        format!(
            "{} images x {} outputs each = {} files",
            estimate.image_count,
            task.estimated_outputs(),
            estimate.image_count * task.estimated_outputs()
        ),
        format!(
            "Estimated time: {} per image, {} total",
            format_duration(estimate.per_image_ms),
            format_duration(estimate.total_ms)
        ),
    ]
}

pub fn format_validation(report: &ValidationReport) -> Vec<String> {
    let mut lines = Vec::new();
    for error in &report.errors {
        lines.push(format!("error: {}", error));
    }
    for warning in &report.warnings {
        lines.push(format!("warning: {}", warning));
    }
    lines.push(if report.is_valid() {
        format!("Valid ({} warnings)", report.warnings.len())
    } else {
        format!(
            "Invalid: {} errors, {} warnings",
            report.errors.len(),
            report.warnings.len()
        )
    });
    lines
}

// ============================================================================
// Run
// ============================================================================

pub fn format_batch_event(event: &BatchEvent) -> Vec<String> {
    match event {
        BatchEvent::Started { total, schedule } => {
            vec![format!("Processing {} images ({})", total, schedule)]
        }
        BatchEvent::StepCompleted {
            index,
            source,
            record,
        } => {
            let mut line = format!(
                "{} {}: {} {}x{} → {}x{}",
                format_index(index + 1),
                file_name(source),
                record.processor,
                record.before.width,
                record.before.height,
                record.after.width,
                record.after.height
            );
            if let Some(d) = &record.detection {
                line.push_str(&format!(" [{}]", detection_label(d)));
            }
            vec![line]
        }
        BatchEvent::ImageCompleted {
            index,
            total,
            source,
            outputs,
            warnings,
        } => {
            let mut lines = vec![format!("[{}/{}] {}", index + 1, total, file_name(source))];
            for output in outputs {
                lines.push(format!("{}→ {}", indent(1), output.display()));
            }
            if *warnings > 0 {
                lines.push(format!("{}{} warnings", indent(1), warnings));
            }
            lines
        }
        BatchEvent::ImageFailed {
            index,
            total,
            source,
            error,
        } => vec![
            format!("[{}/{}] {} FAILED", index + 1, total, file_name(source)),
            format!("{}{}", indent(1), error),
        ],
        BatchEvent::Finished { summary } => vec![format!(
            "Done: {} succeeded, {} failed, {} files in {}",
            summary.succeeded,
            summary.failed,
            summary.outputs,
            format_duration(summary.duration_ms)
        )],
    }
}

/// Warnings and failures worth repeating once the event stream is over.
pub fn format_batch_report(report: &BatchReport) -> Vec<String> {
    let mut lines = Vec::new();
    if !report.summary.warnings.is_empty() {
        lines.push("Warnings".to_string());
        for warning in &report.summary.warnings {
            lines.push(format!("{}{}", indent(1), warning));
        }
    }
    let failed: Vec<_> = report.images.iter().filter(|r| !r.success).collect();
    if !failed.is_empty() {
        lines.push("Failed".to_string());
        for image in failed {
            lines.push(format!(
                "{}{} {}",
                indent(1),
                format_index(image.index + 1),
                image.source.display()
            ));
            if let Some(error) = &image.error {
                lines.push(format!("{}{}", indent(2), error));
            }
        }
    }
    lines
}

pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Dimensions;
    use crate::orchestrator::{BatchSummary, ImageReport, ImageState, OperationRecord, Schedule};
    use crate::step::{ProcessorKind, StepId};
    use crate::validate::ValidationIssue;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn summary(succeeded: usize, failed: usize) -> BatchSummary {
        BatchSummary {
            total: succeeded + failed,
            succeeded,
            failed,
            outputs: succeeded,
            warnings: vec![],
            duration_ms: 1400,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn durations() {
        assert_eq!(format_duration(350), "350ms");
        assert_eq!(format_duration(1400), "1.4s");
        assert_eq!(format_duration(125_000), "2m 05s");
    }

    #[test]
    fn format_index_pads() {
        assert_eq!(format_index(7), "007");
        assert_eq!(format_index(1234), "1234");
    }

    // =========================================================================
    // Task
    // =========================================================================

    #[test]
    fn task_lists_steps_in_execution_order() {
        let mut task = Task::new("Export");
        task.add_step("rename", json!({})).unwrap();
        task.add_step("crop", json!({ "width": 500, "height": 500 }))
            .unwrap();
        task.add_step("resize", json!({})).unwrap();
        task.add_step("optimize", json!({})).unwrap();
        task.set_step_enabled(3, false);

        let lines = format_task(&task);
        assert_eq!(lines[0], "Task: Export (4 steps, Mixed)");
        assert!(lines[1].trim_start().starts_with("3 resize"));
        assert!(lines[2].trim_start().starts_with("2 crop"));
        assert!(lines[2].contains("500x500 Smart"));
        assert!(lines[3].trim_start().starts_with("1 rename"));
        assert_eq!(lines[4], "    4 optimize (disabled)");
    }

    #[test]
    fn estimate_lines() {
        let mut task = Task::new("t");
        task.add_step("resize", json!({})).unwrap();
        let estimate = task.time_estimate(10);
        let lines = format_estimate(&task, &estimate);
        assert_eq!(lines[0], "10 images x 1 outputs each = 10 files");
        assert_eq!(lines[1], "Estimated time: 200ms per image, 2.0s total");
    }

    #[test]
    fn validation_lines() {
        let report = ValidationReport {
            errors: vec![ValidationIssue {
                step: Some(2),
                processor: Some(ProcessorKind::Crop),
                message: "width must be greater than 0".into(),
            }],
            warnings: vec![],
        };
        let lines = format_validation(&report);
        assert_eq!(lines[0], "error: Step 2 (crop): width must be greater than 0");
        assert_eq!(lines[1], "Invalid: 1 errors, 0 warnings");

        let lines = format_validation(&ValidationReport::default());
        assert_eq!(lines, vec!["Valid (0 warnings)"]);
    }

    // =========================================================================
    // Run
    // =========================================================================

    #[test]
    fn started_event() {
        let lines = format_batch_event(&BatchEvent::Started {
            total: 3,
            schedule: Schedule::Parallel { group_size: 2 },
        });
        assert_eq!(lines, vec!["Processing 3 images (parallel, groups of 2)"]);
    }

    #[test]
    fn step_event_shows_dimensions_and_detection() {
        let mut record = OperationRecord {
            sequence: 2,
            step_id: StepId::generate(ProcessorKind::Crop),
            order: 2,
            processor: ProcessorKind::Crop,
            before: Dimensions::new(1080, 810),
            after: Dimensions::new(1080, 1080),
            name: "dawn".into(),
            artifacts: vec![],
            crop: None,
            detection: None,
        };
        let event = |record: &OperationRecord| BatchEvent::StepCompleted {
            index: 0,
            source: PathBuf::from("/in/dawn.jpg"),
            record: record.clone(),
        };
        assert_eq!(
            format_batch_event(&event(&record)),
            vec!["001 dawn.jpg: crop 1080x810 → 1080x1080"]
        );

        record.detection = Some(DetectionResult {
            focus: crate::imaging::FocusPoint::CENTER,
            confidence: 0.92,
            sources: BTreeSet::from([DetectionSource::Face]),
            fallback: None,
            diagnostic: None,
        });
        assert_eq!(
            format_batch_event(&event(&record)),
            vec!["001 dawn.jpg: crop 1080x810 → 1080x1080 [face 92%]"]
        );
    }

    #[test]
    fn image_events() {
        let lines = format_batch_event(&BatchEvent::ImageCompleted {
            index: 0,
            total: 3,
            source: PathBuf::from("/in/dawn.jpg"),
            outputs: vec![PathBuf::from("out/dawn-1.webp")],
            warnings: 1,
        });
        assert_eq!(
            lines,
            vec!["[1/3] dawn.jpg", "    → out/dawn-1.webp", "    1 warnings"]
        );

        let lines = format_batch_event(&BatchEvent::ImageFailed {
            index: 1,
            total: 3,
            source: PathBuf::from("/in/night.jpg"),
            error: "Step 1 (resize) failed: boom".into(),
        });
        assert_eq!(
            lines,
            vec!["[2/3] night.jpg FAILED", "    Step 1 (resize) failed: boom"]
        );
    }

    #[test]
    fn finished_event() {
        let lines = format_batch_event(&BatchEvent::Finished {
            summary: summary(2, 1),
        });
        assert_eq!(lines, vec!["Done: 2 succeeded, 1 failed, 2 files in 1.4s"]);
    }

    #[test]
    fn report_repeats_failures_and_warnings() {
        let mut s = summary(0, 1);
        s.warnings = vec!["crop without a resize step".into()];
        let report = BatchReport {
            task_id: "t".into(),
            task_name: "t".into(),
            schedule: Schedule::Sequential,
            images: vec![ImageReport {
                index: 0,
                source: PathBuf::from("/in/a.jpg"),
                success: false,
                state: ImageState::Failed,
                output: None,
                extra_outputs: vec![],
                dimensions: None,
                history: vec![],
                warnings: vec![],
                error: Some("boom".into()),
                duration_ms: 3,
            }],
            summary: s,
        };
        assert_eq!(
            format_batch_report(&report),
            vec![
                "Warnings",
                "    crop without a resize step",
                "Failed",
                "    001 /in/a.jpg",
                "        boom",
            ]
        );
    }
}
