//! Tasks: reusable, ordered lists of steps.
//!
//! A [`Task`] owns its steps in *authoring* order. Execution order is decided
//! by the [orchestrator](crate::orchestrator) and does not depend on it.
//!
//! Every mutation goes through a method on `Task`, which keeps `order`
//! contiguous (1..=N, matching position) and recomputes the derived
//! [`TaskMetadata`]. Out-of-range indices are reported, never panicked on.
//!
//! Tasks round-trip through JSON via [`Task::export`] / [`Task::import`]:
//!
//! ```json
//! {
//!   "id": "3f2a9c0d1e4b5a67",
//!   "name": "Instagram",
//!   "description": "",
//!   "steps": [
//!     { "id": "...", "processor": "crop", "options": { "width": 1080, ... },
//!       "enabled": true, "order": 1,
//!       "metadata": { "outputType": "single", "outputsPerImage": 1, "batchable": true } }
//!   ],
//!   "metadata": { "estimatedOutputs": 1, "estimatedDurationMs": 900, "category": "crop" },
//!   "createdAt": 1700000000000,
//!   "updatedAt": 1700000000000
//! }
//! ```

use crate::imaging::Dimensions;
use crate::naming::PatternError;
use crate::step::{
    Compression, ProcessorKind, StepId, StepOptions, StepRecord, StepSpec, generate_id, normalize,
};
use crate::validate::{ValidationReport, validate_task};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),
    #[error("Invalid {processor} options: {message}")]
    InvalidOptions {
        processor: ProcessorKind,
        message: String,
    },
    #[error("Invalid rename pattern: {0}")]
    InvalidPattern(#[from] PatternError),
    #[error("No step at index {index} (task has {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Cost model
// ============================================================================

/// Base cost per processor, in milliseconds per image.
///
/// Only used for estimates shown to people; nothing depends on accuracy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostModel {
    pub resize: u64,
    pub crop: u64,
    pub optimize: u64,
    pub rename: u64,
    pub template: u64,
    /// Per size and format.
    pub favicon: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            resize: 200,
            crop: 300,
            optimize: 250,
            rename: 5,
            template: 350,
            favicon: 40,
        }
    }
}

impl CostModel {
    pub fn base_ms(&self, kind: ProcessorKind) -> u64 {
        match kind {
            ProcessorKind::Resize => self.resize,
            ProcessorKind::Crop => self.crop,
            ProcessorKind::Optimize => self.optimize,
            ProcessorKind::Rename => self.rename,
            ProcessorKind::Template => self.template,
            ProcessorKind::Favicon => self.favicon,
        }
    }

    /// Base cost times the step's complexity multiplier.
    pub fn step_ms(&self, options: &StepOptions) -> f64 {
        let multiplier = match options {
            StepOptions::Crop(_) | StepOptions::Template(_) if options.uses_detection() => 3.0,
            StepOptions::Favicon(f) => (f.sizes.len() * f.formats.len()) as f64,
            StepOptions::Optimize(o) => {
                let mut m = 1.0;
                if o.compression == Compression::Aggressive {
                    m *= 1.2;
                }
                if o.analyze_content {
                    m *= 1.5;
                }
                m
            }
            _ => 1.0,
        };
        self.base_ms(options.kind()) as f64 * multiplier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEstimate {
    pub image_count: usize,
    pub per_image_ms: u64,
    pub total_ms: u64,
}

// ============================================================================
// Derived data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    #[default]
    Empty,
    Resize,
    Crop,
    Optimize,
    Rename,
    Template,
    Favicon,
    Mixed,
}

impl From<ProcessorKind> for TaskCategory {
    fn from(kind: ProcessorKind) -> Self {
        match kind {
            ProcessorKind::Resize => TaskCategory::Resize,
            ProcessorKind::Crop => TaskCategory::Crop,
            ProcessorKind::Optimize => TaskCategory::Optimize,
            ProcessorKind::Rename => TaskCategory::Rename,
            ProcessorKind::Template => TaskCategory::Template,
            ProcessorKind::Favicon => TaskCategory::Favicon,
        }
    }
}

/// Read-only facts recomputed after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Artifacts produced per input image.
    pub estimated_outputs: usize,
    /// Estimated cost of one image.
    pub estimated_duration_ms: u64,
    pub category: TaskCategory,
}

/// Overview of a task's shape and health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub step_count: usize,
    pub enabled_count: usize,
    pub processors: BTreeMap<ProcessorKind, usize>,
    pub category: TaskCategory,
    pub error_count: usize,
    pub warning_count: usize,
}

/// Serialized task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: String,
    name: String,
    description: String,
    created_at: u64,
    updated_at: u64,
    steps: Vec<StepSpec>,
    cost_model: CostModel,
    derived: TaskMetadata,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: generate_id("task"),
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
            cost_model: CostModel::default(),
            derived: TaskMetadata::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.touch();
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    /// Steps in authoring order.
    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn metadata(&self) -> TaskMetadata {
        self.derived
    }

    pub fn category(&self) -> TaskCategory {
        self.derived.category
    }

    pub fn estimated_outputs(&self) -> usize {
        self.derived.estimated_outputs
    }

    pub fn estimated_duration_ms(&self) -> u64 {
        self.derived.estimated_duration_ms
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    pub fn set_cost_model(&mut self, cost_model: CostModel) {
        self.cost_model = cost_model;
        self.refresh();
    }

    // ------------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------------

    /// Append a step by processor name. `options` is a JSON object (or
    /// `null`) merged over the processor's defaults.
    pub fn add_step(&mut self, processor: &str, options: Value) -> Result<StepId, TaskError> {
        let kind: ProcessorKind = processor.parse()?;
        let options = normalize(kind, &options)?;
        Ok(self.push(options))
    }

    /// Append a step from typed options. They go through the same
    /// normalization as [`add_step`](Self::add_step).
    pub fn add(&mut self, options: StepOptions) -> Result<StepId, TaskError> {
        let options = normalize(options.kind(), &options.to_value()?)?;
        Ok(self.push(options))
    }

    fn push(&mut self, options: StepOptions) -> StepId {
        let step = StepSpec::new(options, self.steps.len() + 1);
        let id = step.id.clone();
        log::debug!("task {}: added {} step {}", self.id, step.processor(), id);
        self.steps.push(step);
        self.touch();
        id
    }

    pub fn remove_step(&mut self, index: usize) -> Option<StepSpec> {
        if index >= self.steps.len() {
            return None;
        }
        let removed = self.steps.remove(index);
        self.touch();
        Some(removed)
    }

    /// Swap the step at `index` with the one before it.
    pub fn move_step_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.steps.len() {
            return false;
        }
        self.steps.swap(index - 1, index);
        self.touch();
        true
    }

    /// Swap the step at `index` with the one after it.
    pub fn move_step_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.steps.len() {
            return false;
        }
        self.steps.swap(index, index + 1);
        self.touch();
        true
    }

    pub fn set_step_enabled(&mut self, index: usize, enabled: bool) -> bool {
        let Some(step) = self.steps.get_mut(index) else {
            return false;
        };
        step.enabled = enabled;
        self.touch();
        true
    }

    /// Merge `patch` (a JSON object) over the step's current options and
    /// re-normalize. `null` values reset a key to its default.
    pub fn update_step(&mut self, index: usize, patch: &Value) -> Result<(), TaskError> {
        let len = self.steps.len();
        let step = self
            .steps
            .get_mut(index)
            .ok_or(TaskError::OutOfRange { index, len })?;
        let kind = step.processor();

        let Value::Object(patch) = patch else {
            return Err(TaskError::InvalidOptions {
                processor: kind,
                message: format!("expected an object, got {}", patch),
            });
        };
        let mut current = step.options.to_value()?;
        if let Value::Object(base) = &mut current {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        }
        step.set_options(normalize(kind, &current)?);
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.order = i + 1;
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        let enabled: Vec<&StepSpec> = self.steps.iter().filter(|s| s.enabled).collect();

        let main = enabled
            .iter()
            .any(|s| s.processor() != ProcessorKind::Favicon);
        let side: usize = enabled
            .iter()
            .filter(|s| s.processor() == ProcessorKind::Favicon)
            .map(|s| s.metadata.outputs_per_image)
            .sum();

        let mut kinds: Vec<ProcessorKind> = enabled.iter().map(|s| s.processor()).collect();
        kinds.sort();
        kinds.dedup();
        let category = match kinds.as_slice() {
            [] => TaskCategory::Empty,
            [only] => TaskCategory::from(*only),
            _ => TaskCategory::Mixed,
        };

        self.derived = TaskMetadata {
            estimated_outputs: usize::from(main) + side,
            estimated_duration_ms: self.per_image_ms(),
            category,
        };
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    fn per_image_ms(&self) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.enabled)
            .map(|s| self.cost_model.step_ms(&s.options))
            .sum::<f64>()
            .round() as u64
    }

    /// Rough wall-clock estimate for `image_count` images.
    pub fn time_estimate(&self, image_count: usize) -> TimeEstimate {
        let per_image_ms = self.per_image_ms();
        TimeEstimate {
            image_count,
            per_image_ms,
            total_ms: per_image_ms.saturating_mul(image_count as u64),
        }
    }

    /// Check the task, and with `image` also simulate its dimensions
    /// through the execution plan.
    pub fn validate(&self, image: Option<Dimensions>) -> ValidationReport {
        validate_task(self, image)
    }

    pub fn validation_summary(&self) -> ValidationSummary {
        let report = self.validate(None);
        let mut processors = BTreeMap::new();
        for step in &self.steps {
            *processors.entry(step.processor()).or_insert(0) += 1;
        }
        ValidationSummary {
            step_count: self.steps.len(),
            enabled_count: self.steps.iter().filter(|s| s.enabled).count(),
            processors,
            category: self.derived.category,
            error_count: report.errors.len(),
            warning_count: report.warnings.len(),
        }
    }

    /// Independent copy with fresh task and step ids.
    pub fn duplicate(&self) -> Task {
        let mut copy = self.clone();
        let now = now_millis();
        copy.id = generate_id("task");
        copy.name = format!("{} (copy)", self.name);
        copy.created_at = now;
        copy.updated_at = now;
        for step in &mut copy.steps {
            step.id = StepId::generate(step.processor());
        }
        copy
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    pub fn export(&self) -> Result<TaskRecord, TaskError> {
        let steps = self
            .steps
            .iter()
            .map(StepSpec::to_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TaskRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            steps,
            metadata: self.derived,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    /// Rebuild a task from a record. Step options are re-normalized, steps
    /// are sorted by their recorded `order`, and derived data is recomputed.
    pub fn import(record: TaskRecord) -> Result<Task, TaskError> {
        let mut records = record.steps;
        records.sort_by_key(|s| s.order);

        let mut steps = Vec::with_capacity(records.len());
        for (i, r) in records.into_iter().enumerate() {
            let options = normalize(r.processor, &r.options)?;
            let mut step = StepSpec::new(options, i + 1);
            if !r.id.as_str().is_empty() {
                step.id = r.id;
            }
            step.enabled = r.enabled;
            steps.push(step);
        }

        let now = now_millis();
        let or_now = |t: u64| if t == 0 { now } else { t };
        let mut task = Task {
            id: if record.id.is_empty() {
                generate_id("task")
            } else {
                record.id
            },
            name: record.name,
            description: record.description,
            created_at: or_now(record.created_at),
            updated_at: or_now(record.updated_at),
            steps,
            cost_model: CostModel::default(),
            derived: TaskMetadata::default(),
        };
        task.refresh();
        Ok(task)
    }

    pub fn to_json(&self) -> Result<String, TaskError> {
        Ok(serde_json::to_string_pretty(&self.export()?)?)
    }

    pub fn from_json(json: &str) -> Result<Task, TaskError> {
        Task::import(serde_json::from_str(json)?)
    }
}
