//! Publish Pipeline - Single Entry Point
//!
//! Every run goes through the same four stages over the planned tasks:
//! all accepts, then validates, then publishes, then finalizes. Tasks are
//! ordered by item pre-order, then by plugin configuration order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{ConfigError, PublishConfig};
use crate::hashing::compute_report_hash;
use crate::item::{ItemId, ItemTree};
use crate::plugins::{
    build_plugins, AcceptResult, PublishError, PublishPlugin, RecoveryAction, RunContext,
};
use crate::tracker::TrackingBackend;
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No task for plugin '{plugin}' on item '{item}'")]
    UnknownTask { plugin: String, item: String },

    #[error("Task for plugin '{plugin}' on item '{item}' cannot be toggled")]
    TaskLocked { plugin: String, item: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    NotAccepted,
    Accepted,
    Validated,
    Published,
    Finalized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Accept,
    Validate,
    Publish,
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RecoveryAction>,
}

impl TaskError {
    fn new(stage: Stage, error: &PublishError) -> Self {
        Self {
            stage,
            message: error.to_string(),
            action: error.recovery_action().cloned(),
        }
    }
}

/// One (plugin, item) pair that passed accept.
#[derive(Debug, Clone)]
pub struct PublishTask {
    pub plugin: usize,
    pub item: ItemId,
    pub state: TaskState,
    pub checked: bool,
    pub accept: AcceptResult,
    pub errors: Vec<TaskError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub plugin: String,
    pub item: String,
    pub item_type: String,
    pub state: TaskState,
    pub checked: bool,
    pub errors: Vec<TaskError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReport {
    pub run_id: String,
    pub engine_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskReport>,
    pub report_hash: String,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        !self.tasks.iter().any(|t| t.state == TaskState::Failed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }
}

/// The publish pipeline - owns the plugins and the planned tasks of one run
pub struct PublishPipeline {
    plugins: Vec<Box<dyn PublishPlugin>>,
    tasks: Vec<PublishTask>,
    planned: bool,
}

impl PublishPipeline {
    pub fn new(plugins: Vec<Box<dyn PublishPlugin>>) -> Self {
        Self {
            plugins,
            tasks: Vec::new(),
            planned: false,
        }
    }

    pub fn from_config(config: &PublishConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(build_plugins(&config.plugins)?))
    }

    pub fn plugins(&self) -> impl Iterator<Item = &dyn PublishPlugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    pub fn tasks(&self) -> &[PublishTask] {
        &self.tasks
    }

    /// Run accept for every matching (item, plugin) pair and keep the accepted ones.
    pub fn plan(&mut self, ctx: &RunContext<'_>, tree: &ItemTree) -> &[PublishTask] {
        self.tasks.clear();
        for item in tree.preorder() {
            let type_spec = tree.type_spec(item);
            for (index, plugin) in self.plugins.iter().enumerate() {
                if !plugin.matches(type_spec) {
                    continue;
                }
                match plugin.accept(ctx, tree, item) {
                    Ok(result) if result.accepted => {
                        debug!(plugin = plugin.name(), item = tree.item(item).name.as_str(), checked = result.checked, "task accepted");
                        self.tasks.push(PublishTask {
                            plugin: index,
                            item,
                            state: TaskState::Accepted,
                            checked: result.checked,
                            accept: result,
                            errors: Vec::new(),
                        });
                    }
                    Ok(_) => {
                        debug!(plugin = plugin.name(), item = tree.item(item).name.as_str(), "not accepted");
                    }
                    Err(e) => {
                        warn!(plugin = plugin.name(), item = tree.item(item).name.as_str(), error = %e, "accept failed, skipping");
                    }
                }
            }
        }
        self.planned = true;
        info!(tasks = self.tasks.len(), "publish plan ready");
        &self.tasks
    }

    /// Check or uncheck a planned task. Disabled tasks keep their state.
    pub fn set_checked(
        &mut self,
        tree: &ItemTree,
        plugin: &str,
        item: ItemId,
        checked: bool,
    ) -> Result<(), PipelineError> {
        let plugins = &self.plugins;
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.item == item && plugins[t.plugin].name() == plugin)
            .ok_or_else(|| PipelineError::UnknownTask {
                plugin: plugin.to_string(),
                item: tree.item(item).name.clone(),
            })?;
        if !task.accept.enabled {
            return Err(PipelineError::TaskLocked {
                plugin: plugin.to_string(),
                item: tree.item(item).name.clone(),
            });
        }
        task.checked = checked;
        Ok(())
    }

    /// Validate, publish and finalize every checked task.
    ///
    /// A failing task never stops the others. Finalize failures are logged
    /// and recorded but leave the task published.
    pub fn run(
        &mut self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<PublishReport, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("publish", run_id = %run_id);
        let _guard = span.enter();
        let started_at = Utc::now();

        if !self.planned {
            self.plan(ctx, tree);
        }

        info!("validating");
        for task in self.tasks.iter_mut().filter(|t| t.checked && t.state == TaskState::Accepted) {
            let plugin = &self.plugins[task.plugin];
            match plugin.validate(ctx, tree, task.item, tracker.as_reader()) {
                Ok(()) => task.state = TaskState::Validated,
                Err(e) => {
                    error!(plugin = plugin.name(), item = tree.item(task.item).name.as_str(), error = %e, "validation failed");
                    task.errors.push(TaskError::new(Stage::Validate, &e));
                    task.state = TaskState::Failed;
                }
            }
        }

        info!("publishing");
        for task in self.tasks.iter_mut().filter(|t| t.state == TaskState::Validated) {
            let plugin = &self.plugins[task.plugin];
            match plugin.publish(ctx, tree, task.item, tracker) {
                Ok(()) => task.state = TaskState::Published,
                Err(e) => {
                    error!(plugin = plugin.name(), item = tree.item(task.item).name.as_str(), error = %e, "publish failed");
                    task.errors.push(TaskError::new(Stage::Publish, &e));
                    task.state = TaskState::Failed;
                }
            }
        }

        info!("finalizing");
        for task in self.tasks.iter_mut().filter(|t| t.state == TaskState::Published) {
            let plugin = &self.plugins[task.plugin];
            match plugin.finalize(ctx, tree, task.item) {
                Ok(()) => task.state = TaskState::Finalized,
                Err(e) => {
                    warn!(plugin = plugin.name(), item = tree.item(task.item).name.as_str(), error = %e, "finalize failed");
                    task.errors.push(TaskError::new(Stage::Finalize, &e));
                }
            }
        }

        let tasks: Vec<TaskReport> = self
            .tasks
            .iter()
            .map(|task| TaskReport {
                plugin: self.plugins[task.plugin].name().to_string(),
                item: tree.item(task.item).name.clone(),
                item_type: tree.type_spec(task.item).to_string(),
                state: task.state,
                checked: task.checked,
                errors: task.errors.clone(),
            })
            .collect();
        let report_hash = compute_report_hash(&run_id, &tasks, ENGINE_VERSION)?;
        let report = PublishReport {
            run_id,
            engine_version: ENGINE_VERSION.to_string(),
            started_at,
            finished_at: Utc::now(),
            tasks,
            report_hash,
        };
        info!(
            tasks = report.tasks.len(),
            failed = report.failed().count(),
            "publish run complete"
        );
        Ok(report)
    }
}
