//! Secondary Publish - batch export of geometry nodes
//!
//! Every task is attempted. A failing task contributes one error entry and
//! never stops the rest of the batch.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info, info_span};

use crate::host::{HostContext, ObjectId};
use crate::plugins::geometry::{export_geometry, NODE_NAME_KEY};
use crate::plugins::PublishError;
use crate::templates::{
    normalize_path, FieldValue, Fields, Template, TemplateRegistry, VERSION_KEY,
};
use crate::tracker::{EntityContext, PublishRecord, PublishRequest, TrackingBackend};
use crate::versioning::versionless_publish_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryTask {
    pub node_name: String,
    pub node_id: ObjectId,
    /// Template name the exported file is rendered with.
    pub publish_template: String,
    pub publish_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrors {
    pub task: SecondaryTask,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub records: Vec<PublishRecord>,
    pub errors: Vec<TaskErrors>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Publish name: the `name` field when set, else the versionless file stem,
/// suffixed with the node name.
fn secondary_publish_name(template: &Template, fields: &Fields, node_name: &str) -> String {
    let base = match fields.get("name").and_then(FieldValue::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => versionless_publish_name(template, fields)
            .map(|name| {
                Path::new(&name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(name)
            })
            .unwrap_or_else(|_| node_name.to_string()),
    };
    format!("{}-{}", base, node_name)
}

fn publish_task(
    host: &mut HostContext<'_>,
    templates: &TemplateRegistry,
    tracker: &mut dyn TrackingBackend,
    context: &EntityContext,
    task: &SecondaryTask,
    work_fields: &Fields,
) -> Result<PublishRecord, PublishError> {
    let template = templates
        .get(&task.publish_template)
        .ok_or_else(|| PublishError::blocking("Failed to get Publish Path"))?;
    let mut fields = work_fields.clone();
    fields.insert(NODE_NAME_KEY.to_string(), FieldValue::from(task.node_name.as_str()));
    let path = template
        .render(&fields)
        .map_err(|e| PublishError::blocking(format!("Failed to get Publish Path: {}", e)))?;

    export_geometry(host, &task.node_name, task.node_id, Path::new(&path))?;

    let request = PublishRequest {
        path: normalize_path(Path::new(&path)),
        name: secondary_publish_name(template, &fields, &task.node_name),
        version_number: fields.get(VERSION_KEY).and_then(FieldValue::as_int),
        published_file_type: task.publish_type.clone(),
        created_by: context.user.clone(),
        context: context.clone(),
        ..Default::default()
    };
    Ok(tracker.register_publish(request)?)
}

/// Export and register every task against the session at `session_path`.
pub fn publish_secondary_geometry(
    host: &mut HostContext<'_>,
    templates: &TemplateRegistry,
    tracker: &mut dyn TrackingBackend,
    context: &EntityContext,
    tasks: &[SecondaryTask],
    work_template: &Template,
    session_path: &Path,
) -> Result<BatchOutcome, PublishError> {
    let span = info_span!("secondary_publish", tasks = tasks.len());
    let _guard = span.enter();
    info!("starting secondary publish");

    let work_fields = work_template.parse(session_path)?;
    let mut outcome = BatchOutcome::default();
    for task in tasks {
        info!(node = task.node_name.as_str(), template = task.publish_template.as_str(), "publishing node");
        match publish_task(host, templates, tracker, context, task, &work_fields) {
            Ok(record) => outcome.records.push(record),
            Err(e) => {
                error!(node = task.node_name.as_str(), error = %e, "secondary task failed");
                outcome.errors.push(TaskErrors {
                    task: task.clone(),
                    errors: vec![e.to_string()],
                });
            }
        }
    }
    Ok(outcome)
}
