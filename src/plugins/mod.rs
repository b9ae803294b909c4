//! Publish Plugins - the per-item publish steps
//!
//! A plugin claims items by type spec, then runs four stages per claimed
//! item: accept, validate, publish, finalize. Plugins are built once per
//! run from the ordered plugin list of the configuration.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, PluginConfig, PluginKind};
use crate::dependencies::{get_publish_dependencies, DependencyError};
use crate::hashing::file_sha256;
use crate::host::{HostContext, HostError};
use crate::item::{props, ItemId, ItemTree};
use crate::session::SessionError;
use crate::templates::{normalize_path, Template, TemplateError, TemplateRegistry};
use crate::tracker::{
    EntityContext, EntityRef, PublishRecord, PublishRequest, TrackerError, TrackerRead,
    TrackingBackend,
};
use crate::versioning::{strip_version_token, versionless_publish_name};

pub mod geometry;
pub mod lmv;
pub mod material;
pub mod material_asset;
pub mod metadata;
pub mod metadata_set;
pub mod rendering;
pub mod session;
pub mod upload_version;

pub use geometry::GeometryPlugin;
pub use lmv::LmvPlugin;
pub use material::MaterialPlugin;
pub use material_asset::MaterialAssetPlugin;
pub use metadata::MetadataPlugin;
pub use metadata_set::MetadataSetPlugin;
pub use rendering::RenderingPlugin;
pub use session::SessionPlugin;
pub use upload_version::UploadVersionPlugin;

/// What the caller's UI may offer to fix a blocking error. Never executed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub label: String,
    pub tooltip: String,
    pub kind: RecoveryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryKind {
    SaveAs,
    SaveToPath { path: String },
}

impl RecoveryAction {
    pub fn save_as() -> Self {
        Self {
            label: "Save As...".into(),
            tooltip: "Save the current session".into(),
            kind: RecoveryKind::SaveAs,
        }
    }

    pub fn save_file() -> Self {
        Self {
            label: "Save File".into(),
            tooltip: "Save the current session to a different file name".into(),
            kind: RecoveryKind::SaveAs,
        }
    }

    pub fn save_to_version(path: &str, version: u64) -> Self {
        Self {
            label: format!("Save to v{}", version),
            tooltip: format!("Save to the next available version number, v{}", version),
            kind: RecoveryKind::SaveToPath {
                path: path.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{message}")]
    Blocking {
        message: String,
        action: Option<RecoveryAction>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    NotSupported(HostError),

    #[error(transparent)]
    Host(HostError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("External tool failed: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<HostError> for PublishError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::NotFound(what) => PublishError::NotFound(what),
            e @ HostError::NotSupported { .. } => PublishError::NotSupported(e),
            e => PublishError::Host(e),
        }
    }
}

impl PublishError {
    pub fn blocking(message: impl Into<String>) -> Self {
        PublishError::Blocking {
            message: message.into(),
            action: None,
        }
    }

    pub fn blocking_with(message: impl Into<String>, action: RecoveryAction) -> Self {
        PublishError::Blocking {
            message: message.into(),
            action: Some(action),
        }
    }

    pub fn recovery_action(&self) -> Option<&RecoveryAction> {
        match self {
            PublishError::Blocking { action, .. } => action.as_ref(),
            _ => None,
        }
    }
}

/// Answer of a plugin's accept stage, with UI hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResult {
    pub accepted: bool,
    pub enabled: bool,
    pub visible: bool,
    pub checked: bool,
}

impl AcceptResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            enabled: true,
            visible: true,
            checked: true,
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            ..Self::accepted()
        }
    }

    pub fn unchecked(mut self) -> Self {
        self.checked = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Everything a plugin may touch during a run.
pub struct RunContext<'a> {
    pub host: HostContext<'a>,
    pub templates: &'a TemplateRegistry,
    pub entity: &'a EntityContext,
}

impl<'a> RunContext<'a> {
    pub fn new(host: HostContext<'a>, templates: &'a TemplateRegistry, entity: &'a EntityContext) -> Self {
        Self {
            host,
            templates,
            entity,
        }
    }
}

pub trait PublishPlugin {
    fn name(&self) -> &str;

    /// Glob patterns over item type specs.
    fn item_filters(&self) -> &[&'static str];

    fn accept(
        &self,
        ctx: &RunContext<'_>,
        tree: &ItemTree,
        item: ItemId,
    ) -> Result<AcceptResult, PublishError>;

    /// Tracker access is read-only here: nothing may be registered before publish.
    fn validate(
        &self,
        ctx: &RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &dyn TrackerRead,
    ) -> Result<(), PublishError>;

    fn publish(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<(), PublishError>;

    fn finalize(
        &self,
        _ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
    ) -> Result<(), PublishError> {
        if let Some(record) = tree.get_as::<PublishRecord>(item, props::PUBLISH_DATA) {
            info!(plugin = self.name(), publish = record.id, path = record.path(), "publish complete");
        }
        Ok(())
    }

    fn matches(&self, type_spec: &str) -> bool {
        self.item_filters().iter().any(|filter| {
            Pattern::new(filter)
                .map(|p| p.matches(type_spec))
                .unwrap_or(false)
        })
    }
}

/// Instantiate the configured plugins, in configuration order.
pub fn build_plugins(configs: &[PluginConfig]) -> Result<Vec<Box<dyn PublishPlugin>>, ConfigError> {
    let mut plugins: Vec<Box<dyn PublishPlugin>> = Vec::with_capacity(configs.len());
    for config in configs {
        let name = config.display_name();
        let plugin: Box<dyn PublishPlugin> = match config.kind {
            PluginKind::Session => Box::new(SessionPlugin::new(name, config.settings()?)),
            PluginKind::Geometry => Box::new(GeometryPlugin::new(name, config.settings()?)),
            PluginKind::Material => Box::new(MaterialPlugin::new(name, config.settings()?)),
            PluginKind::MaterialAsset => {
                Box::new(MaterialAssetPlugin::new(name, config.settings()?))
            }
            PluginKind::Metadata => Box::new(MetadataPlugin::new(name, config.settings()?)),
            PluginKind::MetadataSet => Box::new(MetadataSetPlugin::new(name, config.settings()?)),
            PluginKind::Rendering => Box::new(RenderingPlugin::new(name, config.settings()?)),
            PluginKind::Lmv => Box::new(LmvPlugin::new(name, config.settings()?)),
            PluginKind::UploadVersion => {
                Box::new(UploadVersionPlugin::new(name, config.settings()?))
            }
        };
        debug!(plugin = plugin.name(), "plugin loaded");
        plugins.push(plugin);
    }
    Ok(plugins)
}

// --- Shared helpers ---

/// Named template from a plugin setting; an unset setting is blocking.
pub(crate) fn required_template<'r>(
    templates: &'r TemplateRegistry,
    setting: Option<&str>,
    label: &str,
) -> Result<&'r Template, PublishError> {
    let name = setting.ok_or_else(|| {
        PublishError::blocking(format!("A {} is required but none is configured.", label))
    })?;
    templates
        .get(name)
        .ok_or_else(|| PublishError::blocking(format!("The {} '{}' is not defined.", label, name)))
}

/// Work template recorded on the item or an ancestor.
pub(crate) fn work_template<'r>(
    templates: &'r TemplateRegistry,
    tree: &ItemTree,
    item: ItemId,
) -> Result<&'r Template, PublishError> {
    let name = tree.get_recursive_as::<String>(item, props::WORK_TEMPLATE);
    required_template(templates, name.as_deref(), "work template")
}

/// Saved path of the session the item belongs to.
pub(crate) fn session_path(
    ctx: &RunContext<'_>,
    tree: &ItemTree,
) -> Result<PathBuf, PublishError> {
    tree.get_path(tree.root(), props::PATH)
        .or_else(|| ctx.host.scene().current_file())
        .ok_or_else(|| {
            PublishError::blocking_with("The session has not been saved.", RecoveryAction::save_as())
        })
}

/// Publish name: explicit property, else the template-derived versionless
/// name, else the file name without its version token.
pub(crate) fn publish_name(ctx: &RunContext<'_>, tree: &ItemTree, item: ItemId, path: &str) -> String {
    if let Some(name) = tree.get_str(item, props::PUBLISH_NAME) {
        return name.to_string();
    }
    if let Ok(Some(template)) = ctx.templates.template_from_path(path) {
        if let Ok(name) = template
            .parse(path)
            .and_then(|fields| versionless_publish_name(template, &fields))
        {
            return name;
        }
    }
    strip_version_token(path).unwrap_or_else(|| path.to_string())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// One publish registration. Dependencies come from the item's cached set.
pub(crate) struct Registration {
    pub path: String,
    pub name: String,
    pub published_file_type: String,
    pub version_number: Option<u64>,
    pub context: Option<EntityContext>,
    pub version_entity: Option<EntityRef>,
    pub thumbnail_path: Option<PathBuf>,
    pub extra_fields: Map<String, Value>,
    /// Item property receiving the record.
    pub store_as: &'static str,
}

impl Registration {
    pub fn new(path: impl Into<String>, name: impl Into<String>, published_file_type: &str) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            published_file_type: published_file_type.to_string(),
            version_number: None,
            context: None,
            version_entity: None,
            thumbnail_path: None,
            extra_fields: Map::new(),
            store_as: props::PUBLISH_DATA,
        }
    }

    pub fn version(mut self, version: Option<u64>) -> Self {
        self.version_number = version;
        self
    }
}

pub(crate) fn register_publish(
    ctx: &RunContext<'_>,
    tree: &mut ItemTree,
    item: ItemId,
    tracker: &mut dyn TrackingBackend,
    registration: Registration,
) -> Result<PublishRecord, PublishError> {
    let deps = get_publish_dependencies(&ctx.host, tree, item, tracker.as_reader())?;

    let mut extra_fields = registration.extra_fields;
    let file = Path::new(&registration.path);
    if file.is_file() {
        extra_fields.insert("sha256".into(), Value::String(file_sha256(file)?));
    }

    let publish_item = tree.item(item);
    let request = PublishRequest {
        path: normalize_path(file),
        name: registration.name,
        version_number: registration.version_number,
        published_file_type: registration.published_file_type,
        comment: publish_item.description.clone(),
        created_by: ctx.entity.user.clone(),
        thumbnail_path: registration
            .thumbnail_path
            .or_else(|| publish_item.thumbnail_path.clone()),
        dependency_paths: deps.paths(),
        dependency_ids: deps.ids(),
        context: registration.context.unwrap_or_else(|| ctx.entity.clone()),
        version_entity: registration.version_entity,
        extra_fields,
    };
    debug!(request = ?request, "registering publish");

    let record = tracker.register_publish(request)?;
    tree.set_property(item, registration.store_as, serde_json::to_value(&record)?);
    info!(
        id = record.id,
        publish_type = record.request.published_file_type.as_str(),
        path = record.path(),
        "publish registered"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishConfig;

    #[test]
    fn test_filters_match_type_specs() {
        let plugin = MaterialPlugin::new("materials".into(), Default::default());
        assert!(plugin.matches("session.material.item"));
        assert!(!plugin.matches("session.material"));
    }

    #[test]
    fn test_build_plugins_keeps_config_order() {
        let config = PublishConfig::from_yaml_str(
            "plugins:\n  - kind: lmv\n  - kind: session\n  - kind: upload_version\n    name: Review\n",
        )
        .unwrap();
        let plugins = build_plugins(&config.plugins).unwrap();
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["Upload for review (LMV)", "Publish Session", "Review"]
        );
    }

    #[test]
    fn test_host_not_found_maps_to_not_found() {
        let err: PublishError = HostError::NotFound("node 3".into()).into();
        assert!(matches!(err, PublishError::NotFound(_)));
    }

    #[test]
    fn test_blocking_error_carries_action() {
        let err = PublishError::blocking_with("unsaved", RecoveryAction::save_as());
        assert_eq!(err.recovery_action().map(|a| a.label.as_str()), Some("Save As..."));
        assert_eq!(err.to_string(), "unsaved");
    }
}
