//! Configuration - YAML publish configuration
//!
//! One file carries the template grammar (roots, keys, paths), the entity
//! context of the work area, collector settings and the ordered plugin list.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::templates::{TemplateConfig, TemplateError, TemplateRegistry};
use crate::tracker::EntityContext;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Invalid settings for plugin '{plugin}': {reason}")]
    InvalidSettings { plugin: String, reason: String },
}

fn default_image_extensions() -> Vec<String> {
    ["png", "exr", "jpg", "jpeg", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Template the session file is expected to match.
    #[serde(default)]
    pub work_template: Option<String>,
    /// Extensions accepted next to the render file's own extension.
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            work_template: None,
            image_extensions: default_image_extensions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub render_template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Session,
    Geometry,
    Material,
    MaterialAsset,
    Metadata,
    MetadataSet,
    Rendering,
    Lmv,
    UploadVersion,
}

impl PluginKind {
    pub fn default_name(self) -> &'static str {
        match self {
            PluginKind::Session => "Publish Session",
            PluginKind::Geometry => "Publish Geometry",
            PluginKind::Material => "Publish Material",
            PluginKind::MaterialAsset => "Publish Material Asset",
            PluginKind::Metadata => "Publish Scene Metadata",
            PluginKind::MetadataSet => "Publish Metadata Set",
            PluginKind::Rendering => "Publish Rendering",
            PluginKind::Lmv => "Upload for review (LMV)",
            PluginKind::UploadVersion => "Upload for review",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub kind: PluginKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub settings: serde_yaml::Value,
}

impl PluginConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.default_name().to_string())
    }

    /// Typed settings; an absent mapping yields the defaults.
    pub fn settings<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_yaml::from_value(self.settings.clone()).map_err(|e| ConfigError::InvalidSettings {
            plugin: self.display_name(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(flatten)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub context: EntityContext,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl PublishConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn template_registry(&self) -> Result<TemplateRegistry, ConfigError> {
        Ok(TemplateRegistry::from_config(&self.templates)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
roots:
  primary: /studio/projects
keys:
  Asset: {type: str}
  name: {type: str, filter_by: alphanumeric}
  version: {type: int, format_spec: "03"}
paths:
  work: "assets/{Asset}/work/{name}.v{version}.vpb"
context:
  entity: {type: Asset, id: 12, name: car}
collector:
  work_template: work
plugins:
  - kind: session
    settings:
      publish_template: work
  - kind: geometry
    name: Export Geometry
"#;

    #[test]
    fn test_load_full_config() {
        let config = PublishConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[1].display_name(), "Export Geometry");
        assert_eq!(config.collector.image_extensions[0], "png");

        let registry = config.template_registry().unwrap();
        let work = registry.require("work").unwrap();
        assert!(work.validate("/studio/projects/assets/car/work/body.v003.vpb"));
    }

    #[test]
    fn test_missing_settings_default() {
        #[derive(Debug, Default, Deserialize)]
        struct Demo {
            #[serde(default)]
            publish_template: Option<String>,
        }
        let config = PublishConfig::from_yaml_str(YAML).unwrap();
        let demo: Demo = config.plugins[1].settings().unwrap();
        assert!(demo.publish_template.is_none());
        let demo: Demo = config.plugins[0].settings().unwrap();
        assert_eq!(demo.publish_template.as_deref(), Some("work"));
    }
}
