//! Material plugin - republishes materials that carry pipeline metadata

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{register_publish, AcceptResult, PublishError, PublishPlugin, Registration, RunContext};
use crate::host::V2Object;
use crate::item::{props, ItemId, ItemTree};
use crate::templates::{normalize_path, FieldValue, VERSION_KEY};
use crate::tracker::{EntityRef, TrackerRead, TrackingBackend};

pub const MATERIAL_PUBLISH_TYPE: &str = "Scene Material";
pub const MATERIAL_FILE_EXTENSION: &str = "osb";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialPluginSettings {
    /// Renders the publish folder from the fields of the material's last publish path.
    pub publish_template: Option<String>,
    pub publish_type: Option<String>,
}

/// Where and as what a material gets published.
#[derive(Debug, Clone)]
pub struct MaterialTarget {
    pub material: V2Object,
    /// Publish name.
    pub name: String,
    /// Scene name of the material; the host names exported files after it.
    pub material_name: String,
    pub dir: PathBuf,
    pub version_number: u64,
    pub version_entity: Option<EntityRef>,
}

impl MaterialTarget {
    pub fn material_file(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.material_name, MATERIAL_FILE_EXTENSION))
    }

    pub fn asset_dir(&self) -> PathBuf {
        self.dir.join(format!("MAT_{}", self.material_name))
    }
}

/// Resolve the material behind `item` and its publish destination.
///
/// Name, version and version entity fall back to the marker metadata left
/// by the previous publish of the material.
pub fn material_target(
    ctx: &RunContext<'_>,
    tree: &ItemTree,
    item: ItemId,
    publish_template: Option<&str>,
) -> Result<MaterialTarget, PublishError> {
    let scene = ctx.host.scene();
    let node_id = tree
        .get_u64(item, props::NODE_ID)
        .ok_or_else(|| PublishError::NotFound("Failed to get material node to publish.".into()))?;
    let node = scene.object(node_id)?;
    let material = scene
        .node_material(&node)?
        .ok_or_else(|| PublishError::NotFound("Failed to get material to publish.".into()))?;
    let marker = ctx.host.marker_set(material.id)?;
    let marker_value = |key: &str| marker.as_ref().and_then(|m| m.marker_value(key));

    let material_name = scene.object_name(&material)?;
    let name = match tree.get_str(item, props::PUBLISH_NAME) {
        Some(name) => name.to_string(),
        None => match marker_value("name") {
            Some(Value::String(name)) => name,
            _ => material_name.clone(),
        },
    };

    let version_number = tree
        .get_recursive_as::<u64>(item, props::VERSION_NUMBER)
        .or_else(|| marker_value("version_number").and_then(|v| v.as_u64()).map(|v| v + 1))
        .unwrap_or(1);

    let version_entity = tree
        .get_recursive_as::<EntityRef>(item, props::VERSION_DATA)
        .or_else(|| marker_value("version").and_then(|v| serde_json::from_value(v).ok()));

    let path = tree
        .get_str(item, props::PATH)
        .map(str::to_string)
        .ok_or_else(|| PublishError::blocking(format!("Material '{}' has no previous publish path.", name)))?;

    let templated = match publish_template {
        Some(template_name) => {
            let publish = ctx.templates.require(template_name)?;
            match ctx.templates.template_from_path(&path)? {
                Some(source) => {
                    let mut fields = ctx.entity.as_template_fields();
                    fields.extend(source.parse(&path)?);
                    fields.insert(VERSION_KEY.to_string(), FieldValue::Int(version_number));
                    Some(PathBuf::from(publish.render(&fields)?))
                }
                None => None,
            }
        }
        None => None,
    };
    let dir = match templated {
        Some(dir) => dir,
        None => Path::new(&path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };

    debug!(material = name.as_str(), dir = %dir.display(), version_number, "material target");
    Ok(MaterialTarget {
        material,
        name,
        material_name,
        dir,
        version_number,
        version_entity,
    })
}

pub struct MaterialPlugin {
    name: String,
    settings: MaterialPluginSettings,
}

impl MaterialPlugin {
    pub fn new(name: String, settings: MaterialPluginSettings) -> Self {
        Self { name, settings }
    }
}

impl PublishPlugin for MaterialPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.material.item"]
    }

    fn accept(
        &self,
        _ctx: &RunContext<'_>,
        tree: &ItemTree,
        item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        if tree.get_property(item, props::PATH).is_none()
            || tree.get_property(item, props::NODE_ID).is_none()
        {
            return Ok(AcceptResult::rejected());
        }
        Ok(AcceptResult::accepted())
    }

    fn validate(
        &self,
        ctx: &RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        _tracker: &dyn TrackerRead,
    ) -> Result<(), PublishError> {
        let target = material_target(ctx, tree, item, self.settings.publish_template.as_deref())?;
        if target.material_file().exists() {
            return Err(PublishError::blocking(
                "Material already exists. Please uncheck this plugin or save the file to a different path.",
            ));
        }
        if target.asset_dir().exists() {
            return Err(PublishError::blocking(
                "Material asset already exists. Please uncheck this plugin or save the file to a different path.",
            ));
        }
        tree.set_local_property(
            item,
            props::PUBLISH_PATH,
            normalize_path(&target.material_file()),
        );
        Ok(())
    }

    fn publish(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<(), PublishError> {
        let target = material_target(ctx, tree, item, self.settings.publish_template.as_deref())?;
        ctx.host
            .scene_mut()
            .save_materials(&[target.material], &target.dir)?;
        info!(material = target.name.as_str(), dir = %target.dir.display(), "material saved");

        let publish_type = self
            .settings
            .publish_type
            .as_deref()
            .unwrap_or(MATERIAL_PUBLISH_TYPE);
        let mut registration = Registration::new(
            normalize_path(&target.material_file()),
            target.name.clone(),
            publish_type,
        )
        .version(Some(target.version_number));
        registration.version_entity = target.version_entity;
        register_publish(ctx, tree, item, tracker, registration)?;
        Ok(())
    }
}
