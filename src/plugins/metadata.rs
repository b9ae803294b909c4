//! Metadata plugin - exports per-node scene metadata as a JSON document

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{
    ensure_parent_dir, register_publish, required_template, session_path, AcceptResult,
    PublishError, PublishPlugin, Registration, RunContext,
};
use crate::hashing::canonical_json;
use crate::host::{scene_nodes, HostContext, HostError, HostFeature};
use crate::item::{props, ItemId, ItemTree};
use crate::templates::{FieldValue, VERSION_KEY};
use crate::tracker::{PublishRecord, TrackerRead, TrackingBackend};

pub const METADATA_PUBLISH_TYPE: &str = "Scene Metadata";

/// Node name to that node's metadata entries.
pub type SceneMetadata = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataPluginSettings {
    pub publish_template: Option<String>,
    pub publish_type: Option<String>,
}

/// Metadata of every scene node that has any.
pub fn scene_metadata(host: &HostContext<'_>) -> Result<SceneMetadata, HostError> {
    host.require(HostFeature::Metadata)?;
    let scene = host.scene();
    let mut doc = SceneMetadata::new();
    for node in scene_nodes(scene)? {
        let entries = scene.object_metadata(node.0)?;
        if entries.is_empty() {
            continue;
        }
        doc.entry(scene.v1_name(node)?).or_default().extend(entries);
    }
    Ok(doc)
}

pub struct MetadataPlugin {
    name: String,
    settings: MetadataPluginSettings,
}

impl MetadataPlugin {
    pub fn new(name: String, settings: MetadataPluginSettings) -> Self {
        Self { name, settings }
    }
}

impl PublishPlugin for MetadataPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.metadata"]
    }

    fn accept(
        &self,
        ctx: &RunContext<'_>,
        _tree: &ItemTree,
        _item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        if !ctx.host.supports(HostFeature::Metadata) {
            debug!("host does not support metadata, skipping");
            return Ok(AcceptResult::rejected());
        }
        if scene_metadata(&ctx.host)?.is_empty() {
            debug!("no metadata found in the current scene, skipping");
            return Ok(AcceptResult::rejected());
        }
        Ok(AcceptResult::accepted().unchecked())
    }

    fn validate(
        &self,
        ctx: &RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        _tracker: &dyn TrackerRead,
    ) -> Result<(), PublishError> {
        let template = required_template(
            ctx.templates,
            self.settings.publish_template.as_deref(),
            "publish template",
        )?;
        session_path(ctx, tree)?;
        tree.set_local_property(item, props::PUBLISH_TEMPLATE, template.name());
        Ok(())
    }

    fn publish(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<(), PublishError> {
        let template = required_template(
            ctx.templates,
            self.settings.publish_template.as_deref(),
            "publish template",
        )?;
        let session_publish = tree
            .get_recursive_as::<PublishRecord>(item, props::PUBLISH_DATA)
            .ok_or_else(|| PublishError::blocking("Couldn't find the publish path of the current session"))?;
        let session_publish_path = session_publish.path().to_string();
        let source = ctx
            .templates
            .template_from_path(&session_publish_path)?
            .ok_or_else(|| {
                PublishError::blocking(format!(
                    "No template matches the session publish path {}",
                    session_publish_path
                ))
            })?;
        let mut fields = ctx.entity.as_template_fields();
        fields.extend(source.parse(&session_publish_path)?);
        let publish_path = template.render(&fields)?;

        let doc = scene_metadata(&ctx.host)?;
        ensure_parent_dir(Path::new(&publish_path))?;
        fs::write(&publish_path, canonical_json(&doc)?)?;
        info!(path = publish_path.as_str(), nodes = doc.len(), "scene metadata written");

        let name = Path::new(&publish_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| publish_path.clone());
        let publish_type = self
            .settings
            .publish_type
            .as_deref()
            .unwrap_or(METADATA_PUBLISH_TYPE);
        let version = fields.get(VERSION_KEY).and_then(FieldValue::as_int);
        tree.set_local_property(item, props::PUBLISH_PATH, publish_path.as_str());
        register_publish(
            ctx,
            tree,
            item,
            tracker,
            Registration::new(publish_path, name, publish_type).version(version),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NodeKind, SceneHost};
    use crate::memory::MemoryScene;
    use std::collections::HashMap;

    #[test]
    fn test_scene_metadata_groups_by_node() {
        let mut scene = MemoryScene::default();
        let root = scene.root_node().0;
        let body = scene.add_node(root, NodeKind::Geometry, "Body");
        let wheel = scene.add_node(body, NodeKind::Geometry, "Wheel");
        scene.add_node(root, NodeKind::Light, "Sun");
        scene.set_object_metadata(body, "part", "A-100").unwrap();
        scene.set_object_metadata(wheel, "part", "W-7").unwrap();
        scene.set_object_metadata(root, "local_storage_root", "/studio").unwrap();

        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let doc = scene_metadata(&host).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc["Wheel"]["part"], "W-7");
    }

    #[test]
    fn test_plugin_rejects_scene_without_metadata() {
        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let templates = crate::templates::TemplateRegistry::new();
        let entity = crate::tracker::EntityContext::default();
        let ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let tree = ItemTree::new(crate::item::ItemKind::Session, "car.vpb");

        let plugin = MetadataPlugin::new("metadata".into(), Default::default());
        assert!(!plugin.accept(&ctx, &tree, tree.root()).unwrap().accepted);
    }
}
