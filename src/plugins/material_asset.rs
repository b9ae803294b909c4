//! Material asset plugin - publishes a material as a reusable asset folder

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::material::{material_target, MaterialTarget};
use super::{register_publish, AcceptResult, PublishError, PublishPlugin, Registration, RunContext};
use crate::host::HostFeature;
use crate::item::{props, ItemId, ItemTree};
use crate::templates::normalize_path;
use crate::tracker::{PublishRecord, TrackerRead, TrackingBackend};

pub const MATERIAL_ASSET_PUBLISH_TYPE: &str = "Material Asset";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialAssetPluginSettings {
    pub publish_template: Option<String>,
    pub publish_type: Option<String>,
}

pub struct MaterialAssetPlugin {
    name: String,
    settings: MaterialAssetPluginSettings,
}

impl MaterialAssetPlugin {
    pub fn new(name: String, settings: MaterialAssetPluginSettings) -> Self {
        Self { name, settings }
    }

    fn target(&self, ctx: &RunContext<'_>, tree: &ItemTree, item: ItemId) -> Result<MaterialTarget, PublishError> {
        material_target(ctx, tree, item, self.settings.publish_template.as_deref())
    }
}

/// Marker metadata written back onto a material after its asset publish.
fn marker_data(record: &PublishRecord) -> Result<Map<String, Value>, PublishError> {
    let mut data = match serde_json::to_value(record)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let context = &record.request.context;
    data.insert("entity".into(), serde_json::to_value(&context.entity)?);
    data.insert("task".into(), serde_json::to_value(&context.task)?);
    data.insert("version".into(), serde_json::to_value(&record.request.version_entity)?);
    Ok(data)
}

impl PublishPlugin for MaterialAssetPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.material.item"]
    }

    fn accept(
        &self,
        ctx: &RunContext<'_>,
        tree: &ItemTree,
        item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        if !ctx.host.supports(HostFeature::MaterialAssets) {
            debug!("host cannot create material assets");
            return Ok(AcceptResult::rejected());
        }
        if tree.get_property(item, props::NODE_ID).is_none() {
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
        let target = self.target(ctx, tree, item)?;
        if target.asset_dir().exists() {
            return Err(PublishError::blocking(
                "Material asset already exists. Please uncheck this plugin or save the file to a different path.",
            ));
        }
        Ok(())
    }

    fn publish(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<(), PublishError> {
        ctx.host.require(HostFeature::MaterialAssets)?;
        let target = self.target(ctx, tree, item)?;
        std::fs::create_dir_all(&target.dir)?;
        let asset_dir = ctx
            .host
            .scene_mut()
            .create_material_asset(&target.material, &target.dir)?;
        info!(material = target.name.as_str(), asset = %asset_dir.display(), "material asset created");

        let thumbnail = asset_dir.join(format!("{}.png", target.material_name));
        let publish_type = self
            .settings
            .publish_type
            .as_deref()
            .unwrap_or(MATERIAL_ASSET_PUBLISH_TYPE);
        let mut registration = Registration::new(normalize_path(&asset_dir), target.name.clone(), publish_type)
            .version(Some(target.version_number));
        registration.version_entity = target.version_entity;
        registration.thumbnail_path = thumbnail.exists().then_some(thumbnail);
        registration.store_as = props::MATERIAL_ASSET_DATA;
        register_publish(ctx, tree, item, tracker, registration)?;
        Ok(())
    }

    /// Swap the material's marker metadata for the data of the new asset publish.
    fn finalize(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
    ) -> Result<(), PublishError> {
        let Some(record) = tree.get_as::<PublishRecord>(item, props::MATERIAL_ASSET_DATA) else {
            return Ok(());
        };
        let target = self.target(ctx, tree, item)?;
        let material = target.material.id;
        ctx.host.remove_marker_metadata(&[material])?;
        ctx.host.add_marker_metadata(&[material], &marker_data(&record)?)?;
        info!(material = target.name.as_str(), publish = record.id, "material marker updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostContext, SceneHost, MARKER_SET_NAME};
    use crate::item::ItemKind;
    use crate::memory::MemoryScene;
    use crate::templates::TemplateRegistry;
    use crate::tracker::{EntityContext, EntityRef, LocalTracker};
    use semver::Version;
    use std::collections::HashMap;

    #[test]
    fn test_asset_publish_rewrites_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut scene = MemoryScene::default();
        let root = scene.root_node().0;
        let paint = scene.add_material("Paint");
        let node = scene.add_material_node(root, paint, "Paint");
        scene.add_metadata_set(MARKER_SET_NAME, &[paint], &[("SG_version_number", "1")]);

        let mut tree = ItemTree::new(ItemKind::Session, "car.vpb");
        let item = tree.create_item(tree.root(), ItemKind::Material, "Paint");
        tree.set_property(item, props::NODE_ID, node);
        tree.set_property(item, props::PATH, normalize_path(&dir.path().join("Paint.osb")));

        let env: HashMap<String, String> = HashMap::new();
        let templates = TemplateRegistry::new();
        let entity = EntityContext {
            task: Some(EntityRef::new("Task", 5, "lookdev")),
            ..Default::default()
        };
        let mut tracker = LocalTracker::new();
        let plugin = MaterialAssetPlugin::new("asset".into(), Default::default());
        {
            let mut ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
            plugin.validate(&ctx, &mut tree, item, &tracker).unwrap();
            plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();
            plugin.finalize(&mut ctx, &mut tree, item).unwrap();
        }

        assert!(dir.path().join("MAT_Paint").is_dir());
        assert!(tree.get_property(item, props::PUBLISH_DATA).is_none());
        let markers: Vec<_> = scene.metadata_sets.iter().filter(|s| s.is_marker()).collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].marker_value("version_number"), Some(serde_json::json!(2)));
        assert_eq!(markers[0].marker_value("task").unwrap()["name"], "lookdev");
    }

    #[test]
    fn test_old_hosts_reject_asset_publish() {
        let mut scene = MemoryScene::new(Version::new(2021, 0, 0));
        let env: HashMap<String, String> = HashMap::new();
        let templates = TemplateRegistry::new();
        let entity = EntityContext::default();
        let ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let mut tree = ItemTree::new(ItemKind::Session, "car.vpb");
        let item = tree.create_item(tree.root(), ItemKind::Material, "Paint");
        tree.set_property(item, props::NODE_ID, 1u64);

        let plugin = MaterialAssetPlugin::new("asset".into(), Default::default());
        assert!(!plugin.accept(&ctx, &tree, item).unwrap().accepted);
    }
}
