//! Metadata set plugin - publishes one metadata set as a sub-asset of the context entity

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{
    ensure_parent_dir, register_publish, required_template, session_path, AcceptResult,
    PublishError, PublishPlugin, Registration, RunContext,
};
use crate::hashing::canonical_json;
use crate::host::{HostFeature, MetadataSet};
use crate::item::{props, ItemId, ItemTree};
use crate::templates::{normalize_path, FieldValue, VERSION_KEY};
use crate::tracker::{TrackerRead, TrackingBackend};

pub const METADATA_SET_PUBLISH_TYPE: &str = "Metadata Set";
/// Set entry naming the asset type of a newly created set asset.
pub const ASSET_TYPE_ENTRY: &str = "SG_asset_type";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSetPluginSettings {
    pub publish_template: Option<String>,
    pub publish_type: Option<String>,
}

pub struct MetadataSetPlugin {
    name: String,
    settings: MetadataSetPluginSettings,
}

impl MetadataSetPlugin {
    pub fn new(name: String, settings: MetadataSetPluginSettings) -> Self {
        Self { name, settings }
    }
}

fn metadata_set(ctx: &RunContext<'_>, tree: &ItemTree, item: ItemId) -> Result<MetadataSet, PublishError> {
    let set_id = tree
        .get_u64(item, props::METADATA_SET_ID)
        .ok_or_else(|| PublishError::blocking("Missing Metadata Set to publish."))?;
    ctx.host
        .scene()
        .metadata_sets()?
        .into_iter()
        .find(|set| set.id == set_id)
        .ok_or_else(|| PublishError::NotFound(format!("metadata set {}", set_id)))
}

impl PublishPlugin for MetadataSetPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.metadata_set.item"]
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
        Ok(AcceptResult::accepted())
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
        metadata_set(ctx, tree, item)?;
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
        ctx.host.require(HostFeature::Metadata)?;
        let template = required_template(
            ctx.templates,
            self.settings.publish_template.as_deref(),
            "publish template",
        )?;
        let set = metadata_set(ctx, tree, item)?;
        let set_name = tree.item(item).name.clone();
        let asset_type = set.entries.get(ASSET_TYPE_ENTRY).cloned();

        let parent = ctx.entity.entity.as_ref();
        let (asset, version) = match tracker.find_asset(&set_name, parent)? {
            Some(asset) => {
                let version = asset.published_files.len() as u64 + 1;
                (asset, version)
            }
            None => {
                let asset = tracker.create_asset(
                    &set_name,
                    asset_type.as_deref(),
                    parent,
                    ctx.entity.project.as_ref(),
                )?;
                info!(asset = asset.code.as_str(), id = asset.id, "metadata set asset created");
                (asset, 1)
            }
        };

        let session = normalize_path(&session_path(ctx, tree)?);
        let mut fields = ctx.entity.as_template_fields();
        if let Some(source) = ctx.templates.template_from_path(&session)? {
            fields.extend(source.parse(&session)?);
        }
        fields.insert("name".into(), FieldValue::from(set_name.as_str()));
        fields.insert(VERSION_KEY.into(), FieldValue::Int(version));
        if let Some(asset_type) = &asset_type {
            fields.insert("sg_asset_type".into(), FieldValue::from(asset_type.as_str()));
        }
        fields.insert("Asset".into(), FieldValue::from(set_name.as_str()));
        let publish_path = template.render(&fields)?;

        ensure_parent_dir(Path::new(&publish_path))?;
        fs::write(&publish_path, canonical_json(&set.entries)?)?;
        tree.set_local_property(item, props::PUBLISH_PATH, publish_path.as_str());
        info!(set = set_name.as_str(), path = publish_path.as_str(), version, "metadata set written");

        let publish_type = self
            .settings
            .publish_type
            .as_deref()
            .unwrap_or(METADATA_SET_PUBLISH_TYPE);
        let mut registration =
            Registration::new(publish_path, set_name, publish_type).version(Some(version));
        registration.context = Some(ctx.entity.with_entity(asset.entity_ref()));
        registration.version_entity = tree.get_recursive_as(item, props::VERSION_DATA);
        register_publish(ctx, tree, item, tracker, registration)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostContext, NodeKind, SceneHost};
    use crate::item::ItemKind;
    use crate::memory::MemoryScene;
    use crate::templates::{TemplateConfig, TemplateRegistry};
    use crate::tracker::{EntityContext, EntityRef, LocalTracker};
    use std::collections::HashMap;

    #[test]
    fn test_republish_versions_up_the_set_asset() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let yaml = format!(
            "roots: {{primary: '{}'}}\nkeys:\n  name: {{type: str}}\n  Asset: {{type: str}}\n  version: {{type: int, format_spec: '03'}}\npaths:\n  work: 'work/{{name}}.v{{version}}.vpb'\n  set_pub: 'sets/{{Asset}}/{{name}}.v{{version}}.json'\n",
            root
        );
        let config: TemplateConfig = serde_yaml::from_str(&yaml).unwrap();
        let templates = TemplateRegistry::from_config(&config).unwrap();

        let mut scene = MemoryScene::default();
        let scene_root = scene.root_node().0;
        let body = scene.add_node(scene_root, NodeKind::Geometry, "Body");
        let set_id = scene.add_metadata_set(
            "Trims",
            &[body],
            &[("SG_asset_type", "Trim Set"), ("color", "red")],
        );
        scene.current_file = Some(format!("{}/work/car.v001.vpb", root).into());

        let mut tree = ItemTree::new(ItemKind::Session, "car.v001.vpb");
        let group = tree.create_item(tree.root(), ItemKind::MetadataSetGroup, "Metadata Sets");
        let item = tree.create_item(group, ItemKind::MetadataSet, "Trims");
        tree.set_property(item, props::METADATA_SET_ID, set_id);

        let env: HashMap<String, String> = HashMap::new();
        let entity = EntityContext {
            entity: Some(EntityRef::new("Asset", 900, "car")),
            ..Default::default()
        };
        let mut tracker = LocalTracker::new();
        let plugin = MetadataSetPlugin::new(
            "sets".into(),
            MetadataSetPluginSettings {
                publish_template: Some("set_pub".into()),
                ..Default::default()
            },
        );
        let mut ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        plugin.validate(&ctx, &mut tree, item, &tracker).unwrap();
        plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();
        plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();

        let assets = &tracker.ledger().assets;
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].asset_type.as_deref(), Some("Trim Set"));
        let second = &tracker.publishes()[1];
        assert_eq!(second.request.version_number, Some(2));
        assert_eq!(second.request.context.entity.as_ref().map(|e| e.id), Some(assets[0].id));
        assert!(dir.path().join("sets/Trims/Trims.v002.json").exists());
    }

    #[test]
    fn test_missing_set_is_blocking() {
        let mut scene = MemoryScene::default();
        scene.current_file = Some("/w/car.v001.vpb".into());
        let yaml = "keys:\n  name: {type: str}\npaths:\n  set_pub: '/p/{name}.json'\n";
        let config: TemplateConfig = serde_yaml::from_str(yaml).unwrap();
        let templates = TemplateRegistry::from_config(&config).unwrap();
        let env: HashMap<String, String> = HashMap::new();
        let entity = EntityContext::default();
        let ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let mut tree = ItemTree::new(ItemKind::Session, "car");
        let item = tree.create_item(tree.root(), ItemKind::MetadataSet, "Trims");

        let plugin = MetadataSetPlugin::new(
            "sets".into(),
            MetadataSetPluginSettings {
                publish_template: Some("set_pub".into()),
                ..Default::default()
            },
        );
        let err = plugin
            .validate(&ctx, &mut tree, item, &LocalTracker::new())
            .unwrap_err();
        assert!(matches!(err, PublishError::Blocking { .. }));
    }
}
