//! Geometry plugin - exports a top-level geometry node to its own file

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::{
    ensure_parent_dir, register_publish, required_template, session_path, work_template,
    AcceptResult, PublishError, PublishPlugin, Registration, RunContext,
};
use crate::host::{HostContext, NodeKind, ObjectId};
use crate::item::{props, ItemId, ItemTree};
use crate::templates::{normalize_path, FieldValue, Template, VERSION_KEY};
use crate::tracker::{TrackerRead, TrackingBackend};

pub const GEOMETRY_PUBLISH_TYPE: &str = "Scene Geometry";
/// Template field receiving the exported node's name.
pub const NODE_NAME_KEY: &str = "nodeName";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryPluginSettings {
    pub publish_template: Option<String>,
    /// Overrides the work template recorded by the collector.
    pub work_template: Option<String>,
    pub publish_type: Option<String>,
}

pub struct GeometryPlugin {
    name: String,
    settings: GeometryPluginSettings,
}

impl GeometryPlugin {
    pub fn new(name: String, settings: GeometryPluginSettings) -> Self {
        Self { name, settings }
    }

    fn templates<'r>(
        &self,
        ctx: &RunContext<'r>,
        tree: &ItemTree,
        item: ItemId,
    ) -> Result<(&'r Template, &'r Template), PublishError> {
        let publish = required_template(
            ctx.templates,
            self.settings.publish_template.as_deref(),
            "publish template",
        )?;
        let work = match self.settings.work_template.as_deref() {
            Some(name) => required_template(ctx.templates, Some(name), "work template")?,
            None => work_template(ctx.templates, tree, item)?,
        };
        Ok((work, publish))
    }
}

/// Publish path of `node_name` for the session at `session_path`.
pub fn geometry_target(
    work: &Template,
    publish: &Template,
    session_path: &str,
    node_name: &str,
) -> Result<(String, Option<u64>), PublishError> {
    if !work.validate(session_path) {
        return Err(PublishError::blocking(format!(
            "Work file '{}' did not match work template '{}'.",
            session_path,
            work.name()
        )));
    }
    let mut fields = work.parse(session_path)?;
    fields.insert(NODE_NAME_KEY.to_string(), FieldValue::from(node_name));
    let version = fields.get(VERSION_KEY).and_then(FieldValue::as_int);
    Ok((publish.render(&fields)?, version))
}

/// Save the top-level geometry node matching both name and id to `target`.
pub fn export_geometry(
    host: &mut HostContext<'_>,
    node_name: &str,
    node_id: ObjectId,
    target: &Path,
) -> Result<(), PublishError> {
    let node = host
        .find_top_level_node(NodeKind::Geometry.v1_type_name(), node_name, node_id)?
        .ok_or_else(|| PublishError::NotFound(format!("Failed to get node {}", node_name)))?;
    ensure_parent_dir(target)?;
    host.scene_mut().save_geometry(node, target)?;
    debug!(node = node_name, path = %target.display(), "geometry saved");
    Ok(())
}

impl PublishPlugin for GeometryPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.geometry"]
    }

    fn accept(
        &self,
        _ctx: &RunContext<'_>,
        _tree: &ItemTree,
        _item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        Ok(AcceptResult::accepted().unchecked().hidden())
    }

    fn validate(
        &self,
        ctx: &RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        _tracker: &dyn TrackerRead,
    ) -> Result<(), PublishError> {
        let (work, publish) = self.templates(ctx, tree, item)?;
        let session = normalize_path(&session_path(ctx, tree)?);
        let node_name = tree.item(item).name.clone();
        let (target, version) = geometry_target(work, publish, &session, &node_name)?;
        if Path::new(&target).exists() {
            return Err(PublishError::blocking(format!(
                "The geometry file already exists on disk: {}",
                target
            )));
        }

        tree.set_property(item, props::PUBLISH_TEMPLATE, publish.name());
        tree.set_local_property(item, props::PUBLISH_PATH, target.as_str());
        if let Some(version) = version {
            tree.set_local_property(item, props::PUBLISH_VERSION, version);
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
        let target = tree
            .get_str(item, props::PUBLISH_PATH)
            .map(str::to_string)
            .ok_or_else(|| PublishError::blocking("The geometry item has not been validated."))?;
        let node_id = tree
            .get_u64(item, props::NODE_ID)
            .ok_or_else(|| PublishError::NotFound(format!("node id of {}", tree.item(item).name)))?;
        let node_name = tree.item(item).name.clone();
        export_geometry(&mut ctx.host, &node_name, node_id, Path::new(&target))?;
        info!(node = node_name.as_str(), path = target.as_str(), "geometry exported");

        let name = Path::new(&target)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| node_name.clone());
        let publish_type = self
            .settings
            .publish_type
            .as_deref()
            .unwrap_or(GEOMETRY_PUBLISH_TYPE);
        let version = tree.get_u64(item, props::PUBLISH_VERSION);
        register_publish(
            ctx,
            tree,
            item,
            tracker,
            Registration::new(target, name, publish_type).version(version),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SceneHost;
    use crate::item::ItemKind;
    use crate::memory::MemoryScene;
    use crate::templates::{TemplateConfig, TemplateRegistry};
    use crate::tracker::{EntityContext, LocalTracker};
    use std::collections::HashMap;

    #[test]
    fn test_geometry_export_and_register() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let yaml = format!(
            "roots: {{primary: '{}'}}\nkeys:\n  name: {{type: str}}\n  nodeName: {{type: str}}\n  version: {{type: int, format_spec: '03'}}\npaths:\n  work: 'work/{{name}}.v{{version}}.vpb'\n  geo: 'publish/geo/{{name}}_{{nodeName}}.v{{version}}.osb'\n",
            root
        );
        let config: TemplateConfig = serde_yaml::from_str(&yaml).unwrap();
        let templates = TemplateRegistry::from_config(&config).unwrap();

        let mut scene = MemoryScene::default();
        let scene_root = scene.root_node().0;
        let body = scene.add_node(scene_root, NodeKind::Geometry, "Body");
        let session = format!("{}/work/car.v002.vpb", root);
        scene.current_file = Some(session.clone().into());

        let mut tree = ItemTree::new(ItemKind::Session, "car.v002.vpb");
        let session_item = tree.root();
        tree.set_property(session_item, props::PATH, session.as_str());
        tree.set_property(session_item, props::WORK_TEMPLATE, "work");
        let item = tree.create_item(session_item, ItemKind::Geometry, "Body");
        tree.set_property(item, props::NODE_ID, body);

        let env: HashMap<String, String> = HashMap::new();
        let entity = EntityContext::default();
        let mut tracker = LocalTracker::new();
        let plugin = GeometryPlugin::new(
            "geo".into(),
            GeometryPluginSettings {
                publish_template: Some("geo".into()),
                ..Default::default()
            },
        );
        let mut ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        plugin.validate(&ctx, &mut tree, item, &tracker).unwrap();
        plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();

        let record = &tracker.publishes()[0];
        assert_eq!(record.request.path, format!("{}/publish/geo/car_Body.v002.osb", root));
        assert_eq!(record.request.version_number, Some(2));
        assert!(dir.path().join("publish/geo/car_Body.v002.osb").exists());
    }

    #[test]
    fn test_missing_publish_template_is_blocking() {
        let mut scene = MemoryScene::default();
        scene.current_file = Some("/w/car.v001.vpb".into());
        let env: HashMap<String, String> = HashMap::new();
        let templates = TemplateRegistry::new();
        let entity = EntityContext::default();
        let ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let mut tree = ItemTree::new(ItemKind::Session, "car");
        let item = tree.create_item(tree.root(), ItemKind::Geometry, "Body");

        let plugin = GeometryPlugin::new("geo".into(), Default::default());
        let err = plugin
            .validate(&ctx, &mut tree, item, &LocalTracker::new())
            .unwrap_err();
        assert!(matches!(err, PublishError::Blocking { .. }));
    }
}
