//! Session plugin - publishes the scene file itself

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{
    ensure_parent_dir, publish_name, register_publish, AcceptResult, PublishError, PublishPlugin,
    RecoveryAction, Registration, RunContext,
};
use crate::item::{props, ItemId, ItemTree};
use crate::session::{save_current_file, save_to_next_version};
use crate::templates::{normalize_path, FieldValue, VERSION_KEY};
use crate::tracker::{TrackerRead, TrackingBackend};
use crate::versioning::{next_version_on_disk, version_from_path};

pub const SCENE_PUBLISH_TYPE: &str = "Scene File";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPluginSettings {
    /// Template for the published copy. Without one the work file is published in place.
    pub publish_template: Option<String>,
    pub publish_type: Option<String>,
}

pub struct SessionPlugin {
    name: String,
    settings: SessionPluginSettings,
}

impl SessionPlugin {
    pub fn new(name: String, settings: SessionPluginSettings) -> Self {
        Self { name, settings }
    }
}

impl PublishPlugin for SessionPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session"]
    }

    fn accept(
        &self,
        ctx: &RunContext<'_>,
        _tree: &ItemTree,
        _item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        if ctx.host.scene().current_file().is_none() {
            warn!("the session has not been saved");
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
        let path = ctx.host.scene().current_file().ok_or_else(|| {
            PublishError::blocking_with("The session has not been saved.", RecoveryAction::save_as())
        })?;
        let path = normalize_path(&path);

        let work_template = match tree.get_recursive_as::<String>(item, props::WORK_TEMPLATE) {
            Some(name) => Some(ctx.templates.require(&name)?),
            None => None,
        };

        let mut version = version_from_path(&path);
        if let Some(template) = work_template {
            if !template.validate(&path) {
                return Err(PublishError::blocking_with(
                    "The current session does not match the configured work file template.",
                    RecoveryAction::save_file(),
                ));
            }
            debug!("work template configured and matches session file");

            let fields = template.parse(&path)?;
            version = fields.get(VERSION_KEY).and_then(FieldValue::as_int);
            if let Some(current) = version {
                let mut next = fields.clone();
                next.insert(VERSION_KEY.to_string(), FieldValue::Int(current + 1));
                if Path::new(&template.render(&next)?).exists() {
                    let free = next_version_on_disk(template, &path)?;
                    return Err(PublishError::blocking_with(
                        "The next version of this file already exists on disk.",
                        RecoveryAction::save_to_version(&free.path, free.version.unwrap_or(current + 1)),
                    ));
                }
            }
        }

        let publish_path = match self.settings.publish_template.as_deref() {
            Some(name) => {
                let publish_template = ctx.templates.require(name)?;
                let mut fields = ctx.entity.as_template_fields();
                if let Some(template) = work_template {
                    fields.extend(template.parse(&path)?);
                }
                tree.set_property(item, props::PUBLISH_TEMPLATE, name);
                publish_template.render(&fields)?
            }
            None => path.clone(),
        };
        if publish_path != path && Path::new(&publish_path).exists() {
            return Err(PublishError::blocking(format!(
                "The publish file already exists on disk: {}",
                publish_path
            )));
        }

        tree.set_property(item, props::PATH, path.as_str());
        tree.set_property(item, props::PUBLISH_PATH, publish_path.as_str());
        if let Some(version) = version {
            tree.set_property(item, props::PUBLISH_VERSION, version);
        }
        debug!(path = path.as_str(), publish_path = publish_path.as_str(), "session validated");
        Ok(())
    }

    fn publish(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<(), PublishError> {
        let path = tree
            .get_path(item, props::PATH)
            .ok_or_else(|| PublishError::blocking("The session has not been validated."))?;
        save_current_file(&mut ctx.host, &path)?;

        let publish_path = tree
            .get_str(item, props::PUBLISH_PATH)
            .map(str::to_string)
            .unwrap_or_else(|| normalize_path(&path));
        if Path::new(&publish_path) != path {
            ensure_parent_dir(Path::new(&publish_path))?;
            fs::copy(&path, &publish_path)?;
            info!(from = %path.display(), to = publish_path.as_str(), "session copied to publish area");
        }

        let name = publish_name(ctx, tree, item, &normalize_path(&path));
        let publish_type = self
            .settings
            .publish_type
            .clone()
            .unwrap_or_else(|| SCENE_PUBLISH_TYPE.to_string());
        let version = tree.get_u64(item, props::PUBLISH_VERSION);
        register_publish(
            ctx,
            tree,
            item,
            tracker,
            Registration::new(publish_path, name, &publish_type).version(version),
        )?;
        Ok(())
    }

    fn finalize(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
    ) -> Result<(), PublishError> {
        let Some(path) = tree.get_path(item, props::PATH) else {
            return Ok(());
        };
        let work_template = tree.get_recursive_as::<String>(item, props::WORK_TEMPLATE);
        let templates = ctx.templates;
        if let Some(bump) = save_to_next_version(&mut ctx.host, templates, work_template.as_deref(), &path)? {
            info!(path = bump.path.as_str(), "session versioned up");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;
    use crate::memory::MemoryScene;
    use crate::plugins::RecoveryKind;
    use crate::templates::{TemplateConfig, TemplateRegistry};
    use crate::tracker::{EntityContext, LocalTracker};
    use std::collections::HashMap;

    fn registry(root: &str) -> TemplateRegistry {
        let yaml = format!(
            "roots: {{primary: '{}'}}\nkeys:\n  name: {{type: str}}\n  version: {{type: int, format_spec: '03'}}\npaths:\n  work: 'work/{{name}}.v{{version}}.vpb'\n  publish: 'publish/{{name}}.v{{version}}.vpb'\n",
            root
        );
        let config: TemplateConfig = serde_yaml::from_str(&yaml).unwrap();
        TemplateRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn test_unsaved_session_offers_save_as() {
        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let templates = TemplateRegistry::new();
        let entity = EntityContext::default();
        let ctx = RunContext::new(crate::host::HostContext::new(&mut scene, &env), &templates, &entity);
        let mut tree = ItemTree::new(ItemKind::Session, "untitled");
        let root = tree.root();

        let plugin = SessionPlugin::new("session".into(), Default::default());
        let err = plugin
            .validate(&ctx, &mut tree, root, &LocalTracker::new())
            .unwrap_err();
        assert_eq!(err.recovery_action().unwrap().kind, RecoveryKind::SaveAs);
    }

    #[test]
    fn test_existing_next_version_blocks_with_free_slot() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        fs::create_dir_all(dir.path().join("work")).unwrap();
        for v in ["001", "002", "003"] {
            fs::write(dir.path().join(format!("work/car.v{}.vpb", v)), b"").unwrap();
        }

        let mut scene = MemoryScene::default();
        scene.current_file = Some(dir.path().join("work/car.v001.vpb"));
        let env: HashMap<String, String> = HashMap::new();
        let templates = registry(&root);
        let entity = EntityContext::default();
        let ctx = RunContext::new(crate::host::HostContext::new(&mut scene, &env), &templates, &entity);
        let mut tree = ItemTree::new(ItemKind::Session, "car.v001.vpb");
        let item = tree.root();
        tree.set_property(item, props::WORK_TEMPLATE, "work");

        let plugin = SessionPlugin::new("session".into(), Default::default());
        let err = plugin
            .validate(&ctx, &mut tree, item, &LocalTracker::new())
            .unwrap_err();
        let action = err.recovery_action().unwrap();
        assert_eq!(action.label, "Save to v4");
        assert_eq!(
            action.kind,
            RecoveryKind::SaveToPath {
                path: format!("{}/work/car.v004.vpb", root)
            }
        );
    }

    #[test]
    fn test_publish_copies_and_versions_up() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let work = dir.path().join("work/car.v001.vpb");

        let mut scene = MemoryScene::default();
        scene.current_file = Some(work.clone());
        let env: HashMap<String, String> = HashMap::new();
        let templates = registry(&root);
        let entity = EntityContext::default();
        let mut tracker = LocalTracker::new();
        let mut tree = ItemTree::new(ItemKind::Session, "car.v001.vpb");
        let item = tree.root();
        tree.set_property(item, props::WORK_TEMPLATE, "work");

        let plugin = SessionPlugin::new(
            "session".into(),
            SessionPluginSettings {
                publish_template: Some("publish".into()),
                publish_type: None,
            },
        );
        {
            let mut ctx =
                RunContext::new(crate::host::HostContext::new(&mut scene, &env), &templates, &entity);
            plugin.validate(&ctx, &mut tree, item, &tracker).unwrap();
            plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();
            plugin.finalize(&mut ctx, &mut tree, item).unwrap();
        }

        let record = &tracker.publishes()[0];
        assert_eq!(record.request.path, format!("{}/publish/car.v001.vpb", root));
        assert_eq!(record.request.name, "car.vpb");
        assert_eq!(record.request.version_number, Some(1));
        assert!(dir.path().join("publish/car.v001.vpb").exists());
        assert!(dir.path().join("work/car.v002.vpb").exists());
    }
}
