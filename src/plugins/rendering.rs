//! Rendering plugin - publishes rendered images and frame sequences

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

use super::{
    ensure_parent_dir, publish_name, register_publish, AcceptResult, PublishError, PublishPlugin,
    Registration, RunContext,
};
use crate::item::{props, ItemId, ItemTree};
use crate::templates::{FieldValue, VERSION_KEY};
use crate::tracker::{TrackerRead, TrackingBackend};
use crate::versioning::version_from_path;

pub const RENDERING_PUBLISH_TYPE: &str = "Rendered Image";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingPluginSettings {
    pub image_template: Option<String>,
    pub sequence_template: Option<String>,
    pub publish_type: Option<String>,
}

/// Source and destination of every file an image item publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub copies: Vec<(String, String)>,
    /// Path registered with the tracker; the frame run of a sequence is `*`.
    pub registered_path: String,
    pub version: Option<u64>,
    pub template: Option<String>,
}

impl RenderTarget {
    pub fn in_place(&self) -> bool {
        self.copies.iter().all(|(src, dst)| src == dst)
    }
}

fn frame_regex() -> &'static Regex {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    FRAME.get_or_init(|| Regex::new(r"(\d+)(\.[^./]+)$").unwrap())
}

/// `shot-0001.png` becomes `shot-*.png`.
pub fn frame_pattern(path: &str) -> String {
    frame_regex().replace(path, "*${2}").into_owned()
}

fn source_paths(tree: &ItemTree, item: ItemId) -> Vec<String> {
    if let Some(Value::Array(frames)) = tree.get_property(item, props::SEQUENCE_PATHS) {
        return frames
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }
    tree.get_str(item, props::PATH)
        .map(|p| vec![p.to_string()])
        .unwrap_or_default()
}

pub struct RenderingPlugin {
    name: String,
    settings: RenderingPluginSettings,
}

impl RenderingPlugin {
    pub fn new(name: String, settings: RenderingPluginSettings) -> Self {
        Self { name, settings }
    }

    /// Resolve where the item's files go.
    ///
    /// With a publish template every frame is parsed by the template its
    /// path matches and rendered through the publish template. Without one
    /// the files are published where they are.
    pub fn target(
        &self,
        ctx: &RunContext<'_>,
        tree: &ItemTree,
        item: ItemId,
    ) -> Result<RenderTarget, PublishError> {
        let sources = source_paths(tree, item);
        let first = sources
            .first()
            .cloned()
            .ok_or_else(|| PublishError::blocking("The rendering item has no files to publish."))?;
        let is_sequence = tree.get_property(item, props::SEQUENCE_PATHS).is_some();
        let setting = if is_sequence {
            self.settings.sequence_template.as_deref()
        } else {
            self.settings.image_template.as_deref()
        };

        let Some(publish) = setting.map(|name| ctx.templates.require(name)).transpose()? else {
            let registered_path = if is_sequence { frame_pattern(&first) } else { first.clone() };
            return Ok(RenderTarget {
                copies: sources.iter().map(|s| (s.clone(), s.clone())).collect(),
                registered_path,
                version: version_from_path(&first),
                template: None,
            });
        };

        let work = ctx.templates.template_from_path(&first)?.ok_or_else(|| {
            PublishError::blocking(format!("The rendering file {} does not match any template.", first))
        })?;
        let mut copies = Vec::with_capacity(sources.len());
        let mut version = None;
        for source in &sources {
            let mut fields = ctx.entity.as_template_fields();
            fields.extend(work.parse(source)?);
            version = version.or_else(|| fields.get(VERSION_KEY).and_then(FieldValue::as_int));
            copies.push((source.clone(), publish.render(&fields)?));
        }
        let first_target = &copies[0].1;
        let registered_path = if is_sequence {
            frame_pattern(first_target)
        } else {
            first_target.clone()
        };
        Ok(RenderTarget {
            copies,
            registered_path,
            version,
            template: Some(publish.name().to_string()),
        })
    }
}

impl PublishPlugin for RenderingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.image"]
    }

    fn accept(
        &self,
        _ctx: &RunContext<'_>,
        _tree: &ItemTree,
        _item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
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
        if let Some(template) = &target.template {
            let session_version = tree
                .parent(item)
                .and_then(|parent| tree.get_u64(parent, props::PUBLISH_VERSION));
            if target.version != session_version {
                return Err(PublishError::blocking(
                    "Your rendering files don't have the same version number than your current work session.",
                ));
            }
            if let Some((_, taken)) = target.copies.iter().find(|(_, dst)| Path::new(dst).exists()) {
                return Err(PublishError::blocking(format!(
                    "The published rendering already exists on disk: {}",
                    taken
                )));
            }
            tree.set_local_property(item, props::PUBLISH_TEMPLATE, template.as_str());
        }

        debug!(path = target.registered_path.as_str(), files = target.copies.len(), "rendering target");
        tree.set_local_property(item, props::PUBLISH_PATH, target.registered_path.as_str());
        if let Some(version) = target.version {
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
        let target = self.target(ctx, tree, item)?;
        if !target.in_place() {
            for (source, destination) in &target.copies {
                ensure_parent_dir(Path::new(destination))?;
                fs::copy(source, destination)?;
            }
            info!(files = target.copies.len(), path = target.registered_path.as_str(), "renderings copied");
        }

        let name = publish_name(ctx, tree, item, &target.registered_path);
        let publish_type = self
            .settings
            .publish_type
            .as_deref()
            .unwrap_or(RENDERING_PUBLISH_TYPE);
        let mut registration =
            Registration::new(target.registered_path.clone(), name, publish_type).version(target.version);
        if let Some(aov) = tree.get_str(item, props::AOV_NAME) {
            registration.extra_fields.insert("aov_name".into(), Value::String(aov.to_string()));
        }
        if target.copies.len() > 1 {
            registration
                .extra_fields
                .insert("frame_count".into(), Value::from(target.copies.len()));
        }
        register_publish(ctx, tree, item, tracker, registration)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;
    use crate::item::ItemKind;
    use crate::memory::MemoryScene;
    use crate::templates::{normalize_path, TemplateConfig, TemplateRegistry};
    use crate::tracker::{EntityContext, LocalTracker};
    use std::collections::HashMap;

    #[test]
    fn test_frame_pattern_replaces_last_digit_run() {
        assert_eq!(frame_pattern("/r/shot.v003-beauty-0012.png"), "/r/shot.v003-beauty-*.png");
        assert_eq!(frame_pattern("/r/still.png"), "/r/still.png");
    }

    fn templates(root: &str) -> TemplateRegistry {
        let yaml = format!(
            "roots: {{primary: '{}'}}\nkeys:\n  name: {{type: str}}\n  SEQ: {{type: int, format_spec: '04'}}\n  version: {{type: int, format_spec: '03'}}\npaths:\n  render_seq: 'renders/{{name}}.v{{version}}-{{SEQ}}.png'\n  publish_seq: 'publish/renders/{{name}}/{{name}}.v{{version}}-{{SEQ}}.png'\n",
            root
        );
        let config: TemplateConfig = serde_yaml::from_str(&yaml).unwrap();
        TemplateRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn test_sequence_publish_copies_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let templates = templates(&root);
        fs::create_dir_all(dir.path().join("renders")).unwrap();
        let frames: Vec<Value> = (1..=3)
            .map(|f| {
                let path = dir.path().join(format!("renders/car.v002-{:04}.png", f));
                fs::write(&path, b"px").unwrap();
                Value::String(normalize_path(&path))
            })
            .collect();

        let mut tree = ItemTree::new(ItemKind::Session, "car.v002.vpb");
        let session = tree.root();
        tree.set_property(session, props::PUBLISH_VERSION, 2u64);
        let item = tree.create_item(session, ItemKind::Image, "car.v002-*.png");
        tree.set_property(item, props::SEQUENCE_PATHS, frames);

        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let entity = EntityContext::default();
        let mut tracker = LocalTracker::new();
        let plugin = RenderingPlugin::new(
            "renders".into(),
            RenderingPluginSettings {
                sequence_template: Some("publish_seq".into()),
                ..Default::default()
            },
        );
        let mut ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        plugin.validate(&ctx, &mut tree, item, &tracker).unwrap();
        plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();

        for f in 1..=3 {
            assert!(dir
                .path()
                .join(format!("publish/renders/car/car.v002-{:04}.png", f))
                .exists());
        }
        let record = &tracker.publishes()[0];
        assert_eq!(
            record.request.path,
            format!("{}/publish/renders/car/car.v002-*.png", root)
        );
        assert_eq!(record.request.version_number, Some(2));
    }

    #[test]
    fn test_version_mismatch_with_session_is_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let templates = templates(&root);
        let frame = format!("{}/renders/car.v001-0001.png", root);

        let mut tree = ItemTree::new(ItemKind::Session, "car.v002.vpb");
        let session = tree.root();
        tree.set_property(session, props::PUBLISH_VERSION, 2u64);
        let item = tree.create_item(session, ItemKind::Image, "car.v001-*.png");
        tree.set_property(item, props::SEQUENCE_PATHS, vec![Value::String(frame)]);

        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let entity = EntityContext::default();
        let ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let plugin = RenderingPlugin::new(
            "renders".into(),
            RenderingPluginSettings {
                sequence_template: Some("publish_seq".into()),
                ..Default::default()
            },
        );
        let err = plugin
            .validate(&ctx, &mut tree, item, &LocalTracker::new())
            .unwrap_err();
        assert!(err.to_string().contains("same version number"));
    }
}
