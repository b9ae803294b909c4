//! Upload version plugin - sends a single rendered image for review

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::{AcceptResult, PublishError, PublishPlugin, RunContext};
use crate::item::{props, ItemId, ItemTree};
use crate::plugins::lmv::UPLOADED_MOVIE_FIELD;
use crate::tracker::{PublishRecord, TrackerRead, TrackingBackend, VersionRequest};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadVersionPluginSettings {
    /// Also attach the image as the thumbnail of the linked publish.
    pub upload_thumbnail: bool,
}

pub struct UploadVersionPlugin {
    name: String,
    settings: UploadVersionPluginSettings,
}

impl UploadVersionPlugin {
    pub fn new(name: String, settings: UploadVersionPluginSettings) -> Self {
        Self { name, settings }
    }
}

fn image_path(tree: &ItemTree, item: ItemId) -> Result<String, PublishError> {
    tree.get_str(item, props::PATH)
        .map(str::to_string)
        .ok_or_else(|| PublishError::blocking("The image item has no path to upload."))
}

impl PublishPlugin for UploadVersionPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session.image"]
    }

    fn accept(
        &self,
        _ctx: &RunContext<'_>,
        tree: &ItemTree,
        item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        if tree.get_property(item, props::SEQUENCE_PATHS).is_some() {
            return Ok(AcceptResult::rejected());
        }
        Ok(AcceptResult::accepted())
    }

    fn validate(
        &self,
        _ctx: &RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        _tracker: &dyn TrackerRead,
    ) -> Result<(), PublishError> {
        let path = image_path(tree, item)?;
        if !Path::new(&path).is_file() {
            return Err(PublishError::NotFound(path));
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
        let path = image_path(tree, item)?;
        let code = Path::new(&path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| tree.item(item).name.clone());
        // the image's own publish, when a rendering plugin ran first
        let linked = tree.get_as::<PublishRecord>(item, props::PUBLISH_DATA);

        let version = tracker.create_version(VersionRequest {
            code,
            description: tree.item(item).description.clone(),
            context: ctx.entity.clone(),
            published_files: linked.iter().map(|record| record.id).collect(),
            path_to_frames: Some(path.clone()),
        })?;
        tracker.upload_to_version(version.id, UPLOADED_MOVIE_FIELD, Path::new(&path))?;
        if let (true, Some(record)) = (self.settings.upload_thumbnail, &linked) {
            tracker.upload_thumbnail(record.id, Path::new(&path))?;
        }
        tree.set_property(item, props::VERSION_DATA, serde_json::to_value(version.entity_ref())?);
        info!(version = version.id, path = path.as_str(), "image uploaded for review");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;
    use crate::item::ItemKind;
    use crate::memory::MemoryScene;
    use crate::templates::{normalize_path, TemplateRegistry};
    use crate::tracker::{EntityContext, EntityRef, LocalTracker};
    use serde_json::Value;
    use std::collections::HashMap;

    #[test]
    fn test_sequences_are_not_uploaded() {
        let mut tree = ItemTree::new(ItemKind::Session, "car.vpb");
        let item = tree.create_item(tree.root(), ItemKind::Image, "car-*.png");
        tree.set_property(item, props::SEQUENCE_PATHS, vec![Value::from("/r/car-0001.png")]);

        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let templates = TemplateRegistry::new();
        let entity = EntityContext::default();
        let ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let plugin = UploadVersionPlugin::new("review".into(), Default::default());
        assert!(!plugin.accept(&ctx, &tree, item).unwrap().accepted);
    }

    #[test]
    fn test_single_image_becomes_version() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("car-beauty.png");
        std::fs::write(&image, b"png").unwrap();

        let mut tree = ItemTree::new(ItemKind::Session, "car.vpb");
        let item = tree.create_item(tree.root(), ItemKind::Image, "car-beauty.png");
        tree.set_property(item, props::PATH, normalize_path(&image));

        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let templates = TemplateRegistry::new();
        let entity = EntityContext::default();
        let mut tracker = LocalTracker::new();
        let mut ctx = RunContext::new(HostContext::new(&mut scene, &env), &templates, &entity);
        let plugin = UploadVersionPlugin::new("review".into(), Default::default());
        plugin.validate(&ctx, &mut tree, item, &tracker).unwrap();
        plugin.publish(&mut ctx, &mut tree, item, &mut tracker).unwrap();

        let version_ref = tree.get_as::<EntityRef>(item, props::VERSION_DATA).unwrap();
        let version = tracker.version(version_ref.id).unwrap();
        assert_eq!(version.request.code, "car-beauty");
        assert_eq!(version.uploads[UPLOADED_MOVIE_FIELD].len(), 1);
    }
}
