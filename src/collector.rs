//! Collector - builds the item tree from the open session
//!
//! The session item is the root. Renders, top-level geometry, marked
//! materials and metadata hang below it. Sub-collectors fail independently.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CollectorSettings;
use crate::host::{scene_nodes, HostContext, HostError, HostFeature, NodeKind};
use crate::item::{props, ItemId, ItemKind, ItemTree};
use crate::references::tracked_material_nodes;
use crate::templates::{normalize_path, TemplateRegistry};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("The current session has never been saved. Save it before publishing.")]
    NoCurrentFile,

    #[error("No render output is configured for this session")]
    NoRenderOutput,

    #[error("Render folder does not exist: {0}")]
    MissingRenderFolder(String),

    #[error("Invalid render pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Root item for the saved session.
pub fn collect_session(
    host: &HostContext<'_>,
    registry: &TemplateRegistry,
    settings: &CollectorSettings,
) -> Result<ItemTree, CollectError> {
    let path = host.scene().current_file().ok_or(CollectError::NoCurrentFile)?;
    let mut tree = ItemTree::new(ItemKind::Session, &file_name(&path));
    let root = tree.root();
    tree.set_property(root, props::PATH, normalize_path(&path));

    if let Some(name) = settings.work_template.as_deref() {
        if registry.get(name).is_some() {
            tree.set_property(root, props::WORK_TEMPLATE, name);
            debug!(template = name, "work template defined for session collection");
        } else {
            warn!(template = name, "work template is not defined, ignoring");
        }
    }

    info!(path = %path.display(), "collected current session");
    Ok(tree)
}

#[derive(Debug, Default)]
struct RenderGroup {
    aov: Option<String>,
    frames: Vec<PathBuf>,
}

fn render_pattern(base: &str, extensions: &[String]) -> Result<Regex, regex::Error> {
    let exts: Vec<String> = extensions.iter().map(|e| regex::escape(e)).collect();
    Regex::new(&format!(
        r"(?i)^{}(?:-(?P<aov>[^\d.][^.]*?))?(?:-(?P<frame>\d+))?\.(?P<ext>{})$",
        regex::escape(base),
        exts.join("|")
    ))
}

/// Image items for the files next to the host's render output.
///
/// Frame-numbered files collapse into one item per sequence, keyed by the
/// file name with the frame run replaced by `*`. Returns the number of
/// items created.
pub fn collect_renders(
    host: &HostContext<'_>,
    tree: &mut ItemTree,
    session: ItemId,
    settings: &CollectorSettings,
) -> Result<usize, CollectError> {
    let render_file = host
        .scene()
        .render_filename()
        .ok_or(CollectError::NoRenderOutput)?;
    let folder = render_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if !folder.is_dir() {
        return Err(CollectError::MissingRenderFolder(folder.display().to_string()));
    }

    let base = render_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut extensions = settings.image_extensions.clone();
    if let Some(ext) = render_file.extension() {
        extensions.insert(0, ext.to_string_lossy().into_owned());
    }
    let pattern = render_pattern(&base, &extensions)?;

    let mut groups: BTreeMap<String, RenderGroup> = BTreeMap::new();
    let mut singles: BTreeMap<String, RenderGroup> = BTreeMap::new();
    for entry in fs::read_dir(&folder)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = file_name(&path);
        let Some(caps) = pattern.captures(&name) else {
            continue;
        };
        let aov = caps.name("aov").map(|m| m.as_str().to_string());
        match caps.name("frame") {
            Some(frame) => {
                let key = format!("{}*{}", &name[..frame.start()], &name[frame.end()..]);
                let group = groups.entry(key).or_default();
                group.aov = aov;
                group.frames.push(path);
            }
            None => {
                singles.insert(
                    name,
                    RenderGroup {
                        aov,
                        frames: vec![path],
                    },
                );
            }
        }
    }

    let mut created = 0;
    for (name, mut group) in groups {
        debug!(sequence = name.as_str(), frames = group.frames.len(), "render sequence");
        group.frames.sort();
        let paths: Vec<Value> = group
            .frames
            .iter()
            .map(|p| Value::String(normalize_path(p)))
            .collect();
        let item = tree.create_item(session, ItemKind::Image, &name);
        tree.item_mut(item).thumbnail_path = group.frames.first().cloned();
        tree.set_property(item, props::SEQUENCE_PATHS, paths);
        tree.set_property(item, props::AOV_NAME, group.aov.map_or(Value::Null, Value::String));
        created += 1;
    }
    for (name, group) in singles {
        let item = tree.create_item(session, ItemKind::Image, &name);
        let path = &group.frames[0];
        tree.item_mut(item).thumbnail_path = Some(path.clone());
        tree.set_property(item, props::PATH, normalize_path(path));
        tree.set_property(item, props::AOV_NAME, group.aov.map_or(Value::Null, Value::String));
        created += 1;
    }

    info!(folder = %folder.display(), items = created, "collected renders");
    Ok(created)
}

/// One item per top-level geometry node.
pub fn collect_geometry(
    host: &HostContext<'_>,
    tree: &mut ItemTree,
    session: ItemId,
) -> Result<usize, CollectError> {
    let scene = host.scene();
    let geometry_type = NodeKind::Geometry.v1_type_name();
    let mut created = 0;
    for node in scene.v1_children(scene.root_node())? {
        if scene.v1_type_name(node)? != geometry_type {
            continue;
        }
        let item = tree.create_item(session, ItemKind::Geometry, &scene.v1_name(node)?);
        tree.set_property(item, props::NODE_ID, node.0);
        created += 1;
    }
    debug!(items = created, "collected geometry");
    Ok(created)
}

/// Previously published materials under a "Materials" group item.
pub fn collect_materials(
    host: &HostContext<'_>,
    tree: &mut ItemTree,
    parent: ItemId,
) -> Result<usize, CollectError> {
    let materials = tracked_material_nodes(host)?;
    if materials.is_empty() {
        return Ok(0);
    }

    let group = tree.create_item(parent, ItemKind::MaterialGroup, "Materials");
    for tracked in &materials {
        let item = tree.create_item(group, ItemKind::Material, &tracked.name);
        tree.set_property(item, props::NODE_ID, tracked.node.id);
        tree.set_property(item, props::MATERIAL_ID, tracked.material.id);

        let path = match tracked.marker.marker_value("path") {
            Some(Value::Object(map)) => map.get("local_path").cloned(),
            other => other,
        };
        if let Some(path) = path.filter(|p| !p.is_null()) {
            tree.set_property(item, props::PATH, path);
        }
        if let Some(entity) = tracked.marker.marker_value("entity") {
            tree.set_property(item, props::MATERIAL_ENTITY, entity);
        }
        if let Some(task) = tracked.marker.marker_value("task") {
            tree.set_property(item, props::MATERIAL_TASK, task);
        }
    }
    info!(items = materials.len(), "collected materials");
    Ok(materials.len())
}

/// Scene metadata item plus one item per user metadata set.
pub fn collect_metadata(
    host: &HostContext<'_>,
    tree: &mut ItemTree,
    session: ItemId,
) -> Result<usize, CollectError> {
    if !host.supports(HostFeature::Metadata) {
        debug!("host has no metadata service, skipping metadata collection");
        return Ok(0);
    }
    let scene = host.scene();
    let mut created = 0;

    let mut has_metadata = false;
    for node in scene_nodes(scene)? {
        if !scene.object_metadata(node.0)?.is_empty() {
            has_metadata = true;
            break;
        }
    }
    if has_metadata {
        tree.create_item(session, ItemKind::Metadata, "Scene Metadata");
        created += 1;
    }

    let sets: Vec<_> = scene
        .metadata_sets()?
        .into_iter()
        .filter(|s| !s.is_marker())
        .collect();
    if !sets.is_empty() {
        let group = tree.create_item(session, ItemKind::MetadataSetGroup, "Metadata Sets");
        for set in sets {
            let item = tree.create_item(group, ItemKind::MetadataSet, &set.name);
            tree.set_property(item, props::METADATA_SET_ID, set.id);
            created += 1;
        }
    }
    debug!(items = created, "collected metadata");
    Ok(created)
}

/// Full collection pass. Only a missing session file is fatal.
pub fn collect_current_session(
    host: &HostContext<'_>,
    registry: &TemplateRegistry,
    settings: &CollectorSettings,
) -> Result<ItemTree, CollectError> {
    let mut tree = collect_session(host, registry, settings)?;
    let session = tree.root();

    if let Err(e) = collect_renders(host, &mut tree, session, settings) {
        warn!(error = %e, "skipping render collection");
    }
    if let Err(e) = collect_geometry(host, &mut tree, session) {
        warn!(error = %e, "skipping geometry collection");
    }
    if let Err(e) = collect_materials(host, &mut tree, session) {
        warn!(error = %e, "skipping material collection");
    }
    if let Err(e) = collect_metadata(host, &mut tree, session) {
        warn!(error = %e, "skipping metadata collection");
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SceneHost, MARKER_SET_NAME};
    use crate::memory::MemoryScene;
    use std::collections::HashMap;

    #[test]
    fn test_unsaved_session_is_blocking() {
        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let err = collect_session(&host, &TemplateRegistry::new(), &CollectorSettings::default());
        assert!(matches!(err, Err(CollectError::NoCurrentFile)));
    }

    #[test]
    fn test_single_images_and_sequences() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["car.png", "car-0001.png", "car-0002.png", "car-depth.png", "other.png"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let mut scene = MemoryScene::default();
        scene.current_file = Some(dir.path().join("car.vpb"));
        scene.render_filename = Some(dir.path().join("car.png"));

        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let settings = CollectorSettings::default();
        let mut tree = collect_session(&host, &TemplateRegistry::new(), &settings).unwrap();
        let root = tree.root();
        let created = collect_renders(&host, &mut tree, root, &settings).unwrap();
        assert_eq!(created, 3);

        let seq = tree.find_child(root, ItemKind::Image).unwrap();
        assert_eq!(tree.item(seq).name, "car-*.png");
        let depth = tree
            .children(root)
            .iter()
            .copied()
            .find(|c| tree.item(*c).name == "car-depth.png")
            .unwrap();
        assert_eq!(tree.get_str(depth, props::AOV_NAME), Some("depth"));
    }

    #[test]
    fn test_missing_render_folder_is_skipped() {
        let mut scene = MemoryScene::default();
        scene.current_file = Some(PathBuf::from("/tmp/car.vpb"));
        scene.render_filename = Some(PathBuf::from("/does/not/exist/car.png"));
        let root = scene.root_node().0;
        scene.add_node(root, NodeKind::Geometry, "Body");

        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let tree =
            collect_current_session(&host, &TemplateRegistry::new(), &CollectorSettings::default())
                .unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.item(tree.children(tree.root())[0]).kind, ItemKind::Geometry);
    }

    #[test]
    fn test_marked_materials_are_grouped() {
        let mut scene = MemoryScene::default();
        scene.current_file = Some(PathBuf::from("/tmp/car.vpb"));
        let root = scene.root_node().0;
        let paint = scene.add_material("Paint");
        let node = scene.add_material_node(root, paint, "Paint");
        scene.add_metadata_set(
            MARKER_SET_NAME,
            &[paint],
            &[("SG_path", r#"{"local_path": "/pub/Paint.osb"}"#)],
        );
        scene.add_metadata_set("Specs", &[node], &[("color", "red")]);

        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let mut tree = ItemTree::new(ItemKind::Session, "car.vpb");
        let session = tree.root();
        assert_eq!(collect_materials(&host, &mut tree, session).unwrap(), 1);
        assert_eq!(collect_metadata(&host, &mut tree, session).unwrap(), 1);

        let group = tree.find_child(session, ItemKind::MaterialGroup).unwrap();
        let material = tree.children(group)[0];
        assert_eq!(tree.get_str(material, props::PATH), Some("/pub/Paint.osb"));
        assert_eq!(tree.get_u64(material, props::MATERIAL_ID), Some(paint));
        assert!(tree.find_child(session, ItemKind::MetadataSetGroup).is_some());
    }
}
