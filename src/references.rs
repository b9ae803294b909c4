//! References - storage root reconciliation and scene reference scans

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::host::{HostContext, HostError, HostFeature, MetadataSet, ObjectId, V2Object};

/// Root-node metadata key holding the storage root references were authored against.
pub const STORAGE_ROOT_KEY: &str = "local_storage_root";
/// Root-node metadata key naming the environment variable that resolves the root.
pub const STORAGE_ENV_KEY: &str = "local_storage_env";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    SourceReference,
    SmartReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewrittenPath {
    pub reference: ObjectId,
    pub kind: ReferenceKind,
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRootUpdate {
    pub env_var: String,
    pub old_root: String,
    pub new_root: String,
    pub rewritten: Vec<RewrittenPath>,
    /// Reference paths that did not start with the stored root.
    pub untouched: Vec<String>,
}

/// Repoint reference paths when the scene was authored against another storage root.
///
/// Returns `None` when nothing needed to change. Only paths starting with
/// the exact stored root string are rewritten.
pub fn resolve_local_storage_root(
    host: &mut HostContext<'_>,
) -> Result<Option<StorageRootUpdate>, HostError> {
    if !host.supports(HostFeature::Metadata) {
        debug!("host has no metadata service, skipping storage root check");
        return Ok(None);
    }
    host.require(HostFeature::References)?;

    let root = host.scene().root_node().0;
    let meta = host.scene().object_metadata(root)?;
    let (Some(old_root), Some(env_var)) = (meta.get(STORAGE_ROOT_KEY), meta.get(STORAGE_ENV_KEY))
    else {
        return Ok(None);
    };
    let Some(new_root) = host.env().var(env_var) else {
        warn!(env_var = env_var.as_str(), "storage root variable is not set");
        return Ok(None);
    };
    if &new_root == old_root {
        return Ok(None);
    }

    let mut rewritten = vec![];
    let mut untouched = vec![];
    for reference in host.scene().scene_references()? {
        let candidates = [
            (ReferenceKind::SmartReference, reference.smart_path),
            (ReferenceKind::SourceReference, reference.source_path),
        ];
        for (kind, path) in candidates {
            let Some(path) = path else { continue };
            let Some(rest) = path.strip_prefix(old_root.as_str()) else {
                untouched.push(path);
                continue;
            };
            let new_path = format!("{}{}", new_root, rest);
            match kind {
                ReferenceKind::SmartReference => {
                    host.scene_mut().set_smart_path(reference.id, &new_path)?
                }
                ReferenceKind::SourceReference => {
                    host.scene_mut().set_source_path(reference.id, &new_path)?
                }
            }
            rewritten.push(RewrittenPath {
                reference: reference.id,
                kind,
                old_path: path,
                new_path,
            });
        }
    }

    host.scene_mut()
        .set_object_metadata(root, STORAGE_ROOT_KEY, &new_root)?;
    info!(
        old_root = old_root.as_str(),
        new_root = new_root.as_str(),
        rewritten = rewritten.len(),
        "storage root updated"
    );

    Ok(Some(StorageRootUpdate {
        env_var: env_var.clone(),
        old_root: old_root.clone(),
        new_root,
        rewritten,
        untouched,
    }))
}

/// A material node whose material carries the pipeline marker set.
#[derive(Debug, Clone)]
pub struct TrackedMaterial {
    pub node: V2Object,
    pub material: V2Object,
    pub name: String,
    pub marker: MetadataSet,
}

/// Material nodes whose material was previously published.
pub fn tracked_material_nodes(host: &HostContext<'_>) -> Result<Vec<TrackedMaterial>, HostError> {
    host.require(HostFeature::Metadata)?;
    let scene = host.scene();
    let mut found = vec![];
    for node in scene.material_nodes()? {
        let Some(material) = scene.node_material(&node)? else {
            continue;
        };
        if let Some(marker) = host.marker_set(material.id)? {
            found.push(TrackedMaterial {
                node,
                material,
                name: scene.object_name(&material)?,
                marker,
            });
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneReference {
    pub node: String,
    pub kind: ReferenceKind,
    pub path: String,
}

/// Top-level references with their current path. Source paths win over smart paths.
pub fn scan_references(host: &HostContext<'_>) -> Result<Vec<SceneReference>, HostError> {
    host.require(HostFeature::References)?;
    let mut refs = vec![];
    for reference in host.scene().scene_references()? {
        if reference.parent_reference.is_some() {
            continue;
        }
        let entry = match (reference.source_path, reference.smart_path) {
            (Some(path), _) => (ReferenceKind::SourceReference, path),
            (None, Some(path)) => (ReferenceKind::SmartReference, path),
            (None, None) => continue,
        };
        refs.push(SceneReference {
            node: reference.name,
            kind: entry.0,
            path: entry.1,
        });
    }
    Ok(refs)
}

/// Point each named reference at its new path. Source references are also
/// renamed after the new file's stem.
pub fn update_references(
    host: &mut HostContext<'_>,
    updates: &[SceneReference],
) -> Result<(), HostError> {
    host.require(HostFeature::References)?;
    for update in updates {
        let reference = host
            .scene()
            .scene_references()?
            .into_iter()
            .find(|r| r.name == update.node)
            .ok_or_else(|| HostError::NotFound(format!("reference node '{}'", update.node)))?;

        match update.kind {
            ReferenceKind::SourceReference => {
                host.scene_mut().set_source_path(reference.id, &update.path)?;
                let stem = Path::new(&update.path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| update.node.clone());
                let object = host.scene().object(reference.id)?;
                host.scene_mut().set_object_name(&object, &stem)?;
            }
            ReferenceKind::SmartReference => {
                host.scene_mut().set_smart_path(reference.id, &update.path)?;
            }
        }
        debug!(node = update.node.as_str(), path = update.path.as_str(), "reference updated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NodeKind, SceneHost, MARKER_SET_NAME};
    use crate::memory::MemoryScene;
    use std::collections::HashMap;

    #[test]
    fn test_scan_prefers_source_and_skips_nested() {
        let mut scene = MemoryScene::default();
        let root = scene.root_node().0;
        let outer = scene.add_reference(root, "wheel", Some("/a/wheel.vpb"), Some("/a/wheel.osb"), None);
        scene.add_reference(outer, "bolt", Some("/a/bolt.vpb"), None, Some(outer));
        scene.add_reference(root, "seat", Some("/a/seat.vpb"), None, None);

        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let refs = scan_references(&host).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, ReferenceKind::SourceReference);
        assert_eq!(refs[0].path, "/a/wheel.osb");
        assert_eq!(refs[1].kind, ReferenceKind::SmartReference);
    }

    #[test]
    fn test_update_renames_source_reference() {
        let mut scene = MemoryScene::default();
        let root = scene.root_node().0;
        let id = scene.add_reference(root, "wheel_v1", None, Some("/a/wheel_v1.osb"), None);

        let env: HashMap<String, String> = HashMap::new();
        let mut host = HostContext::new(&mut scene, &env);
        update_references(
            &mut host,
            &[SceneReference {
                node: "wheel_v1".into(),
                kind: ReferenceKind::SourceReference,
                path: "/a/wheel_v2.osb".into(),
            }],
        )
        .unwrap();

        assert_eq!(scene.node(id).unwrap().name, "wheel_v2");
        assert_eq!(scene.reference(id).unwrap().source_path.as_deref(), Some("/a/wheel_v2.osb"));
    }

    #[test]
    fn test_tracked_materials_need_marker_set() {
        let mut scene = MemoryScene::default();
        let root = scene.root_node().0;
        let paint = scene.add_material("Paint");
        let glass = scene.add_material("Glass");
        scene.add_material_node(root, paint, "Paint");
        scene.add_material_node(root, glass, "Glass");
        scene.add_metadata_set(MARKER_SET_NAME, &[paint], &[("SG_name", "Paint")]);
        assert_eq!(scene.node(paint).unwrap().kind, NodeKind::Material);

        let env: HashMap<String, String> = HashMap::new();
        let host = HostContext::new(&mut scene, &env);
        let found = tracked_material_nodes(&host).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Paint");
    }
}
