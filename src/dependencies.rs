//! Publish Dependencies - upstream artifacts of an item
//!
//! The set is computed once per item and cached in the item's local
//! properties, so repeated calls return the same list without rescanning.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::host::{HostContext, HostError, HostFeature, NodeKind};
use crate::item::{props, ItemId, ItemKind, ItemTree};
use crate::tracker::{PublishRecord, TrackerError, TrackerRead};

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub path: String,
    #[serde(default)]
    pub publish_id: Option<u64>,
}

/// Ordered upstream paths with their resolved publish ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencySet {
    entries: Vec<Dependency>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency; a path already present keeps its first entry.
    pub fn push(&mut self, path: impl Into<String>, publish_id: Option<u64>) {
        let path = path.into();
        if self.entries.iter().any(|d| d.path == path) {
            return;
        }
        self.entries.push(Dependency { path, publish_id });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|d| d.path.clone()).collect()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().filter_map(|d| d.publish_id).collect()
    }

    fn unresolved(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|d| d.publish_id.is_none())
            .map(|d| d.path.clone())
            .collect()
    }

    fn resolve(&mut self, path: &str, id: u64) {
        for entry in self.entries.iter_mut().filter(|d| d.path == path) {
            entry.publish_id = Some(id);
        }
    }
}

/// Upstream dependencies of `item`.
///
/// Combines the parent's registered publish, the scene's top-level
/// references (session items only), and for materials the reference the
/// material was loaded from plus its measurement source file.
pub fn get_publish_dependencies(
    host: &HostContext<'_>,
    tree: &mut ItemTree,
    item: ItemId,
    tracker: &dyn TrackerRead,
) -> Result<DependencySet, DependencyError> {
    if let Some(cached) = tree
        .item(item)
        .local_properties
        .get(props::PUBLISH_DEPENDENCIES)
        .filter(|v| !v.is_null())
    {
        return Ok(serde_json::from_value(cached.clone())?);
    }

    let mut deps = DependencySet::new();

    if let Some(parent) = tree.parent(item) {
        if let Some(record) = tree.get_as::<PublishRecord>(parent, props::PUBLISH_DATA) {
            deps.push(record.request.path.clone(), Some(record.id));
        }
    }

    let scene = host.scene();
    if tree.item(item).kind == ItemKind::Session && host.supports(HostFeature::References) {
        for reference in scene.scene_references()? {
            if reference.parent_reference.is_some() {
                continue;
            }
            if let Some(path) = reference.smart_path.or(reference.source_path) {
                deps.push(path, None);
            }
        }
    }

    if tree.item(item).kind == ItemKind::Material {
        if let Some(node_id) = tree.get_u64(item, props::NODE_ID) {
            let node = scene.object(node_id)?;
            if let Some(parent) = scene.v2_parent(&node)? {
                if parent.kind == NodeKind::Reference {
                    let reference = scene
                        .scene_references()?
                        .into_iter()
                        .find(|r| r.id == parent.id);
                    if let Some(path) = reference.and_then(|r| r.smart_path) {
                        deps.push(path, None);
                    }
                }
            }
        }
        if let Some(material_id) = tree.get_u64(item, props::MATERIAL_ID) {
            let material = scene.object(material_id)?;
            if let Some(measurement) = scene.material_measurement(&material)? {
                deps.push(crate::templates::normalize_path(&measurement), None);
            }
        }
    }

    let unresolved = deps.unresolved();
    if !unresolved.is_empty() {
        for (path, record) in tracker.find_publish(&unresolved)? {
            deps.resolve(&path, record.id);
        }
    }

    debug!(item = tree.item(item).name.as_str(), count = deps.len(), "publish dependencies");
    tree.set_local_property(item, props::PUBLISH_DEPENDENCIES, serde_json::to_value(&deps)?);
    Ok(deps)
}
