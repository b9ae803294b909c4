//! Host Surface - Scene scripting API abstraction
//!
//! The host exposes two generations of its scripting surface at once: a
//! handle-style v1 API and an object-style v2 API. Both address the same
//! scene objects by a stable numeric id, so conversions go through that id.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type ObjectId = u64;

/// Name of the metadata set marking objects managed by the pipeline.
pub const MARKER_SET_NAME: &str = "ShotGrid";
/// Prefix applied to every key written into the marker set.
pub const MARKER_KEY_PREFIX: &str = "SG_";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{feature} requires host version {required} or newer (running {current}). Please upgrade the host application to use this feature.")]
    NotSupported {
        feature: HostFeature,
        required: Version,
        current: Version,
    },

    #[error("Scene object not found: {0}")]
    NotFound(String),

    #[error("Host operation failed: {0}")]
    Operation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Group,
    Transform,
    Geometry,
    Material,
    MaterialNode,
    Reference,
    Light,
    Camera,
    MetadataSet,
}

impl NodeKind {
    /// Type name reported by the v1 surface.
    pub fn v1_type_name(self) -> &'static str {
        match self {
            NodeKind::Group => "Group",
            NodeKind::Transform => "Transform3D",
            NodeKind::Geometry => "Geometry",
            NodeKind::Material => "Material",
            NodeKind::MaterialNode => "MaterialNode",
            NodeKind::Reference => "Reference",
            NodeKind::Light => "Light",
            NodeKind::Camera => "Camera",
            NodeKind::MetadataSet => "MetadataSet",
        }
    }
}

/// v1 pointer-style handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct V1Handle(pub ObjectId);

/// v2 object, carrying its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct V2Object {
    pub id: ObjectId,
    pub kind: NodeKind,
}

/// A scene object expressed in either API generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRef {
    V1(V1Handle),
    V2(V2Object),
}

impl HostRef {
    pub fn id(&self) -> ObjectId {
        match self {
            HostRef::V1(h) => h.0,
            HostRef::V2(o) => o.id,
        }
    }

    pub fn to_v1(&self) -> V1Handle {
        V1Handle(self.id())
    }

    /// Hosts older than the object API cannot hand out v2 objects.
    pub fn to_v2(&self, scene: &dyn SceneHost) -> Result<V2Object, HostError> {
        match self {
            HostRef::V1(h) => {
                let current = scene.host_version();
                let required = HostFeature::ObjectApi.min_version();
                if current < required {
                    return Err(HostError::NotSupported {
                        feature: HostFeature::ObjectApi,
                        required,
                        current,
                    });
                }
                scene.object(h.0)
            }
            HostRef::V2(o) => Ok(*o),
        }
    }

    pub fn is_visible(&self, scene: &dyn SceneHost) -> Result<bool, HostError> {
        match self {
            HostRef::V1(h) => scene.v1_is_active(*h),
            HostRef::V2(o) => scene.v2_is_visible(o),
        }
    }

    pub fn delete(&self, scene: &mut dyn SceneHost) -> Result<(), HostError> {
        match self {
            HostRef::V1(h) => scene.v1_delete(*h),
            HostRef::V2(o) => scene.v2_remove(o),
        }
    }
}

/// Scripting features that only exist from a given host release onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFeature {
    ObjectApi,
    Metadata,
    References,
    MaterialAssets,
}

impl HostFeature {
    pub fn min_version(self) -> Version {
        match self {
            HostFeature::ObjectApi => Version::new(2021, 0, 0),
            HostFeature::References => Version::new(2021, 3, 0),
            HostFeature::MaterialAssets => Version::new(2022, 0, 0),
            HostFeature::Metadata => Version::new(2023, 0, 0),
        }
    }
}

impl fmt::Display for HostFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostFeature::ObjectApi => "Object API",
            HostFeature::Metadata => "Metadata service",
            HostFeature::References => "Reference service",
            HostFeature::MaterialAssets => "Material assets",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSet {
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
    #[serde(default)]
    pub objects: Vec<ObjectId>,
}

impl MetadataSet {
    pub fn is_marker(&self) -> bool {
        self.name == MARKER_SET_NAME
    }

    /// Read a marker key, JSON-decoding it when possible.
    pub fn marker_value(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.entries.get(&format!("{}{}", MARKER_KEY_PREFIX, key))?;
        Some(serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.clone())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub smart_path: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    /// Set when the reference lives inside another referenced file.
    #[serde(default)]
    pub parent_reference: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSetGroup {
    pub name: String,
    #[serde(default)]
    pub variant_sets: Vec<String>,
}

/// The host scripting surface the publish core consumes.
pub trait SceneHost {
    fn host_version(&self) -> Version;

    // --- Session file ---
    fn current_file(&self) -> Option<PathBuf>;
    fn save_file(&mut self, path: &Path) -> Result<(), HostError>;
    fn render_filename(&self) -> Option<PathBuf>;
    fn set_render_filename(&mut self, path: &Path) -> Result<(), HostError>;

    // --- v1 handle surface ---
    fn root_node(&self) -> V1Handle;
    fn v1_children(&self, node: V1Handle) -> Result<Vec<V1Handle>, HostError>;
    fn v1_type_name(&self, node: V1Handle) -> Result<String, HostError>;
    fn v1_name(&self, node: V1Handle) -> Result<String, HostError>;
    fn v1_is_active(&self, node: V1Handle) -> Result<bool, HostError>;
    fn v1_delete(&mut self, node: V1Handle) -> Result<(), HostError>;
    fn save_geometry(&mut self, node: V1Handle, path: &Path) -> Result<(), HostError>;

    // --- v2 object surface ---
    fn object(&self, id: ObjectId) -> Result<V2Object, HostError>;
    fn object_name(&self, object: &V2Object) -> Result<String, HostError>;
    fn set_object_name(&mut self, object: &V2Object, name: &str) -> Result<(), HostError>;
    fn v2_children(&self, object: &V2Object) -> Result<Vec<V2Object>, HostError>;
    fn v2_parent(&self, object: &V2Object) -> Result<Option<V2Object>, HostError>;
    fn v2_is_visible(&self, object: &V2Object) -> Result<bool, HostError>;
    fn v2_remove(&mut self, object: &V2Object) -> Result<(), HostError>;

    // --- Materials ---
    fn material_nodes(&self) -> Result<Vec<V2Object>, HostError>;
    fn node_material(&self, node: &V2Object) -> Result<Option<V2Object>, HostError>;
    /// Source measurement file of a measured material.
    fn material_measurement(&self, material: &V2Object) -> Result<Option<PathBuf>, HostError>;
    fn save_materials(&mut self, materials: &[V2Object], dir: &Path) -> Result<(), HostError>;
    /// Write a material asset into `dir` and return the asset directory.
    fn create_material_asset(&mut self, material: &V2Object, dir: &Path) -> Result<PathBuf, HostError>;

    // --- Metadata ---
    fn object_metadata(&self, id: ObjectId) -> Result<BTreeMap<String, String>, HostError>;
    fn set_object_metadata(&mut self, id: ObjectId, key: &str, value: &str) -> Result<(), HostError>;
    fn metadata_sets(&self) -> Result<Vec<MetadataSet>, HostError>;
    fn create_metadata_set(&mut self, name: &str, objects: &[ObjectId]) -> Result<ObjectId, HostError>;
    fn set_metadata_value(&mut self, set: ObjectId, key: &str, value: &str) -> Result<(), HostError>;
    fn delete_metadata_sets(&mut self, sets: &[ObjectId]) -> Result<(), HostError>;

    // --- References ---
    fn scene_references(&self) -> Result<Vec<ReferenceInfo>, HostError>;
    fn set_smart_path(&mut self, reference: ObjectId, path: &str) -> Result<(), HostError>;
    fn set_source_path(&mut self, reference: ObjectId, path: &str) -> Result<(), HostError>;

    // --- Variant sets ---
    fn variant_set_groups(&self) -> Result<Vec<VariantSetGroup>, HostError>;
}

/// Environment variable lookup.
pub trait EnvLookup {
    fn var(&self, name: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvLookup for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl EnvLookup for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Every host collaborator a publish session needs, passed explicitly.
pub struct HostContext<'a> {
    scene: &'a mut dyn SceneHost,
    env: &'a dyn EnvLookup,
}

impl<'a> HostContext<'a> {
    pub fn new(scene: &'a mut dyn SceneHost, env: &'a dyn EnvLookup) -> Self {
        Self { scene, env }
    }

    pub fn scene(&self) -> &dyn SceneHost {
        &*self.scene
    }

    pub fn scene_mut(&mut self) -> &mut dyn SceneHost {
        &mut *self.scene
    }

    pub fn env(&self) -> &dyn EnvLookup {
        self.env
    }

    pub fn supports(&self, feature: HostFeature) -> bool {
        self.scene.host_version() >= feature.min_version()
    }

    pub fn require(&self, feature: HostFeature) -> Result<(), HostError> {
        let current = self.scene.host_version();
        let required = feature.min_version();
        if current < required {
            return Err(HostError::NotSupported {
                feature,
                required,
                current,
            });
        }
        Ok(())
    }

    /// Marker metadata set attached to `object`, if any.
    pub fn marker_set(&self, object: ObjectId) -> Result<Option<MetadataSet>, HostError> {
        self.require(HostFeature::Metadata)?;
        Ok(self
            .scene
            .metadata_sets()?
            .into_iter()
            .find(|s| s.is_marker() && s.objects.contains(&object)))
    }

    /// Write publish data into the marker set of each object, creating the
    /// set where missing. Null values are skipped, non-strings stored as JSON.
    pub fn add_marker_metadata(
        &mut self,
        objects: &[ObjectId],
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), HostError> {
        for object in objects {
            let set = match self.marker_set(*object)? {
                Some(set) => set.id,
                None => self.scene.create_metadata_set(MARKER_SET_NAME, &[*object])?,
            };
            for (key, value) in data {
                let text = match value {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.scene
                    .set_metadata_value(set, &format!("{}{}", MARKER_KEY_PREFIX, key), &text)?;
            }
        }
        Ok(())
    }

    pub fn remove_marker_metadata(&mut self, objects: &[ObjectId]) -> Result<(), HostError> {
        self.require(HostFeature::Metadata)?;
        let doomed: Vec<ObjectId> = self
            .scene
            .metadata_sets()?
            .into_iter()
            .filter(|s| s.is_marker() && s.objects.iter().any(|o| objects.contains(o)))
            .map(|s| s.id)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        self.scene.delete_metadata_sets(&doomed)
    }

    /// Top-level node with the given type, name and id.
    pub fn find_top_level_node(
        &self,
        type_name: &str,
        name: &str,
        id: ObjectId,
    ) -> Result<Option<V1Handle>, HostError> {
        let root = self.scene.root_node();
        for child in self.scene.v1_children(root)? {
            if child.0 == id
                && self.scene.v1_type_name(child)? == type_name
                && self.scene.v1_name(child)? == name
            {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

/// Every scene graph node below the root, parents before children.
pub fn scene_nodes(scene: &dyn SceneHost) -> Result<Vec<V1Handle>, HostError> {
    let mut found = vec![];
    let mut stack = scene.v1_children(scene.root_node())?;
    stack.reverse();
    while let Some(node) = stack.pop() {
        found.push(node);
        let mut children = scene.v1_children(node)?;
        children.reverse();
        stack.extend(children);
    }
    Ok(found)
}

/// Result of scanning for variant set groups without any variant sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyGroupScan {
    pub groups: Vec<String>,
    /// Always false: the host enumeration skips empty groups, so the
    /// scan can miss them.
    pub complete: bool,
}

pub fn find_empty_variant_set_groups(scene: &dyn SceneHost) -> Result<EmptyGroupScan, HostError> {
    let groups = scene
        .variant_set_groups()?
        .into_iter()
        .filter(|g| g.variant_sets.is_empty())
        .map(|g| g.name)
        .collect();
    tracing::warn!("empty variant set group detection is incomplete on this host");
    Ok(EmptyGroupScan {
        groups,
        complete: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_supported_message_recommends_upgrade() {
        let err = HostError::NotSupported {
            feature: HostFeature::Metadata,
            required: Version::new(2023, 0, 0),
            current: Version::new(2022, 1, 0),
        };
        let msg = err.to_string();
        assert!(msg.contains("Metadata service"));
        assert!(msg.contains("upgrade"));
    }

    #[test]
    fn test_marker_value_decodes_json() {
        let mut entries = BTreeMap::new();
        entries.insert("SG_version_number".to_string(), "3".to_string());
        entries.insert("SG_name".to_string(), "Paint".to_string());
        let set = MetadataSet {
            id: 1,
            name: MARKER_SET_NAME.to_string(),
            entries,
            objects: vec![7],
        };
        assert_eq!(set.marker_value("version_number"), Some(serde_json::json!(3)));
        assert_eq!(set.marker_value("name"), Some(serde_json::json!("Paint")));
        assert_eq!(set.marker_value("missing"), None);
    }

    #[test]
    fn test_feature_table_is_ordered() {
        assert!(HostFeature::ObjectApi.min_version() < HostFeature::Metadata.min_version());
    }
}
