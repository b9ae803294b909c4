//! Memory Scene - JSON scene document implementing the host surface
//!
//! Drives the publish core without a running host application. The whole
//! scene round-trips through serde, so a saved session is just the document
//! written to disk.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::host::{
    HostError, MetadataSet, NodeKind, ObjectId, ReferenceInfo, SceneHost, V1Handle, V2Object,
    VariantSetGroup,
};

const ROOT_ID: ObjectId = 0;

fn default_version() -> Version {
    Version::new(2024, 0, 0)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub children: Vec<ObjectId>,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub material: Option<ObjectId>,
    #[serde(default)]
    pub measurement: Option<PathBuf>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SceneNode {
    fn new(kind: NodeKind, name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            children: vec![],
            visible: true,
            material: None,
            measurement: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryScene {
    #[serde(default = "default_version")]
    pub host_version: Version,
    #[serde(default)]
    pub current_file: Option<PathBuf>,
    #[serde(default)]
    pub render_filename: Option<PathBuf>,
    #[serde(default)]
    pub nodes: BTreeMap<ObjectId, SceneNode>,
    #[serde(default)]
    pub metadata_sets: Vec<MetadataSet>,
    #[serde(default)]
    pub references: Vec<ReferenceInfo>,
    #[serde(default)]
    pub variant_set_groups: Vec<VariantSetGroup>,
}

impl MemoryScene {
    pub fn new(host_version: Version) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_ID, SceneNode::new(NodeKind::Group, "Root"));
        Self {
            host_version,
            current_file: None,
            render_filename: None,
            nodes,
            metadata_sets: vec![],
            references: vec![],
            variant_set_groups: vec![],
        }
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let text = fs::read_to_string(path)?;
        let mut scene: Self = serde_json::from_str(&text)
            .map_err(|e| HostError::Operation(format!("invalid scene document: {}", e)))?;
        scene
            .nodes
            .entry(ROOT_ID)
            .or_insert_with(|| SceneNode::new(NodeKind::Group, "Root"));
        Ok(scene)
    }

    pub fn write(&self, path: &Path) -> Result<(), HostError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| HostError::Operation(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    fn next_id(&self) -> ObjectId {
        let node_max = self.nodes.keys().next_back().copied().unwrap_or(ROOT_ID);
        let set_max = self.metadata_sets.iter().map(|s| s.id).max().unwrap_or(0);
        node_max.max(set_max) + 1
    }

    // --- Builders ---

    pub fn add_node(&mut self, parent: ObjectId, kind: NodeKind, name: &str) -> ObjectId {
        let id = self.next_id();
        self.nodes.insert(id, SceneNode::new(kind, name));
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Materials live outside the scene graph.
    pub fn add_material(&mut self, name: &str) -> ObjectId {
        let id = self.next_id();
        self.nodes.insert(id, SceneNode::new(NodeKind::Material, name));
        id
    }

    pub fn add_material_node(&mut self, parent: ObjectId, material: ObjectId, name: &str) -> ObjectId {
        let id = self.add_node(parent, NodeKind::MaterialNode, name);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.material = Some(material);
        }
        id
    }

    pub fn add_reference(
        &mut self,
        parent: ObjectId,
        name: &str,
        smart_path: Option<&str>,
        source_path: Option<&str>,
        parent_reference: Option<ObjectId>,
    ) -> ObjectId {
        let id = self.add_node(parent, NodeKind::Reference, name);
        self.references.push(ReferenceInfo {
            id,
            name: name.to_string(),
            smart_path: smart_path.map(str::to_string),
            source_path: source_path.map(str::to_string),
            parent_reference,
        });
        id
    }

    pub fn add_metadata_set(
        &mut self,
        name: &str,
        objects: &[ObjectId],
        entries: &[(&str, &str)],
    ) -> ObjectId {
        let id = self.next_id();
        self.metadata_sets.push(MetadataSet {
            id,
            name: name.to_string(),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            objects: objects.to_vec(),
        });
        id
    }

    pub fn node(&self, id: ObjectId) -> Result<&SceneNode, HostError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| HostError::NotFound(format!("object {}", id)))
    }

    pub fn node_mut(&mut self, id: ObjectId) -> Result<&mut SceneNode, HostError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| HostError::NotFound(format!("object {}", id)))
    }

    pub fn reference(&self, id: ObjectId) -> Option<&ReferenceInfo> {
        self.references.iter().find(|r| r.id == id)
    }

    fn parent_of(&self, id: ObjectId) -> Option<ObjectId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.children.contains(&id))
            .map(|(pid, _)| *pid)
    }

    fn remove_subtree(&mut self, id: ObjectId) -> Result<(), HostError> {
        if id == ROOT_ID {
            return Err(HostError::Operation("cannot delete the root node".into()));
        }
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| HostError::NotFound(format!("object {}", id)))?;
        for child in node.children {
            self.remove_subtree(child)?;
        }
        for parent in self.nodes.values_mut() {
            parent.children.retain(|c| *c != id);
        }
        self.references.retain(|r| r.id != id);
        Ok(())
    }

    fn subtree(&self, id: ObjectId) -> Result<serde_json::Value, HostError> {
        let node = self.node(id)?;
        let children = node
            .children
            .iter()
            .map(|c| self.subtree(*c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(serde_json::json!({
            "id": id,
            "name": node.name,
            "kind": node.kind,
            "children": children,
        }))
    }

    fn reference_mut(&mut self, id: ObjectId) -> Result<&mut ReferenceInfo, HostError> {
        self.references
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| HostError::NotFound(format!("reference {}", id)))
    }

    fn set_mut(&mut self, id: ObjectId) -> Result<&mut MetadataSet, HostError> {
        self.metadata_sets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| HostError::NotFound(format!("metadata set {}", id)))
    }
}

impl Default for MemoryScene {
    fn default() -> Self {
        Self::new(default_version())
    }
}

impl SceneHost for MemoryScene {
    fn host_version(&self) -> Version {
        self.host_version.clone()
    }

    fn current_file(&self) -> Option<PathBuf> {
        self.current_file.clone()
    }

    fn save_file(&mut self, path: &Path) -> Result<(), HostError> {
        self.current_file = Some(path.to_path_buf());
        self.write(path)
    }

    fn render_filename(&self) -> Option<PathBuf> {
        self.render_filename.clone()
    }

    fn set_render_filename(&mut self, path: &Path) -> Result<(), HostError> {
        self.render_filename = Some(path.to_path_buf());
        Ok(())
    }

    fn root_node(&self) -> V1Handle {
        V1Handle(ROOT_ID)
    }

    fn v1_children(&self, node: V1Handle) -> Result<Vec<V1Handle>, HostError> {
        Ok(self.node(node.0)?.children.iter().map(|c| V1Handle(*c)).collect())
    }

    fn v1_type_name(&self, node: V1Handle) -> Result<String, HostError> {
        Ok(self.node(node.0)?.kind.v1_type_name().to_string())
    }

    fn v1_name(&self, node: V1Handle) -> Result<String, HostError> {
        Ok(self.node(node.0)?.name.clone())
    }

    fn v1_is_active(&self, node: V1Handle) -> Result<bool, HostError> {
        Ok(self.node(node.0)?.visible)
    }

    fn v1_delete(&mut self, node: V1Handle) -> Result<(), HostError> {
        self.remove_subtree(node.0)
    }

    fn save_geometry(&mut self, node: V1Handle, path: &Path) -> Result<(), HostError> {
        let doc = self.subtree(node.0)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text =
            serde_json::to_string_pretty(&doc).map_err(|e| HostError::Operation(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    fn object(&self, id: ObjectId) -> Result<V2Object, HostError> {
        Ok(V2Object {
            id,
            kind: self.node(id)?.kind,
        })
    }

    fn object_name(&self, object: &V2Object) -> Result<String, HostError> {
        Ok(self.node(object.id)?.name.clone())
    }

    fn set_object_name(&mut self, object: &V2Object, name: &str) -> Result<(), HostError> {
        self.node_mut(object.id)?.name = name.to_string();
        if let Ok(reference) = self.reference_mut(object.id) {
            reference.name = name.to_string();
        }
        Ok(())
    }

    fn v2_children(&self, object: &V2Object) -> Result<Vec<V2Object>, HostError> {
        self.node(object.id)?
            .children
            .iter()
            .map(|c| self.object(*c))
            .collect()
    }

    fn v2_parent(&self, object: &V2Object) -> Result<Option<V2Object>, HostError> {
        match self.parent_of(object.id) {
            Some(pid) => Ok(Some(self.object(pid)?)),
            None => Ok(None),
        }
    }

    fn v2_is_visible(&self, object: &V2Object) -> Result<bool, HostError> {
        Ok(self.node(object.id)?.visible)
    }

    fn v2_remove(&mut self, object: &V2Object) -> Result<(), HostError> {
        self.remove_subtree(object.id)
    }

    fn material_nodes(&self) -> Result<Vec<V2Object>, HostError> {
        Ok(self
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == NodeKind::MaterialNode)
            .map(|(id, n)| V2Object { id: *id, kind: n.kind })
            .collect())
    }

    fn node_material(&self, node: &V2Object) -> Result<Option<V2Object>, HostError> {
        match self.node(node.id)?.material {
            Some(mat) => Ok(Some(self.object(mat)?)),
            None => Ok(None),
        }
    }

    fn material_measurement(&self, material: &V2Object) -> Result<Option<PathBuf>, HostError> {
        Ok(self.node(material.id)?.measurement.clone())
    }

    fn save_materials(&mut self, materials: &[V2Object], dir: &Path) -> Result<(), HostError> {
        fs::create_dir_all(dir)?;
        for material in materials {
            let node = self.node(material.id)?;
            let doc = serde_json::json!({
                "id": material.id,
                "name": node.name,
                "metadata": node.metadata,
            });
            fs::write(dir.join(format!("{}.osb", node.name)), doc.to_string())?;
        }
        Ok(())
    }

    fn create_material_asset(&mut self, material: &V2Object, dir: &Path) -> Result<PathBuf, HostError> {
        let name = self.node(material.id)?.name.clone();
        let asset_dir = dir.join(format!("MAT_{}", name));
        fs::create_dir_all(&asset_dir)?;
        let doc = serde_json::json!({ "id": material.id, "name": name });
        fs::write(asset_dir.join(format!("{}.vpb", name)), doc.to_string())?;
        Ok(asset_dir)
    }

    fn object_metadata(&self, id: ObjectId) -> Result<BTreeMap<String, String>, HostError> {
        Ok(self.node(id)?.metadata.clone())
    }

    fn set_object_metadata(&mut self, id: ObjectId, key: &str, value: &str) -> Result<(), HostError> {
        self.node_mut(id)?
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn metadata_sets(&self) -> Result<Vec<MetadataSet>, HostError> {
        Ok(self.metadata_sets.clone())
    }

    fn create_metadata_set(&mut self, name: &str, objects: &[ObjectId]) -> Result<ObjectId, HostError> {
        Ok(self.add_metadata_set(name, objects, &[]))
    }

    fn set_metadata_value(&mut self, set: ObjectId, key: &str, value: &str) -> Result<(), HostError> {
        self.set_mut(set)?
            .entries
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_metadata_sets(&mut self, sets: &[ObjectId]) -> Result<(), HostError> {
        self.metadata_sets.retain(|s| !sets.contains(&s.id));
        Ok(())
    }

    fn scene_references(&self) -> Result<Vec<ReferenceInfo>, HostError> {
        Ok(self.references.clone())
    }

    fn set_smart_path(&mut self, reference: ObjectId, path: &str) -> Result<(), HostError> {
        self.reference_mut(reference)?.smart_path = Some(path.to_string());
        Ok(())
    }

    fn set_source_path(&mut self, reference: ObjectId, path: &str) -> Result<(), HostError> {
        self.reference_mut(reference)?.source_path = Some(path.to_string());
        Ok(())
    }

    fn variant_set_groups(&self) -> Result<Vec<VariantSetGroup>, HostError> {
        Ok(self.variant_set_groups.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{find_empty_variant_set_groups, HostFeature, HostRef};

    #[test]
    fn test_v1_and_v2_address_the_same_node() {
        let mut scene = MemoryScene::default();
        let car = scene.add_node(ROOT_ID, NodeKind::Geometry, "Car");

        let v1 = HostRef::V1(V1Handle(car));
        let v2 = v1.to_v2(&scene).unwrap();
        assert_eq!(v2.kind, NodeKind::Geometry);
        assert_eq!(HostRef::V2(v2).to_v1(), V1Handle(car));
    }

    #[test]
    fn test_v2_objects_need_object_api() {
        let mut scene = MemoryScene::new(Version::new(2020, 5, 0));
        let car = scene.add_node(ROOT_ID, NodeKind::Geometry, "Car");
        let err = HostRef::V1(V1Handle(car)).to_v2(&scene).unwrap_err();
        assert!(matches!(
            err,
            HostError::NotSupported {
                feature: HostFeature::ObjectApi,
                ..
            }
        ));
    }

    #[test]
    fn test_only_empty_variant_set_groups_are_listed() {
        let mut scene = MemoryScene::default();
        scene.variant_set_groups = vec![
            VariantSetGroup {
                name: "Trims".into(),
                variant_sets: vec![],
            },
            VariantSetGroup {
                name: "Paints".into(),
                variant_sets: vec!["Red".into(), "Blue".into()],
            },
        ];
        let scan = find_empty_variant_set_groups(&scene).unwrap();
        assert_eq!(scan.groups, vec!["Trims".to_string()]);
        assert!(!scan.complete);
    }

    #[test]
    fn test_delete_branches_on_generation() {
        let mut scene = MemoryScene::default();
        let a = scene.add_node(ROOT_ID, NodeKind::Geometry, "A");
        let b = scene.add_node(ROOT_ID, NodeKind::Geometry, "B");
        let b_obj = scene.object(b).unwrap();

        HostRef::V1(V1Handle(a)).delete(&mut scene).unwrap();
        HostRef::V2(b_obj).delete(&mut scene).unwrap();
        assert!(scene.v1_children(scene.root_node()).unwrap().is_empty());
    }

    #[test]
    fn test_document_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");
        let mut scene = MemoryScene::default();
        let mat = scene.add_material("Paint");
        scene.add_material_node(ROOT_ID, mat, "Paint");
        scene.save_file(&path).unwrap();

        let loaded = MemoryScene::load(&path).unwrap();
        assert_eq!(loaded.current_file.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.material_nodes().unwrap().len(), 1);
    }
}
