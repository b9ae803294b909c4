//! Item Tree - publishable items collected from the session
//!
//! Items live in an arena owned by [`ItemTree`]; parents own their children
//! and children keep a non-owning index back to the parent. Property lookups
//! that inherit from ancestors go through an explicit [`ScopeChain`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub type PropertyMap = BTreeMap<String, Value>;

/// Well-known property keys shared by collectors and plugins.
pub mod props {
    pub const PATH: &str = "path";
    pub const WORK_TEMPLATE: &str = "work_template";
    pub const PUBLISH_TEMPLATE: &str = "publish_template";
    pub const PUBLISH_PATH: &str = "publish_path";
    pub const PUBLISH_NAME: &str = "publish_name";
    pub const PUBLISH_TYPE: &str = "publish_type";
    pub const PUBLISH_VERSION: &str = "publish_version";
    pub const PUBLISH_DEPENDENCIES: &str = "publish_dependencies";
    /// The tracker record registered for an item.
    pub const PUBLISH_DATA: &str = "publish_data";
    /// Shared version entity, written recursively so every descendant sees it.
    pub const VERSION_DATA: &str = "version_data";
    pub const VERSION_NUMBER: &str = "version_number";
    pub const NODE_ID: &str = "node_id";
    pub const MATERIAL_ID: &str = "material_id";
    pub const MATERIAL_ENTITY: &str = "material_entity";
    pub const MATERIAL_TASK: &str = "material_task";
    pub const MATERIAL_ASSET_DATA: &str = "material_asset_data";
    pub const METADATA_SET_ID: &str = "metadata_set_id";
    pub const AOV_NAME: &str = "aov_name";
    pub const SEQUENCE_PATHS: &str = "sequence_paths";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(usize);

impl ItemId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Session,
    Geometry,
    MaterialGroup,
    Material,
    Metadata,
    MetadataSetGroup,
    MetadataSet,
    Image,
}

impl ItemKind {
    /// Dotted type string matched by plugin item filters.
    pub fn type_spec(self) -> &'static str {
        match self {
            ItemKind::Session => "session",
            ItemKind::Geometry => "session.geometry",
            ItemKind::MaterialGroup => "session.material",
            ItemKind::Material => "session.material.item",
            ItemKind::Metadata => "session.metadata",
            ItemKind::MetadataSetGroup => "session.metadata_set",
            ItemKind::MetadataSet => "session.metadata_set.item",
            ItemKind::Image => "session.image",
        }
    }

    pub fn display_type(self) -> &'static str {
        match self {
            ItemKind::Session => "Scene Session",
            ItemKind::Geometry => "Geometry",
            ItemKind::MaterialGroup => "Materials",
            ItemKind::Material => "Material",
            ItemKind::Metadata => "Scene Metadata",
            ItemKind::MetadataSetGroup => "Metadata Sets",
            ItemKind::MetadataSet => "Metadata Set",
            ItemKind::Image => "Rendering",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishItem {
    pub kind: ItemKind,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub local_properties: PropertyMap,
    parent: Option<ItemId>,
    children: Vec<ItemId>,
}

impl PublishItem {
    fn new(kind: ItemKind, name: &str, parent: Option<ItemId>) -> Self {
        Self {
            kind,
            name: name.to_string(),
            description: None,
            thumbnail_path: None,
            properties: PropertyMap::new(),
            local_properties: PropertyMap::new(),
            parent,
            children: vec![],
        }
    }

    pub fn parent(&self) -> Option<ItemId> {
        self.parent
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }
}

/// Ordered property layers, nearest first.
///
/// The first layer holds the item's local properties, the second its own
/// properties, then one layer per ancestor up to the root.
pub struct ScopeChain<'t> {
    layers: Vec<(ItemId, &'t PropertyMap)>,
}

impl<'t> ScopeChain<'t> {
    pub fn new(layers: Vec<(ItemId, &'t PropertyMap)>) -> Self {
        Self { layers }
    }

    /// First non-null value for `key`.
    pub fn get(&self, key: &str) -> Option<&'t Value> {
        self.layers
            .iter()
            .find_map(|(_, layer)| layer.get(key).filter(|v| !v.is_null()))
    }

    /// Item owning the layer that resolves `key`.
    pub fn origin(&self, key: &str) -> Option<ItemId> {
        self.layers
            .iter()
            .find(|(_, layer)| layer.get(key).map_or(false, |v| !v.is_null()))
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// The tree of items for one publish operation. Index 0 is the session root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTree {
    items: Vec<PublishItem>,
}

impl ItemTree {
    pub fn new(kind: ItemKind, name: &str) -> Self {
        Self {
            items: vec![PublishItem::new(kind, name, None)],
        }
    }

    pub fn root(&self) -> ItemId {
        ItemId(0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        id.0 < self.items.len()
    }

    /// Append a child under `parent` and return it.
    pub fn create_item(&mut self, parent: ItemId, kind: ItemKind, name: &str) -> ItemId {
        let id = ItemId(self.items.len());
        self.items.push(PublishItem::new(kind, name, Some(parent)));
        self.items[parent.0].children.push(id);
        id
    }

    pub fn item(&self, id: ItemId) -> &PublishItem {
        &self.items[id.0]
    }

    pub fn item_mut(&mut self, id: ItemId) -> &mut PublishItem {
        &mut self.items[id.0]
    }

    pub fn parent(&self, id: ItemId) -> Option<ItemId> {
        self.items[id.0].parent
    }

    pub fn children(&self, id: ItemId) -> &[ItemId] {
        &self.items[id.0].children
    }

    pub fn type_spec(&self, id: ItemId) -> &'static str {
        self.items[id.0].kind.type_spec()
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    pub fn ancestors(&self, id: ItemId) -> Vec<ItemId> {
        let mut out = vec![];
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            out.push(p);
            cur = self.parent(p);
        }
        out
    }

    pub fn depth(&self, id: ItemId) -> usize {
        self.ancestors(id).len()
    }

    /// Every item, parents before their children.
    pub fn preorder(&self) -> Vec<ItemId> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.children(id).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    pub fn find_child(&self, parent: ItemId, kind: ItemKind) -> Option<ItemId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.item(*c).kind == kind)
    }

    // --- Properties ---

    /// Local properties first, then the item's own properties.
    pub fn get_property(&self, id: ItemId, key: &str) -> Option<&Value> {
        let item = &self.items[id.0];
        item.local_properties
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| item.properties.get(key).filter(|v| !v.is_null()))
    }

    pub fn get_property_or(&self, id: ItemId, key: &str, default: Value) -> Value {
        self.get_property(id, key).cloned().unwrap_or(default)
    }

    pub fn get_str(&self, id: ItemId, key: &str) -> Option<&str> {
        self.get_property(id, key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, id: ItemId, key: &str) -> Option<u64> {
        self.get_property(id, key).and_then(Value::as_u64)
    }

    pub fn get_path(&self, id: ItemId, key: &str) -> Option<PathBuf> {
        self.get_str(id, key).map(PathBuf::from)
    }

    /// Deserialize a property into a typed value. Bad shapes read as unset.
    pub fn get_as<T: DeserializeOwned>(&self, id: ItemId, key: &str) -> Option<T> {
        self.get_property(id, key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_property(&mut self, id: ItemId, key: &str, value: impl Into<Value>) {
        self.items[id.0]
            .properties
            .insert(key.to_string(), value.into());
    }

    pub fn set_local_property(&mut self, id: ItemId, key: &str, value: impl Into<Value>) {
        self.items[id.0]
            .local_properties
            .insert(key.to_string(), value.into());
    }

    pub fn scope_chain(&self, id: ItemId) -> ScopeChain<'_> {
        let item = &self.items[id.0];
        let mut layers = vec![(id, &item.local_properties), (id, &item.properties)];
        for ancestor in self.ancestors(id) {
            layers.push((ancestor, &self.items[ancestor.0].properties));
        }
        ScopeChain::new(layers)
    }

    /// First value found walking from the item up through its ancestors.
    pub fn get_property_recursive(&self, id: ItemId, key: &str) -> Option<&Value> {
        self.scope_chain(id).get(key)
    }

    pub fn get_recursive_as<T: DeserializeOwned>(&self, id: ItemId, key: &str) -> Option<T> {
        self.get_property_recursive(id, key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Write `key` on the item and on every ancestor up to the root.
    pub fn set_property_recursive(&mut self, id: ItemId, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut cur = Some(id);
        while let Some(c) = cur {
            self.items[c.0]
                .properties
                .insert(key.to_string(), value.clone());
            cur = self.items[c.0].parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> (ItemTree, ItemId, ItemId, ItemId) {
        let mut tree = ItemTree::new(ItemKind::Session, "scene.vpb");
        let group = tree.create_item(tree.root(), ItemKind::MaterialGroup, "Materials");
        let paint = tree.create_item(group, ItemKind::Material, "Paint");
        let glass = tree.create_item(group, ItemKind::Material, "Glass");
        (tree, group, paint, glass)
    }

    #[test]
    fn test_recursive_lookup_walks_ancestors() {
        let (mut tree, group, paint, _) = tree();
        tree.set_property(tree.root(), "project", "demo");
        tree.set_property(group, "project", "override");

        assert_eq!(
            tree.get_property_recursive(paint, "project"),
            Some(&json!("override"))
        );
        assert_eq!(tree.scope_chain(paint).origin("project"), Some(group));
    }

    #[test]
    fn test_recursive_lookup_ignores_siblings() {
        let (mut tree, _, paint, glass) = tree();
        tree.set_property(glass, "only_glass", 1);
        assert!(tree.get_property_recursive(paint, "only_glass").is_none());
    }

    #[test]
    fn test_local_properties_are_not_inherited() {
        let (mut tree, group, paint, _) = tree();
        tree.set_local_property(group, "secret", true);
        assert!(tree.get_property_recursive(paint, "secret").is_none());
        assert_eq!(tree.get_property(group, "secret"), Some(&json!(true)));
    }

    #[test]
    fn test_local_shadows_own_property() {
        let (mut tree, _, paint, _) = tree();
        tree.set_property(paint, "path", "/a");
        tree.set_local_property(paint, "path", "/b");
        assert_eq!(tree.get_str(paint, "path"), Some("/b"));
    }

    #[test]
    fn test_recursive_setter_reaches_root() {
        let (mut tree, group, paint, glass) = tree();
        tree.set_property_recursive(paint, props::VERSION_DATA, json!({"id": 9}));
        assert!(tree.get_property(group, props::VERSION_DATA).is_some());
        assert!(tree.get_property(tree.root(), props::VERSION_DATA).is_some());
        // Siblings read it through the shared ancestors.
        assert_eq!(
            tree.get_property_recursive(glass, props::VERSION_DATA),
            Some(&json!({"id": 9}))
        );
    }

    #[test]
    fn test_null_reads_as_unset() {
        let (mut tree, _, paint, _) = tree();
        tree.set_property(tree.root(), "aov", "beauty");
        tree.set_property(paint, "aov", Value::Null);
        assert_eq!(tree.get_property_recursive(paint, "aov"), Some(&json!("beauty")));
    }

    #[test]
    fn test_preorder_puts_parents_first() {
        let (tree, group, paint, glass) = tree();
        assert_eq!(tree.preorder(), vec![tree.root(), group, paint, glass]);
        assert_eq!(tree.depth(glass), 2);
    }
}
