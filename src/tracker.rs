//! Tracker - Production tracking backend
//!
//! Reading and writing are split into two traits so that stages which may
//! only look at tracking state receive a read-only view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::templates::{normalize_path, FieldValue, Fields};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker record not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: u64,
    pub name: String,
}

impl EntityRef {
    pub fn new(entity_type: &str, id: u64, name: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id,
            name: name.to_string(),
        }
    }
}

/// Who and what a publish belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    #[serde(default)]
    pub project: Option<EntityRef>,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub step: Option<EntityRef>,
    #[serde(default)]
    pub task: Option<EntityRef>,
    #[serde(default)]
    pub user: Option<EntityRef>,
}

impl EntityContext {
    /// Template fields implied by the context: the entity under its type
    /// name (`Asset`, `Shot`, ...) plus `Step`, `Task` and `Project`.
    pub fn as_template_fields(&self) -> Fields {
        let mut fields = Fields::new();
        if let Some(entity) = &self.entity {
            fields.insert(entity.entity_type.clone(), FieldValue::from(entity.name.as_str()));
        }
        if let Some(step) = &self.step {
            fields.insert("Step".into(), FieldValue::from(step.name.as_str()));
        }
        if let Some(task) = &self.task {
            fields.insert("Task".into(), FieldValue::from(task.name.as_str()));
        }
        if let Some(project) = &self.project {
            fields.insert("Project".into(), FieldValue::from(project.name.as_str()));
        }
        fields
    }

    pub fn with_entity(&self, entity: EntityRef) -> Self {
        Self {
            entity: Some(entity),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub version_number: Option<u64>,
    pub published_file_type: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub created_by: Option<EntityRef>,
    #[serde(default)]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(default)]
    pub dependency_paths: Vec<String>,
    #[serde(default)]
    pub dependency_ids: Vec<u64>,
    #[serde(default)]
    pub context: EntityContext,
    #[serde(default)]
    pub version_entity: Option<EntityRef>,
    #[serde(default)]
    pub extra_fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub request: PublishRequest,
}

impl PublishRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new("PublishedFile", self.id, &self.request.name)
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionRequest {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context: EntityContext,
    #[serde(default)]
    pub published_files: Vec<u64>,
    #[serde(default)]
    pub path_to_frames: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub request: VersionRequest,
    /// Uploaded files per field name.
    #[serde(default)]
    pub uploads: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl VersionRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new("Version", self.id, &self.request.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: u64,
    pub code: String,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub parent: Option<EntityRef>,
    #[serde(default)]
    pub project: Option<EntityRef>,
    #[serde(default)]
    pub published_files: Vec<u64>,
}

impl AssetRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new("Asset", self.id, &self.code)
    }
}

/// Read-only view of tracking state.
pub trait TrackerRead {
    /// Latest publish registered for each of `paths` that has one.
    fn find_publish(&self, paths: &[String]) -> Result<BTreeMap<String, PublishRecord>, TrackerError>;
    fn find_asset(&self, code: &str, parent: Option<&EntityRef>) -> Result<Option<AssetRecord>, TrackerError>;
}

pub trait TrackingBackend: TrackerRead {
    fn as_reader(&self) -> &dyn TrackerRead;

    fn register_publish(&mut self, request: PublishRequest) -> Result<PublishRecord, TrackerError>;
    fn create_version(&mut self, request: VersionRequest) -> Result<VersionRecord, TrackerError>;
    fn update_version(&mut self, id: u64, fields: Map<String, Value>) -> Result<(), TrackerError>;
    fn upload_to_version(&mut self, id: u64, field: &str, path: &Path) -> Result<(), TrackerError>;
    fn upload_thumbnail(&mut self, publish_id: u64, path: &Path) -> Result<(), TrackerError>;
    fn create_asset(
        &mut self,
        code: &str,
        asset_type: Option<&str>,
        parent: Option<&EntityRef>,
        project: Option<&EntityRef>,
    ) -> Result<AssetRecord, TrackerError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub publishes: Vec<PublishRecord>,
    #[serde(default)]
    pub versions: Vec<VersionRecord>,
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
    #[serde(default)]
    pub thumbnails: BTreeMap<u64, PathBuf>,
}

/// Tracking backend kept in a JSON ledger file.
///
/// Uploaded files are copied into the upload directory, `<ledger>_uploads`
/// next to the ledger unless set otherwise. Without one, uploads record the
/// caller's path as is.
#[derive(Debug, Default)]
pub struct LocalTracker {
    path: Option<PathBuf>,
    uploads: Option<PathBuf>,
    ledger: Ledger,
}

impl LocalTracker {
    /// In-memory tracker, never written to disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or start) the ledger at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        let ledger = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Ledger::default()
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger".to_string());
        let uploads = path.with_file_name(format!("{}_uploads", stem));
        Ok(Self {
            path: Some(path),
            uploads: Some(uploads),
            ledger,
        })
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.uploads = Some(dir.into());
        self
    }

    pub fn upload_dir(&self) -> Option<&Path> {
        self.uploads.as_deref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn publishes(&self) -> &[PublishRecord] {
        &self.ledger.publishes
    }

    pub fn version(&self, id: u64) -> Option<&VersionRecord> {
        self.ledger.versions.iter().find(|v| v.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        self.ledger.next_id += 1;
        self.ledger.next_id
    }

    fn persist(&self) -> Result<(), TrackerError> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_string_pretty(&self.ledger)?)?;
        }
        Ok(())
    }

    /// Copy `source` under `<uploads>/<folder>/` and return the stored path.
    fn store_upload(&self, source: &Path, folder: &str, index: usize) -> Result<PathBuf, TrackerError> {
        if !source.is_file() {
            return Err(TrackerError::Upload(format!(
                "{} does not exist",
                source.display()
            )));
        }
        let Some(uploads) = &self.uploads else {
            return Ok(source.to_path_buf());
        };
        let file_name = source
            .file_name()
            .ok_or_else(|| TrackerError::Upload(format!("{} has no file name", source.display())))?;
        let dir = uploads.join(folder);
        fs::create_dir_all(&dir)?;
        let stored = dir.join(format!("{:04}_{}", index, file_name.to_string_lossy()));
        fs::copy(source, &stored)?;
        tracing::debug!(from = %source.display(), to = %stored.display(), "file uploaded");
        Ok(stored)
    }

    fn version_mut(&mut self, id: u64) -> Result<&mut VersionRecord, TrackerError> {
        self.ledger
            .versions
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| TrackerError::NotFound(format!("Version {}", id)))
    }
}

impl TrackerRead for LocalTracker {
    fn find_publish(&self, paths: &[String]) -> Result<BTreeMap<String, PublishRecord>, TrackerError> {
        let mut found = BTreeMap::new();
        for path in paths {
            let wanted = normalize_path(Path::new(path));
            let latest = self
                .ledger
                .publishes
                .iter()
                .filter(|p| normalize_path(Path::new(&p.request.path)) == wanted)
                .max_by_key(|p| p.id);
            if let Some(record) = latest {
                found.insert(path.clone(), record.clone());
            }
        }
        Ok(found)
    }

    fn find_asset(&self, code: &str, parent: Option<&EntityRef>) -> Result<Option<AssetRecord>, TrackerError> {
        Ok(self
            .ledger
            .assets
            .iter()
            .find(|a| a.code == code && a.parent.as_ref() == parent)
            .cloned())
    }
}

impl TrackingBackend for LocalTracker {
    fn as_reader(&self) -> &dyn TrackerRead {
        self
    }

    fn register_publish(&mut self, request: PublishRequest) -> Result<PublishRecord, TrackerError> {
        let id = self.allocate_id();
        let record = PublishRecord {
            id,
            created_at: Utc::now(),
            request,
        };
        if let Some(entity) = &record.request.context.entity {
            if entity.entity_type == "Asset" {
                if let Some(asset) = self.ledger.assets.iter_mut().find(|a| a.id == entity.id) {
                    asset.published_files.push(id);
                }
            }
        }
        if let Some(version) = &record.request.version_entity {
            if let Some(v) = self.ledger.versions.iter_mut().find(|v| v.id == version.id) {
                v.request.published_files.push(id);
            }
        }
        tracing::debug!(id, path = %record.request.path, "publish registered");
        self.ledger.publishes.push(record.clone());
        self.persist()?;
        Ok(record)
    }

    fn create_version(&mut self, request: VersionRequest) -> Result<VersionRecord, TrackerError> {
        let id = self.allocate_id();
        let record = VersionRecord {
            id,
            created_at: Utc::now(),
            request,
            uploads: BTreeMap::new(),
            fields: Map::new(),
        };
        self.ledger.versions.push(record.clone());
        self.persist()?;
        Ok(record)
    }

    fn update_version(&mut self, id: u64, fields: Map<String, Value>) -> Result<(), TrackerError> {
        self.version_mut(id)?.fields.extend(fields);
        self.persist()
    }

    fn upload_to_version(&mut self, id: u64, field: &str, path: &Path) -> Result<(), TrackerError> {
        let index = self
            .version_mut(id)?
            .uploads
            .get(field)
            .map_or(0, Vec::len);
        let stored = self.store_upload(path, &format!("version_{}/{}", id, field), index)?;
        self.version_mut(id)?
            .uploads
            .entry(field.to_string())
            .or_default()
            .push(stored);
        self.persist()
    }

    fn upload_thumbnail(&mut self, publish_id: u64, path: &Path) -> Result<(), TrackerError> {
        if !self.ledger.publishes.iter().any(|p| p.id == publish_id) {
            return Err(TrackerError::NotFound(format!("PublishedFile {}", publish_id)));
        }
        let stored = self.store_upload(path, &format!("publish_{}", publish_id), 0)?;
        self.ledger.thumbnails.insert(publish_id, stored);
        self.persist()
    }

    fn create_asset(
        &mut self,
        code: &str,
        asset_type: Option<&str>,
        parent: Option<&EntityRef>,
        project: Option<&EntityRef>,
    ) -> Result<AssetRecord, TrackerError> {
        let id = self.allocate_id();
        let record = AssetRecord {
            id,
            code: code.to_string(),
            asset_type: asset_type.map(str::to_string),
            parent: parent.cloned(),
            project: project.cloned(),
            published_files: vec![],
        };
        self.ledger.assets.push(record.clone());
        self.persist()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> PublishRequest {
        PublishRequest {
            path: path.to_string(),
            name: "scene".to_string(),
            version_number: Some(1),
            published_file_type: "Scene".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_find_publish_returns_latest_per_path() {
        let mut tracker = LocalTracker::new();
        tracker.register_publish(request("/p/a.vpb")).unwrap();
        let second = tracker.register_publish(request("/p/a.vpb")).unwrap();

        let found = tracker
            .find_publish(&["/p/a.vpb".to_string(), "/p/missing".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["/p/a.vpb"].id, second.id);
    }

    #[test]
    fn test_find_publish_normalizes_separators() {
        let mut tracker = LocalTracker::new();
        tracker.register_publish(request("C:/p/a.vpb")).unwrap();
        let found = tracker.find_publish(&["C:\\p\\a.vpb".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_asset_collects_its_publishes() {
        let mut tracker = LocalTracker::new();
        let asset = tracker.create_asset("Trim", Some("Material"), None, None).unwrap();
        let mut req = request("/p/trim.json");
        req.context = EntityContext::default().with_entity(asset.entity_ref());
        tracker.register_publish(req).unwrap();

        let asset = tracker.find_asset("Trim", None).unwrap().unwrap();
        assert_eq!(asset.published_files.len(), 1);
    }

    #[test]
    fn test_ledger_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let mut tracker = LocalTracker::open(&path).unwrap();
            tracker.register_publish(request("/p/a.vpb")).unwrap();
        }
        let tracker = LocalTracker::open(&path).unwrap();
        assert_eq!(tracker.publishes().len(), 1);
    }

    #[test]
    fn test_uploads_are_copied_next_to_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.json");
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("0.pf");
        fs::write(&source, b"pf").unwrap();

        let mut tracker = LocalTracker::open(&ledger).unwrap();
        let publish = tracker.register_publish(request("/p/a.vpb")).unwrap();
        let version = tracker.create_version(VersionRequest::default()).unwrap();
        tracker.upload_to_version(version.id, "translation_files", &source).unwrap();
        tracker.upload_to_version(version.id, "translation_files", &source).unwrap();
        tracker.upload_thumbnail(publish.id, &source).unwrap();
        drop(scratch);

        let stored = &tracker.version(version.id).unwrap().uploads["translation_files"];
        assert_eq!(stored.len(), 2);
        assert_ne!(stored[0], stored[1]);
        for path in stored.iter().chain(tracker.ledger().thumbnails.values()) {
            assert!(path.starts_with(dir.path().join("ledger_uploads")));
            assert_eq!(fs::read(path).unwrap(), b"pf");
        }
    }

    #[test]
    fn test_missing_upload_is_rejected() {
        let mut tracker = LocalTracker::new();
        let version = tracker.create_version(VersionRequest::default()).unwrap();
        let err = tracker
            .upload_to_version(version.id, "uploaded_movie", Path::new("/nope/x.png"))
            .unwrap_err();
        assert!(matches!(err, TrackerError::Upload(_)));
    }

    #[test]
    fn test_context_template_fields() {
        let ctx = EntityContext {
            entity: Some(EntityRef::new("Asset", 4, "car")),
            step: Some(EntityRef::new("Step", 1, "model")),
            ..Default::default()
        };
        let fields = ctx.as_template_fields();
        assert_eq!(fields["Asset"], FieldValue::from("car"));
        assert_eq!(fields["Step"], FieldValue::from("model"));
    }
}
