//! LMV plugin - review version for the session, with optional viewer translation
//!
//! A version linked to the session publish is always created. When a
//! translator executable is configured and present, the scene is translated
//! in a scratch folder, the output is installed under
//! `<publish root>/translations/lmv/<version id>` and attached to that
//! version. Otherwise the session thumbnail is uploaded instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use super::{
    required_template, session_path, AcceptResult, PublishError, PublishPlugin, RunContext,
};
use crate::item::{props, ItemId, ItemTree};
use crate::templates::normalize_path;
use crate::tracker::{EntityRef, PublishRecord, TrackerRead, TrackingBackend, VersionRecord, VersionRequest};

pub const TRANSLATION_FIELD: &str = "translation_files";
pub const UPLOADED_MOVIE_FIELD: &str = "uploaded_movie";
/// Local property holding the folder translations are installed under.
const TRANSLATION_ROOT: &str = "lmv_translation_root";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LmvPluginSettings {
    pub lmv_publish_template: Option<String>,
    pub work_template: Option<String>,
    /// Translator executable, called as `translator <index.json> <scene>`.
    pub translator: Option<PathBuf>,
}

pub struct LmvPlugin {
    name: String,
    settings: LmvPluginSettings,
}

impl LmvPlugin {
    pub fn new(name: String, settings: LmvPluginSettings) -> Self {
        Self { name, settings }
    }

    fn translator(&self) -> Option<&Path> {
        self.settings
            .translator
            .as_deref()
            .filter(|path| path.is_file())
    }
}

/// Rename the translator's `output/1/{stem}.svf` after the version and list
/// every produced file.
pub fn collect_translation(output: &Path, stem: &str, version_id: u64) -> Result<Vec<PathBuf>, PublishError> {
    let svf = output.join("1").join(format!("{}.svf", stem));
    if !svf.is_file() {
        return Err(PublishError::Tool(format!(
            "translator produced no {}",
            svf.display()
        )));
    }
    fs::rename(&svf, output.join("1").join(format!("{}.svf", version_id)))?;

    let pattern = format!("{}/**/*", output.display());
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).map_err(|e| PublishError::Tool(e.to_string()))? {
        let path = entry.map_err(|e| e.into_error())?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy translator output into `target`, keeping paths relative to `output`.
pub fn install_translation(output: &Path, files: &[PathBuf], target: &Path) -> Result<Vec<PathBuf>, PublishError> {
    let mut installed = Vec::with_capacity(files.len());
    for file in files {
        let relative = file.strip_prefix(output).map_err(|_| {
            PublishError::Tool(format!("{} is outside {}", file.display(), output.display()))
        })?;
        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(file, &dest)?;
        installed.push(dest);
    }
    Ok(installed)
}

fn translate(translator: &Path, source: &Path, version_id: u64) -> Result<(tempfile::TempDir, Vec<PathBuf>), PublishError> {
    let scratch = tempfile::Builder::new().prefix("scenepub_").tempdir()?;
    let file_name = source
        .file_name()
        .ok_or_else(|| PublishError::NotFound(format!("file name of {}", source.display())))?;
    let local = scratch.path().join(file_name);
    fs::copy(source, &local)?;
    let index = scratch.path().join("index.json");
    fs::write(&index, b"")?;

    debug!(translator = %translator.display(), source = %local.display(), "running translator");
    let status = Command::new(translator).arg(&index).arg(&local).status()?;
    if !status.success() {
        return Err(PublishError::Tool(format!(
            "{} exited with {}",
            translator.display(),
            status
        )));
    }

    let stem = local
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let files = collect_translation(&scratch.path().join("output"), &stem, version_id)?;
    Ok((scratch, files))
}

impl PublishPlugin for LmvPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_filters(&self) -> &[&'static str] {
        &["session"]
    }

    fn accept(
        &self,
        _ctx: &RunContext<'_>,
        _tree: &ItemTree,
        _item: ItemId,
    ) -> Result<AcceptResult, PublishError> {
        Ok(AcceptResult::accepted().disabled())
    }

    fn validate(
        &self,
        ctx: &RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        _tracker: &dyn TrackerRead,
    ) -> Result<(), PublishError> {
        let publish = required_template(
            ctx.templates,
            self.settings.lmv_publish_template.as_deref(),
            "LMV publish template",
        )?;
        let work = required_template(
            ctx.templates,
            self.settings.work_template.as_deref(),
            "LMV work template",
        )?;
        let source = session_path(ctx, tree)?;
        if !work.validate(&source) {
            return Err(PublishError::blocking(format!(
                "The session does not match the LMV work template '{}'.",
                work.name()
            )));
        }
        if self.settings.translator.is_some() && self.translator().is_none() {
            warn!("LMV translator not found, the thumbnail will be uploaded instead");
        }

        // Templates without a storage root translate next to the session.
        let root = match publish.root_path() {
            Some(root) => PathBuf::from(root),
            None => source.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        let translations = root.join("translations");
        debug!(root = %translations.display(), "LMV translation root");
        tree.set_local_property(item, props::PUBLISH_TEMPLATE, publish.name());
        tree.set_local_property(item, TRANSLATION_ROOT, normalize_path(&translations));
        Ok(())
    }

    fn publish(
        &self,
        ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
        tracker: &mut dyn TrackingBackend,
    ) -> Result<(), PublishError> {
        let session = tree
            .get_recursive_as::<PublishRecord>(item, props::PUBLISH_DATA)
            .ok_or_else(|| PublishError::blocking("The session must be published before its review version."))?;
        let source = session_path(ctx, tree)?;
        let code = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| tree.item(item).name.clone());

        let version: VersionRecord = tracker.create_version(VersionRequest {
            code,
            description: tree.item(item).description.clone(),
            context: ctx.entity.clone(),
            published_files: vec![session.id],
            path_to_frames: None,
        })?;
        tree.set_property_recursive(item, props::VERSION_DATA, serde_json::to_value(version.entity_ref())?);
        info!(version = version.id, publish = session.id, "review version created");

        match self.translator() {
            Some(translator) => {
                let root = tree
                    .get_path(item, TRANSLATION_ROOT)
                    .ok_or_else(|| PublishError::blocking("The LMV publish has not been validated."))?;
                let target = root.join("lmv").join(version.id.to_string());
                let (scratch, files) = translate(translator, &source, version.id)?;
                let installed = install_translation(&scratch.path().join("output"), &files, &target)?;
                for file in &installed {
                    tracker.upload_to_version(version.id, TRANSLATION_FIELD, file)?;
                }
                let mut fields = Map::new();
                fields.insert("translation_type".into(), Value::String("LMV".into()));
                tracker.update_version(version.id, fields)?;
                info!(version = version.id, files = installed.len(), "LMV translation uploaded");
            }
            None => {
                if let Some(thumbnail) = tree.item(item).thumbnail_path.clone() {
                    if thumbnail.is_file() {
                        tracker.upload_thumbnail(session.id, &thumbnail)?;
                        tracker.upload_to_version(version.id, UPLOADED_MOVIE_FIELD, &thumbnail)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut RunContext<'_>,
        tree: &mut ItemTree,
        item: ItemId,
    ) -> Result<(), PublishError> {
        if let Some(version) = tree.get_as::<EntityRef>(item, props::VERSION_DATA) {
            info!(version = version.id, code = version.name.as_str(), "review version ready");
        }
        Ok(())
    }
}
