//! Session - scene file lifecycle
//!
//! Saving with verification, render output preparation and version-up of
//! the working file after a publish.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::host::{HostContext, HostError};
use crate::templates::{FieldValue, TemplateError, TemplateRegistry};
use crate::tracker::EntityContext;
use crate::versioning::{bump_path_version, next_version_on_disk, VersionBump};

/// Field the render template receives with the scene file's stem.
pub const SCENE_NAME_KEY: &str = "scene_name";
pub const RENDER_EXTENSION: &str = "png";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to save file {0}")]
    SaveFailed(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Save the session to `path` and check the file actually landed on disk.
pub fn save_current_file(host: &mut HostContext<'_>, path: &Path) -> Result<(), SessionError> {
    info!(path = %path.display(), "saving session");
    host.scene_mut().save_file(path)?;
    if !path.exists() {
        return Err(SessionError::SaveFailed(path.display().to_string()));
    }
    Ok(())
}

/// Render output file for a scene: the render template's folder plus
/// `{scene_name}.png`. The folder is created.
pub fn render_path_for(
    registry: &TemplateRegistry,
    context: &EntityContext,
    render_template: &str,
    file: &Path,
) -> Result<PathBuf, SessionError> {
    let template = registry.require(render_template)?;
    let scene_name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut fields = context.as_template_fields();
    fields.insert(SCENE_NAME_KEY.to_string(), FieldValue::from(scene_name.as_str()));
    let folder = PathBuf::from(template.render(&fields)?);
    fs::create_dir_all(&folder)?;

    let path = folder.join(format!("{}.{}", scene_name, RENDER_EXTENSION));
    debug!(path = %path.display(), "render path");
    Ok(path)
}

/// Point the host's render output at the scene's render path. Failures are
/// logged and leave the host setting unchanged.
pub fn prepare_render_path(
    host: &mut HostContext<'_>,
    registry: &TemplateRegistry,
    context: &EntityContext,
    render_template: &str,
    file: &Path,
) -> Option<PathBuf> {
    let path = match render_path_for(registry, context, render_template, file) {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "could not generate render path");
            return None;
        }
    };
    if let Err(e) = host.scene_mut().set_render_filename(&path) {
        warn!(error = %e, "could not set render filename");
        return None;
    }
    Some(path)
}

/// Save the session to the next free version of `path`.
///
/// Uses the named work template, else whichever template matches the path,
/// else the file name's own version token. Returns `None` when no newer
/// version can be derived.
pub fn save_to_next_version(
    host: &mut HostContext<'_>,
    registry: &TemplateRegistry,
    work_template: Option<&str>,
    path: &Path,
) -> Result<Option<VersionBump>, SessionError> {
    let template = match work_template {
        Some(name) => Some(registry.require(name)?),
        None => registry.template_from_path(path)?,
    };

    let bump = match template {
        Some(template) => next_version_on_disk(template, path)?,
        None => {
            let mut candidate = bump_path_version(path);
            while let Some(next) = candidate.as_deref().filter(|p| Path::new(p).exists()) {
                candidate = bump_path_version(next);
            }
            match candidate {
                Some(next) => VersionBump {
                    version: crate::versioning::version_from_path(&next),
                    path: next,
                    versioned: true,
                },
                None => {
                    warn!(path = %path.display(), "no version token to increment, session not versioned up");
                    return Ok(None);
                }
            }
        }
    };

    if !bump.versioned {
        return Ok(None);
    }
    save_current_file(host, Path::new(&bump.path))?;
    info!(path = bump.path.as_str(), "session saved to next version");
    Ok(Some(bump))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SceneHost;
    use crate::memory::MemoryScene;
    use crate::templates::{TemplateConfig, TemplateRegistry};
    use crate::tracker::EntityRef;
    use std::collections::HashMap;

    #[test]
    fn test_save_to_next_version_without_template() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("car_v001.vpb");
        let taken = dir.path().join("car_v002.vpb");
        fs::write(&taken, b"").unwrap();

        let mut scene = MemoryScene::default();
        let env: HashMap<String, String> = HashMap::new();
        let mut host = HostContext::new(&mut scene, &env);
        let registry = TemplateRegistry::new();

        let bump = save_to_next_version(&mut host, &registry, None, &work)
            .unwrap()
            .unwrap();
        assert_eq!(bump.version, Some(3));
        assert!(Path::new(&bump.path).exists());
        assert_eq!(
            scene.current_file().map(|p| p.to_string_lossy().replace('\\', "/")),
            Some(bump.path)
        );
    }

    #[test]
    fn test_render_path_uses_scene_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().replace('\\', "/");
        let yaml = format!(
            "roots: {{primary: '{}'}}\nkeys:\n  Asset: {{type: str}}\n  scene_name: {{type: str}}\npaths:\n  renders: 'renders/{{Asset}}/{{scene_name}}'\n",
            root
        );
        let config: TemplateConfig = serde_yaml::from_str(&yaml).unwrap();
        let registry = TemplateRegistry::from_config(&config).unwrap();
        let context = EntityContext {
            entity: Some(EntityRef::new("Asset", 1, "car")),
            ..Default::default()
        };

        let path = render_path_for(&registry, &context, "renders", Path::new("/w/car.v002.vpb")).unwrap();
        assert!(path.ends_with("renders/car/car.v002/car.v002.png"));
        assert!(path.parent().unwrap().is_dir());
    }
}
