//! Versioning - next-version probing and version tokens in file names

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::templates::{normalize_path, FieldValue, Fields, Template, TemplateError, VERSION_KEY};

/// Placeholder version used to locate the version token in a rendered name.
const DUMMY_VERSION: u64 = 9876;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBump {
    pub path: String,
    pub version: Option<u64>,
    /// False when the template carries no version key and the path is reused.
    pub versioned: bool,
}

/// Find the next free version of `path` under `template`.
///
/// The version is incremented and the path re-rendered until `exists`
/// reports a free slot.
pub fn next_version(
    template: &Template,
    path: impl AsRef<Path>,
    exists: impl Fn(&Path) -> bool,
) -> Result<VersionBump, TemplateError> {
    let path = path.as_ref();
    if !template.has_key(VERSION_KEY) {
        warn!(
            template = template.name(),
            "template has no version key, the existing file will be overwritten"
        );
        return Ok(VersionBump {
            path: normalize_path(path),
            version: None,
            versioned: false,
        });
    }

    let mut fields = template.parse(path)?;
    let mut version = fields
        .get(VERSION_KEY)
        .and_then(FieldValue::as_int)
        .unwrap_or(0);
    loop {
        version += 1;
        fields.insert(VERSION_KEY.to_string(), FieldValue::Int(version));
        let candidate = template.render(&fields)?;
        if !exists(Path::new(&candidate)) {
            debug!(path = %candidate, version, "next free version");
            return Ok(VersionBump {
                path: candidate,
                version: Some(version),
                versioned: true,
            });
        }
    }
}

/// [`next_version`] probing the local filesystem.
pub fn next_version_on_disk(
    template: &Template,
    path: impl AsRef<Path>,
) -> Result<VersionBump, TemplateError> {
    next_version(template, path, |p| p.exists())
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // stem ending in a separator, `v`, digits, optional extension
        Regex::new(r"^(?P<stem>.*[._-])[vV](?P<ver>\d+)(?P<rest>\..*)?$").unwrap()
    })
}

/// Version token of a file name such as `car.v003.vpb` or `car_v12.vpb`.
pub fn version_from_path(path: impl AsRef<Path>) -> Option<u64> {
    let name = path.as_ref().file_name()?.to_string_lossy().into_owned();
    let caps = version_regex().captures(&name)?;
    caps.name("ver")?.as_str().parse().ok()
}

/// Same path with the file name's version token incremented, keeping its padding.
pub fn bump_path_version(path: impl AsRef<Path>) -> Option<String> {
    let path = path.as_ref();
    let name = path.file_name()?.to_string_lossy().into_owned();
    let caps = version_regex().captures(&name)?;
    let digits = caps.name("ver")?.as_str();
    let next = digits.parse::<u64>().ok()? + 1;
    let marker = &name[caps.name("ver")?.start() - 1..caps.name("ver")?.start()];
    let new_name = format!(
        "{}{}{:0width$}{}",
        caps.name("stem")?.as_str(),
        marker,
        next,
        caps.name("rest").map_or("", |m| m.as_str()),
        width = digits.len()
    );
    Some(normalize_path(&path.with_file_name(new_name)))
}

/// File name with its version token and separator removed: `car.v003.vpb` gives `car.vpb`.
pub fn strip_version_token(path: impl AsRef<Path>) -> Option<String> {
    let name = path.as_ref().file_name()?.to_string_lossy().into_owned();
    let Some(caps) = version_regex().captures(&name) else {
        return Some(name);
    };
    let stem = caps.name("stem")?.as_str();
    Some(format!(
        "{}{}",
        &stem[..stem.len() - 1],
        caps.name("rest").map_or("", |m| m.as_str())
    ))
}

/// Publish name without its version token.
///
/// Renders the file name with a placeholder version, then removes the
/// placeholder together with its separator and `v` prefix.
pub fn versionless_publish_name(template: &Template, fields: &Fields) -> Result<String, TemplateError> {
    let mut fields = fields.clone();
    let token = match template.key(VERSION_KEY) {
        Some(key) => {
            fields.insert(VERSION_KEY.to_string(), FieldValue::Int(DUMMY_VERSION));
            key.format_value(&FieldValue::Int(DUMMY_VERSION))
        }
        None => None,
    };
    let rendered = template.render(&fields)?;
    let file_name = Path::new(&rendered)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(rendered);

    let Some(token) = token else {
        return Ok(file_name);
    };
    let strip = Regex::new(&format!(r"[._-]?[vV]?{}", regex::escape(&token)))
        .map_err(|_| TemplateError::InvalidDefinition(template.definition().to_string()))?;
    Ok(strip.replacen(&file_name, 1, "").into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateKey;
    use std::collections::BTreeMap;
    use std::fs;

    fn work_template(root: &str) -> Template {
        let mut keys = BTreeMap::new();
        keys.insert("name".into(), TemplateKey::string("name"));
        keys.insert("version".into(), TemplateKey::int("version", 3));
        Template::new("work", "{name}.v{version}.vpb", Some(root), &keys).unwrap()
    }

    #[test]
    fn test_next_version_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let t = work_template(&root);
        for v in 1..=4 {
            fs::write(format!("{}/car.v{:03}.vpb", root, v), b"").unwrap();
        }

        let bump = next_version_on_disk(&t, format!("{}/car.v001.vpb", root)).unwrap();
        assert_eq!(bump.version, Some(5));
        assert!(bump.path.ends_with("car.v005.vpb"));
    }

    #[test]
    fn test_unversioned_template_returns_same_path() {
        let mut keys = BTreeMap::new();
        keys.insert("name".into(), TemplateKey::string("name"));
        let t = Template::new("flat", "/p/{name}.vpb", None, &keys).unwrap();

        let bump = next_version(&t, "/p/car.vpb", |_| true).unwrap();
        assert!(!bump.versioned);
        assert_eq!(bump.path, "/p/car.vpb");
    }

    #[test]
    fn test_version_from_path_variants() {
        assert_eq!(version_from_path("/p/car.v003.vpb"), Some(3));
        assert_eq!(version_from_path("/p/car_v12.vpb"), Some(12));
        assert_eq!(version_from_path("/p/car-v7"), Some(7));
        assert_eq!(version_from_path("/p/car.vpb"), None);
    }

    #[test]
    fn test_bump_keeps_padding() {
        assert_eq!(bump_path_version("/p/car.v009.vpb").as_deref(), Some("/p/car.v010.vpb"));
        assert_eq!(bump_path_version("/p/car_v1.vpb").as_deref(), Some("/p/car_v2.vpb"));
    }

    #[test]
    fn test_strip_version_token() {
        assert_eq!(strip_version_token("/w/car.v003.vpb").as_deref(), Some("car.vpb"));
        assert_eq!(strip_version_token("/w/car_v3").as_deref(), Some("car"));
        assert_eq!(strip_version_token("/w/car.vpb").as_deref(), Some("car.vpb"));
    }

    #[test]
    fn test_versionless_name() {
        let t = work_template("/p");
        let mut fields = Fields::new();
        fields.insert("name".into(), FieldValue::from("car"));
        fields.insert("version".into(), FieldValue::Int(3));
        assert_eq!(versionless_publish_name(&t, &fields).unwrap(), "car.vpb");
    }
}
