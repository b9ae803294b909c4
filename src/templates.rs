//! Template System - Path Contracts
//!
//! A template maps named fields to a concrete path and back. Parsing and
//! rendering are inverse operations for every path the template accepts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub type TemplateName = String;

/// Resolved field values, keyed by template key name.
pub type Fields = BTreeMap<String, FieldValue>;

/// Name of the key carrying the version number.
pub const VERSION_KEY: &str = "version";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Path '{path}' does not match template '{template}'")]
    Mismatch { template: String, path: String },

    #[error("Template '{template}' requires field '{field}'")]
    MissingField { template: String, field: String },

    #[error("Invalid value '{value}' for field '{field}' in template '{template}'")]
    InvalidValue {
        template: String,
        field: String,
        value: String,
    },

    #[error("Template not found: {0}")]
    Unknown(String),

    #[error("Template '{template}' references undefined key '{key}'")]
    UnknownKey { template: String, key: String },

    #[error("Template '{template}' references undefined storage root '{root}'")]
    UnknownRoot { template: String, root: String },

    #[error("Invalid template definition '{0}'")]
    InvalidDefinition(String),

    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Path '{path}' matches several templates: {candidates:?}")]
    Ambiguous {
        path: String,
        candidates: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(u64),
    Str(String),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            FieldValue::Int(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(v)
    }
}

// --- Key definitions (configuration form) ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Str,
    Int,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDef {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// Zero padding for integer keys, written as `"03"`.
    #[serde(default)]
    pub format_spec: Option<String>,
    /// `alphanumeric` or `alpha` for string keys.
    #[serde(default)]
    pub filter_by: Option<String>,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub default: Option<FieldValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathDef {
    Plain(String),
    Rooted {
        definition: String,
        #[serde(default)]
        root_name: Option<String>,
    },
}

/// The template section of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub roots: BTreeMap<String, String>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyDef>,
    #[serde(default)]
    pub paths: BTreeMap<TemplateName, PathDef>,
}

// --- Resolved keys ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrFilter {
    Any,
    Alphanumeric,
    Alpha,
    Choices(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Str(StrFilter),
    /// Padding is a property of the key, never inferred from a value.
    Int { padding: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateKey {
    pub name: String,
    pub kind: KeyKind,
    pub default: Option<FieldValue>,
}

impl TemplateKey {
    pub fn string(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: KeyKind::Str(StrFilter::Any),
            default: None,
        }
    }

    pub fn int(name: &str, padding: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: KeyKind::Int { padding },
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_filter(mut self, filter: StrFilter) -> Self {
        self.kind = KeyKind::Str(filter);
        self
    }

    pub fn from_def(name: &str, def: &KeyDef) -> Result<Self, TemplateError> {
        let invalid = |reason: String| TemplateError::InvalidKey {
            key: name.to_string(),
            reason,
        };

        let kind = match def.key_type {
            KeyType::Int => {
                let padding = match def.format_spec.as_deref() {
                    None => 0,
                    Some(spec) => {
                        let digits = spec.strip_prefix('0').unwrap_or(spec);
                        digits
                            .parse::<usize>()
                            .map_err(|_| invalid(format!("bad format_spec '{}'", spec)))?
                    }
                };
                KeyKind::Int { padding }
            }
            KeyType::Str => {
                let filter = if !def.choices.is_empty() {
                    StrFilter::Choices(def.choices.clone())
                } else {
                    match def.filter_by.as_deref() {
                        None => StrFilter::Any,
                        Some("alphanumeric") => StrFilter::Alphanumeric,
                        Some("alpha") => StrFilter::Alpha,
                        Some(other) => return Err(invalid(format!("unknown filter '{}'", other))),
                    }
                };
                KeyKind::Str(filter)
            }
        };

        let key = Self {
            name: name.to_string(),
            kind,
            default: def.default.clone(),
        };
        if let Some(default) = &key.default {
            if !key.accepts(default) {
                return Err(invalid(format!("default '{}' does not fit the key", default)));
            }
        }
        Ok(key)
    }

    fn pattern(&self) -> String {
        match &self.kind {
            KeyKind::Int { .. } => r"\d+".to_string(),
            KeyKind::Str(StrFilter::Any) => r"[^/]+?".to_string(),
            KeyKind::Str(StrFilter::Alphanumeric) => r"[A-Za-z0-9]+".to_string(),
            KeyKind::Str(StrFilter::Alpha) => r"[A-Za-z]+".to_string(),
            KeyKind::Str(StrFilter::Choices(choices)) => {
                let alternatives: Vec<_> = choices.iter().map(|c| regex::escape(c)).collect();
                format!("(?:{})", alternatives.join("|"))
            }
        }
    }

    /// Render a value the way it appears in a path.
    pub fn format_value(&self, value: &FieldValue) -> Option<String> {
        if !self.accepts(value) {
            return None;
        }
        Some(match (&self.kind, value) {
            (KeyKind::Int { padding }, FieldValue::Int(v)) => {
                format!("{:0width$}", v, width = *padding)
            }
            (_, v) => v.to_string(),
        })
    }

    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (&self.kind, value) {
            (KeyKind::Int { .. }, FieldValue::Int(_)) => true,
            (KeyKind::Str(filter), FieldValue::Str(s)) => {
                if s.is_empty() || s.contains('/') || s.contains('\\') {
                    return false;
                }
                match filter {
                    StrFilter::Any => true,
                    StrFilter::Alphanumeric => s.chars().all(|c| c.is_ascii_alphanumeric()),
                    StrFilter::Alpha => s.chars().all(|c| c.is_ascii_alphabetic()),
                    StrFilter::Choices(choices) => choices.iter().any(|c| c == s),
                }
            }
            _ => false,
        }
    }

    fn value_from_text(&self, text: &str) -> Option<FieldValue> {
        match &self.kind {
            KeyKind::Int { padding } => {
                let v: u64 = text.parse().ok()?;
                // Reject text whose canonical rendering differs ("0012" with padding 3).
                if format!("{:0width$}", v, width = *padding) != text {
                    return None;
                }
                Some(FieldValue::Int(v))
            }
            KeyKind::Str(_) => Some(FieldValue::Str(text.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field(String),
}

/// A parametrized path pattern.
#[derive(Debug, Clone)]
pub struct Template {
    name: TemplateName,
    definition: String,
    root: Option<String>,
    tokens: Vec<Token>,
    keys: BTreeMap<String, TemplateKey>,
    pattern: Regex,
}

pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

impl Template {
    /// Build a template from a definition such as
    /// `assets/{Asset}/{Step}/publish/{name}.v{version}.vpb`, optionally prefixed by a storage root.
    pub fn new(
        name: &str,
        definition: &str,
        root: Option<&str>,
        keys: &BTreeMap<String, TemplateKey>,
    ) -> Result<Self, TemplateError> {
        let root = root.map(|r| r.replace('\\', "/").trim_end_matches('/').to_string());
        let full = match &root {
            Some(root) => format!("{}/{}", root, definition.trim_start_matches('/')),
            None => definition.to_string(),
        };

        let tokens = tokenize(&full)?;
        let mut used = BTreeMap::new();
        let mut regex_src = String::from("^");
        for (index, token) in tokens.iter().enumerate() {
            match token {
                Token::Literal(text) => regex_src.push_str(&regex::escape(text)),
                Token::Field(key_name) => {
                    let key = keys.get(key_name).ok_or_else(|| TemplateError::UnknownKey {
                        template: name.to_string(),
                        key: key_name.clone(),
                    })?;
                    regex_src.push_str(&format!("(?P<f{}>{})", index, key.pattern()));
                    used.insert(key_name.clone(), key.clone());
                }
            }
        }
        regex_src.push('$');

        let pattern =
            Regex::new(&regex_src).map_err(|_| TemplateError::InvalidDefinition(full.clone()))?;

        Ok(Self {
            name: name.to_string(),
            definition: full,
            root,
            tokens,
            keys: used,
            pattern,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The definition including the storage root prefix.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Storage root the definition is prefixed with, if any.
    pub fn root_path(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TemplateKey> {
        self.keys.values()
    }

    pub fn key(&self, name: &str) -> Option<&TemplateKey> {
        self.keys.get(name)
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    /// Keys that must be supplied when rendering.
    pub fn required_keys(&self) -> Vec<&str> {
        self.keys
            .values()
            .filter(|k| k.default.is_none())
            .map(|k| k.name.as_str())
            .collect()
    }

    /// Extract the field values encoded in `path`.
    ///
    /// Backslashes are read as `/`. The round trip `render(parse(p)) == p`
    /// holds for paths already using `/`; other paths render back normalized.
    pub fn parse(&self, path: impl AsRef<Path>) -> Result<Fields, TemplateError> {
        let text = normalize_path(path.as_ref());
        let mismatch = || TemplateError::Mismatch {
            template: self.name.clone(),
            path: text.clone(),
        };

        let caps = self.pattern.captures(&text).ok_or_else(mismatch)?;
        let mut fields = Fields::new();
        for (index, token) in self.tokens.iter().enumerate() {
            let Token::Field(key_name) = token else {
                continue;
            };
            let raw = caps
                .name(&format!("f{}", index))
                .map(|m| m.as_str())
                .ok_or_else(mismatch)?;
            let key = &self.keys[key_name];
            let value = key.value_from_text(raw).ok_or_else(mismatch)?;
            match fields.get(key_name) {
                Some(existing) if existing != &value => return Err(mismatch()),
                _ => {
                    fields.insert(key_name.clone(), value);
                }
            }
        }
        Ok(fields)
    }

    /// Render a path from field values. Extra fields are ignored.
    pub fn render(&self, fields: &Fields) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.definition.len());
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Field(key_name) => {
                    let key = &self.keys[key_name];
                    let value = fields
                        .get(key_name)
                        .or(key.default.as_ref())
                        .ok_or_else(|| TemplateError::MissingField {
                            template: self.name.clone(),
                            field: key_name.clone(),
                        })?;
                    let text = key
                        .format_value(value)
                        .ok_or_else(|| TemplateError::InvalidValue {
                            template: self.name.clone(),
                            field: key_name.clone(),
                            value: value.to_string(),
                        })?;
                    out.push_str(&text);
                }
            }
        }
        Ok(out)
    }

    pub fn validate(&self, path: impl AsRef<Path>) -> bool {
        self.parse(path).is_ok()
    }
}

fn tokenize(definition: &str) -> Result<Vec<Token>, TemplateError> {
    let invalid = || TemplateError::InvalidDefinition(definition.to_string());
    let mut tokens = vec![];
    let mut rest = definition;

    while !rest.is_empty() {
        match rest.find('{') {
            Some(start) => {
                if start > 0 {
                    tokens.push(Token::Literal(rest[..start].to_string()));
                }
                let after = &rest[start + 1..];
                let end = after.find('}').ok_or_else(invalid)?;
                let key = &after[..end];
                if key.is_empty() || key.contains('{') {
                    return Err(invalid());
                }
                // Two adjacent fields cannot be split back apart.
                if matches!(tokens.last(), Some(Token::Field(_))) && start == 0 {
                    return Err(invalid());
                }
                tokens.push(Token::Field(key.to_string()));
                rest = &after[end + 1..];
            }
            None => {
                if rest.contains('}') {
                    return Err(invalid());
                }
                tokens.push(Token::Literal(rest.to_string()));
                rest = "";
            }
        }
    }
    Ok(tokens)
}

/// Template registry - resolves and caches templates
pub struct TemplateRegistry {
    templates: HashMap<TemplateName, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn from_config(config: &TemplateConfig) -> Result<Self, TemplateError> {
        let keys = config
            .keys
            .iter()
            .map(|(name, def)| TemplateKey::from_def(name, def).map(|k| (name.clone(), k)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let mut registry = Self::new();
        for (name, path_def) in &config.paths {
            let (definition, root_name) = match path_def {
                PathDef::Plain(definition) => (definition.as_str(), None),
                PathDef::Rooted {
                    definition,
                    root_name,
                } => (definition.as_str(), root_name.as_deref()),
            };

            // A single configured root is implied; otherwise `primary` is the default.
            let root = match root_name {
                Some(root_name) => Some(config.roots.get(root_name).ok_or_else(|| {
                    TemplateError::UnknownRoot {
                        template: name.clone(),
                        root: root_name.to_string(),
                    }
                })?),
                None if config.roots.len() == 1 => config.roots.values().next(),
                None => config.roots.get("primary"),
            };

            let template = Template::new(name, definition, root.map(String::as_str), &keys)?;
            registry.register(template);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Template, TemplateError> {
        self.get(name)
            .ok_or_else(|| TemplateError::Unknown(name.to_string()))
    }

    /// All templates, sorted by name.
    pub fn list(&self) -> Vec<&Template> {
        let mut templates: Vec<_> = self.templates.values().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    /// The unique template able to parse `path`, if any.
    pub fn template_from_path(&self, path: impl AsRef<Path>) -> Result<Option<&Template>, TemplateError> {
        let path = path.as_ref();
        let matches: Vec<&Template> = self
            .list()
            .into_iter()
            .filter(|t| t.validate(path))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(TemplateError::Ambiguous {
                path: normalize_path(path),
                candidates: matches.iter().map(|t| t.name.clone()).collect(),
            }),
        }
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
