use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BtcError;

pub const DEFAULT_SERVER: &str = "https://git.door43.org";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseKey(String);

impl BaseKey {
    pub fn new(owner: &str, language: &str, resource_id: &str) -> Result<Self, BtcError> {
        format!("{owner}/{language}/{resource_id}").parse()
    }

    pub(crate) fn from_validated(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the key into `(owner, language, resource_id)`.
    pub fn parts(&self) -> (&str, &str, &str) {
        let mut parts = self.0.splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let language = parts.next().unwrap_or_default();
        let resource_id = parts.next().unwrap_or_default();
        (owner, language, resource_id)
    }
}

impl From<BaseKey> for String {
    fn from(value: BaseKey) -> Self {
        value.0
    }
}

impl TryFrom<String> for BaseKey {
    type Error = BtcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for BaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BaseKey {
    type Err = BtcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts = trimmed.split('/').collect::<Vec<_>>();
        let is_valid = parts.len() == 3
            && parts.iter().all(|part| !part.is_empty())
            && !trimmed.contains('#')
            && !trimmed.chars().any(char::is_whitespace);
        if !is_valid {
            return Err(BtcError::InvalidBaseKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// A base key that may carry a `#N` ordinal so the same resource can be placed
/// more than once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceKey(String);

impl InstanceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_parts(base: &BaseKey, ordinal: u32) -> Self {
        if ordinal <= 1 {
            Self(base.as_str().to_string())
        } else {
            Self(format!("{}#{ordinal}", base.as_str()))
        }
    }
}

impl From<BaseKey> for InstanceKey {
    fn from(value: BaseKey) -> Self {
        Self(value.0)
    }
}

impl From<InstanceKey> for String {
    fn from(value: InstanceKey) -> Self {
        value.0
    }
}

impl TryFrom<String> for InstanceKey {
    type Error = BtcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceKey {
    type Err = BtcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (base, suffix) = match trimmed.rsplit_once('#') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (trimmed, None),
        };
        if let Some(suffix) = suffix {
            let is_valid_suffix = !suffix.is_empty()
                && suffix.chars().all(|ch| ch.is_ascii_digit())
                && suffix.parse::<u32>().is_ok();
            if !is_valid_suffix {
                return Err(BtcError::InvalidInstanceKey(value.to_string()));
            }
        }
        base.parse::<BaseKey>()
            .map_err(|_| BtcError::InvalidInstanceKey(value.to_string()))?;
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePointer {
    #[serde(default = "default_server")]
    pub server: String,
    pub owner: String,
    pub language: String,
    pub resource_id: String,
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

impl ResourcePointer {
    pub fn new(server: &str, owner: &str, language: &str, resource_id: &str) -> Self {
        Self {
            server: server.to_string(),
            owner: owner.to_string(),
            language: language.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    pub fn from_base_key(server: &str, key: &BaseKey) -> Self {
        let (owner, language, resource_id) = key.parts();
        Self::new(server, owner, language, resource_id)
    }

    pub fn base_key(&self) -> Result<BaseKey, BtcError> {
        BaseKey::new(&self.owner, &self.language, &self.resource_id)
            .map_err(|_| BtcError::InvalidPointer(self.to_string()))
    }

    /// Repository name on a Door43-style server, e.g. `en_ult`.
    pub fn repo_name(&self) -> String {
        format!("{}_{}", self.language, self.resource_id)
    }
}

impl fmt::Display for ResourcePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.owner, self.language, self.resource_id, self.server
        )
    }
}

/// Accepts `owner/language/resourceId` or `owner/language/resourceId@server`.
impl FromStr for ResourcePointer {
    type Err = BtcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (key, server) = match trimmed.split_once('@') {
            Some((key, server)) if !server.is_empty() => (key, server),
            Some(_) => return Err(BtcError::InvalidPointer(value.to_string())),
            None => (trimmed, DEFAULT_SERVER),
        };
        let key: BaseKey = key
            .parse()
            .map_err(|_| BtcError::InvalidPointer(value.to_string()))?;
        Ok(Self::from_base_key(server, &key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStructure {
    #[default]
    Book,
    Entry,
}

impl ContentStructure {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentStructure::Book => "book",
            ContentStructure::Entry => "entry",
        }
    }
}

impl fmt::Display for ContentStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub identifier: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(flatten)]
    pub pointer: ResourcePointer,
    pub title: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub content_structure: ContentStructure,
    pub version: String,
    #[serde(default)]
    pub released_at: Option<String>,
    #[serde(default)]
    pub language_title: Option<String>,
    #[serde(default)]
    pub language_direction: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub readme: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
}

impl ResourceMetadata {
    pub fn base_key(&self) -> Result<BaseKey, BtcError> {
        self.pointer.base_key()
    }

    /// Minimal placeholder for a pointer that could not be resolved.
    pub fn stub(pointer: &ResourcePointer) -> Self {
        Self {
            pointer: pointer.clone(),
            title: pointer.resource_id.clone(),
            subject: String::new(),
            resource_type: String::new(),
            format: None,
            content_structure: ContentStructure::default(),
            version: String::new(),
            released_at: None,
            language_title: None,
            language_direction: None,
            license: None,
            readme: None,
            ingredients: Vec::new(),
        }
    }

    /// Folds a freshly fetched record into this one. Fields the fresh record
    /// leaves empty keep their previous value.
    pub fn merge_from(&mut self, fresh: ResourceMetadata) {
        self.pointer = fresh.pointer;
        if !fresh.title.is_empty() {
            self.title = fresh.title;
        }
        if !fresh.subject.is_empty() {
            self.subject = fresh.subject;
        }
        if !fresh.resource_type.is_empty() {
            self.resource_type = fresh.resource_type;
        }
        if fresh.format.is_some() {
            self.format = fresh.format;
        }
        self.content_structure = fresh.content_structure;
        if !fresh.version.is_empty() {
            self.version = fresh.version;
        }
        if fresh.released_at.is_some() {
            self.released_at = fresh.released_at;
        }
        if fresh.language_title.is_some() {
            self.language_title = fresh.language_title;
        }
        if fresh.language_direction.is_some() {
            self.language_direction = fresh.language_direction;
        }
        if fresh.license.is_some() {
            self.license = fresh.license;
        }
        if fresh.readme.is_some() {
            self.readme = fresh.readme;
        }
        if !fresh.ingredients.is_empty() {
            self.ingredients = fresh.ingredients;
        }
    }
}
