use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, error::WithContext};

/// One configured query, addressed by its alias.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub alias: String,
    pub sql: String,
    pub host: String,
    pub database: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Key/value store holding per-alias database credentials.
pub trait SecretSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Secrets read from the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapSecrets {
    values: HashMap<String, String>,
}

impl MapSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Register both credential keys for `alias`.
    pub fn with_credential(self, alias: &str, username: &str, password: &str) -> Self {
        let (user_key, pass_key) = credential_keys(alias);
        self.with(user_key, username).with(pass_key, password)
    }
}

impl SecretSource for MapSecrets {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// `SQL_<ALIAS>_USERNAME` / `SQL_<ALIAS>_PASSWORD`, alias upper-cased with
/// anything outside `[A-Z0-9]` mapped to `_`.
pub fn credential_keys(alias: &str) -> (String, String) {
    let normalized: String = alias
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    (
        format!("SQL_{normalized}_USERNAME"),
        format!("SQL_{normalized}_PASSWORD"),
    )
}

#[derive(Deserialize)]
struct EntryDoc {
    sql: String,
    host: String,
    database: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AliasDocument {
    Wrapped { queries: BTreeMap<String, EntryDoc> },
    Bare(BTreeMap<String, EntryDoc>),
}

/// Read-only snapshot of the alias document plus the secret store used to
/// enrich definitions with credentials.
#[derive(Clone)]
pub struct AliasRegistry {
    entries: BTreeMap<String, QueryDefinition>,
    secrets: Arc<dyn SecretSource>,
    source: Option<PathBuf>,
}

impl fmt::Debug for AliasRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliasRegistry")
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .field("source", &self.source)
            .finish()
    }
}

impl AliasRegistry {
    pub fn new(
        definitions: impl IntoIterator<Item = QueryDefinition>,
        secrets: Arc<dyn SecretSource>,
    ) -> Self {
        let entries = definitions
            .into_iter()
            .map(|def| (def.alias.clone(), def))
            .collect();
        Self {
            entries,
            secrets,
            source: None,
        }
    }

    pub fn from_yaml_str(doc: &str, secrets: Arc<dyn SecretSource>) -> Result<Self> {
        let parsed: AliasDocument = serde_yaml::from_str(doc)?;
        let raw = match parsed {
            AliasDocument::Wrapped { queries } => queries,
            AliasDocument::Bare(map) => map,
        };
        let definitions = raw.into_iter().map(|(alias, entry)| QueryDefinition {
            alias,
            sql: entry.sql,
            host: entry.host,
            database: entry.database,
        });
        Ok(Self::new(definitions, secrets))
    }

    pub fn load(path: impl AsRef<Path>, secrets: Arc<dyn SecretSource>) -> Result<Self> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .map_err(Error::from)
            .context(format!("reading alias document {}", path.display()))?;
        let mut registry = Self::from_yaml_str(&doc, secrets)
            .context(format!("parsing alias document {}", path.display()))?;
        registry.source = Some(path.to_path_buf());
        tracing::debug!(
            target: "sqlbot::registry",
            path = %path.display(),
            aliases = registry.len(),
            "alias document loaded"
        );
        Ok(registry)
    }

    /// Fresh snapshot from the same document. Registries built in memory
    /// return an unchanged copy.
    pub fn reload(&self) -> Result<Self> {
        match &self.source {
            Some(path) => Self::load(path, self.secrets.clone()),
            None => Ok(self.clone()),
        }
    }

    pub fn lookup(&self, alias: &str) -> Option<&QueryDefinition> {
        self.entries.get(alias)
    }

    /// `None` when either credential key is absent or the username is blank.
    pub fn resolve_credential(&self, alias: &str) -> Option<Credential> {
        let (user_key, pass_key) = credential_keys(alias);
        let username = self.secrets.get(&user_key).filter(|u| !u.trim().is_empty())?;
        let password = self.secrets.get(&pass_key)?;
        Some(Credential { username, password })
    }

    /// Definitions ordered by alias.
    pub fn entries(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
