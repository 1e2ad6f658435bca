use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PushyError, Result};

/// Decides which commands may be pushed to nodes and what nodes actually run.
pub trait Whitelist: Send + Sync {
    /// The command line to run for `command`, or `None` if it is not allowed.
    fn resolve(&self, command: &str) -> Option<String>;
}

/// Allows every command unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Whitelist for AllowAll {
    fn resolve(&self, command: &str) -> Option<String> {
        Some(command.to_string())
    }
}

/// Fixed table of allowed commands.
///
/// Keys are what a job may request; values are what nodes are told to run.
/// A full command maps to itself, a short alias maps to the real command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandWhitelist {
    entries: BTreeMap<String, String>,
}

impl CommandWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `command` as-is.
    pub fn allow(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        self.entries.insert(command.clone(), command);
        self
    }

    /// Allow `name` as a short alias for `command`.
    pub fn alias(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.entries.insert(name.into(), command.into());
        self
    }

    /// Parse a JSON object of `{"name": "command"}` pairs.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: BTreeMap<String, String> = serde_json::from_str(json)?;
        if entries.keys().any(|k| k.trim().is_empty()) {
            return Err(PushyError::Config(
                "whitelist entries must have a non-empty name".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let whitelist = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), entries = whitelist.len(), "Loaded command whitelist");
        Ok(whitelist)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Whitelist for CommandWhitelist {
    fn resolve(&self, command: &str) -> Option<String> {
        self.entries.get(command).cloned()
    }
}
