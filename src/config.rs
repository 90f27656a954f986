// src/config.rs

//! Manages node configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// The scope that is always present and that the convenience APIs on
/// [`crate::node::Node`] operate on.
pub const DEFAULT_SCOPE: &str = "default";

/// The full configuration of a roster node.
///
/// Typically deserialized from a TOML file via [`Config::from_file`], or
/// built programmatically for embedded/test use.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The cluster-unique name of this node.
    pub node: String,
    /// The scopes this node participates in. The `default` scope is always
    /// created, whether or not it is listed here.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Capacity of each scope actor's mailbox. Peer messages that arrive
    /// while the mailbox is full are dropped (the mesh is best-effort);
    /// local API calls apply backpressure instead.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_scopes() -> Vec<String> {
    vec![DEFAULT_SCOPE.to_string()]
}

fn default_mailbox_capacity() -> usize {
    1024
}

impl Config {
    /// Creates a configuration for a single node with the default scope only.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            scopes: default_scopes(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }

    /// Adds a scope to the configuration.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node.trim().is_empty() {
            return Err(anyhow!("node name cannot be empty"));
        }
        if self.mailbox_capacity == 0 {
            return Err(anyhow!("mailbox_capacity cannot be 0"));
        }
        for (i, scope) in self.scopes.iter().enumerate() {
            if scope.trim().is_empty() {
                return Err(anyhow!("invalid scope #{}: name cannot be empty", i + 1));
            }
            if self.scopes[..i].contains(scope) {
                return Err(anyhow!("duplicate scope '{scope}'"));
            }
        }
        Ok(())
    }

    /// The scopes to bring up on this node: the configured ones, with the
    /// `default` scope prepended when absent.
    pub fn effective_scopes(&self) -> Vec<String> {
        let mut scopes = self.scopes.clone();
        if !scopes.iter().any(|s| s == DEFAULT_SCOPE) {
            scopes.insert(0, DEFAULT_SCOPE.to_string());
        }
        scopes
    }
}
