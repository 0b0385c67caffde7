//! Capability-scoped execution context for reviewer invocations
//!
//! A sandbox is assembled from an explicit allow-list. Nothing is inherited
//! from the host: child processes start from an empty environment, see a
//! fresh configuration directory as their home, and lose it when the
//! sandbox is dropped.

use crate::error::{HermesError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// What a reviewer may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read files in the repository under review
    ReadRepository,
    /// Run read-only git commands that produce diffs and history
    ReadDiff,
}

impl Capability {
    /// Tool names granted to the model CLI for this capability
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            Capability::ReadRepository => &["Read", "Grep", "Glob"],
            Capability::ReadDiff => &["Bash(git diff:*)", "Bash(git show:*)", "Bash(git log:*)"],
        }
    }
}

/// Builder for a [`SandboxContext`]
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    repository: PathBuf,
    capabilities: BTreeSet<Capability>,
    env: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            capabilities: BTreeSet::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn allow(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn allow_all(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    /// Pass one environment variable through to child processes
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Create the context and its private configuration directory
    pub fn build(self) -> Result<SandboxContext> {
        if self.capabilities.is_empty() {
            return Err(HermesError::InvalidRequest(
                "sandbox needs at least one capability".to_string(),
            ));
        }

        let config_dir =
            std::env::temp_dir().join(format!("hermes-sandbox-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&config_dir)?;
        tracing::debug!(
            "Created sandbox at {} with {:?}",
            config_dir.display(),
            self.capabilities
        );

        Ok(SandboxContext {
            repository: self.repository,
            capabilities: self.capabilities,
            env: self.env,
            config_dir,
        })
    }
}

/// Live sandbox; its configuration directory is removed on drop
#[derive(Debug)]
pub struct SandboxContext {
    repository: PathBuf,
    capabilities: BTreeSet<Capability>,
    env: BTreeMap<String, String>,
    config_dir: PathBuf,
}

impl SandboxContext {
    pub fn repository(&self) -> &Path {
        &self.repository
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.allows(capability) {
            Ok(())
        } else {
            Err(HermesError::InvalidRequest(format!(
                "sandbox does not grant {:?}",
                capability
            )))
        }
    }

    pub fn allowed_tools(&self) -> Vec<&'static str> {
        self.capabilities
            .iter()
            .flat_map(|c| c.allowed_tools().iter().copied())
            .collect()
    }

    /// Command confined to the sandbox: empty environment apart from
    /// `PATH`, the sandbox home and explicit pass-throughs, run in the
    /// repository and killed if its handle is dropped.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut command = Command::new(program);
        command
            .env_clear()
            .current_dir(&self.repository)
            .env("HOME", &self.config_dir)
            .env("XDG_CONFIG_HOME", &self.config_dir)
            .env("TMPDIR", &self.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.config_dir) {
            tracing::warn!(
                "Failed to remove sandbox {}: {}",
                self.config_dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_removed_on_drop() {
        let sandbox = SandboxSpec::new(".")
            .allow(Capability::ReadRepository)
            .build()
            .unwrap();
        let dir = sandbox.config_dir().to_path_buf();
        assert!(dir.is_dir());

        drop(sandbox);
        assert!(!dir.exists());
    }

    #[test]
    fn test_requires_a_capability() {
        let err = SandboxSpec::new(".").build().unwrap_err();
        assert!(matches!(err, HermesError::InvalidRequest(_)));
    }

    #[test]
    fn test_tools_follow_allow_list() {
        let sandbox = SandboxSpec::new(".")
            .allow(Capability::ReadRepository)
            .build()
            .unwrap();
        let tools = sandbox.allowed_tools();
        assert!(tools.contains(&"Read"));
        assert!(!tools.iter().any(|t| t.starts_with("Bash")));
        assert!(sandbox.require(Capability::ReadDiff).is_err());
    }

    #[test]
    fn test_command_environment_is_explicit() {
        let sandbox = SandboxSpec::new(".")
            .allow(Capability::ReadDiff)
            .env("HERMES_MODEL", "sonnet")
            .build()
            .unwrap();
        let command = sandbox.command("git");

        let keys: Vec<String> = command
            .as_std()
            .get_envs()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.to_string_lossy().into_owned())
            .collect();
        for key in &keys {
            assert!(
                ["HOME", "XDG_CONFIG_HOME", "TMPDIR", "PATH", "HERMES_MODEL"]
                    .contains(&key.as_str()),
                "unexpected variable {}",
                key
            );
        }
        assert!(keys.contains(&"HERMES_MODEL".to_string()));
    }
}
