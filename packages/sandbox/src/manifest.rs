// ABOUTME: Dependency manifest parsing and normalization
// ABOUTME: Accepts list or name→version map per section and canonicalizes into name[@version] tokens

use crate::error::{Result, SandboxError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Caller-supplied dependency declaration: a JSON object with up to three
/// optional sections. Each section is either a plain list (latest version
/// implied) or a name→version map (pinned).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencyManifest {
    /// Git-hosted libraries, `owner/repo` names.
    #[serde(default)]
    pub git: Option<SectionSpec>,
    #[serde(default)]
    pub npm: Option<SectionSpec>,
    #[serde(default)]
    pub yarn: Option<SectionSpec>,
}

/// A manifest section in either of its two accepted shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SectionSpec {
    List(Vec<String>),
    Pinned(BTreeMap<String, String>),
}

/// Canonical form consumed by the installer: ordered `name[@version]` tokens
/// per section. Pinned sections iterate in sorted name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedManifest {
    pub git: Vec<String>,
    pub npm: Vec<String>,
    pub yarn: Vec<String>,
}

impl DependencyManifest {
    /// Load a manifest from disk. A missing or unparseable file is a
    /// configuration error, reported before any container is created.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Configuration(format!(
                "cannot read dependency manifest {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SandboxError::Configuration(format!(
                "invalid dependency manifest {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn normalize(&self) -> NormalizedManifest {
        NormalizedManifest {
            git: tokens(&self.git),
            npm: tokens(&self.npm),
            yarn: tokens(&self.yarn),
        }
    }
}

impl NormalizedManifest {
    pub fn is_empty(&self) -> bool {
        self.git.is_empty() && self.npm.is_empty() && self.yarn.is_empty()
    }
}

fn tokens(section: &Option<SectionSpec>) -> Vec<String> {
    match section {
        None => Vec::new(),
        Some(SectionSpec::List(names)) => {
            names.iter().map(|name| token(name, None)).collect()
        }
        Some(SectionSpec::Pinned(pins)) => pins
            .iter()
            .map(|(name, version)| token(name, Some(version)))
            .collect(),
    }
}

fn token(name: &str, version: Option<&str>) -> String {
    let name = name.trim();
    match version.map(str::trim) {
        Some(version) if !version.is_empty() && version != "latest" => {
            format!("{}@{}", name, version)
        }
        _ => name.to_string(),
    }
}
