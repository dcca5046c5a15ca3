//! Sketch directories and their `sketch.json` metadata.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const METADATA_FILE: &str = "sketch.json";

/// Per-sketch defaults used when a request leaves target fields unset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_fqbn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_programmer: Option<String>,
    /// Named target sets selectable at `init`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, SketchProfile>,
}

/// One entry of `sketch.json`'s `profiles`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SketchProfile {
    pub fqbn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub programmer: Option<String>,
}

impl SketchMetadata {
    /// Read `sketch.json` from a sketch directory.
    ///
    /// A missing or unreadable file yields empty metadata; the sketch
    /// directory itself does not have to exist.
    #[must_use]
    pub fn load(sketch: &Path) -> Self {
        let path = sketch.join(METADATA_FILE);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// The defaults with a named profile's fields on top.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the sketch has no such profile.
    pub fn with_profile(mut self, name: &str) -> Result<Self> {
        let profile = self.profiles.get(name).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("Sketch has no profile named '{name}'"))
        })?;
        self.default_fqbn = Some(profile.fqbn);
        self.default_port = profile.port.or(self.default_port);
        self.default_programmer = profile.programmer.or(self.default_programmer);
        Ok(self)
    }

    /// Fill unset defaults from `fallback`.
    #[must_use]
    pub fn or(self, fallback: &Self) -> Self {
        Self {
            default_fqbn: self.default_fqbn.or_else(|| fallback.default_fqbn.clone()),
            default_port: self.default_port.or_else(|| fallback.default_port.clone()),
            default_programmer: self
                .default_programmer
                .or_else(|| fallback.default_programmer.clone()),
            profiles: self.profiles,
        }
    }
}

/// Sketch name: the directory's final component
#[must_use]
pub fn project_name(sketch: &Path) -> String {
    sketch
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Locate the sketch's main file, `<dir>/<dir name>.ino`.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if the directory has no main file.
pub fn main_file(sketch: &Path) -> Result<PathBuf> {
    let name = project_name(sketch);
    let main = sketch.join(format!("{name}.ino"));
    if name.is_empty() || !main.is_file() {
        return Err(Error::InvalidArgument(format!(
            "Not a sketch: {} has no {name}.ino",
            sketch.display()
        )));
    }
    Ok(main)
}
