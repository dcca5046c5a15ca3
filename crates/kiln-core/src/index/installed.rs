use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPlatform {
    pub packager: String,
    pub architecture: String,
    pub version: String,
}

impl InstalledPlatform {
    #[must_use]
    pub fn new(packager: &str, architecture: &str, version: &str) -> Self {
        Self {
            packager: packager.to_string(),
            architecture: architecture.to_string(),
            version: version.to_string(),
        }
    }
}

/// Contents of `installed.json`: at most one version per platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledSet {
    #[serde(default)]
    platforms: Vec<InstalledPlatform>,
}

impl InstalledSet {
    /// Load installed platforms; a missing file is an empty set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No installed platforms recorded at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist through a temp file so readers never see a partial write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    #[must_use]
    pub fn find(&self, packager: &str, architecture: &str) -> Option<&InstalledPlatform> {
        self.platforms
            .iter()
            .find(|p| p.packager == packager && p.architecture == architecture)
    }

    /// Record a platform, replacing any other installed version of it.
    pub fn insert(&mut self, platform: InstalledPlatform) {
        self.platforms
            .retain(|p| !(p.packager == platform.packager && p.architecture == platform.architecture));
        self.platforms.push(platform);
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstalledPlatform> {
        self.platforms.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces_version() {
        let mut set = InstalledSet::default();
        set.insert(InstalledPlatform::new("acme", "samd", "1.0.0"));
        set.insert(InstalledPlatform::new("acme", "avr", "2.0.0"));
        set.insert(InstalledPlatform::new("acme", "samd", "1.1.0"));

        assert_eq!(set.len(), 2);
        assert_eq!(set.find("acme", "samd").unwrap().version, "1.1.0");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/installed.json");

        let mut set = InstalledSet::default();
        set.insert(InstalledPlatform::new("acme", "samd", "1.0.0"));
        set.save(&path).unwrap();

        let loaded = InstalledSet::load(&path).unwrap();
        assert_eq!(loaded, set);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InstalledSet::load(&dir.path().join("installed.json")).unwrap().is_empty());
    }
}
