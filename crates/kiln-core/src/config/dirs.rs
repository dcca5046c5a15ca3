use crate::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

/// Application directories following XDG spec
#[derive(Debug, Clone)]
pub struct Directories {
    /// Config directory (~/.config/kiln)
    pub config: PathBuf,

    /// Data directory (~/.local/share/kiln)
    pub data: PathBuf,

    /// Config file path
    pub config_file: PathBuf,
}

impl Directories {
    /// Create a new `Directories` instance with standard XDG paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the system's project directories cannot be determined.
    pub fn new() -> Result<Self> {
        let project = ProjectDirs::from("", "", "kiln")
            .ok_or_else(|| Error::Config("Failed to determine project directories".to_string()))?;

        let config = project.config_dir().to_path_buf();
        Ok(Self {
            config_file: config.join("config.json"),
            data: project.data_dir().to_path_buf(),
            config,
        })
    }

    #[must_use]
    pub fn with_base(base: PathBuf) -> Self {
        Self {
            config_file: base.join("config.json"),
            data: base.join("data"),
            config: base,
        }
    }

    /// Point the data directory somewhere else, keeping config paths.
    #[must_use]
    pub fn with_data_dir(mut self, data: PathBuf) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn package_index(&self) -> PathBuf {
        self.data.join("package_index.json")
    }

    #[must_use]
    pub fn installed_file(&self) -> PathBuf {
        self.data.join("installed.json")
    }

    /// Where downloaded archives wait for checksum verification
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.data.join("staging")
    }

    #[must_use]
    pub fn packages(&self) -> PathBuf {
        self.data.join("packages")
    }

    /// Root of one installed platform release.
    #[must_use]
    pub fn platform_dir(&self, packager: &str, architecture: &str, version: &str) -> PathBuf {
        self.packages()
            .join(packager)
            .join("hardware")
            .join(architecture)
            .join(version)
    }

    /// Ensure all directories exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config)?;
        std::fs::create_dir_all(&self.data)?;
        std::fs::create_dir_all(self.staging())?;
        std::fs::create_dir_all(self.packages())?;
        Ok(())
    }
}
