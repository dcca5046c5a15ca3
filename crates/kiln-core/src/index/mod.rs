//! Package index and installed-platform state.
//!
//! `package_index.json` lists every platform release the daemon can install.
//! `installed.json` records which releases are present under `packages/`.
//! Together they form an instance's [`IndexState`].

mod installed;

pub use installed::{InstalledPlatform, InstalledSet};

use crate::config::Directories;
use crate::fqbn::Fqbn;
use crate::sketch::SketchMetadata;
use crate::{Error, Result};
use kiln_types::BoardListItem;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageIndex {
    #[serde(default)]
    pub packages: Vec<Package>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub platforms: Vec<PlatformRelease>,
}

/// One installable version of a platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRelease {
    pub architecture: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_file_name: Option<String>,
    /// `SHA-256:<hex>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// argv run after unpacking, relative to the platform directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_install: Vec<String>,
    /// argv of the build recipe, with `{...}` placeholders
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compile: Vec<String>,
    #[serde(default)]
    pub boards: Vec<BoardDefinition>,
    #[serde(default)]
    pub programmers: Vec<Programmer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "usb_ids")]
    pub vid: Vec<String>,
    #[serde(default, deserialize_with = "usb_ids")]
    pub pid: Vec<String>,
    /// Replaces the platform debug profile for this board
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugProfile>,
}

impl BoardDefinition {
    /// True when any (vid, pid) pair at the same position matches.
    #[must_use]
    pub fn matches_usb(&self, vid: &str, pid: &str) -> bool {
        let vid = normalize_usb_id(vid);
        let pid = normalize_usb_id(pid);
        self.vid
            .iter()
            .zip(&self.pid)
            .any(|(v, p)| *v == vid && *p == pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Programmer {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Debugger selection for a platform or board.
///
/// String fields may contain `{...}` placeholders expanded by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    pub toolchain: String,
    #[serde(default)]
    pub toolchain_path: String,
    #[serde(default)]
    pub toolchain_prefix: String,
    pub server: String,
    #[serde(default)]
    pub server_path: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub toolchain_configuration: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub server_configuration: Map<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_configs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svd_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_programmer: Option<String>,
}

fn usb_ids<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw.iter().map(|id| normalize_usb_id(id)).collect())
}

/// `0x2341` and `2341` compare equal; case is ignored.
#[must_use]
pub fn normalize_usb_id(id: &str) -> String {
    let id = id.trim();
    let id = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    id.to_ascii_lowercase()
}

/// Dotted numeric comparison; non-numeric parts compare as text.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl PackageIndex {
    /// Load the index file.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid index.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!("Package index not found at {}", path.display());
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let index: Self = serde_json::from_str(&content).map_err(|e| {
            Error::OperationFailed(format!(
                "Malformed package index {} (line {}, column {}): {e}",
                path.display(),
                e.line(),
                e.column()
            ))
        })?;
        Ok(Some(index))
    }

    /// Find a release; an empty or absent version picks the highest one.
    #[must_use]
    pub fn find_platform(
        &self,
        packager: &str,
        architecture: &str,
        version: Option<&str>,
    ) -> Option<&PlatformRelease> {
        let mut candidates = self
            .packages
            .iter()
            .filter(|p| p.name == packager)
            .flat_map(|p| &p.platforms)
            .filter(|r| r.architecture == architecture);

        match version.filter(|v| !v.is_empty()) {
            Some(version) => candidates.find(|r| r.version == version),
            None => candidates.max_by(|a, b| compare_versions(&a.version, &b.version)),
        }
    }
}

/// A board resolved against an installed platform release
#[derive(Debug, Clone)]
pub struct ResolvedBoard<'a> {
    pub fqbn: Fqbn,
    pub platform: &'a PlatformRelease,
    pub board: &'a BoardDefinition,
    pub platform_path: PathBuf,
}

/// Per-instance view of what is known and what is installed
#[derive(Debug, Clone, Default)]
pub struct IndexState {
    pub index: PackageIndex,
    pub installed: InstalledSet,
    /// Target defaults of the sketch the instance was initialized with
    pub sketch_defaults: SketchMetadata,
    packages_dir: PathBuf,
    loaded: bool,
}

impl IndexState {
    #[must_use]
    pub fn new(index: PackageIndex, installed: InstalledSet, dirs: &Directories) -> Self {
        Self {
            index,
            installed,
            sketch_defaults: SketchMetadata::default(),
            packages_dir: dirs.packages(),
            loaded: true,
        }
    }

    /// Whether `Init` has populated this state
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn platform_path(&self, packager: &str, architecture: &str, version: &str) -> PathBuf {
        self.packages_dir
            .join(packager)
            .join("hardware")
            .join(architecture)
            .join(version)
    }

    /// The index entry of the installed release of a platform.
    #[must_use]
    pub fn installed_release(
        &self,
        packager: &str,
        architecture: &str,
    ) -> Option<&PlatformRelease> {
        let installed = self.installed.find(packager, architecture)?;
        self.index
            .find_platform(packager, architecture, Some(&installed.version))
    }

    /// Resolve a board name against installed platforms.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedTarget` when the platform is not installed
    /// or does not define the board.
    pub fn board(&self, fqbn: &Fqbn) -> Result<ResolvedBoard<'_>> {
        let platform = self
            .installed_release(&fqbn.packager, &fqbn.architecture)
            .ok_or_else(|| {
                Error::UnsupportedTarget(format!("Platform {} is not installed", fqbn.platform_id()))
            })?;
        let board = platform
            .boards
            .iter()
            .find(|b| b.id == fqbn.board_id)
            .ok_or_else(|| Error::UnsupportedTarget(format!("Unknown board {fqbn}")))?;

        Ok(ResolvedBoard {
            fqbn: fqbn.clone(),
            platform,
            board,
            platform_path: self.platform_path(
                &fqbn.packager,
                &fqbn.architecture,
                &platform.version,
            ),
        })
    }

    /// Installed boards whose USB ids match, in index order.
    #[must_use]
    pub fn identify(&self, vid: &str, pid: &str) -> Vec<BoardListItem> {
        let mut matches = Vec::new();
        for installed in self.installed.iter() {
            let Some(platform) = self.index.find_platform(
                &installed.packager,
                &installed.architecture,
                Some(&installed.version),
            ) else {
                continue;
            };
            for board in platform.boards.iter().filter(|b| b.matches_usb(vid, pid)) {
                matches.push(BoardListItem {
                    name: board.name.clone(),
                    fqbn: format!(
                        "{}:{}:{}",
                        installed.packager, installed.architecture, board.id
                    ),
                });
            }
        }
        matches
    }
}

/// Read both index files into a fresh state.
///
/// # Errors
///
/// Returns an error if either file exists but cannot be parsed.
pub fn load_state(dirs: &Directories) -> Result<(IndexState, bool)> {
    let index = PackageIndex::load(&dirs.package_index())?;
    let found = index.is_some();
    let installed = InstalledSet::load(&dirs.installed_file())?;
    let state = IndexState::new(index.unwrap_or_default(), installed, dirs);
    info!(
        "Loaded package index ({} packages, {} installed platforms)",
        state.index.packages.len(),
        state.installed.len()
    );
    Ok((state, found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_index() -> PackageIndex {
        serde_json::from_value(json!({
            "packages": [{
                "name": "acme",
                "platforms": [
                    {"architecture": "samd", "version": "1.9.0", "boards": []},
                    {"architecture": "samd", "version": "1.10.0", "boards": [
                        {"id": "zero", "name": "Acme Zero", "vid": ["0x2341"], "pid": ["0x804E"]}
                    ]},
                    {"architecture": "avr", "version": "2.0.0"}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_find_platform_latest() {
        let index = sample_index();
        let latest = index.find_platform("acme", "samd", None).unwrap();
        assert_eq!(latest.version, "1.10.0");
        let empty = index.find_platform("acme", "samd", Some("")).unwrap();
        assert_eq!(empty.version, "1.10.0");
        assert_eq!(
            index.find_platform("acme", "samd", Some("1.9.0")).unwrap().version,
            "1.9.0"
        );
        assert!(index.find_platform("acme", "samd", Some("3.0.0")).is_none());
        assert!(index.find_platform("other", "samd", None).is_none());
    }

    #[test]
    fn test_usb_ids_are_normalized() {
        let index = sample_index();
        let board = &index.find_platform("acme", "samd", None).unwrap().boards[0];
        assert_eq!(board.vid, vec!["2341"]);
        assert_eq!(board.pid, vec!["804e"]);
        assert!(board.matches_usb("0x2341", "804E"));
        assert!(!board.matches_usb("2341", "0001"));
    }

    #[test]
    fn test_board_requires_installed_platform() {
        let dirs = Directories::with_base(PathBuf::from("/k"));
        let mut state = IndexState::new(sample_index(), InstalledSet::default(), &dirs);
        let fqbn = Fqbn::parse("acme:samd:zero").unwrap();
        assert!(matches!(state.board(&fqbn), Err(Error::UnsupportedTarget(_))));

        state.installed.insert(InstalledPlatform::new("acme", "samd", "1.10.0"));
        let resolved = state.board(&fqbn).unwrap();
        assert_eq!(resolved.board.name, "Acme Zero");
        assert_eq!(
            resolved.platform_path,
            PathBuf::from("/k/data/packages/acme/hardware/samd/1.10.0")
        );

        let unknown = Fqbn::parse("acme:samd:mkr").unwrap();
        assert!(matches!(state.board(&unknown), Err(Error::UnsupportedTarget(_))));
    }

    #[test]
    fn test_identify_only_installed() {
        let dirs = Directories::with_base(PathBuf::from("/k"));
        let mut state = IndexState::new(sample_index(), InstalledSet::default(), &dirs);
        assert!(state.identify("2341", "804e").is_empty());

        state.installed.insert(InstalledPlatform::new("acme", "samd", "1.10.0"));
        let boards = state.identify("2341", "804e");
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].fqbn, "acme:samd:zero");
    }

    #[test]
    fn test_load_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PackageIndex::load(&dir.path().join("none.json")).unwrap().is_none());
    }

    #[test]
    fn test_load_malformed_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package_index.json");
        std::fs::write(&path, r#"{"packages": [{"platforms": 3}]}"#).unwrap();
        assert!(matches!(
            PackageIndex::load(&path),
            Err(Error::OperationFailed(_))
        ));
    }
}
