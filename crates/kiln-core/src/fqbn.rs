//! Fully-qualified board names: `packager:architecture:board[:opt=val,...]`

use crate::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const SEGMENT_PATTERN: &str = r"^[A-Za-z0-9._-]+$";

fn segment_regex() -> Option<&'static Regex> {
    static SEGMENT: OnceLock<Option<Regex>> = OnceLock::new();
    SEGMENT
        .get_or_init(|| match Regex::new(SEGMENT_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("Invalid FQBN segment pattern: {}", e);
                None
            }
        })
        .as_ref()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fqbn {
    pub packager: String,
    pub architecture: String,
    pub board_id: String,
    pub options: BTreeMap<String, String>,
}

impl Fqbn {
    /// Parse and validate a board name.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the name does not have at least
    /// three valid segments or the options are malformed.
    pub fn parse(fqbn: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidArgument(format!("Invalid FQBN '{fqbn}': {why}"));
        let segment = segment_regex().ok_or_else(|| invalid("validator unavailable"))?;

        let mut parts = fqbn.splitn(4, ':');
        let mut next_segment = |name: &str| -> Result<String> {
            match parts.next() {
                Some(part) if segment.is_match(part) => Ok(part.to_string()),
                Some("") | None => Err(invalid(&format!("missing {name}"))),
                Some(part) => Err(invalid(&format!("bad {name} '{part}'"))),
            }
        };

        let packager = next_segment("packager")?;
        let architecture = next_segment("architecture")?;
        let board_id = next_segment("board")?;

        let mut options = BTreeMap::new();
        if let Some(raw) = parts.next() {
            for pair in raw.split(',') {
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(invalid(&format!("option '{pair}' is not key=value")));
                };
                if !segment.is_match(key) {
                    return Err(invalid(&format!("bad option name '{key}'")));
                }
                options.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            packager,
            architecture,
            board_id,
            options,
        })
    }

    /// `packager:architecture` as used in platform lookups and messages
    #[must_use]
    pub fn platform_id(&self) -> String {
        format!("{}:{}", self.packager, self.architecture)
    }
}

impl fmt::Display for Fqbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.packager, self.architecture, self.board_id)?;
        let mut sep = ':';
        for (key, value) in &self.options {
            write!(f, "{sep}{key}={value}")?;
            sep = ',';
        }
        Ok(())
    }
}

/// Directory name for a board's build output: path separators become `_`.
#[must_use]
pub fn build_dir_name(fqbn: &str) -> String {
    fqbn.replace(['/', '\\'], "_")
}

/// `{sketch}/build/{normalized fqbn}`
#[must_use]
pub fn default_build_path(sketch: &Path, fqbn: &str) -> PathBuf {
    sketch.join("build").join(build_dir_name(fqbn))
}
