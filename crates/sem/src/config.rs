//! Service configuration.
//!
//! ```toml
//! caching = true
//! low-memory-eviction = true
//! max-recursion-depth = 256
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_MAX_RECURSION_DEPTH: usize = 256;

/// Tunables for a [`crate::SemService`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct SemConfig {
	/// When false, every query recomputes and nothing is published.
	pub caching: bool,
	/// When false, low-memory signals are ignored.
	pub low_memory_eviction: bool,
	/// Frames nested deeper than this are refused like cycles.
	pub max_recursion_depth: usize,
}

impl Default for SemConfig {
	fn default() -> Self {
		Self {
			caching: true,
			low_memory_eviction: true,
			max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
		}
	}
}

impl SemConfig {
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&text)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		assert_eq!(SemConfig::from_toml_str("").unwrap(), SemConfig::default());
	}

	#[test]
	fn partial_override() {
		let cfg = SemConfig::from_toml_str("max-recursion-depth = 8\ncaching = false").unwrap();
		assert_eq!(cfg.max_recursion_depth, 8);
		assert!(!cfg.caching);
		assert!(cfg.low_memory_eviction);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let err = SemConfig::from_toml_str("cache-everything = true").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)));
	}

	#[test]
	fn loads_from_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "low-memory-eviction = false").unwrap();

		let cfg = SemConfig::from_path(file.path()).unwrap();
		assert!(!cfg.low_memory_eviction);
	}

	#[test]
	fn missing_file_reports_path() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("absent.toml");
		match SemConfig::from_path(&path) {
			Err(ConfigError::Io { path: p, .. }) => assert_eq!(p, path),
			other => panic!("expected io error, got {other:?}"),
		}
	}
}
