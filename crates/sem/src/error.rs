//! Error types for the semantic cache.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration errors, raised while building the key hierarchy, the
/// producer registry, or loading [`crate::SemConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Two keys were declared with the same name.
	#[error("duplicate semantic key: {0}")]
	DuplicateKey(String),

	/// A key names a supertype that was never declared.
	#[error("key {key} names undeclared supertype {supertype}")]
	UnknownSupertype { key: String, supertype: String },

	/// The supertype relation contains a cycle through this key.
	#[error("cyclic key hierarchy through {0}")]
	CyclicKey(String),

	/// A producer targets a key missing from the hierarchy.
	#[error("producer {producer} targets unregistered key {key}")]
	UnregisteredKey { producer: String, key: String },

	/// The configuration text is not valid.
	#[error("invalid cache configuration: {0}")]
	Parse(#[from] toml::de::Error),

	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		path: PathBuf,
		error: std::io::Error,
	},
}

/// The computation was cancelled; nothing from it was cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("semantic computation cancelled")]
pub struct Cancelled;

/// Error returned by a producer transform.
#[derive(Debug, Error)]
pub enum ProducerError {
	/// Cancellation observed inside the producer. Always propagated.
	#[error(transparent)]
	Cancelled(#[from] Cancelled),

	/// The producer failed. Its contribution is treated as empty.
	#[error(transparent)]
	Failed(#[from] anyhow::Error),
}

impl From<SemError> for ProducerError {
	fn from(err: SemError) -> Self {
		match err {
			SemError::Cancelled(c) => Self::Cancelled(c),
			SemError::Config(e) => Self::Failed(e.into()),
		}
	}
}

/// A producer failure collected while answering a query.
#[derive(Debug)]
pub struct ProducerFailure {
	/// Name of the failing producer.
	pub producer: &'static str,
	/// Key the producer was registered against.
	pub key: crate::SemKey,
	pub error: anyhow::Error,
}

/// Error returned by [`crate::SemService::query`].
#[derive(Debug, Error)]
pub enum SemError {
	#[error(transparent)]
	Cancelled(#[from] Cancelled),

	/// The producer registry could not be built.
	#[error(transparent)]
	Config(#[from] ConfigError),
}

impl SemError {
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled(_))
	}
}

pub type Result<T, E = SemError> = std::result::Result<T, E>;
