//! Runtime limits shared by clients, servers and codecs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest frame (binary) or line (text) accepted by default: 16 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default completion queue depth for [`crate::Client::go`].
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// Default bound on concurrently dispatched handlers per connection.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// Tunables for the RPC runtime.
///
/// Every field has a default, so a TOML document only needs the keys it
/// overrides:
///
/// ```toml
/// max-frame-len = 1048576
/// done-capacity = 32
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RpcConfig {
	/// Maximum size of one binary frame, in bytes.
	pub max_frame_len: usize,
	/// Maximum length of one text line, in bytes.
	pub max_line_len: usize,
	/// Queue depth allocated by [`crate::Client::go`].
	pub done_capacity: usize,
	/// Maximum number of handlers in flight on one server connection.
	pub max_inflight: usize,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			max_frame_len: DEFAULT_MAX_FRAME_LEN,
			max_line_len: DEFAULT_MAX_FRAME_LEN,
			done_capacity: DEFAULT_DONE_CAPACITY,
			max_inflight: DEFAULT_MAX_INFLIGHT,
		}
	}
}

impl RpcConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads, parses and validates a TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&input)
	}

	/// Set the binary frame limit.
	pub fn max_frame_len(mut self, len: usize) -> Self {
		self.max_frame_len = len;
		self
	}

	/// Set the text line limit.
	pub fn max_line_len(mut self, len: usize) -> Self {
		self.max_line_len = len;
		self
	}

	/// Set the queue depth used by [`crate::Client::go`].
	pub fn done_capacity(mut self, capacity: usize) -> Self {
		self.done_capacity = capacity;
		self
	}

	/// Set the per-connection handler bound.
	pub fn max_inflight(mut self, max: usize) -> Self {
		self.max_inflight = max;
		self
	}

	/// Rejects zero limits.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let fields = [
			("max-frame-len", self.max_frame_len),
			("max-line-len", self.max_line_len),
			("done-capacity", self.done_capacity),
			("max-inflight", self.max_inflight),
		];
		match fields.iter().find(|(_, value)| *value == 0) {
			Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be greater than zero"))),
			None => Ok(()),
		}
	}
}
