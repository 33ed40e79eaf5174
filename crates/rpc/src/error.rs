//! Error types for the RPC runtime.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Terminal outcome of a failed call, or a failure of the client itself.
///
/// Values are cloned when the reader drains the pending table, so every
/// variant is cheap to clone.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
	/// The client was closed, or the reader stopped after a local close.
	#[error("connection is shut down")]
	Shutdown,
	/// The peer went away while calls were still pending.
	#[error("unexpected end of stream")]
	UnexpectedEof,
	/// The remote handler (or dispatcher) reported an error.
	///
	/// Carried verbatim from the response envelope.
	#[error("{0}")]
	Server(String),
	/// Encoding or writing the request failed. Only this call is affected.
	#[error("writing request: {0}")]
	WriteRequest(CodecError),
	/// The response body could not be decoded into the reply type.
	#[error("reading body: {0}")]
	ReadBody(CodecError),
	/// The connection failed with an unrecoverable codec error.
	#[error(transparent)]
	Codec(#[from] CodecError),
	/// Connecting to the peer failed.
	#[error("dial {network} {address}: {source}")]
	Dial {
		/// Network name passed to the dialer.
		network: String,
		/// Address passed to the dialer.
		address: String,
		/// The underlying I/O error.
		source: Arc<io::Error>,
	},
	/// Binding a listener failed.
	#[error("listen {network} {address}: {source}")]
	Listen {
		/// Network name passed to the listener.
		network: String,
		/// Address passed to the listener.
		address: String,
		/// The underlying I/O error.
		source: Arc<io::Error>,
	},
	/// The network name is not one of the supported transports.
	#[error("unsupported network {0:?}")]
	UnsupportedNetwork(String),
	/// The call completed with neither a reply nor an error.
	#[error("call completed without a reply")]
	MissingReply,
}

/// Failures raised by a codec while framing, encoding or decoding.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CodecError {
	/// The peer closed the stream at a frame boundary.
	#[error("end of stream")]
	Eof,
	/// The codec was closed locally.
	#[error("codec is closed")]
	Closed,
	/// Input/output errors from the underlying stream.
	#[error("i/o error: {0}")]
	Io(Arc<io::Error>),
	/// A frame or line exceeded the configured limit.
	#[error("frame exceeds {0} bytes")]
	FrameTooLarge(usize),
	/// An outgoing envelope exceeded the configured limit. Nothing was
	/// written, so the stream stays in frame.
	#[error("message exceeds {0} bytes")]
	MessageTooLarge(usize),
	/// A value could not be encoded.
	#[error("encode: {0}")]
	Encode(String),
	/// A value could not be decoded.
	#[error("decode: {0}")]
	Decode(String),
	/// A text-encoded envelope arrived without a payload.
	#[error("request body missing params")]
	MissingParams,
}

impl CodecError {
	/// Returns true if the stream ended, either remotely or by a local close.
	pub fn is_end_of_stream(&self) -> bool {
		matches!(self, Self::Eof | Self::Closed)
	}

	/// Returns true if the stream can no longer be read or written in frame.
	///
	/// Decode failures on a body leave the framing intact and only affect the
	/// envelope being read.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Eof | Self::Closed | Self::Io(_) | Self::FrameTooLarge(_))
	}
}

impl From<io::Error> for CodecError {
	fn from(error: io::Error) -> Self {
		Self::Io(Arc::new(error))
	}
}

/// Errors reported synchronously by service registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RegisterError {
	/// Neither an explicit name nor a type name was available.
	#[error("rpc.Register: no service name for type {0}")]
	NoServiceName(String),
	/// The receiver's type name is not exported and no explicit name was given.
	#[error("rpc.Register: type {0} is not exported")]
	NotExported(String),
	/// The service ended up with no callable methods.
	#[error("rpc.Register: type {service} has no exported methods of suitable type{}", rejected_hint(.rejected))]
	NoSuitableMethods {
		/// Service name.
		service: String,
		/// Reasons for every candidate that was skipped.
		rejected: Vec<String>,
	},
	/// A service with the same name is already registered.
	#[error("rpc: service already defined: {0}")]
	Duplicate(String),
}

fn rejected_hint(rejected: &[String]) -> String {
	if rejected.is_empty() {
		String::new()
	} else {
		format!(" (hint: {} candidate method(s) rejected: {})", rejected.len(), rejected.join("; "))
	}
}

/// Errors raised while loading [`crate::RpcConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: io::Error,
	},
	/// Error parsing TOML syntax or fields.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),
	/// A value is out of its accepted range.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}
