//! Codec abstraction for wire formats and envelope framing.
//!
//! A call travels as two logical parts: an envelope header ([`Request`] or
//! [`Response`]) and an opaque payload. Readers expose the two steps
//! separately so the dispatcher can inspect the method name and sequence
//! number before it commits to decoding (or discarding) a body.
//!
//! ```text
//!  Client                                   Server
//!  ──────                                   ──────
//!  write_request(hdr, body) ──────────────▶ read_request_header()
//!                                           read_request_body()
//!  read_response_header()   ◀────────────── write_response(hdr, body)
//!  read_response_body()
//! ```
//!
//! Payload encoding is a property of a [`PayloadFormat`]; the format also
//! builds the connection codec for any duplex byte stream. Two formats ship
//! with the crate: [`Binary`] (MessagePack) and [`Json`] (one JSON object per
//! line).

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::RpcConfig;
use crate::error::CodecError;

pub mod binary;
pub mod json;

pub use binary::{Binary, BinaryCodec};
pub use json::{Json, JsonCodec};

/// Encoded body type of a format.
pub type Payload<F> = <F as PayloadFormat>::Payload;

/// Request envelope header.
///
/// `seq` is assigned by the client and is unique among the calls outstanding
/// on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
	/// Target in `Service.Method` form.
	#[serde(default)]
	pub method: String,
	/// Client-assigned sequence number.
	#[serde(default)]
	pub seq: u64,
}

/// Response envelope header.
///
/// When `error` is set the payload is absent or ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
	/// Echo of the request's method.
	#[serde(default)]
	pub method: String,
	/// Echo of the request's sequence number.
	#[serde(default)]
	pub seq: u64,
	/// Error text reported by the server, if any.
	#[serde(default)]
	pub error: Option<String>,
}

impl Response {
	/// Returns the error text, treating an empty string as no error.
	pub fn error_message(&self) -> Option<&str> {
		self.error.as_deref().filter(|msg| !msg.is_empty())
	}
}

/// A payload encoding plus the factory for its connection codec.
pub trait PayloadFormat: Send + Sync + Sized + 'static {
	/// Opaque encoded body.
	type Payload: Send + 'static;

	/// Connection codec for a duplex stream `S`.
	type Codec<S>: ClientCodec<Format = Self> + ServerCodec<Format = Self>
	where
		S: AsyncRead + AsyncWrite + Send + 'static;

	/// Short name used in logs.
	const NAME: &'static str;

	/// Encodes a value into a body.
	fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Self::Payload, CodecError>;

	/// Decodes a body into a value.
	fn decode_payload<T: DeserializeOwned>(payload: Self::Payload) -> Result<T, CodecError>;

	/// Wraps a duplex stream in this format's codec.
	fn codec<S>(stream: S, config: &RpcConfig) -> Self::Codec<S>
	where
		S: AsyncRead + AsyncWrite + Send + 'static;
}

/// Client half of a connection codec.
///
/// Implementations guarantee that one `write_request` lands on the wire as a
/// unit with respect to concurrent writers, and that [`ClientCodec::close`] is
/// idempotent.
pub trait ClientCodec: Send + Sync + 'static {
	/// Payload encoding used by this codec.
	type Format: PayloadFormat;

	/// Writes a request header followed by its body.
	fn write_request(
		&self,
		header: &Request,
		body: Payload<Self::Format>,
	) -> impl Future<Output = Result<(), CodecError>> + Send;

	/// Reads the next response header.
	///
	/// Any error here is unrecoverable for the connection.
	fn read_response_header(&self) -> impl Future<Output = Result<Response, CodecError>> + Send;

	/// Reads the body belonging to the last header.
	fn read_response_body(&self) -> impl Future<Output = Result<Payload<Self::Format>, CodecError>> + Send;

	/// Consumes the body belonging to the last header without decoding it.
	fn discard_response_body(&self) -> impl Future<Output = Result<(), CodecError>> + Send;

	/// Closes the codec. Calls after the first have no effect.
	fn close(&self) -> impl Future<Output = Result<(), CodecError>> + Send;
}

/// Server half of a connection codec.
pub trait ServerCodec: Send + Sync + 'static {
	/// Payload encoding used by this codec.
	type Format: PayloadFormat;

	/// Reads the next request header.
	///
	/// Any error here is unrecoverable for the connection.
	fn read_request_header(&self) -> impl Future<Output = Result<Request, CodecError>> + Send;

	/// Reads the body belonging to the last header.
	fn read_request_body(&self) -> impl Future<Output = Result<Payload<Self::Format>, CodecError>> + Send;

	/// Consumes the body belonging to the last header without decoding it.
	fn discard_request_body(&self) -> impl Future<Output = Result<(), CodecError>> + Send;

	/// Writes a response header followed by its body.
	///
	/// `body` is `None` for error responses.
	fn write_response(
		&self,
		header: &Response,
		body: Option<Payload<Self::Format>>,
	) -> impl Future<Output = Result<(), CodecError>> + Send;

	/// Closes the codec. Calls after the first have no effect.
	fn close(&self) -> impl Future<Output = Result<(), CodecError>> + Send;
}
