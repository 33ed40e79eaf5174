//! Line-delimited JSON codec.
//!
//! Each envelope is one self-contained JSON object on its own line:
//!
//! ```text
//! {"method":"Arith.Add","seq":7,"payload":{"a":7,"b":8}}
//! {"method":"Arith.Add","seq":7,"error":null,"payload":{"c":15}}
//! ```
//!
//! The payload travels inside the envelope, so reading a header also buffers
//! its body; the body read only hands the buffered value over. An absent or
//! `null` payload is reported as [`CodecError::MissingParams`].

use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::{ClientCodec, PayloadFormat, Request, Response, ServerCodec};
use crate::config::RpcConfig;
use crate::error::CodecError;

/// Textual payloads (JSON values).
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl PayloadFormat for Json {
	type Payload = Value;
	type Codec<S>
		= JsonCodec<ReadHalf<S>, WriteHalf<S>>
	where
		S: AsyncRead + AsyncWrite + Send + 'static;

	const NAME: &'static str = "json";

	fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
		serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))
	}

	fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T, CodecError> {
		serde_json::from_value(payload).map_err(|e| CodecError::Decode(e.to_string()))
	}

	fn codec<S>(stream: S, config: &RpcConfig) -> Self::Codec<S>
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		JsonCodec::with_config(stream, config)
	}
}

/// Inbound envelope; serves both directions.
#[derive(Debug, Deserialize)]
struct Envelope {
	#[serde(default)]
	method: String,
	#[serde(default)]
	seq: u64,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	payload: Option<Value>,
}

#[derive(Serialize)]
struct OutboundRequest<'a> {
	method: &'a str,
	seq: u64,
	payload: &'a Value,
}

#[derive(Serialize)]
struct OutboundResponse<'a> {
	method: &'a str,
	seq: u64,
	error: Option<&'a str>,
	payload: Option<&'a Value>,
}

struct LineReader<R> {
	lines: FramedRead<R, LinesCodec>,
	/// Payload of the last envelope read, until its body is taken.
	payload: Option<Value>,
}

/// Line-delimited JSON codec over a read half and a write half.
pub struct JsonCodec<R, W> {
	reader: Mutex<LineReader<R>>,
	writer: Mutex<FramedWrite<W, LinesCodec>>,
	cancel: CancellationToken,
	closed: AtomicBool,
	max_line_len: usize,
}

impl<S> JsonCodec<ReadHalf<S>, WriteHalf<S>>
where
	S: AsyncRead + AsyncWrite,
{
	/// Wraps a duplex stream with default limits.
	pub fn new(stream: S) -> Self {
		Self::with_config(stream, &RpcConfig::default())
	}

	/// Wraps a duplex stream.
	pub fn with_config(stream: S, config: &RpcConfig) -> Self {
		let (reader, writer) = tokio::io::split(stream);
		Self::from_parts(reader, writer, config)
	}
}

impl<R, W> JsonCodec<R, W>
where
	R: AsyncRead,
	W: AsyncWrite,
{
	/// Builds a codec from separate read and write halves.
	pub fn from_parts(reader: R, writer: W, config: &RpcConfig) -> Self {
		Self {
			reader: Mutex::new(LineReader {
				lines: FramedRead::new(reader, LinesCodec::new_with_max_length(config.max_line_len)),
				payload: None,
			}),
			writer: Mutex::new(FramedWrite::new(writer, LinesCodec::new())),
			cancel: CancellationToken::new(),
			closed: AtomicBool::new(false),
			max_line_len: config.max_line_len,
		}
	}
}

impl<R, W> JsonCodec<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	/// Reads the next non-blank line as an envelope and buffers its payload.
	async fn read_envelope(&self) -> Result<Envelope, CodecError> {
		if self.cancel.is_cancelled() {
			return Err(CodecError::Closed);
		}
		let mut reader = self.reader.lock().await;
		loop {
			let next = tokio::select! {
				biased;
				() = self.cancel.cancelled() => return Err(CodecError::Closed),
				next = reader.lines.next() => next,
			};
			let line = match next {
				Some(Ok(line)) => line,
				Some(Err(e)) => return Err(self.line_error(e)),
				None => return Err(CodecError::Eof),
			};
			if line.trim().is_empty() {
				continue;
			}
			let mut envelope: Envelope = serde_json::from_str(&line).map_err(|e| CodecError::Decode(e.to_string()))?;
			reader.payload = envelope.payload.take();
			return Ok(envelope);
		}
	}

	async fn take_payload(&self) -> Result<Value, CodecError> {
		self.reader.lock().await.payload.take().ok_or(CodecError::MissingParams)
	}

	async fn drop_payload(&self) {
		self.reader.lock().await.payload = None;
	}

	async fn write_line<T: Serialize>(&self, envelope: &T) -> Result<(), CodecError> {
		if self.cancel.is_cancelled() {
			return Err(CodecError::Closed);
		}
		let line = serde_json::to_string(envelope).map_err(|e| CodecError::Encode(e.to_string()))?;
		if line.len() > self.max_line_len {
			return Err(CodecError::MessageTooLarge(self.max_line_len));
		}
		let mut writer = self.writer.lock().await;
		writer.send(line).await.map_err(|e| self.line_error(e))
	}

	async fn shutdown(&self) -> Result<(), CodecError> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.cancel.cancel();
		let mut writer = self.writer.lock().await;
		match SinkExt::<String>::close(&mut *writer).await {
			Ok(()) => Ok(()),
			Err(LinesCodecError::Io(e))
				if matches!(e.kind(), std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe) =>
			{
				Ok(())
			}
			Err(e) => Err(self.line_error(e)),
		}
	}

	fn line_error(&self, error: LinesCodecError) -> CodecError {
		match error {
			LinesCodecError::MaxLineLengthExceeded => CodecError::FrameTooLarge(self.max_line_len),
			LinesCodecError::Io(e) => e.into(),
		}
	}
}

impl<R, W> ClientCodec for JsonCodec<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	type Format = Json;

	async fn write_request(&self, header: &Request, body: Value) -> Result<(), CodecError> {
		self.write_line(&OutboundRequest {
			method: &header.method,
			seq: header.seq,
			payload: &body,
		})
		.await
	}

	async fn read_response_header(&self) -> Result<Response, CodecError> {
		let envelope = self.read_envelope().await?;
		Ok(Response {
			method: envelope.method,
			seq: envelope.seq,
			error: envelope.error,
		})
	}

	async fn read_response_body(&self) -> Result<Value, CodecError> {
		self.take_payload().await
	}

	async fn discard_response_body(&self) -> Result<(), CodecError> {
		self.drop_payload().await;
		Ok(())
	}

	async fn close(&self) -> Result<(), CodecError> {
		self.shutdown().await
	}
}

impl<R, W> ServerCodec for JsonCodec<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	type Format = Json;

	async fn read_request_header(&self) -> Result<Request, CodecError> {
		let envelope = self.read_envelope().await?;
		Ok(Request {
			method: envelope.method,
			seq: envelope.seq,
		})
	}

	async fn read_request_body(&self) -> Result<Value, CodecError> {
		self.take_payload().await
	}

	async fn discard_request_body(&self) -> Result<(), CodecError> {
		self.drop_payload().await;
		Ok(())
	}

	async fn write_response(&self, header: &Response, body: Option<Value>) -> Result<(), CodecError> {
		self.write_line(&OutboundResponse {
			method: &header.method,
			seq: header.seq,
			error: header.error_message(),
			payload: body.as_ref(),
		})
		.await
	}

	async fn close(&self) -> Result<(), CodecError> {
		self.shutdown().await
	}
}
