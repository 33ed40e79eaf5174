//! MessagePack codec with length-delimited framing.
//!
//! Wire format, per envelope:
//! ```text
//! ┌────────────┬───────────────────────────┐
//! │ Length (4B)│ MessagePack value (N B)   │
//! │ BE u32     │                           │
//! └────────────┴───────────────────────────┘
//! ```
//!
//! A request is a header frame immediately followed by a body frame; so is a
//! response. Error responses still carry a body frame (MessagePack `nil`) so
//! the stream stays framed. Headers are encoded with field names, which keeps
//! every frame self-describing.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::{ClientCodec, PayloadFormat, Request, Response, ServerCodec};
use crate::config::RpcConfig;
use crate::error::CodecError;

/// Compact self-describing binary payloads (MessagePack).
#[derive(Debug, Clone, Copy, Default)]
pub struct Binary;

impl PayloadFormat for Binary {
	type Payload = Bytes;
	type Codec<S>
		= BinaryCodec<ReadHalf<S>, WriteHalf<S>>
	where
		S: AsyncRead + AsyncWrite + Send + 'static;

	const NAME: &'static str = "binary";

	fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
		rmp_serde::to_vec_named(value)
			.map(Bytes::from)
			.map_err(|e| CodecError::Encode(e.to_string()))
	}

	fn decode_payload<T: DeserializeOwned>(payload: Bytes) -> Result<T, CodecError> {
		rmp_serde::from_slice(&payload).map_err(|e| CodecError::Decode(e.to_string()))
	}

	fn codec<S>(stream: S, config: &RpcConfig) -> Self::Codec<S>
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		BinaryCodec::with_config(stream, config)
	}
}

/// Length-delimited MessagePack codec over a read half and a write half.
pub struct BinaryCodec<R, W> {
	reader: Mutex<FramedRead<R, LengthDelimitedCodec>>,
	writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
	cancel: CancellationToken,
	closed: AtomicBool,
	max_frame_len: usize,
}

impl<S> BinaryCodec<ReadHalf<S>, WriteHalf<S>>
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

impl<R, W> BinaryCodec<R, W>
where
	R: AsyncRead,
	W: AsyncWrite,
{
	/// Builds a codec from separate read and write halves.
	pub fn from_parts(reader: R, writer: W, config: &RpcConfig) -> Self {
		let framing = || {
			LengthDelimitedCodec::builder()
				.max_frame_length(config.max_frame_len)
				.new_codec()
		};
		Self {
			reader: Mutex::new(FramedRead::new(reader, framing())),
			writer: Mutex::new(FramedWrite::new(writer, framing())),
			cancel: CancellationToken::new(),
			closed: AtomicBool::new(false),
			max_frame_len: config.max_frame_len,
		}
	}
}

impl<R, W> BinaryCodec<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	async fn read_frame(&self) -> Result<Bytes, CodecError> {
		if self.cancel.is_cancelled() {
			return Err(CodecError::Closed);
		}
		let mut reader = self.reader.lock().await;
		tokio::select! {
			biased;
			() = self.cancel.cancelled() => Err(CodecError::Closed),
			frame = reader.next() => match frame {
				Some(Ok(frame)) => Ok(frame.freeze()),
				Some(Err(e)) => Err(self.framing_error(e)),
				None => Err(CodecError::Eof),
			},
		}
	}

	/// Writes both frames under one writer lock, then flushes.
	///
	/// Sizes are checked before either frame is buffered; a rejected envelope
	/// leaves nothing behind.
	async fn write_frames(&self, header: Bytes, body: Bytes) -> Result<(), CodecError> {
		if self.cancel.is_cancelled() {
			return Err(CodecError::Closed);
		}
		if header.len() > self.max_frame_len || body.len() > self.max_frame_len {
			return Err(CodecError::MessageTooLarge(self.max_frame_len));
		}
		let mut writer = self.writer.lock().await;
		writer.feed(header).await.map_err(|e| self.framing_error(e))?;
		writer.feed(body).await.map_err(|e| self.framing_error(e))?;
		SinkExt::<Bytes>::flush(&mut *writer).await.map_err(|e| self.framing_error(e))
	}

	async fn shutdown(&self) -> Result<(), CodecError> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.cancel.cancel();
		let mut writer = self.writer.lock().await;
		match SinkExt::<Bytes>::close(&mut *writer).await {
			Ok(()) => Ok(()),
			Err(e) if matches!(e.kind(), io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	fn framing_error(&self, error: io::Error) -> CodecError {
		// LengthDelimitedCodec reports oversize frames as InvalidData (decode)
		// or InvalidInput (encode).
		match error.kind() {
			io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => CodecError::FrameTooLarge(self.max_frame_len),
			_ => error.into(),
		}
	}
}

impl<R, W> ClientCodec for BinaryCodec<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	type Format = Binary;

	async fn write_request(&self, header: &Request, body: Bytes) -> Result<(), CodecError> {
		let header = Binary::encode_payload(header)?;
		self.write_frames(header, body).await
	}

	async fn read_response_header(&self) -> Result<Response, CodecError> {
		Binary::decode_payload(self.read_frame().await?)
	}

	async fn read_response_body(&self) -> Result<Bytes, CodecError> {
		self.read_frame().await
	}

	async fn discard_response_body(&self) -> Result<(), CodecError> {
		self.read_frame().await.map(drop)
	}

	async fn close(&self) -> Result<(), CodecError> {
		self.shutdown().await
	}
}

impl<R, W> ServerCodec for BinaryCodec<R, W>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	type Format = Binary;

	async fn read_request_header(&self) -> Result<Request, CodecError> {
		Binary::decode_payload(self.read_frame().await?)
	}

	async fn read_request_body(&self) -> Result<Bytes, CodecError> {
		self.read_frame().await
	}

	async fn discard_request_body(&self) -> Result<(), CodecError> {
		self.read_frame().await.map(drop)
	}

	async fn write_response(&self, header: &Response, body: Option<Bytes>) -> Result<(), CodecError> {
		let header = Binary::encode_payload(header)?;
		let body = match body {
			Some(body) => body,
			None => Binary::encode_payload(&())?,
		};
		self.write_frames(header, body).await
	}

	async fn close(&self) -> Result<(), CodecError> {
		self.shutdown().await
	}
}
