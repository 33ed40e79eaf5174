//! Call-correlating client.
//!
//! A [`Client`] owns a codec and one background reader. Requests are written
//! under the `sending` lock so concurrent calls never interleave on the wire;
//! the pending table lives under a separate synchronous lock that is never
//! held across an await.
//!
//! ```text
//! go() ──▶ seq := next ──▶ pending[seq] = completion ──▶ write_request
//!                                                          │
//! reader: read_response_header ──▶ pending.remove(seq) ◀───┘
//!           ├─ unknown seq   → discard body
//!           ├─ error header  → Err(Server(msg)), discard body
//!           └─ ok            → read body, decode into reply
//! ```
//!
//! When the reader stops, every pending call is failed: with
//! [`Error::Shutdown`] if [`Client::close`] was called first, with
//! [`Error::UnexpectedEof`] if the peer went away, and with
//! [`Error::Codec`] for any other fatal codec error.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{ReadHalf, WriteHalf};

use crate::call::{Call, DoneReceiver, DoneSender, done_channel};
use crate::codec::{Binary, BinaryCodec, ClientCodec, Payload, PayloadFormat, Request};
use crate::config::RpcConfig;
use crate::error::{CodecError, Error, Result};
use crate::net::{self, Connection};
use crate::task;

/// Consumes the outcome of one pending call.
type Completion<F> = Box<dyn FnOnce(Result<Payload<F>>) + Send>;

/// Client produced by [`dial`].
pub type BinaryClient = Client<BinaryCodec<ReadHalf<Connection>, WriteHalf<Connection>>>;

struct State<F: PayloadFormat> {
	seq: u64,
	pending: HashMap<u64, Completion<F>>,
	/// The user called [`Client::close`].
	closing: bool,
	/// The reader has stopped.
	shutdown: bool,
}

struct Inner<C: ClientCodec> {
	codec: C,
	/// Reused request header; the lock orders writes.
	sending: tokio::sync::Mutex<Request>,
	state: Mutex<State<C::Format>>,
	config: RpcConfig,
}

/// Handle to an RPC connection. Clones share the connection.
pub struct Client<C: ClientCodec> {
	inner: Arc<Inner<C>>,
}

impl<C: ClientCodec> Clone for Client<C> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

/// Connects to `address` and speaks the binary format.
///
/// Supported networks are `tcp`, `tcp4`, `tcp6` and (on unix) `unix`.
pub async fn dial(network: &str, address: &str) -> Result<BinaryClient> {
	dial_with::<Binary>(network, address, RpcConfig::default()).await
}

/// Connects to `address` and speaks format `F`.
pub async fn dial_with<F: PayloadFormat>(
	network: &str,
	address: &str,
	config: RpcConfig,
) -> Result<Client<F::Codec<Connection>>> {
	let conn = net::connect(network, address).await?;
	let codec = F::codec(conn, &config);
	Ok(Client::with_config(codec, config))
}

impl Client<BinaryCodec<ReadHalf<Connection>, WriteHalf<Connection>>> {
	/// Same as [`dial`].
	pub async fn dial(network: &str, address: &str) -> Result<Self> {
		dial(network, address).await
	}
}

impl<C: ClientCodec> Client<C> {
	/// Starts a client over `codec` with default limits.
	pub fn new(codec: C) -> Self {
		Self::with_config(codec, RpcConfig::default())
	}

	/// Starts a client over `codec` and spawns its reader.
	pub fn with_config(codec: C, config: RpcConfig) -> Self {
		let inner = Arc::new(Inner {
			codec,
			sending: tokio::sync::Mutex::new(Request::default()),
			state: Mutex::new(State {
				seq: 0,
				pending: HashMap::new(),
				closing: false,
				shutdown: false,
			}),
			config,
		});
		task::spawn("rpc.client.reader", read_loop(inner.clone()));
		Self { inner }
	}

	/// Issues a call and returns the queue its completion is delivered to.
	///
	/// The queue holds `done-capacity` completions.
	pub async fn go<A, R>(&self, service_method: &str, args: A) -> DoneReceiver<A, R>
	where
		A: Serialize + Send + 'static,
		R: DeserializeOwned + Send + 'static,
	{
		let (done, rx) = done_channel(self.inner.config.done_capacity.max(1));
		self.go_with(service_method, args, &done).await;
		rx
	}

	/// Issues a call whose completion is delivered to `done`.
	///
	/// Returns once the request has been written (or has failed). The
	/// completion is dropped with a warning if `done` is full at delivery.
	pub async fn go_with<A, R>(&self, service_method: &str, args: A, done: &DoneSender<A, R>)
	where
		A: Serialize + Send + 'static,
		R: DeserializeOwned + Send + 'static,
	{
		let call = Call::new(service_method, args);
		let body = <C::Format as PayloadFormat>::encode_payload(&call.args);
		let done = done.clone();
		let complete: Completion<C::Format> = Box::new(move |outcome| {
			let outcome = outcome.and_then(|body| <C::Format as PayloadFormat>::decode_payload(body).map_err(Error::ReadBody));
			done.deliver(call.finish(outcome));
		});
		match body {
			Ok(body) => self.send(service_method, body, complete).await,
			Err(e) => complete(Err(Error::WriteRequest(e))),
		}
	}

	/// Issues a call and waits for its reply.
	pub async fn call<A, R>(&self, service_method: &str, args: A) -> Result<R>
	where
		A: Serialize + Send + 'static,
		R: DeserializeOwned + Send + 'static,
	{
		let (done, mut rx) = done_channel(1);
		self.go_with(service_method, args, &done).await;
		drop(done);
		match rx.recv().await {
			Some(call) => call.into_result(),
			None => Err(Error::Shutdown),
		}
	}

	async fn send(&self, service_method: &str, body: Payload<C::Format>, complete: Completion<C::Format>) {
		let mut request = self.inner.sending.lock().await;
		let seq = {
			let mut state = self.inner.state.lock();
			if state.closing || state.shutdown {
				drop(state);
				complete(Err(Error::Shutdown));
				return;
			}
			let seq = state.seq;
			state.seq = state.seq.wrapping_add(1);
			state.pending.insert(seq, complete);
			seq
		};

		request.seq = seq;
		request.method.clear();
		request.method.push_str(service_method);
		tracing::trace!(seq, method = service_method, "rpc.client.send");
		if let Err(e) = self.inner.codec.write_request(&request, body).await {
			let complete = self.inner.state.lock().pending.remove(&seq);
			if let Some(complete) = complete {
				complete(Err(Error::WriteRequest(e)));
			}
		}
	}

	/// Closes the connection.
	///
	/// The first call returns the codec's close result; later calls return
	/// [`Error::Shutdown`]. Pending calls fail with [`Error::Shutdown`] once
	/// the reader observes the close.
	pub async fn close(&self) -> Result<()> {
		{
			let mut state = self.inner.state.lock();
			if state.closing {
				return Err(Error::Shutdown);
			}
			state.closing = true;
		}
		self.inner.codec.close().await.map_err(Error::from)
	}

	/// Returns true once the reader has stopped.
	pub fn is_shutdown(&self) -> bool {
		self.inner.state.lock().shutdown
	}

	/// Number of calls awaiting a response.
	pub fn pending(&self) -> usize {
		self.inner.state.lock().pending.len()
	}
}

async fn read_loop<C: ClientCodec>(inner: Arc<Inner<C>>) {
	let error = loop {
		let header = match inner.codec.read_response_header().await {
			Ok(header) => header,
			Err(e) => break e,
		};
		let complete = inner.state.lock().pending.remove(&header.seq);
		let Some(complete) = complete else {
			// Already completed (e.g. its write failed) or never issued.
			tracing::warn!(seq = header.seq, method = %header.method, "rpc: response for unknown call");
			if let Err(e) = inner.codec.discard_response_body().await
				&& e.is_fatal()
			{
				break e;
			}
			continue;
		};
		if let Some(message) = header.error_message() {
			complete(Err(Error::Server(message.to_owned())));
			if let Err(e) = inner.codec.discard_response_body().await
				&& e.is_fatal()
			{
				break e;
			}
			continue;
		}
		match inner.codec.read_response_body().await {
			Ok(body) => complete(Ok(body)),
			Err(e) => {
				let fatal = e.is_fatal();
				complete(Err(Error::ReadBody(e.clone())));
				if fatal {
					break e;
				}
			}
		}
	};
	terminate(&inner, error).await;
}

/// Marks the client shut down and fails every pending call.
async fn terminate<C: ClientCodec>(inner: &Inner<C>, error: CodecError) {
	let _sending = inner.sending.lock().await;
	let (pending, outcome) = {
		let mut state = inner.state.lock();
		state.shutdown = true;
		let outcome = match (&error, state.closing) {
			(CodecError::Closed, _) | (CodecError::Eof, true) => Error::Shutdown,
			(CodecError::Eof, false) => Error::UnexpectedEof,
			_ => Error::Codec(error.clone()),
		};
		if !error.is_end_of_stream() && !state.closing {
			tracing::warn!(error = %error, "rpc: client protocol error");
		}
		(std::mem::take(&mut state.pending), outcome)
	};
	tracing::debug!(pending = pending.len(), error = %outcome, "rpc.client.shutdown");
	for (_, complete) in pending {
		complete(Err(outcome.clone()));
	}
}
