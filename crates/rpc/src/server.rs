//! Service registry and per-connection dispatch loop.
//!
//! ```text
//!   Reading ──▶ Dispatching (0..max_inflight handlers) ──▶ Draining ──▶ Closed
//!      ▲              │
//!      └──────────────┘
//! ```
//!
//! Requests that cannot be resolved or decoded are answered with an error
//! response and never end the connection. Only a failed header read (or a
//! fatal body read) stops the loop; in-flight handlers are then awaited so
//! their responses are still written before the codec is closed.

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{Binary, Json, Payload, PayloadFormat, Request, Response, ServerCodec};
use crate::config::RpcConfig;
use crate::error::{CodecError, RegisterError};
use crate::net::Listener;
use crate::service::{MethodType, Prepared, Service, ServiceBuilder, ServiceInfo};
use crate::task::{self, InFlight};

const HANDLER_PANICKED: &str = "rpc: handler panicked";
const HANDLER_EMPTY_ERROR: &str = "rpc: handler returned an empty error";

/// An RPC server for payload format `F`.
pub struct Server<F: PayloadFormat = Binary> {
	services: RwLock<HashMap<String, Arc<Service<F>>>>,
	config: RpcConfig,
}

impl<F: PayloadFormat> std::fmt::Debug for Server<F> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut names: Vec<_> = self.services.read().keys().cloned().collect();
		names.sort();
		f.debug_struct("Server")
			.field("format", &F::NAME)
			.field("services", &names)
			.field("config", &self.config)
			.finish()
	}
}

/// Outcome of reading one request.
enum Incoming<F: PayloadFormat> {
	Dispatch {
		header: Request,
		method: Arc<MethodType<F>>,
		call: Prepared<F>,
	},
	Reject {
		header: Request,
		error: String,
	},
}

impl Server<Binary> {
	/// Creates a server speaking the binary format.
	pub fn new() -> Self {
		Self::with_config(RpcConfig::default())
	}
}

impl Server<Json> {
	/// Creates a server speaking the line-delimited JSON format.
	pub fn new_json() -> Self {
		Self::with_config(RpcConfig::default())
	}
}

impl<F: PayloadFormat> Default for Server<F> {
	fn default() -> Self {
		Self::with_config(RpcConfig::default())
	}
}

impl<F: PayloadFormat> Server<F> {
	/// Creates a server with explicit limits.
	pub fn with_config(config: RpcConfig) -> Self {
		Self {
			services: RwLock::new(HashMap::new()),
			config,
		}
	}

	/// Runtime limits in effect.
	pub fn config(&self) -> &RpcConfig {
		&self.config
	}

	/// Publishes a service under its receiver's type name.
	pub fn register<S>(&self, service: ServiceBuilder<S, F>) -> Result<(), RegisterError>
	where
		S: Send + Sync + 'static,
	{
		self.insert(service.build(None))
	}

	/// Publishes a service under `name`. A blank name falls back to the
	/// receiver's type name.
	pub fn register_name<S>(&self, name: &str, service: ServiceBuilder<S, F>) -> Result<(), RegisterError>
	where
		S: Send + Sync + 'static,
	{
		self.insert(service.build(Some(name)))
	}

	fn insert(&self, service: Result<Service<F>, RegisterError>) -> Result<(), RegisterError> {
		let service = service.inspect_err(|error| tracing::warn!(%error, "rpc.register"))?;
		let mut services = self.services.write();
		if services.contains_key(&service.name) {
			let error = RegisterError::Duplicate(service.name);
			tracing::warn!(%error, "rpc.register");
			return Err(error);
		}
		tracing::debug!(service = %service.name, methods = service.methods.len(), format = F::NAME, "rpc.register");
		services.insert(service.name.clone(), Arc::new(service));
		Ok(())
	}

	/// Snapshot of every service and method, sorted by name.
	pub fn services(&self) -> Vec<ServiceInfo> {
		let mut infos: Vec<ServiceInfo> = self.services.read().values().map(|s| s.info()).collect();
		infos.sort_by(|a, b| a.name.cmp(&b.name));
		infos
	}

	/// Looks up `Service.Method`, splitting on the last `.`.
	fn resolve(&self, service_method: &str) -> Result<Arc<MethodType<F>>, String> {
		let Some((service, method)) = service_method.rsplit_once('.') else {
			return Err(format!("rpc: service/method request ill-formed: {service_method}"));
		};
		let services = self.services.read();
		let Some(service) = services.get(service) else {
			return Err(format!("rpc: can't find service {service_method}"));
		};
		service
			.methods
			.get(method)
			.cloned()
			.ok_or_else(|| format!("rpc: can't find method {service_method}"))
	}

	/// Reads one request. Errors are unrecoverable for the connection.
	async fn read_request<C>(&self, codec: &C) -> Result<Incoming<F>, CodecError>
	where
		C: ServerCodec<Format = F>,
	{
		let header = codec.read_request_header().await?;
		let method = match self.resolve(&header.method) {
			Ok(method) => method,
			Err(error) => {
				if let Err(e) = codec.discard_request_body().await
					&& e.is_fatal()
				{
					return Err(e);
				}
				return Ok(Incoming::Reject { header, error });
			}
		};
		let body = match codec.read_request_body().await {
			Ok(body) => body,
			Err(e) if e.is_fatal() => return Err(e),
			Err(e) => {
				return Ok(Incoming::Reject {
					header,
					error: e.to_string(),
				});
			}
		};
		Ok(match method.prepare(body) {
			Ok(call) => Incoming::Dispatch { header, method, call },
			Err(e) => Incoming::Reject {
				header,
				error: e.to_string(),
			},
		})
	}

	/// Serves one connection until its header stream fails, then waits for
	/// outstanding handlers and closes the codec.
	pub async fn serve_codec<C>(&self, codec: C)
	where
		C: ServerCodec<Format = F>,
	{
		let codec = Arc::new(codec);
		let mut inflight = InFlight::new("rpc.handler", self.config.max_inflight);
		loop {
			match self.read_request(&*codec).await {
				Ok(Incoming::Dispatch { header, method, call }) => {
					tracing::trace!(seq = header.seq, method = %header.method, "rpc.server.dispatch");
					let codec = codec.clone();
					inflight
						.spawn(async move {
							let outcome = invoke(&method, call).await;
							respond(&*codec, header, outcome).await;
						})
						.await;
				}
				Ok(Incoming::Reject { header, error }) => {
					tracing::debug!(seq = header.seq, method = %header.method, %error, "rpc.server.reject");
					respond(&*codec, header, Err(error)).await;
				}
				Err(e) => {
					if e.is_end_of_stream() {
						tracing::debug!("rpc.server.eof");
					} else {
						tracing::warn!(error = %e, "rpc: server cannot read request");
					}
					break;
				}
			}
		}
		inflight.wait().await;
		if let Err(e) = codec.close().await {
			tracing::debug!(error = %e, "rpc.server.close");
		}
	}

	/// Serves one connection over a duplex byte stream.
	pub async fn serve_conn<S>(&self, stream: S)
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		self.serve_codec(F::codec(stream, &self.config)).await;
	}

	/// Reads, runs and answers exactly one request, inline.
	///
	/// Returns an error only when the connection can no longer be read; bad
	/// requests are answered with an error response.
	pub async fn serve_request<C>(&self, codec: &C) -> Result<(), CodecError>
	where
		C: ServerCodec<Format = F>,
	{
		match self.read_request(codec).await? {
			Incoming::Dispatch { header, method, call } => {
				let outcome = invoke(&method, call).await;
				respond(codec, header, outcome).await;
			}
			Incoming::Reject { header, error } => respond(codec, header, Err(error)).await,
		}
		Ok(())
	}

	/// Serves every connection accepted on `listener`, each on its own task.
	///
	/// Runs until accepting fails and returns that error.
	pub async fn accept(self: &Arc<Self>, listener: Listener) -> io::Error {
		loop {
			match listener.accept().await {
				Ok((conn, peer)) => {
					tracing::debug!(%peer, "rpc.server.accept");
					let server = self.clone();
					task::spawn("rpc.conn", async move { server.serve_conn(conn).await });
				}
				Err(error) => {
					tracing::warn!(%error, "rpc.Serve: accept");
					return error;
				}
			}
		}
	}
}

/// Runs a prepared call, counting it and converting a panic into an error.
async fn invoke<F: PayloadFormat>(method: &MethodType<F>, call: Prepared<F>) -> Result<Payload<F>, String> {
	method.record_call();
	match AssertUnwindSafe(call).catch_unwind().await {
		// An empty error string reads as success on the wire.
		Ok(Err(error)) if error.is_empty() => Err(HANDLER_EMPTY_ERROR.to_owned()),
		Ok(outcome) => outcome,
		Err(_) => {
			tracing::error!(method = method.name(), "rpc: handler panicked");
			Err(HANDLER_PANICKED.to_owned())
		}
	}
}

/// Writes the response for `request`.
///
/// A reply that cannot be written without breaking the stream (too large, or
/// unencodable) is replaced by an error response. A fatal write error closes
/// the codec so the read side stops too.
async fn respond<C: ServerCodec>(codec: &C, request: Request, outcome: Result<Payload<C::Format>, String>) {
	let (error, body) = match outcome {
		Ok(body) => (None, Some(body)),
		Err(error) => (Some(error), None),
	};
	let mut header = Response {
		method: request.method,
		seq: request.seq,
		error,
	};
	let mut result = codec.write_response(&header, body).await;
	if let Err(e) = &result
		&& !e.is_fatal()
		&& header.error.is_none()
	{
		tracing::warn!(seq = header.seq, method = %header.method, error = %e, "rpc: reply not sent");
		header.error = Some(e.to_string());
		result = codec.write_response(&header, None).await;
	}
	if let Err(e) = result {
		tracing::warn!(seq = header.seq, method = %header.method, error = %e, "rpc: writing response");
		if e.is_fatal() {
			let _ = codec.close().await;
		}
	}
}

#[cfg(test)]
mod tests;
