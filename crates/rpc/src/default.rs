//! Process-wide default server.
//!
//! The default instance is created on first use. [`set_default_server`] may
//! install a configured one instead, but only before anything has used the
//! default.

use std::io;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RegisterError;
use crate::net::Listener;
use crate::server::Server;
use crate::service::ServiceBuilder;

static DEFAULT_SERVER: OnceLock<Arc<Server>> = OnceLock::new();

/// Returns the default server, creating it on first use.
pub fn default_server() -> &'static Arc<Server> {
	DEFAULT_SERVER.get_or_init(|| {
		tracing::debug!("rpc.default_server.init");
		Arc::new(Server::new())
	})
}

/// Installs `server` as the default.
///
/// Fails, handing `server` back, if the default was already used or set.
pub fn set_default_server(server: Arc<Server>) -> Result<(), Arc<Server>> {
	DEFAULT_SERVER.set(server)
}

/// Registers a service on the default server.
pub fn register<S>(service: ServiceBuilder<S>) -> Result<(), RegisterError>
where
	S: Send + Sync + 'static,
{
	default_server().register(service)
}

/// Registers a named service on the default server.
pub fn register_name<S>(name: &str, service: ServiceBuilder<S>) -> Result<(), RegisterError>
where
	S: Send + Sync + 'static,
{
	default_server().register_name(name, service)
}

/// Serves one connection with the default server.
pub async fn serve_conn<S>(stream: S)
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	default_server().serve_conn(stream).await;
}

/// Serves every connection accepted on `listener` with the default server.
pub async fn accept(listener: Listener) -> io::Error {
	default_server().accept(listener).await
}
