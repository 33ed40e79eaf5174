//! Stream transports: TCP everywhere, Unix domain sockets on unix.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};

/// A connected duplex byte stream.
#[derive(Debug)]
pub enum Connection {
	/// TCP stream.
	Tcp(TcpStream),
	/// Unix domain stream.
	#[cfg(unix)]
	Unix(UnixStream),
}

impl AsyncRead for Connection {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			#[cfg(unix)]
			Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Connection {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			#[cfg(unix)]
			Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Self::Tcp(s) => Pin::new(s).poll_flush(cx),
			#[cfg(unix)]
			Self::Unix(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			#[cfg(unix)]
			Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
		}
	}
}

/// Dials `address` on `network` (`tcp`, `tcp4`, `tcp6`, or `unix`).
pub async fn connect(network: &str, address: &str) -> Result<Connection> {
	let dial_error = |source: io::Error| Error::Dial {
		network: network.to_owned(),
		address: address.to_owned(),
		source: Arc::new(source),
	};
	match network {
		"tcp" | "tcp4" | "tcp6" => connect_tcp(network, address).await.map(Connection::Tcp).map_err(dial_error),
		#[cfg(unix)]
		"unix" => UnixStream::connect(address).await.map(Connection::Unix).map_err(dial_error),
		other => Err(Error::UnsupportedNetwork(other.to_owned())),
	}
}

fn family_matches(network: &str, addr: &SocketAddr) -> bool {
	match network {
		"tcp4" => addr.is_ipv4(),
		"tcp6" => addr.is_ipv6(),
		_ => true,
	}
}

async fn connect_tcp(network: &str, address: &str) -> io::Result<TcpStream> {
	let mut last_error = None;
	for addr in tokio::net::lookup_host(address).await? {
		if !family_matches(network, &addr) {
			continue;
		}
		match TcpStream::connect(addr).await {
			Ok(stream) => {
				stream.set_nodelay(true)?;
				return Ok(stream);
			}
			Err(e) => last_error = Some(e),
		}
	}
	Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no {network} address for {address}"))))
}

async fn bind_tcp(network: &str, address: &str) -> io::Result<TcpListener> {
	let mut last_error = None;
	for addr in tokio::net::lookup_host(address).await? {
		if !family_matches(network, &addr) {
			continue;
		}
		match TcpListener::bind(addr).await {
			Ok(listener) => return Ok(listener),
			Err(e) => last_error = Some(e),
		}
	}
	Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no {network} address for {address}"))))
}

/// A bound listener.
#[derive(Debug)]
pub enum Listener {
	/// TCP listener.
	Tcp(TcpListener),
	/// Unix domain listener.
	#[cfg(unix)]
	Unix(UnixListener),
}

impl Listener {
	/// Binds `address` on `network` (`tcp`, `tcp4`, `tcp6`, or `unix`).
	pub async fn bind(network: &str, address: &str) -> Result<Self> {
		let listen_error = |source: io::Error| Error::Listen {
			network: network.to_owned(),
			address: address.to_owned(),
			source: Arc::new(source),
		};
		match network {
			"tcp" | "tcp4" | "tcp6" => bind_tcp(network, address).await.map(Self::Tcp).map_err(listen_error),
			#[cfg(unix)]
			"unix" => UnixListener::bind(address).map(Self::Unix).map_err(listen_error),
			other => Err(Error::UnsupportedNetwork(other.to_owned())),
		}
	}

	/// Waits for the next connection; returns it with the peer's address.
	pub async fn accept(&self) -> io::Result<(Connection, String)> {
		match self {
			Self::Tcp(listener) => {
				let (stream, peer) = listener.accept().await?;
				stream.set_nodelay(true)?;
				Ok((Connection::Tcp(stream), peer.to_string()))
			}
			#[cfg(unix)]
			Self::Unix(listener) => {
				let (stream, peer) = listener.accept().await?;
				let peer = peer.as_pathname().map(|p| p.display().to_string()).unwrap_or_default();
				Ok((Connection::Unix(stream), peer))
			}
		}
	}

	/// Address the listener is bound to, in dialable form.
	pub fn local_addr(&self) -> io::Result<String> {
		match self {
			Self::Tcp(listener) => listener.local_addr().map(|addr| addr.to_string()),
			#[cfg(unix)]
			Self::Unix(listener) => {
				let addr = listener.local_addr()?;
				Ok(addr.as_pathname().map(|p| p.display().to_string()).unwrap_or_default())
			}
		}
	}

	/// Network name to dial this listener with.
	pub fn network(&self) -> &'static str {
		match self {
			Self::Tcp(_) => "tcp",
			#[cfg(unix)]
			Self::Unix(_) => "unix",
		}
	}
}
