//! Call-correlating RPC runtime with pluggable wire codecs.
//!
//! A [`Server`] exposes named methods of registered receivers; a [`Client`]
//! invokes them over any duplex byte stream, multiplexing concurrent calls on
//! one connection by sequence number:
//! * [`codec`]: envelope framing and payload formats ([`Binary`], [`Json`])
//! * [`Client`] / [`Call`]: pending-call table and completion queues
//! * [`ServiceBuilder`] / [`Server`]: method table and per-connection dispatch
//! * [`default`]: the process-wide default server
//! * [`net`]: TCP and Unix transports

#![warn(missing_docs)]

pub mod call;
pub mod client;
pub mod codec;
pub mod config;
pub mod default;
pub mod error;
pub mod net;
pub mod server;
pub mod service;
pub mod task;

pub use call::{Call, DoneReceiver, DoneSender, done_channel};
pub use client::{BinaryClient, Client, dial, dial_with};
pub use codec::{Binary, BinaryCodec, ClientCodec, Json, JsonCodec, PayloadFormat, Request, Response, ServerCodec};
pub use config::RpcConfig;
pub use default::{default_server, set_default_server};
pub use error::{CodecError, ConfigError, Error, RegisterError, Result};
pub use net::{Connection, Listener};
pub use server::Server;
pub use service::{MethodInfo, MethodType, ServiceBuilder, ServiceInfo};
