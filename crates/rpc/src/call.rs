//! Client-side handle for one invocation, and the queue that reports it done.
//!
//! A [`Call`] is created by [`crate::Client::go`], owned by the client while
//! the request is outstanding, and handed to its [`DoneSender`] exactly once
//! when a terminal outcome is known. Delivery never blocks: a full queue drops
//! the notification and logs it, so the connection reader can never stall on a
//! slow consumer.

use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Error, Result};

/// One RPC invocation and its outcome.
#[derive(Debug)]
pub struct Call<A, R> {
	/// Target in `Service.Method` form.
	pub service_method: String,
	/// Arguments the call was issued with.
	pub args: A,
	/// Decoded reply, set when the call succeeded.
	pub reply: Option<R>,
	/// Terminal error, set when the call failed.
	pub error: Option<Error>,
}

impl<A, R> Call<A, R> {
	pub(crate) fn new(service_method: impl Into<String>, args: A) -> Self {
		Self {
			service_method: service_method.into(),
			args,
			reply: None,
			error: None,
		}
	}

	/// Records the terminal outcome. Exactly one of `reply` or `error` is set.
	pub(crate) fn finish(mut self, outcome: Result<R>) -> Self {
		match outcome {
			Ok(reply) => self.reply = Some(reply),
			Err(error) => self.error = Some(error),
		}
		self
	}

	/// Returns true once an outcome has been recorded.
	pub fn is_done(&self) -> bool {
		self.reply.is_some() || self.error.is_some()
	}

	/// Converts the call into its outcome.
	pub fn into_result(self) -> Result<R> {
		match (self.error, self.reply) {
			(Some(error), _) => Err(error),
			(None, Some(reply)) => Ok(reply),
			(None, None) => Err(Error::MissingReply),
		}
	}
}

impl<A: fmt::Debug, R: fmt::Debug> fmt::Display for Call<A, R> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Call {}({:?}) (", self.service_method, self.args)?;
		match &self.reply {
			Some(reply) => write!(f, "{reply:?}")?,
			None => f.write_str("-")?,
		}
		match &self.error {
			Some(error) => write!(f, ", {error})"),
			None => f.write_str(", -)"),
		}
	}
}

/// Producer side of a completion queue. Cheap to clone; several calls may
/// share one queue.
#[derive(Debug)]
pub struct DoneSender<A, R> {
	tx: mpsc::Sender<Call<A, R>>,
}

impl<A, R> Clone for DoneSender<A, R> {
	fn clone(&self) -> Self {
		Self { tx: self.tx.clone() }
	}
}

impl<A, R> DoneSender<A, R> {
	/// Hands a finished call to the queue without waiting.
	///
	/// Returns false if the notification was dropped.
	pub(crate) fn deliver(&self, call: Call<A, R>) -> bool {
		match self.tx.try_send(call) {
			Ok(()) => true,
			Err(TrySendError::Full(call)) => {
				tracing::warn!(
					method = %call.service_method,
					capacity = self.tx.max_capacity(),
					"rpc: discarding call reply due to insufficient done queue capacity"
				);
				false
			}
			Err(TrySendError::Closed(call)) => {
				tracing::debug!(method = %call.service_method, "rpc: done queue receiver dropped");
				false
			}
		}
	}

	/// Maximum number of undelivered completions the queue holds.
	pub fn capacity(&self) -> usize {
		self.tx.max_capacity()
	}
}

/// Consumer side of a completion queue.
#[derive(Debug)]
pub struct DoneReceiver<A, R> {
	rx: mpsc::Receiver<Call<A, R>>,
}

impl<A, R> DoneReceiver<A, R> {
	/// Waits for the next finished call.
	///
	/// Returns `None` once every sender is gone and the queue is empty.
	pub async fn recv(&mut self) -> Option<Call<A, R>> {
		self.rx.recv().await
	}

	/// Returns a finished call if one is ready.
	pub fn try_recv(&mut self) -> Option<Call<A, R>> {
		self.rx.try_recv().ok()
	}
}

/// Creates a bounded completion queue.
///
/// # Panics
///
/// Panics if `capacity` is zero. Delivery is non-blocking, so an unbuffered
/// queue could never receive anything.
pub fn done_channel<A, R>(capacity: usize) -> (DoneSender<A, R>, DoneReceiver<A, R>) {
	assert!(capacity > 0, "rpc: done channel is unbuffered");
	let (tx, rx) = mpsc::channel(capacity);
	(DoneSender { tx }, DoneReceiver { rx })
}
