//! Task spawning and in-flight handler tracking.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("tether-rpc-global")
			.build()
			.expect("failed to build tether-rpc global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns a task on the current runtime, or on a shared fallback runtime when
/// called outside of one.
pub fn spawn<F>(role: &'static str, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(task_role = role, "rpc.spawn");
	runtime_handle().spawn(fut)
}

/// Dispatched handler tasks of one connection.
///
/// At most `max` tasks run at once; [`InFlight::spawn`] waits for a free slot.
/// [`InFlight::wait`] returns once every task has finished.
#[derive(Debug)]
pub struct InFlight {
	role: &'static str,
	tasks: JoinSet<()>,
	permits: Arc<Semaphore>,
}

impl InFlight {
	/// Creates an empty set admitting `max` concurrent tasks.
	pub fn new(role: &'static str, max: usize) -> Self {
		Self {
			role,
			tasks: JoinSet::new(),
			permits: Arc::new(Semaphore::new(max.max(1))),
		}
	}

	/// Number of tasks not yet reaped.
	pub fn len(&self) -> usize {
		self.tasks.len()
	}

	/// Returns `true` if no task is tracked.
	pub fn is_empty(&self) -> bool {
		self.tasks.is_empty()
	}

	/// Spawns `fut` once a slot is free.
	pub async fn spawn<F>(&mut self, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		while let Some(result) = self.tasks.try_join_next() {
			self.reap(result);
		}
		// The semaphore is never closed, so acquisition only fails if that
		// changes; run unbounded rather than drop the request.
		let permit = self.permits.clone().acquire_owned().await.ok();
		tracing::trace!(task_role = self.role, pending = self.tasks.len(), "rpc.inflight.spawn");
		self.tasks.spawn_on(
			async move {
				let _permit = permit;
				fut.await;
			},
			&runtime_handle(),
		);
	}

	/// Waits for every tracked task.
	pub async fn wait(&mut self) {
		while let Some(result) = self.tasks.join_next().await {
			self.reap(result);
		}
	}

	fn reap(&self, result: Result<(), tokio::task::JoinError>) {
		if let Err(error) = result
			&& error.is_panic()
		{
			tracing::error!(task_role = self.role, error = %error, "rpc.inflight.panic");
		}
	}
}
