//! Service descriptors and the method table used by the dispatcher.
//!
//! A service is a shared receiver plus an explicit list of methods. Each
//! method is stored as a type-erased invoker: given an encoded argument body
//! it decodes the argument and returns a ready-to-run future producing the
//! encoded reply (or the handler's error text).
//!
//! ```ignore
//! let arith = ServiceBuilder::new(Arith)
//!     .method("Add", |_: &Arith, args: Args, reply: &mut Reply| {
//!         reply.c = args.a + args.b;
//!         Ok::<_, String>(())
//!     });
//! server.register(arith)?;
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{Binary, Payload, PayloadFormat};
use crate::error::{CodecError, RegisterError};

/// Future running one decoded invocation.
pub(crate) type Prepared<F> = BoxFuture<'static, Result<Payload<F>, String>>;

type Invoker<F> = Box<dyn Fn(Payload<F>) -> Result<Prepared<F>, CodecError> + Send + Sync>;

/// Descriptor of one callable method.
pub struct MethodType<F: PayloadFormat> {
	name: String,
	arg_type: &'static str,
	reply_type: &'static str,
	num_calls: AtomicU64,
	invoke: Invoker<F>,
}

impl<F: PayloadFormat> MethodType<F> {
	/// Method name (without the service prefix).
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Rust type name of the argument.
	pub fn arg_type(&self) -> &'static str {
		self.arg_type
	}

	/// Rust type name of the reply.
	pub fn reply_type(&self) -> &'static str {
		self.reply_type
	}

	/// Number of invocations so far.
	pub fn num_calls(&self) -> u64 {
		self.num_calls.load(Ordering::Relaxed)
	}

	pub(crate) fn record_call(&self) {
		self.num_calls.fetch_add(1, Ordering::Relaxed);
	}

	/// Decodes the argument body and binds it to the handler.
	pub(crate) fn prepare(&self, body: Payload<F>) -> Result<Prepared<F>, CodecError> {
		(self.invoke)(body)
	}
}

impl<F: PayloadFormat> std::fmt::Debug for MethodType<F> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MethodType")
			.field("name", &self.name)
			.field("arg_type", &self.arg_type)
			.field("reply_type", &self.reply_type)
			.field("num_calls", &self.num_calls())
			.finish()
	}
}

/// A registered service.
pub(crate) struct Service<F: PayloadFormat> {
	pub(crate) name: String,
	pub(crate) methods: HashMap<String, Arc<MethodType<F>>>,
}

impl<F: PayloadFormat> Service<F> {
	pub(crate) fn info(&self) -> ServiceInfo {
		let mut methods: Vec<MethodInfo> = self
			.methods
			.values()
			.map(|method| MethodInfo {
				name: method.name.clone(),
				arg_type: method.arg_type.to_owned(),
				reply_type: method.reply_type.to_owned(),
				calls: method.num_calls(),
			})
			.collect();
		methods.sort_by(|a, b| a.name.cmp(&b.name));
		ServiceInfo {
			name: self.name.clone(),
			methods,
		}
	}
}

/// Read-only snapshot of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
	/// Service name.
	pub name: String,
	/// Methods sorted by name.
	pub methods: Vec<MethodInfo>,
}

/// Read-only snapshot of one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
	/// Method name.
	pub name: String,
	/// Argument type name.
	pub arg_type: String,
	/// Reply type name.
	pub reply_type: String,
	/// Invocation count at snapshot time.
	pub calls: u64,
}

/// Collects a receiver and its methods for registration on a
/// [`crate::Server`] of payload format `F`.
pub struct ServiceBuilder<S, F: PayloadFormat = Binary> {
	receiver: Arc<S>,
	methods: Vec<MethodType<F>>,
	rejected: Vec<String>,
}

impl<S, F> ServiceBuilder<S, F>
where
	S: Send + Sync + 'static,
	F: PayloadFormat,
{
	/// Starts a service around `receiver`.
	pub fn new(receiver: S) -> Self {
		Self::from_arc(Arc::new(receiver))
	}

	/// Starts a service around a receiver that is already shared.
	pub fn from_arc(receiver: Arc<S>) -> Self {
		Self {
			receiver,
			methods: Vec::new(),
			rejected: Vec::new(),
		}
	}

	/// Adds a synchronous method.
	///
	/// The handler fills the reply in place; the reply starts as
	/// `R::default()`, so container replies arrive empty and ready to
	/// populate. On `Err` the reply is not sent and the error text is returned
	/// to the caller verbatim.
	pub fn method<A, R, E, H>(self, name: &str, handler: H) -> Self
	where
		A: DeserializeOwned + Send + 'static,
		R: Serialize + Default + Send + 'static,
		E: Display,
		H: Fn(&S, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
	{
		let receiver = self.receiver.clone();
		let handler = Arc::new(handler);
		let invoke: Invoker<F> = Box::new(move |body: Payload<F>| -> Result<Prepared<F>, CodecError> {
			let args: A = F::decode_payload(body)?;
			let receiver = receiver.clone();
			let handler = handler.clone();
			Ok(Box::pin(async move {
				let mut reply = R::default();
				(*handler)(&*receiver, args, &mut reply).map_err(|e| e.to_string())?;
				F::encode_payload(&reply).map_err(|e| e.to_string())
			}))
		});
		self.add(name, std::any::type_name::<A>(), std::any::type_name::<R>(), invoke)
	}

	/// Adds an asynchronous method.
	pub fn async_method<A, R, E, H, Fut>(self, name: &str, handler: H) -> Self
	where
		A: DeserializeOwned + Send + 'static,
		R: Serialize + Send + 'static,
		E: Display,
		H: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<R, E>> + Send + 'static,
	{
		let receiver = self.receiver.clone();
		let handler = Arc::new(handler);
		let invoke: Invoker<F> = Box::new(move |body: Payload<F>| -> Result<Prepared<F>, CodecError> {
			let args: A = F::decode_payload(body)?;
			let receiver = receiver.clone();
			let handler = handler.clone();
			// The handler runs on first poll, inside the dispatcher's unwind guard.
			Ok(Box::pin(async move {
				let reply = (*handler)(receiver, args).await.map_err(|e| e.to_string())?;
				F::encode_payload(&reply).map_err(|e| e.to_string())
			}))
		});
		self.add(name, std::any::type_name::<A>(), std::any::type_name::<R>(), invoke)
	}

	fn add(mut self, name: &str, arg_type: &'static str, reply_type: &'static str, invoke: Invoker<F>) -> Self {
		let reason = if !is_exported(name) {
			Some(format!("method {name:?} is not exported"))
		} else if name.contains('.') {
			Some(format!("method {name:?} contains the '.' separator"))
		} else if self.methods.iter().any(|m| m.name == name) {
			Some(format!("method {name:?} is already defined"))
		} else {
			None
		};
		match reason {
			Some(reason) => {
				tracing::warn!(service = type_short_name::<S>(), method = name, %reason, "rpc.register: skipping method");
				self.rejected.push(reason);
			}
			None => self.methods.push(MethodType {
				name: name.to_owned(),
				arg_type,
				reply_type,
				num_calls: AtomicU64::new(0),
				invoke,
			}),
		}
		self
	}

	/// Resolves the service name and freezes the method table.
	///
	/// With `name` unset (or blank) the receiver's type name is used, which
	/// must be exported.
	pub(crate) fn build(self, name: Option<&str>) -> Result<Service<F>, RegisterError> {
		let type_name = type_short_name::<S>();
		let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
			Some(name) => name.to_owned(),
			None if type_name.is_empty() => return Err(RegisterError::NoServiceName(std::any::type_name::<S>().to_owned())),
			None if !is_exported(type_name) => return Err(RegisterError::NotExported(type_name.to_owned())),
			None => type_name.to_owned(),
		};
		if self.methods.is_empty() {
			return Err(RegisterError::NoSuitableMethods {
				service: name,
				rejected: self.rejected,
			});
		}
		let methods = self
			.methods
			.into_iter()
			.map(|method| (method.name.clone(), Arc::new(method)))
			.collect();
		Ok(Service { name, methods })
	}
}

/// Last path segment of `S`'s type name, without generic arguments.
pub(crate) fn type_short_name<S: ?Sized>() -> &'static str {
	let full = std::any::type_name::<S>();
	let base = full.split('<').next().unwrap_or(full);
	base.rsplit("::").next().unwrap_or(base)
}

/// Exported names start with an ASCII uppercase letter.
pub(crate) fn is_exported(name: &str) -> bool {
	name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests;
