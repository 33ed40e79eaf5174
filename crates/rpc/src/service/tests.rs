use std::collections::BTreeMap;

use super::*;
use crate::codec::Json;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
	a: i64,
	b: i64,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Reply {
	c: i64,
}

struct Arith;

#[allow(non_camel_case_types)]
struct hidden;

fn arith() -> ServiceBuilder<Arith> {
	ServiceBuilder::new(Arith)
		.method("Add", |_: &Arith, args: Args, reply: &mut Reply| {
			reply.c = args.a + args.b;
			Ok::<_, String>(())
		})
		.method("Div", |_: &Arith, args: Args, reply: &mut Reply| {
			if args.b == 0 {
				return Err("divide by zero".to_owned());
			}
			reply.c = args.a / args.b;
			Ok(())
		})
}

async fn run<F: PayloadFormat>(method: &MethodType<F>, body: Payload<F>) -> Result<Payload<F>, String> {
	method.prepare(body).map_err(|e| e.to_string())?.await
}

#[test]
fn test_type_short_name() {
	assert_eq!(type_short_name::<Arith>(), "Arith");
	assert_eq!(type_short_name::<Vec<u8>>(), "Vec");
	assert_eq!(type_short_name::<hidden>(), "hidden");
}

#[test]
fn test_is_exported() {
	assert!(is_exported("Add"));
	assert!(!is_exported("add"));
	assert!(!is_exported("_Add"));
	assert!(!is_exported(""));
}

#[test]
fn test_build_uses_type_name() {
	let service = arith().build(None).unwrap();
	assert_eq!(service.name, "Arith");
	let mut names: Vec<_> = service.methods.keys().cloned().collect();
	names.sort();
	assert_eq!(names, ["Add", "Div"]);
}

#[test]
fn test_explicit_and_blank_names() {
	assert_eq!(arith().build(Some("Calc")).unwrap().name, "Calc");
	assert_eq!(arith().build(Some("   ")).unwrap().name, "Arith");
}

#[test]
fn test_unexported_type_needs_explicit_name() {
	let builder = || {
		ServiceBuilder::<_, Binary>::new(hidden).method("Ping", |_: &hidden, _: (), _: &mut ()| Ok::<_, String>(()))
	};
	let err = builder().build(None).err().unwrap();
	assert_eq!(err, RegisterError::NotExported("hidden".into()));
	assert_eq!(err.to_string(), "rpc.Register: type hidden is not exported");

	assert_eq!(builder().build(Some("Hidden")).unwrap().name, "Hidden");
}

#[test]
fn test_ineligible_methods_are_skipped() {
	let service = arith()
		.method("sub", |_: &Arith, _: Args, _: &mut Reply| Ok::<_, String>(()))
		.method("Add", |_: &Arith, _: Args, _: &mut Reply| Ok::<_, String>(()))
		.method("Nested.Add", |_: &Arith, _: Args, _: &mut Reply| Ok::<_, String>(()))
		.build(None)
		.unwrap();
	assert_eq!(service.methods.len(), 2);
	assert!(!service.methods.contains_key("sub"));
	assert!(!service.methods.contains_key("Nested.Add"));
}

#[test]
fn test_no_suitable_methods() {
	let err = ServiceBuilder::<_, Binary>::new(Arith).build(None).err().unwrap();
	assert_eq!(err.to_string(), "rpc.Register: type Arith has no exported methods of suitable type");

	let err = ServiceBuilder::<_, Binary>::new(Arith)
		.method("add", |_: &Arith, _: Args, _: &mut Reply| Ok::<_, String>(()))
		.build(None)
		.err()
		.unwrap();
	let RegisterError::NoSuitableMethods { service, rejected } = &err else {
		panic!("unexpected error {err:?}");
	};
	assert_eq!(service, "Arith");
	assert_eq!(rejected.len(), 1);
	assert!(err.to_string().contains("hint: 1 candidate method(s) rejected"), "{err}");
	assert!(err.to_string().contains("\"add\" is not exported"), "{err}");
}

#[tokio::test]
async fn test_sync_method_invocation() {
	let service = arith().build(None).unwrap();
	let add = &service.methods["Add"];
	let body = Binary::encode_payload(&Args { a: 7, b: 8 }).unwrap();
	let reply: Reply = Binary::decode_payload(run(add, body).await.unwrap()).unwrap();
	assert_eq!(reply, Reply { c: 15 });

	let div = &service.methods["Div"];
	let body = Binary::encode_payload(&Args { a: 7, b: 0 }).unwrap();
	assert_eq!(run(div, body).await.unwrap_err(), "divide by zero");
}

#[tokio::test]
async fn test_bad_argument_fails_prepare() {
	let service = arith().build(None).unwrap();
	let err = service.methods["Add"].prepare(Binary::encode_payload("seven").unwrap()).err().unwrap();
	assert!(matches!(err, CodecError::Decode(_)), "{err}");
}

#[tokio::test]
async fn test_container_reply_starts_empty() {
	let service = ServiceBuilder::<_, Json>::new(Arith)
		.method("Split", |_: &Arith, n: u32, reply: &mut BTreeMap<String, u32>| {
			assert!(reply.is_empty());
			for i in 0..n {
				reply.insert(format!("k{i}"), i);
			}
			Ok::<_, String>(())
		})
		.build(None)
		.unwrap();
	let out = run(&service.methods["Split"], serde_json::json!(2)).await.unwrap();
	assert_eq!(out, serde_json::json!({"k0": 0, "k1": 1}));
}

#[tokio::test]
async fn test_async_method_shares_receiver() {
	struct Counter(AtomicU64);

	let service = ServiceBuilder::<_, Json>::new(Counter(AtomicU64::new(0)))
		.async_method("Bump", |counter: Arc<Counter>, by: u64| async move {
			Ok::<_, String>(counter.0.fetch_add(by, Ordering::SeqCst) + by)
		})
		.build(None)
		.unwrap();
	let bump = &service.methods["Bump"];
	assert_eq!(run(bump, serde_json::json!(2)).await.unwrap(), serde_json::json!(2));
	assert_eq!(run(bump, serde_json::json!(3)).await.unwrap(), serde_json::json!(5));
	assert_eq!(bump.arg_type(), "u64");
	assert_eq!(bump.reply_type(), "u64");
}

#[tokio::test]
async fn test_async_handler_runs_on_first_poll() {
	let service = ServiceBuilder::<_, Binary>::new(Arith)
		.async_method("Boom", |_: Arc<Arith>, n: u64| {
			assert!(n != 0, "zero");
			async move { Ok::<_, String>(n) }
		})
		.build(None)
		.unwrap();
	let boom = &service.methods["Boom"];

	let call = boom.prepare(Binary::encode_payload(&0u64).unwrap()).unwrap();
	let outcome = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(call)).await;
	assert!(outcome.is_err());

	let reply = run(boom, Binary::encode_payload(&5u64).unwrap()).await.unwrap();
	assert_eq!(Binary::decode_payload::<u64>(reply).unwrap(), 5);
}

#[test]
fn test_info_is_sorted_and_counts_calls() {
	let service = ServiceBuilder::<_, Binary>::new(Arith)
		.method("Mul", |_: &Arith, _: Args, _: &mut Reply| Ok::<_, String>(()))
		.method("Add", |_: &Arith, _: Args, _: &mut Reply| Ok::<_, String>(()))
		.build(None)
		.unwrap();
	service.methods["Mul"].record_call();
	service.methods["Mul"].record_call();

	let info = service.info();
	assert_eq!(info.name, "Arith");
	let names: Vec<_> = info.methods.iter().map(|m| m.name.as_str()).collect();
	assert_eq!(names, ["Add", "Mul"]);
	assert_eq!(info.methods[0].calls, 0);
	assert_eq!(info.methods[1].calls, 2);
	assert!(info.methods[1].arg_type.ends_with("Args"));
}
