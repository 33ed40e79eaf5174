use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use super::*;
use crate::codec::{BinaryCodec, ClientCodec, JsonCodec};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
	a: i64,
	b: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Reply {
	c: i64,
}

struct Arith;

fn arith<F: PayloadFormat>() -> ServiceBuilder<Arith, F> {
	ServiceBuilder::new(Arith)
		.method("Add", |_: &Arith, args: Args, reply: &mut Reply| {
			reply.c = args.a + args.b;
			Ok::<_, String>(())
		})
		.method("Mul", |_: &Arith, args: Args, reply: &mut Reply| {
			reply.c = args.a * args.b;
			Ok::<_, String>(())
		})
		.method("Div", |_: &Arith, args: Args, reply: &mut Reply| {
			if args.b == 0 {
				return Err("divide by zero".to_owned());
			}
			reply.c = args.a / args.b;
			Ok(())
		})
		.method("Error", |_: &Arith, _: Args, _: &mut Reply| -> Result<(), String> { panic!("ERROR") })
		.async_method("Sleep", |_: Arc<Arith>, millis: u64| async move {
			tokio::time::sleep(Duration::from_millis(millis)).await;
			Ok::<_, String>(millis)
		})
}

fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Hand-written JSON client over one end of a duplex pipe.
struct Wire {
	lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
	writer: WriteHalf<DuplexStream>,
}

impl Wire {
	fn serve(server: Server<Json>) -> Self {
		let (cli, srv) = tokio::io::duplex(64 * 1024);
		tokio::spawn(async move { server.serve_conn(srv).await });
		let (reader, writer) = tokio::io::split(cli);
		Self {
			lines: BufReader::new(reader).lines(),
			writer,
		}
	}

	async fn send_raw(&mut self, line: &str) {
		self.writer.write_all(line.as_bytes()).await.unwrap();
		self.writer.write_all(b"\n").await.unwrap();
	}

	async fn recv(&mut self) -> Option<Value> {
		let line = self.lines.next_line().await.unwrap()?;
		Some(serde_json::from_str(&line).unwrap())
	}
}

fn json_server() -> Server<Json> {
	let server = Server::new_json();
	server.register(arith()).unwrap();
	server
}

#[tokio::test]
async fn test_json_request_without_params() {
	let mut wire = Wire::serve(json_server());
	wire.send_raw(r#"{"method": "Arith.Add", "seq": 987}"#).await;
	let resp = wire.recv().await.unwrap();
	assert_eq!(resp["seq"], 987);
	assert_eq!(resp["error"], "request body missing params");
	assert_eq!(resp["payload"], Value::Null);
}

#[tokio::test]
async fn test_json_empty_object() {
	let mut wire = Wire::serve(json_server());
	wire.send_raw("{}").await;
	let resp = wire.recv().await.unwrap();
	assert_eq!(resp["seq"], 0);
	assert_eq!(resp["error"], "rpc: service/method request ill-formed: ");
}

#[tokio::test]
async fn test_json_hand_coded_requests() {
	let mut wire = Wire::serve(json_server());
	for i in 0..10 {
		wire.send_raw(&format!(r#"{{"method": "Arith.Add", "seq": {i}, "payload": {{"a": {i}, "b": {}}}}}"#, i + 1))
			.await;
		let resp = wire.recv().await.unwrap();
		assert_eq!(resp["error"], Value::Null, "{resp}");
		assert_eq!(resp["seq"], i);
		assert_eq!(resp["payload"]["c"], 2 * i + 1);
	}
}

#[tokio::test]
async fn test_resolution_errors_keep_connection() {
	let mut wire = Wire::serve(json_server());
	let cases = [
		("Arith", "rpc: service/method request ill-formed: Arith"),
		("Calc.Add", "rpc: can't find service Calc.Add"),
		("Arith.Pow", "rpc: can't find method Arith.Pow"),
		("Arith.", "rpc: can't find method Arith."),
	];
	for (seq, (method, expected)) in cases.iter().enumerate() {
		wire.send_raw(&json!({"method": method, "seq": seq, "payload": {"a": 1, "b": 1}}).to_string())
			.await;
		let resp = wire.recv().await.unwrap();
		assert_eq!(resp["seq"], seq);
		assert_eq!(resp["error"], *expected);
	}

	wire.send_raw(r#"{"method": "Arith.Mul", "seq": 99, "payload": {"a": 6, "b": 7}}"#).await;
	assert_eq!(wire.recv().await.unwrap()["payload"]["c"], 42);
}

#[tokio::test]
async fn test_bad_argument_is_reported() {
	let mut wire = Wire::serve(json_server());
	wire.send_raw(r#"{"method": "Arith.Add", "seq": 1, "payload": "seven"}"#).await;
	let resp = wire.recv().await.unwrap();
	assert!(resp["error"].as_str().unwrap().starts_with("decode: "), "{resp}");

	wire.send_raw(r#"{"method": "Arith.Div", "seq": 2, "payload": {"a": 1, "b": 0}}"#).await;
	let resp = wire.recv().await.unwrap();
	assert_eq!(resp["error"], "divide by zero");
	assert_eq!(resp["payload"], Value::Null);
}

#[tokio::test]
async fn test_malformed_header_ends_connection() {
	let mut wire = Wire::serve(json_server());
	wire.send_raw("this is not json").await;
	assert!(wire.recv().await.is_none());
}

#[tokio::test]
async fn test_handler_panic_is_answered() {
	init_tracing();
	let mut wire = Wire::serve(json_server());
	wire.send_raw(r#"{"method": "Arith.Error", "seq": 1, "payload": {"a": 0, "b": 0}}"#).await;
	let resp = wire.recv().await.unwrap();
	assert_eq!(resp["error"], "rpc: handler panicked");

	wire.send_raw(r#"{"method": "Arith.Add", "seq": 2, "payload": {"a": 1, "b": 1}}"#).await;
	assert_eq!(wire.recv().await.unwrap()["payload"]["c"], 2);
}

#[tokio::test]
async fn test_inflight_handlers_finish_before_close() {
	let mut wire = Wire::serve(json_server());
	wire.send_raw(r#"{"method": "Arith.Sleep", "seq": 1, "payload": 50}"#).await;
	wire.writer.shutdown().await.unwrap();

	let resp = wire.recv().await.unwrap();
	assert_eq!(resp["seq"], 1);
	assert_eq!(resp["payload"], 50);
	assert!(wire.recv().await.is_none());
}

#[tokio::test]
async fn test_serve_request_binary() {
	let server = Server::new();
	server.register(arith()).unwrap();
	let (cli, srv) = tokio::io::duplex(4096);
	let client = BinaryCodec::new(cli);
	let codec = BinaryCodec::new(srv);

	let args = Binary::encode_payload(&Args { a: 3, b: 4 }).unwrap();
	let header = Request {
		method: "Arith.Mul".into(),
		seq: 5,
	};
	ClientCodec::write_request(&client, &header, args).await.unwrap();
	server.serve_request(&codec).await.unwrap();

	let resp = client.read_response_header().await.unwrap();
	assert_eq!((resp.seq, resp.error_message()), (5, None));
	let reply: Reply = Binary::decode_payload(client.read_response_body().await.unwrap()).unwrap();
	assert_eq!(reply.c, 12);

	ClientCodec::close(&client).await.unwrap();
	let err = server.serve_request(&codec).await.unwrap_err();
	assert!(err.is_end_of_stream(), "{err}");
}

#[tokio::test]
async fn test_serve_request_rejects_unknown_method() {
	let server = Server::new_json();
	server.register(arith()).unwrap();
	let (cli, srv) = tokio::io::duplex(4096);
	let client = JsonCodec::new(cli);
	let codec = JsonCodec::new(srv);

	let header = Request {
		method: "Arith.Sub".into(),
		seq: 8,
	};
	ClientCodec::write_request(&client, &header, json!({"a": 1, "b": 1})).await.unwrap();
	server.serve_request(&codec).await.unwrap();
	let resp = client.read_response_header().await.unwrap();
	assert_eq!(resp.seq, 8);
	assert_eq!(resp.error_message(), Some("rpc: can't find method Arith.Sub"));
}

#[test]
fn test_registration_rules() {
	let server = Server::new();
	server.register(arith()).unwrap();

	let err = server
		.register(ServiceBuilder::new(Arith).method("Neg", |_: &Arith, a: i64, r: &mut i64| {
			*r = -a;
			Ok::<_, String>(())
		}))
		.unwrap_err();
	assert_eq!(err, RegisterError::Duplicate("Arith".into()));
	assert_eq!(err.to_string(), "rpc: service already defined: Arith");
	let arith_info = &server.services()[0];
	assert!(arith_info.methods.iter().all(|m| m.name != "Neg"));

	server
		.register_name(
			"Calc",
			ServiceBuilder::new(Arith).method("Neg", |_: &Arith, a: i64, r: &mut i64| {
				*r = -a;
				Ok::<_, String>(())
			}),
		)
		.unwrap();
	let names: Vec<_> = server.services().into_iter().map(|s| s.name).collect();
	assert_eq!(names, ["Arith", "Calc"]);

	let err = server.register_name("Empty", ServiceBuilder::<_, Binary>::new(Arith)).unwrap_err();
	assert!(matches!(err, RegisterError::NoSuitableMethods { .. }), "{err}");
	assert_eq!(server.services().len(), 2);
}

#[tokio::test]
async fn test_introspection_counts_calls() {
	let server = Server::new_json();
	server.register(arith()).unwrap();
	let info = server.services();
	let methods: Vec<_> = info[0].methods.iter().map(|m| m.name.as_str()).collect();
	assert_eq!(methods, ["Add", "Div", "Error", "Mul", "Sleep"]);

	let server = Arc::new(server);
	let (cli, srv) = tokio::io::duplex(4096);
	tokio::spawn({
		let server = server.clone();
		async move { server.serve_conn(srv).await }
	});
	let (reader, mut writer) = tokio::io::split(cli);
	let mut lines = BufReader::new(reader).lines();
	for seq in 0..3 {
		writer
			.write_all(format!("{{\"method\":\"Arith.Add\",\"seq\":{seq},\"payload\":{{\"a\":1,\"b\":1}}}}\n").as_bytes())
			.await
			.unwrap();
		lines.next_line().await.unwrap().unwrap();
	}

	let add = server.services()[0].methods.iter().find(|m| m.name == "Add").cloned().unwrap();
	assert_eq!(add.calls, 3);
	assert!(add.arg_type.ends_with("Args"));
	assert!(add.reply_type.ends_with("Reply"));
}
