//! 入站分发：路由优先级、处理链顺序与中止、负载计数，以及请求-应答端到端场景。

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use spark_rpc::{
    CallOptions, Cmd, Context, DefaultRouter, ErrorCode, FilterAction, FreeListPacketPool,
    IdentityEncoder, JsonCodec, Metadata, Packet, Payload, Process, Protocol, Route, Router,
    RpcProcess, WireLayout, XorEncoder, default_config, handler,
};

use common::{Add, Sum, init_tracing, pipe, pump};

fn request_frame(layout: WireLayout, route: Route) -> BytesMut {
    let protocol = Protocol::new(
        JsonCodec,
        layout.codec(1 << 20),
        Arc::new(IdentityEncoder),
        Arc::new(FreeListPacketPool::new()),
    );
    let mut packet = protocol.new_packet(Cmd::Request, &route, Metadata::new());
    protocol.marshal_value(&mut packet, &0u8).expect("编码负载");
    BytesMut::from(&protocol.marshal_frame(&mut packet).expect("成帧")[..])
}

fn silent_output() -> Arc<dyn spark_rpc::Output> {
    Arc::new(|_frame: &[u8]| -> spark_rpc::Result<()> { Ok(()) })
}

fn recorder(trail: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> spark_rpc::Handler<JsonCodec> {
    let trail = trail.clone();
    handler(move |_ctx: &mut Context<JsonCodec>| trail.lock().push(name))
}

#[test]
fn numeric_route_takes_priority_over_uri() {
    let mut router = DefaultRouter::<JsonCodec>::new();
    router.register("user.get", |_ctx| {}).expect("注册 URI");
    router.register(7u32, |_ctx| {}).expect("注册数值 ID");

    let mut both = Packet::new();
    both.set_uri("user.get");
    both.set_msg_id(7);
    let mut id_only = Packet::new();
    id_only.set_msg_id(7);

    let resolved = router.get_handlers(&both).expect("解析");
    assert!(Arc::ptr_eq(&resolved, &router.get_handlers(&id_only).expect("数值路由")));
}

#[test]
fn msg_id_layout_dispatches_by_numeric_route() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let mut router = DefaultRouter::<JsonCodec>::new();
    let by_id = recorder(&trail, "id");
    router.register(7u32, move |ctx| by_id(ctx)).expect("注册");
    let fallback = recorder(&trail, "fallback");
    router.no_router(move |ctx| fallback(ctx));

    let config = default_config().with_layout(WireLayout::MsgId);
    let process = Process::new(config, Arc::new(router), silent_output());
    process
        .on_read(request_frame(WireLayout::MsgId, Route::Id(7)))
        .expect("命中数值路由");
    process
        .on_read(request_frame(WireLayout::MsgId, Route::Id(8)))
        .expect("落入兜底链");
    assert_eq!(*trail.lock(), vec!["id", "fallback"]);
}

#[test]
fn chain_runs_global_then_route_middlewares_then_terminal() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let mut router = DefaultRouter::<JsonCodec>::new();
    router.use_middlewares([recorder(&trail, "A"), recorder(&trail, "B")]);
    let terminal = recorder(&trail, "T");
    router
        .register_with("op", [recorder(&trail, "C")], move |ctx| terminal(ctx))
        .expect("注册");

    let pool = Arc::new(FreeListPacketPool::new());
    let process = Process::new(
        default_config().with_packet_pool(pool.clone()),
        Arc::new(router),
        silent_output(),
    );
    process
        .on_read(request_frame(WireLayout::Uri, Route::from("op")))
        .expect("分发");
    assert_eq!(*trail.lock(), vec!["A", "B", "C", "T"]);
    assert_eq!(pool.stats().outstanding(), 0);
}

#[test]
fn abort_skips_remaining_handlers_and_still_releases() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let mut router = DefaultRouter::<JsonCodec>::new();
    let b_trail = trail.clone();
    router.use_middlewares([
        recorder(&trail, "A"),
        handler(move |ctx: &mut Context<JsonCodec>| {
            b_trail.lock().push("B");
            ctx.abort();
        }),
    ]);
    let terminal = recorder(&trail, "T");
    router
        .register_with("op", [recorder(&trail, "C")], move |ctx| terminal(ctx))
        .expect("注册");

    let pool = Arc::new(FreeListPacketPool::new());
    let process = Process::new(
        default_config().with_packet_pool(pool.clone()),
        Arc::new(router),
        silent_output(),
    );
    process
        .on_read(request_frame(WireLayout::Uri, Route::from("op")))
        .expect("分发");
    assert_eq!(*trail.lock(), vec!["A", "B"]);
    let stats = pool.stats();
    assert_eq!(stats.outstanding(), 0);
    assert!(stats.gets > 0);
}

#[test]
fn fallback_chain_runs_global_then_own_middlewares() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let mut router = DefaultRouter::<JsonCodec>::new();
    router.use_middlewares([recorder(&trail, "A")]);
    let terminal = recorder(&trail, "T");
    router.no_router_with([recorder(&trail, "B")], move |ctx| terminal(ctx));

    let pool = Arc::new(FreeListPacketPool::new());
    let process = Process::new(
        default_config().with_packet_pool(pool.clone()),
        Arc::new(router),
        silent_output(),
    );
    process
        .on_read(request_frame(WireLayout::Uri, Route::from("unknown")))
        .expect("落入兜底链");
    assert_eq!(*trail.lock(), vec!["A", "B", "T"]);
    assert_eq!(pool.stats().outstanding(), 0);
}

#[test]
fn data_filter_stop_swallows_the_frame() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let mut router = DefaultRouter::<JsonCodec>::new();
    let terminal = recorder(&trail, "T");
    router.register("op", move |ctx| terminal(ctx)).expect("注册");

    let pool = Arc::new(FreeListPacketPool::new());
    let seen = Arc::new(Mutex::new(0usize));
    let counted = seen.clone();
    let config = default_config()
        .with_packet_pool(pool.clone())
        .with_data_filter(move |data: &mut BytesMut| -> spark_rpc::Result<FilterAction> {
            *counted.lock() += data.len();
            Ok(FilterAction::Stop)
        });
    let process = Process::new(config, Arc::new(router), silent_output());

    let frame = request_frame(WireLayout::Uri, Route::from("op"));
    let len = frame.len();
    process.on_read(frame).expect("被过滤的帧不是错误");
    assert!(trail.lock().is_empty());
    assert_eq!(*seen.lock(), len);
    let stats = pool.stats();
    assert_eq!(stats.outstanding(), 0);
    assert_eq!(stats.gets, 0);
}

#[test]
fn load_counter_is_observed_and_restored() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let config = default_config().with_load_limit(move |load| {
        observed.lock().push(load);
        false
    });
    let mut router = DefaultRouter::<JsonCodec>::new();
    router.register("op", |_ctx| {}).expect("注册");
    let process = Process::new(config, Arc::new(router), silent_output());

    for _ in 0..2 {
        process
            .on_read(request_frame(WireLayout::Uri, Route::from("op")))
            .expect("分发");
    }
    assert_eq!(*seen.lock(), vec![1, 1]);
    assert_eq!(process.load(), 0);
}

fn add_router() -> DefaultRouter<JsonCodec> {
    let mut router = DefaultRouter::<JsonCodec>::new();
    router
        .register("add", |ctx: &mut Context<JsonCodec>| {
            let reply = match ctx.unmarshal::<Add>() {
                Ok(add) => Payload::Value(Sum { sum: add.a + add.b }),
                Err(err) => Payload::from(err),
            };
            ctx.respond(reply, Metadata::new()).expect("写回应答");
        })
        .expect("注册 add");
    router
        .register("deny", |ctx: &mut Context<JsonCodec>| {
            ctx.respond::<Sum>(Payload::fault(ErrorCode::NotSupported, "denied"), Metadata::new())
                .expect("写回错误");
        })
        .expect("注册 deny");
    router
}

fn connect(
    client_config: spark_rpc::ProcessConfig<JsonCodec>,
    server_config: spark_rpc::ProcessConfig<JsonCodec>,
    router: DefaultRouter<JsonCodec>,
) -> Arc<RpcProcess<JsonCodec>> {
    init_tracing();
    let (to_server, server_rx) = pipe();
    let (to_client, client_rx) = pipe();
    let server = Arc::new(RpcProcess::new(server_config, Arc::new(router), to_client));
    let client = Arc::new(RpcProcess::new(
        client_config,
        Arc::new(DefaultRouter::<JsonCodec>::new()),
        to_server,
    ));
    pump(server_rx, server);
    pump(client_rx, client.clone());
    client
}

#[tokio::test]
async fn add_request_returns_sum() {
    let client = connect(default_config(), default_config(), add_router());
    let sum: Sum = client
        .call("add", &Add { a: 2, b: 3 }, CallOptions::new().with_timeout(Duration::from_secs(5)))
        .await
        .expect("调用成功");
    assert_eq!(sum, Sum { sum: 5 });
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn remote_fault_surfaces_as_typed_error() {
    let client = connect(default_config(), default_config(), add_router());
    let err = client
        .call::<Add, Sum>("deny", &Add { a: 1, b: 1 }, CallOptions::new())
        .await
        .expect_err("对端返回错误");
    assert!(err.is(ErrorCode::NotSupported));
    assert_eq!(err.message(), "denied");
}

#[tokio::test]
async fn obfuscated_link_carries_calls() {
    let encoder = Arc::new(XorEncoder::new(b"spark".to_vec()).expect("密钥"));
    let client = connect(
        default_config().with_encoder(encoder.clone()),
        default_config().with_encoder(encoder),
        add_router(),
    );
    let sum: Sum = client
        .call("add", &Add { a: 40, b: 2 }, CallOptions::new().with_timeout(Duration::from_secs(5)))
        .await
        .expect("调用成功");
    assert_eq!(sum.sum, 42);
}

#[tokio::test]
async fn notify_carries_metadata_and_reserved_bits_without_session() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut router = DefaultRouter::<JsonCodec>::new();
    router
        .register("audit", move |ctx: &mut Context<JsonCodec>| {
            let packet = ctx.packet();
            let line: String = ctx.unmarshal().expect("解码通知");
            let trace = packet.metadata().get_first("trace-id").map(str::to_owned);
            let _ = tx.send((packet.cmd(), packet.reserved(), trace, line));
        })
        .expect("注册");
    let client = connect(default_config(), default_config(), router);

    let mut metadata = Metadata::new();
    metadata.append("trace-id", "t-1");
    client
        .notify(
            "audit",
            &"login".to_owned(),
            CallOptions::new().with_metadata(metadata).with_reserved(0b0100),
        )
        .expect("发送通知");
    let (cmd, reserved, trace, line) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("通知应到达")
        .expect("通道未关闭");
    assert_eq!(cmd, Cmd::Notify);
    assert_eq!(reserved, 0b0100);
    assert_eq!(trace.as_deref(), Some("t-1"));
    assert_eq!(line, "login");
    assert_eq!(client.pending(), 0);
}
