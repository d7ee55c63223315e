//! # rpc：会话关联层
//!
//! ## 核心意图（Why）
//! - 在 [`Process`] 之上提供 `call` / `async_call` / `notify` 三种出站语义；
//! - 以连接级会话表把乱序到达的应答准确交还给等待它的调用方。
//!
//! ## 架构定位（Where）
//! - [`RpcProcess`] 持有一个 `Process`，并把应答拦截器装入其唯一的拦截钩子；
//! - 入站路径（读任务）与出站路径（任意调用方）之间只共享会话表与两个原子计数。
//!
//! ## 行为契约（What）
//! - 应答按会话号关联，与到达顺序无关；
//! - 会话号重复登记属于序号复用的编程错误，直接 panic；
//! - 找不到会话的应答（已超时或未知）记录日志后丢弃；
//! - 连接拆除时 [`RpcProcess::clean`] 保证每个未决调用都收到终结错误；此后会话表关闭，
//!   新的 `call` / `async_call` 在写出请求之前即以 `SessionClosed` 失败。
//!
//! ## 风险提示（Trade-offs）
//! - 同步 `call` 在超时或被取消时会主动移除自己的会话，会话表规模因此只取决于真实在途的调用数；
//! - 带超时的 `async_call` 为每次调用派生一个等待任务，其寿命以截止时间为上限。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::codec::MessageCodec;
use crate::context::{Context, ContextPool, drive};
use crate::error::{ErrorCode, Result, RpcError};
use crate::metadata::Metadata;
use crate::packet::{Cmd, Packet, Route};
use crate::process::{Interception, Interceptor, Output, Process, ProcessConfig};
use crate::protocol::Protocol;
use crate::router::{Handler, HandlerChain, Router};

/// 单次出站调用的选项。
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// 等待应答的上限；`None` 表示无限等待，直到应答或连接拆除。
    pub timeout: Option<Duration>,
    /// 附在请求包上的元数据。
    pub metadata: Metadata,
    /// 写入请求包的保留位。
    pub reserved: u8,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_reserved(mut self, reserved: u8) -> Self {
        self.reserved = reserved;
        self
    }
}

/// 包裹异步回调链的应答过滤器；第一个参数是原始请求包。
///
/// 过滤器必须调用 [`Context::next`] 才会真正执行回调链。
pub type ResponseFilter<C> = Arc<dyn Fn(&Packet, &mut Context<C>) + Send + Sync>;

/// 带超时异步调用的等待任务调度函数。
pub type Spawner = Arc<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>;

fn default_response_filter<C: 'static>() -> ResponseFilter<C> {
    Arc::new(|_request: &Packet, ctx: &mut Context<C>| ctx.next())
}


/// 异步调用在应答到达时需要的全部状态。
struct AsyncReply<C> {
    callbacks: HandlerChain<C>,
    request: Packet,
    filter: ResponseFilter<C>,
}

/// 一个未决调用。
enum RpcSession<C> {
    /// 同步调用，或带超时的异步调用的等待任务。
    Waiting(oneshot::Sender<Packet>),
    /// 无超时的异步调用：应答在读路径上内联执行回调。
    Callback(AsyncReply<C>),
}

struct SessionState<C> {
    sessions: HashMap<u64, RpcSession<C>>,
    closed: bool,
}

/// 连接级会话表；`drain` 之后关闭，拒绝任何新登记。
struct SessionTable<C> {
    state: Mutex<SessionState<C>>,
}

impl<C> SessionTable<C> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                sessions: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// 登记会话；表已关闭时原样交还会话，由调用方回收其中的资源。
    fn register(&self, session_id: u64, session: RpcSession<C>) -> Result<(), RpcSession<C>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(session);
        }
        let previous = state.sessions.insert(session_id, session);
        assert!(
            previous.is_none(),
            "session id {session_id} registered twice; sequence numbers were reused"
        );
        Ok(())
    }

    fn take(&self, session_id: u64) -> Option<RpcSession<C>> {
        self.state.lock().sessions.remove(&session_id)
    }

    fn drain(&self) -> Vec<(u64, RpcSession<C>)> {
        let mut state = self.state.lock();
        state.closed = true;
        state.sessions.drain().collect()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

fn closed_error(route: &Route) -> RpcError {
    RpcError::session_closed(format!("connection closed, {route:?} not sent"))
}

/// 入站应答路径与出站调用路径共享的状态。
struct RpcShared<C> {
    protocol: Arc<Protocol<C>>,
    context_pool: Arc<dyn ContextPool<C>>,
    output: Arc<dyn Output>,
    sessions: SessionTable<C>,
}

impl<C> RpcShared<C>
where
    C: Send + Sync + 'static,
{
    /// 以应答包驱动异步回调链，随后归还原始请求包。
    fn deliver(&self, reply: AsyncReply<C>, packet: Packet) {
        let AsyncReply {
            callbacks,
            request,
            filter,
        } = reply;
        let mut ctx = self.context_pool.get();
        ctx.bind(
            callbacks,
            packet,
            self.output.clone(),
            self.protocol.clone(),
            None,
        );
        drive(self.context_pool.as_ref(), ctx, |ctx| filter(&request, ctx));
        self.protocol.pool().put(request);
    }

    /// 合成一个携带错误的应答包，如同对端回复了该错误。
    fn synthesize(&self, request: &Packet, code: ErrorCode, message: &str) -> Packet {
        let mut packet = self.protocol.new_response(request, Metadata::new());
        self.protocol.marshal_fault(&mut packet, code, message);
        packet
    }
}

/// 装入 `Process` 拦截钩子的应答分拣器。
struct ReplyInterceptor<C> {
    shared: Arc<RpcShared<C>>,
}

impl<C> Interceptor for ReplyInterceptor<C>
where
    C: Send + Sync + 'static,
{
    fn intercept(&self, packet: Packet) -> Interception {
        if packet.cmd() != Cmd::Response {
            return Interception::Pass(packet);
        }
        let session_id = packet.session_id();
        match self.shared.sessions.take(session_id) {
            Some(RpcSession::Callback(reply)) => {
                trace!(session_id, "delivering async reply inline");
                self.shared.deliver(reply, packet);
            }
            Some(RpcSession::Waiting(tx)) => {
                if let Err(packet) = tx.send(packet) {
                    trace!(session_id, "caller gave up before reply arrived");
                    self.shared.protocol.pool().put(packet);
                }
            }
            None => {
                debug!(session_id, uri = packet.uri(), "dropping reply without pending session");
                self.shared.protocol.pool().put(packet);
            }
        }
        Interception::Handled
    }
}

/// 调用结束（含超时、取消）时移除自己的会话。
struct PendingGuard<'a, C> {
    sessions: &'a SessionTable<C>,
    session_id: u64,
}

impl<C> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        self.sessions.take(self.session_id);
    }
}

/// 支持关联调用的连接级分发引擎。
///
/// # 教案式注释
/// - **意图 (Why)**：以组合而非继承扩展 [`Process`]：应答在路由前被拦截并按会话号分拣；
/// - **契约 (What)**：
///   - `call` 登记会话后才写出请求，应答不可能先于登记到达；
///   - 无超时的 `async_call` 不派生任何任务，回调在读路径上内联执行；
///   - `clean` 幂等，第二次调用没有任何效果；
/// - **风险 (Trade-offs)**：回调与处理器同样运行在读路径上，不得执行阻塞 I/O。
pub struct RpcProcess<C> {
    process: Process<C>,
    shared: Arc<RpcShared<C>>,
    response_filter: ResponseFilter<C>,
    /// `None` 表示在调用时所在的 Tokio 运行时上派生。
    spawner: Option<Spawner>,
}

impl<C> RpcProcess<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(config: ProcessConfig<C>, router: Arc<dyn Router<C>>, output: Arc<dyn Output>) -> Self {
        let mut process = Process::new(config, router, output);
        let shared = Arc::new(RpcShared {
            protocol: process.protocol().clone(),
            context_pool: process.context_pool().clone(),
            output: process.output().clone(),
            sessions: SessionTable::new(),
        });
        process.set_interceptor(Arc::new(ReplyInterceptor {
            shared: shared.clone(),
        }));
        Self {
            process,
            shared,
            response_filter: default_response_filter(),
            spawner: None,
        }
    }

    /// 替换异步回调的应答过滤器。
    pub fn with_response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Packet, &mut Context<C>) + Send + Sync + 'static,
    {
        self.response_filter = Arc::new(filter);
        self
    }

    /// 替换带超时异步调用的等待任务调度函数。
    ///
    /// 默认派生到发起调用时所在的 Tokio 运行时；不在运行时中发起调用的宿主需要在此注入自己的调度。
    pub fn with_spawner<F>(mut self, spawner: F) -> Self
    where
        F: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
    {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// 附加连接级数据，入站处理器经 [`Context::peer`] 读取；异步回调的上下文不携带它。
    pub fn with_peer<T>(mut self, peer: T) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        self.process.set_peer(Arc::new(peer));
        self
    }

    pub fn process(&self) -> &Process<C> {
        &self.process
    }

    pub fn protocol(&self) -> &Arc<Protocol<C>> {
        &self.shared.protocol
    }

    /// 当前未决会话数量。
    pub fn pending(&self) -> usize {
        self.shared.sessions.len()
    }

    /// 已执行过 [`RpcProcess::clean`]，不再接受新的调用。
    pub fn is_closed(&self) -> bool {
        self.shared.sessions.is_closed()
    }

    /// 传输层入口，见 [`Process::on_read`]。
    pub fn on_read(&self, data: BytesMut) -> Result<()> {
        self.process.on_read(data)
    }

    fn outbound(&self, cmd: Cmd, route: &Route, options: &CallOptions) -> Packet {
        let mut packet = self
            .shared
            .protocol
            .new_packet(cmd, route, options.metadata.clone());
        packet.set_reserved(options.reserved);
        packet
    }

    /// 同步调用：发送请求并等待对应应答。
    ///
    /// - 超时返回 `Timeout`，此后到达的应答被静默丢弃；
    /// - 连接在应答前被拆除返回 `SessionClosed`，拆除之后发起的调用不写出请求，立即返回同一错误；
    /// - 对端回复错误时返回对端的错误。
    pub async fn call<Req, Resp>(
        &self,
        route: impl Into<Route>,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp>
    where
        C: MessageCodec<Req> + MessageCodec<Resp>,
    {
        let route = route.into();
        let protocol = &self.shared.protocol;
        let mut packet = self.outbound(Cmd::Request, &route, &options);
        if let Err(err) = protocol.marshal_value(&mut packet, request) {
            protocol.pool().put(packet);
            return Err(err);
        }

        let session_id = packet.session_id();
        let (tx, mut rx) = oneshot::channel();
        if self
            .shared
            .sessions
            .register(session_id, RpcSession::Waiting(tx))
            .is_err()
        {
            protocol.pool().put(packet);
            return Err(closed_error(&route));
        }
        let _guard = PendingGuard {
            sessions: &self.shared.sessions,
            session_id,
        };
        let sent = protocol.send(self.shared.output.as_ref(), &mut packet);
        protocol.pool().put(packet);
        sent?;

        let received = match options.timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    if self.shared.sessions.take(session_id).is_some() {
                        debug!(session_id, route = ?route, "call timed out");
                        return Err(RpcError::timeout(format!(
                            "call {route:?} timed out after {limit:?}"
                        )));
                    }
                    // 应答与超时竞争时已被分拣器取走，必定已在通道中或通道已关闭。
                    rx.await
                }
            },
        };

        let reply = received.map_err(|_| {
            RpcError::session_closed(format!("connection closed before reply to {route:?}"))
        })?;
        let result = protocol.payload_unmarshal(&reply);
        protocol.pool().put(reply);
        result
    }

    /// 异步调用：应答（或合成的超时/关闭错误）到达时执行回调链。
    ///
    /// 返回 `Ok` 表示回调链恰好执行一次（通常因为请求已写出）；返回 `Err` 时回调链不会执行。
    ///
    /// 带超时且未通过 [`RpcProcess::with_spawner`] 指定调度函数时，必须在 Tokio 运行时中调用，
    /// 否则在登记与写出之前返回 `UnexpectedCode`。
    pub fn async_call<Req>(
        &self,
        route: impl Into<Route>,
        request: &Req,
        callbacks: impl IntoIterator<Item = Handler<C>>,
        options: CallOptions,
    ) -> Result<()>
    where
        C: MessageCodec<Req>,
    {
        let route = route.into();
        let spawner = match (options.timeout, &self.spawner) {
            (None, _) => None,
            (Some(_), Some(spawner)) => Some(spawner.clone()),
            (Some(_), None) => Some(current_runtime_spawner()?),
        };
        let protocol = &self.shared.protocol;
        let mut packet = self.outbound(Cmd::Request, &route, &options);
        let frame = protocol
            .marshal_value(&mut packet, request)
            .and_then(|()| protocol.marshal_frame(&mut packet).map(|_| ()))
            .map(|()| packet.take_buffer());
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                protocol.pool().put(packet);
                return Err(err);
            }
        };

        let session_id = packet.session_id();
        let reply = AsyncReply {
            callbacks: callbacks.into_iter().collect(),
            request: packet,
            filter: self.response_filter.clone(),
        };
        let (session, deadline) = match (options.timeout, spawner) {
            (Some(limit), Some(spawner)) => {
                let (tx, rx) = oneshot::channel();
                (RpcSession::Waiting(tx), Some((rx, reply, limit, spawner)))
            }
            _ => (RpcSession::Callback(reply), None),
        };
        if let Err(session) = self.shared.sessions.register(session_id, session) {
            let request = match (session, deadline) {
                (RpcSession::Callback(reply), _) => Some(reply.request),
                (RpcSession::Waiting(_), deadline) => deadline.map(|(_, reply, _, _)| reply.request),
            };
            if let Some(request) = request {
                protocol.pool().put(request);
            }
            return Err(closed_error(&route));
        }

        if let Err(err) = self.shared.output.write(&frame) {
            warn!(session_id, route = ?route, error = %err, "failed to write async request");
            let orphan = match self.shared.sessions.take(session_id) {
                Some(RpcSession::Callback(reply)) => Some(reply),
                Some(RpcSession::Waiting(_)) => deadline.map(|(_, reply, _, _)| reply),
                None => match deadline {
                    // `clean` 只丢弃了等待端，回调链仍在此处，可以安全放弃。
                    Some((_, reply, _, _)) => Some(reply),
                    None => {
                        debug!(session_id, "connection closed while writing; callbacks already ran");
                        return Ok(());
                    }
                },
            };
            if let Some(reply) = orphan {
                protocol.pool().put(reply.request);
            }
            return Err(err);
        }
        if let Some((rx, reply, limit, spawner)) = deadline {
            spawner(await_deadline(self.shared.clone(), session_id, rx, reply, limit).boxed());
        }
        Ok(())
    }

    /// 单向通知，不登记会话。
    pub fn notify<Req>(&self, route: impl Into<Route>, request: &Req, options: CallOptions) -> Result<()>
    where
        C: MessageCodec<Req>,
    {
        let route = route.into();
        let protocol = &self.shared.protocol;
        let mut packet = self.outbound(Cmd::Notify, &route, &options);
        let result = protocol
            .marshal_value(&mut packet, request)
            .and_then(|()| protocol.send(self.shared.output.as_ref(), &mut packet));
        protocol.pool().put(packet);
        result
    }

    /// 连接拆除时终结全部未决会话。
    ///
    /// 会话表随即关闭，之后的 `call` / `async_call` 立即以 `SessionClosed` 失败。
    /// 同步调用收到 `SessionClosed`，属于超时类错误（见 [`RpcError::is_timeout_class`]）；
    /// 无超时的异步调用在此处以合成的 `SessionClosed` 应答执行回调；
    /// 带超时的异步调用由其等待任务完成同样的投递。
    pub fn clean(&self) {
        let drained = self.shared.sessions.drain();
        if drained.is_empty() {
            return;
        }
        debug!(pending = drained.len(), "terminating pending sessions");
        for (session_id, session) in drained {
            match session {
                RpcSession::Waiting(tx) => drop(tx),
                RpcSession::Callback(reply) => {
                    trace!(session_id, "closing async session");
                    let packet = self.shared.synthesize(
                        &reply.request,
                        ErrorCode::SessionClosed,
                        "connection closed before reply",
                    );
                    self.shared.deliver(reply, packet);
                }
            }
        }
    }
}

impl<C> fmt::Debug for RpcProcess<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcProcess")
            .field("pending", &self.shared.sessions.len())
            .finish_non_exhaustive()
    }
}

/// 默认调度：派生到调用方所在的 Tokio 运行时；不在运行时中时报告装配错误。
fn current_runtime_spawner() -> Result<Spawner> {
    let handle = tokio::runtime::Handle::try_current().map_err(|err| {
        RpcError::new(
            ErrorCode::UnexpectedCode,
            "async_call with a timeout needs a tokio runtime or a custom spawner",
        )
        .with_cause(err)
    })?;
    Ok(Arc::new(move |future: BoxFuture<'static, ()>| {
        handle.spawn(future);
    }))
}

/// 带超时异步调用的等待任务：截止时间与应答赛跑，结果一律经回调链投递。
async fn await_deadline<C>(
    shared: Arc<RpcShared<C>>,
    session_id: u64,
    mut rx: oneshot::Receiver<Packet>,
    reply: AsyncReply<C>,
    limit: Duration,
) where
    C: Send + Sync + 'static,
{
    let received = match tokio::time::timeout(limit, &mut rx).await {
        Ok(received) => received.ok(),
        Err(_elapsed) => {
            if shared.sessions.take(session_id).is_some() {
                debug!(session_id, "async call timed out");
                let packet = shared.synthesize(
                    &reply.request,
                    ErrorCode::Timeout,
                    &format!("async call timed out after {limit:?}"),
                );
                shared.deliver(reply, packet);
                return;
            }
            rx.await.ok()
        }
    };
    let packet = match received {
        Some(packet) => packet,
        None => shared.synthesize(
            &reply.request,
            ErrorCode::SessionClosed,
            "connection closed before reply",
        ),
    };
    shared.deliver(reply, packet);
}
