//! 执行上下文：单个入站包在处理链上的全部运行期状态，以及上下文对象池。

use std::any::Any;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use spin::Mutex;
use tracing::Span;

use crate::codec::MessageCodec;
use crate::error::{ErrorCode, Result, RpcError};
use crate::metadata::Metadata;
use crate::packet::{Cmd, Packet};
use crate::process::Output;
use crate::protocol::{Payload, Protocol};
use crate::router::HandlerChain;

/// `abort` 把游标推到这里：远超任何处理链长度，且继续自增不会溢出。
const ABORT_INDEX: usize = usize::MAX / 2;

/// 单个入站包的执行记录。
///
/// # 模块角色（Why）
/// - 在处理链各环节之间传递包、输出端与协议包装，使中间件与终端处理器共享同一份状态；
/// - 把“包何时归还”的决定集中到一处，处理器无需关心池化细节。
///
/// # 核心机制（How）
/// - `index` 为单调游标，[`Context::next`] 以 gin 风格循环执行剩余环节；中间件在自身内部调用
///   `next` 即可在后续环节返回后做收尾；
/// - `depth` 记录 `next` 的嵌套层数，最外层 `next` 返回时释放包并回退负载计数，
///   无论处理器调用 `next` 多少次，释放只发生一次。
///
/// # 契约说明（What）
/// - 上下文只在一次 [`drive`] 期间有效，不得跨包保留；
/// - 释放后包字段被池清空，处理器在链返回后不应再读取。
pub struct Context<C> {
    chain: Option<HandlerChain<C>>,
    index: usize,
    depth: usize,
    packet: Packet,
    output: Option<Arc<dyn Output>>,
    protocol: Option<Arc<Protocol<C>>>,
    load: Option<Arc<AtomicI64>>,
    peer: Option<Arc<dyn Any + Send + Sync>>,
    span: Span,
    released: bool,
}

impl<C> Context<C> {
    /// 创建未绑定的空上下文，通常只由上下文池调用。
    pub fn new() -> Self {
        Self {
            chain: None,
            index: 0,
            depth: 0,
            packet: Packet::new(),
            output: None,
            protocol: None,
            load: None,
            peer: None,
            span: Span::none(),
            released: true,
        }
    }

    /// 依次执行游标之后的处理器。
    pub fn next(&mut self) {
        self.depth += 1;
        while let Some(handler) = self
            .chain
            .as_ref()
            .and_then(|chain| chain.get(self.index))
            .cloned()
        {
            self.index += 1;
            handler(self);
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.release();
        }
    }

    /// 跳过剩余处理器；释放仍由外层 `next` 完成。
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }

    /// 当前入站包。
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// 传输层附加的连接级数据，类型不符时返回 `None`。
    pub fn peer<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.peer.clone()?.downcast::<T>().ok()
    }

    pub fn set_peer(&mut self, peer: Option<Arc<dyn Any + Send + Sync>>) {
        self.peer = peer;
    }

    pub fn protocol(&self) -> Option<&Arc<Protocol<C>>> {
        self.protocol.as_ref()
    }

    pub fn output(&self) -> Option<&Arc<dyn Output>> {
        self.output.as_ref()
    }

    /// 解码入站负载；错误标志置位时返回对端传来的错误。
    pub fn unmarshal<T>(&self) -> Result<T>
    where
        C: MessageCodec<T>,
    {
        self.bound_protocol()?.payload_unmarshal(&self.packet)
    }

    /// 对请求写回应答，仅在请求上下文中有效。
    pub fn respond<T>(&self, payload: Payload<T>, metadata: Metadata) -> Result<()>
    where
        C: MessageCodec<T>,
    {
        if self.packet.cmd() != Cmd::Request {
            return Err(RpcError::new(
                ErrorCode::NotSupported,
                format!("cannot respond to a {:?} packet", self.packet.cmd()),
            ));
        }
        let protocol = self.bound_protocol()?;
        let output = self.output.as_ref().ok_or_else(|| unbound("output"))?;

        let mut response = protocol.new_response(&self.packet, metadata);
        let result = protocol
            .payload_marshal(&mut response, &payload)
            .and_then(|()| protocol.send(output.as_ref(), &mut response));
        protocol.pool().put(response);
        result
    }

    fn bound_protocol(&self) -> Result<&Arc<Protocol<C>>> {
        self.protocol.as_ref().ok_or_else(|| unbound("protocol"))
    }

    pub(crate) fn bind(
        &mut self,
        chain: HandlerChain<C>,
        packet: Packet,
        output: Arc<dyn Output>,
        protocol: Arc<Protocol<C>>,
        load: Option<Arc<AtomicI64>>,
    ) {
        self.span = tracing::trace_span!(
            "rpc.context",
            cmd = ?packet.cmd(),
            session_id = packet.session_id(),
            uri = packet.uri(),
            msg_id = packet.msg_id(),
        );
        self.chain = Some(chain);
        self.index = 0;
        self.depth = 0;
        self.packet = packet;
        self.output = Some(output);
        self.protocol = Some(protocol);
        self.load = load;
        self.released = false;
    }

    /// 归还包并回退负载计数；重复调用无副作用。
    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let packet = mem::take(&mut self.packet);
        if let Some(protocol) = &self.protocol {
            protocol.pool().put(packet);
        }
        if let Some(load) = self.load.take() {
            load.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// 解除全部绑定，供上下文池复用。
    pub(crate) fn reset(&mut self) {
        self.release();
        self.chain = None;
        self.index = 0;
        self.depth = 0;
        self.output = None;
        self.protocol = None;
        self.peer = None;
        self.span = Span::none();
    }
}

impl<C> Default for Context<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn unbound(what: &str) -> RpcError {
    RpcError::new(
        ErrorCode::UnexpectedCode,
        format!("context has no {what} bound"),
    )
}

/// 上下文对象池契约；传输层可借此注入携带自身连接数据的实现。
pub trait ContextPool<C>: Send + Sync + 'static {
    /// 取出一个未绑定的上下文。
    fn get(&self) -> Context<C>;

    /// 归还上下文，实现需调用方已完成释放。
    fn put(&self, ctx: Context<C>);
}

/// 基于自由链表的默认上下文池。
pub struct FreeListContextPool<C> {
    free: Mutex<Vec<Context<C>>>,
    capacity: usize,
}

impl<C> FreeListContextPool<C> {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// 当前空闲的上下文数量。
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl<C> Default for FreeListContextPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ContextPool<C> for FreeListContextPool<C>
where
    C: Send + Sync + 'static,
{
    fn get(&self) -> Context<C> {
        self.free.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut ctx: Context<C>) {
        ctx.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }
}

/// 在上下文的 span 内执行 `entry`，随后保证释放并归还上下文。
///
/// `entry` 通常是 [`Context::next`]；应答过滤器若从不调用 `next`，包也会在这里被归还。
pub(crate) fn drive<C: 'static, F>(pool: &dyn ContextPool<C>, mut ctx: Context<C>, entry: F)
where
    F: FnOnce(&mut Context<C>),
{
    let span = ctx.span.clone();
    {
        let _entered = span.enter();
        entry(&mut ctx);
    }
    ctx.release();
    pool.put(ctx);
}
