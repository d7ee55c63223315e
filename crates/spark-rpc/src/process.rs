//! 分发引擎：把传输层交来的字节转换为路由后的处理链调用。
//!
//! # 入站状态机（How）
//! `on_read(bytes)` 依次经过：
//! 1. 数据过滤链（可中止）；
//! 2. 包编码器逆变换 + 线上解码进池化包；
//! 3. 单一拦截钩子（[`RpcProcess`](crate::rpc::RpcProcess) 借此截获应答）；
//! 4. 包过滤链（可中止）；
//! 5. 路由查找；
//! 6. 负载限制判定；
//! 7. 从上下文池取上下文并执行处理链。
//!
//! 任何一步提前结束都会把包归还池中，且包只经由一条路径归还：
//! 要么在上下文释放时，要么在提前失败时。

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::codec::JsonCodec;
use crate::context::{Context, ContextPool, FreeListContextPool, drive};
use crate::encoder::{IdentityEncoder, PacketEncoder};
use crate::error::Result;
use crate::packet::{FreeListPacketPool, Packet, PacketPool};
use crate::protocol::Protocol;
use crate::router::Router;
use crate::wire::{DEFAULT_MAX_PACKET_SIZE, WireLayout};

/// 连接的出站字节汇。实现需自行保证并发写入时帧不交错。
pub trait Output: Send + Sync + 'static {
    /// 写出一帧完整数据（含长度前缀）。
    fn write(&self, frame: &[u8]) -> Result<()>;
}

impl<F> Output for F
where
    F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
{
    fn write(&self, frame: &[u8]) -> Result<()> {
        self(frame)
    }
}

/// 过滤器的裁决。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterAction {
    /// 继续后续阶段。
    Continue,
    /// 在此丢弃，不视为错误。
    Stop,
}

/// 解码前作用于原始帧的过滤器，可用于分帧埋点。
pub trait DataFilter: Send + Sync + 'static {
    fn on_data(&self, data: &mut BytesMut) -> Result<FilterAction>;
}

impl<F> DataFilter for F
where
    F: Fn(&mut BytesMut) -> Result<FilterAction> + Send + Sync + 'static,
{
    fn on_data(&self, data: &mut BytesMut) -> Result<FilterAction> {
        self(data)
    }
}

/// 解码后、路由前作用于包的过滤器。
pub trait PacketFilter: Send + Sync + 'static {
    fn on_packet(&self, packet: &mut Packet) -> Result<FilterAction>;
}

impl<F> PacketFilter for F
where
    F: Fn(&mut Packet) -> Result<FilterAction> + Send + Sync + 'static,
{
    fn on_packet(&self, packet: &mut Packet) -> Result<FilterAction> {
        self(packet)
    }
}

/// 拦截结果：拦截器要么接管包，要么原样交还。
pub enum Interception {
    /// 包已被接管，分发到此结束。
    Handled,
    /// 继续常规路由。
    Pass(Packet),
}

/// 路由前的单一拦截钩子；接管包时也接管它的归还责任。
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, packet: Packet) -> Interception;
}

/// 负载限制谓词：参数为计入当前包后的在途数量，返回 `true` 表示丢弃。
pub type LoadLimit = Arc<dyn Fn(i64) -> bool + Send + Sync>;

/// 分发引擎的装配参数。
///
/// # 契约说明（What）
/// - 以 `ProcessConfig::new(codec)` 起步，所有可插拔部件都有默认值；
/// - 配置可克隆，同一份配置可装配多条连接，包池与上下文池随之共享。
#[derive(Clone)]
pub struct ProcessConfig<C> {
    codec: C,
    layout: WireLayout,
    max_packet_size: usize,
    encoder: Arc<dyn PacketEncoder>,
    data_filters: Vec<Arc<dyn DataFilter>>,
    packet_filters: Vec<Arc<dyn PacketFilter>>,
    load_limit: Option<LoadLimit>,
    packet_pool: Arc<dyn PacketPool>,
    context_pool: Option<Arc<dyn ContextPool<C>>>,
}

impl<C> ProcessConfig<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            layout: WireLayout::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            encoder: Arc::new(IdentityEncoder),
            data_filters: Vec::new(),
            packet_filters: Vec::new(),
            load_limit: None,
            packet_pool: Arc::new(FreeListPacketPool::new()),
            context_pool: None,
        }
    }

    pub fn with_layout(mut self, layout: WireLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn PacketEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// 追加数据过滤器，按追加顺序执行。
    pub fn with_data_filter(mut self, filter: impl DataFilter) -> Self {
        self.data_filters.push(Arc::new(filter));
        self
    }

    /// 追加包过滤器，按追加顺序执行。
    pub fn with_packet_filter(mut self, filter: impl PacketFilter) -> Self {
        self.packet_filters.push(Arc::new(filter));
        self
    }

    pub fn with_load_limit<F>(mut self, limit: F) -> Self
    where
        F: Fn(i64) -> bool + Send + Sync + 'static,
    {
        self.load_limit = Some(Arc::new(limit));
        self
    }

    pub fn with_packet_pool(mut self, pool: Arc<dyn PacketPool>) -> Self {
        self.packet_pool = pool;
        self
    }

    pub fn with_context_pool(mut self, pool: Arc<dyn ContextPool<C>>) -> Self {
        self.context_pool = Some(pool);
        self
    }

    pub fn layout(&self) -> WireLayout {
        self.layout
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn packet_pool(&self) -> &Arc<dyn PacketPool> {
        &self.packet_pool
    }
}

/// JSON 编解码 + URI 布局的默认配置。
pub fn default_config() -> ProcessConfig<JsonCodec> {
    ProcessConfig::new(JsonCodec)
}

/// 单条连接的入站分发引擎。
///
/// # 模块角色（Why）
/// - 对传输层只暴露 `on_read` 与 [`Output`] 两个接缝，传输实现无需了解包格式与路由；
/// - 包与上下文的生命周期全部在此收口。
///
/// # 契约说明（What）
/// - 同一连接上同一时刻只有一个 `on_read` 在执行，由传输层串行化；
/// - 解码、过滤或路由失败只影响当前包：包被归还，错误返回给传输层，连接不受影响；
/// - 负载限制丢弃不是错误，返回 `Ok(())`。
pub struct Process<C> {
    protocol: Arc<Protocol<C>>,
    router: Arc<dyn Router<C>>,
    output: Arc<dyn Output>,
    context_pool: Arc<dyn ContextPool<C>>,
    data_filters: Vec<Arc<dyn DataFilter>>,
    packet_filters: Vec<Arc<dyn PacketFilter>>,
    interceptor: Option<Arc<dyn Interceptor>>,
    load_limit: Option<LoadLimit>,
    load: Arc<AtomicI64>,
    peer: Option<Arc<dyn Any + Send + Sync>>,
}

impl<C> Process<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(config: ProcessConfig<C>, router: Arc<dyn Router<C>>, output: Arc<dyn Output>) -> Self {
        let ProcessConfig {
            codec,
            layout,
            max_packet_size,
            encoder,
            data_filters,
            packet_filters,
            load_limit,
            packet_pool,
            context_pool,
        } = config;
        let protocol = Protocol::new(codec, layout.codec(max_packet_size), encoder, packet_pool);
        let context_pool: Arc<dyn ContextPool<C>> = match context_pool {
            Some(pool) => pool,
            None => Arc::new(FreeListContextPool::<C>::new()),
        };
        Self {
            protocol: Arc::new(protocol),
            router,
            output,
            context_pool,
            data_filters,
            packet_filters,
            interceptor: None,
            load_limit,
            load: Arc::new(AtomicI64::new(0)),
            peer: None,
        }
    }

    /// 安装拦截钩子，覆盖已有的钩子。
    pub fn set_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptor = Some(interceptor);
    }

    /// 附加连接级数据，处理器经 [`Context::peer`] 读取。
    pub fn set_peer(&mut self, peer: Arc<dyn Any + Send + Sync>) {
        self.peer = Some(peer);
    }

    pub fn protocol(&self) -> &Arc<Protocol<C>> {
        &self.protocol
    }

    pub fn output(&self) -> &Arc<dyn Output> {
        &self.output
    }

    pub fn context_pool(&self) -> &Arc<dyn ContextPool<C>> {
        &self.context_pool
    }

    /// 受负载限制计数的在途包数量。
    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Acquire)
    }

    /// 处理一帧完整的入站数据（含长度前缀）。
    pub fn on_read(&self, mut data: BytesMut) -> Result<()> {
        for filter in &self.data_filters {
            if filter.on_data(&mut data)? == FilterAction::Stop {
                trace!(len = data.len(), "data filter stopped frame");
                return Ok(());
            }
        }

        let pool = self.protocol.pool();
        let mut packet = pool.get();
        if let Err(err) = self.protocol.unmarshal_frame(data, &mut packet) {
            pool.put(packet);
            warn!(code = %err.code(), error = %err, "dropping undecodable frame");
            return Err(err);
        }

        let mut packet = match &self.interceptor {
            Some(interceptor) => match interceptor.intercept(packet) {
                Interception::Handled => return Ok(()),
                Interception::Pass(packet) => packet,
            },
            None => packet,
        };

        for filter in &self.packet_filters {
            match filter.on_packet(&mut packet) {
                Ok(FilterAction::Continue) => {}
                Ok(FilterAction::Stop) => {
                    debug!(session_id = packet.session_id(), uri = packet.uri(), "packet filter stopped packet");
                    pool.put(packet);
                    return Ok(());
                }
                Err(err) => {
                    pool.put(packet);
                    return Err(err);
                }
            }
        }

        let chain = match self.router.get_handlers(&packet) {
            Ok(chain) => chain,
            Err(err) => {
                warn!(
                    code = %err.code(),
                    session_id = packet.session_id(),
                    uri = packet.uri(),
                    msg_id = packet.msg_id(),
                    "no route for inbound packet"
                );
                pool.put(packet);
                return Err(err);
            }
        };

        let load = match &self.load_limit {
            Some(limit) => {
                let current = self.load.fetch_add(1, Ordering::AcqRel) + 1;
                if limit(current) {
                    self.load.fetch_sub(1, Ordering::AcqRel);
                    debug!(load = current, session_id = packet.session_id(), "load limit dropped packet");
                    pool.put(packet);
                    return Ok(());
                }
                Some(self.load.clone())
            }
            None => None,
        };

        let mut ctx = self.context_pool.get();
        ctx.bind(chain, packet, self.output.clone(), self.protocol.clone(), load);
        ctx.set_peer(self.peer.clone());
        drive(self.context_pool.as_ref(), ctx, Context::next);
        Ok(())
    }
}
