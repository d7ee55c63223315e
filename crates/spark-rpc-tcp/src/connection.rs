use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use spark_rpc::{Output, ProcessConfig, Result as RpcResult, Router, RpcError, RpcProcess};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::frame::read_frame;

/// 把出站帧投递给写任务的 [`Output`] 实现。
///
/// 写入只做一次拷贝与入队，不会阻塞调用方；写任务退出后返回 `SessionClosed`。
struct ChannelOutput {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Output for ChannelOutput {
    fn write(&self, frame: &[u8]) -> RpcResult<()> {
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| RpcError::session_closed("tcp writer has stopped"))
    }
}

/// 一条已接入协议引擎的 TCP 连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为 [`RpcProcess`] 提供它唯一需要的两样东西：逐帧串行的入站投递与一个出站 [`Output`]；
/// - 连接拆除时调用 [`RpcProcess::clean`]，让所有未决调用以 `SessionClosed` 解除阻塞。
///
/// ## 逻辑 (How)
/// - `into_split` 拆出读写半部：读任务循环调用 [`read_frame`] 并同步执行 `on_read`，
///   写任务从无界通道取帧后 `write_all`；
/// - 两个任务共享一个 `watch` 关闭信号，[`TcpConnection::close`] 或读任务退出时置位，写任务随之半关闭套接字；
/// - 对端地址以 [`SocketAddr`] 形式附加到连接上，处理器经 `ctx.peer::<SocketAddr>()` 读取。
///
/// ## 契约 (What)
/// - 读任务退出（EOF、读错误、帧违规或主动关闭）后恰好调用一次 `clean`，
///   此后在该连接上发起的调用不再写出，立即以 `SessionClosed` 失败；
/// - 丢弃本句柄不会关闭连接，两个任务会一直服务到对端断开；需要主动断开时调用 `close`。
///
/// ## 注意事项 (Trade-offs)
/// - 出站通道无界，慢速对端会让待写帧在内存中堆积；
/// - 处理器运行在读任务上，阻塞处理器会停住整条连接的入站方向。
pub struct TcpConnection<C> {
    rpc: Arc<RpcProcess<C>>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl<C> TcpConnection<C>
where
    C: Send + Sync + 'static,
{
    /// 建立到 `addr` 的连接并启动读写任务。
    pub async fn connect<A>(
        addr: A,
        router: Arc<dyn Router<C>>,
        config: ProcessConfig<C>,
    ) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(stream, router, config)
    }

    /// 接管一条已建立的流；必须在 Tokio 运行时中调用。
    pub fn spawn(
        stream: TcpStream,
        router: Arc<dyn Router<C>>,
        config: ProcessConfig<C>,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let max_packet_size = config.max_packet_size();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(watch::channel(false).0);

        let rpc = Arc::new(
            RpcProcess::new(config, router, Arc::new(ChannelOutput { tx })).with_peer(peer_addr),
        );
        let reader = tokio::spawn(read_loop(
            rpc.clone(),
            read_half,
            max_packet_size,
            peer_addr,
            shutdown.clone(),
            shutdown.subscribe(),
        ));
        let writer = tokio::spawn(write_loop(write_half, rx, peer_addr, shutdown.subscribe()));
        debug!(%peer_addr, %local_addr, "tcp connection established");

        Ok(Self {
            rpc,
            peer_addr,
            local_addr,
            shutdown,
            reader,
            writer,
        })
    }

    /// 协议引擎句柄，用于发起 `call` / `async_call` / `notify`。
    pub fn rpc(&self) -> &Arc<RpcProcess<C>> {
        &self.rpc
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 读任务已经退出，连接上的未决会话都已终结。
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// 主动断开连接并等待两个任务退出。
    pub async fn close(self) {
        self.shutdown.send_replace(true);
        for task in [self.reader, self.writer] {
            if let Err(err) = task.await {
                warn!(peer_addr = %self.peer_addr, error = %err, "tcp connection task failed");
            }
        }
    }
}

async fn read_loop<C>(
    rpc: Arc<RpcProcess<C>>,
    mut read_half: OwnedReadHalf,
    max_packet_size: usize,
    peer_addr: SocketAddr,
    closing: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) where
    C: Send + Sync + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                debug!(%peer_addr, "tcp connection closed locally");
                break;
            }
            frame = read_frame(&mut read_half, max_packet_size) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                trace!(%peer_addr, len = frame.len(), "inbound frame");
                if let Err(err) = rpc.on_read(frame) {
                    debug!(%peer_addr, error = %err, "inbound frame rejected");
                }
            }
            Ok(None) => {
                debug!(%peer_addr, "tcp connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(%peer_addr, error = %err, "tcp read failed, dropping connection");
                break;
            }
        }
    }
    // 先让写任务停止收帧，再终结会话；此后的新调用由关闭的会话表直接拒绝。
    closing.send_replace(true);
    rpc.clean();
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    peer_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_half.write_all(&frame).await {
            warn!(%peer_addr, error = %err, "tcp write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
