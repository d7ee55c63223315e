use std::net::SocketAddr;
use std::sync::Arc;

use spark_rpc::{ProcessConfig, Router};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::connection::TcpConnection;
use crate::error::TransportError;

/// 对 Tokio `TcpListener` 的薄封装，把每个入站连接接入协议引擎。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端只需提供路由表与处理配置，无需接触读写任务与成帧细节。
///
/// ## 契约 (What)
/// - `accept` 成功返回的 [`TcpConnection`] 已启动读写任务；
/// - 每个连接拥有独立的 [`spark_rpc::RpcProcess`]，路由表在连接之间共享、只读；
/// - 处理配置按连接克隆，包池与上下文池等共享组件随之共享。
///
/// ## 注意事项 (Trade-offs)
/// - 未设置 `SO_REUSEPORT` 等套接字选项。
#[derive(Debug)]
pub struct TcpServer {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind<A>(addr: A) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs,
    {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        info!(%local_addr, "rpc listener bound");
        Ok(Self { inner, local_addr })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受一个入站连接并接入协议引擎。
    pub async fn accept<C>(
        &self,
        router: Arc<dyn Router<C>>,
        config: ProcessConfig<C>,
    ) -> Result<TcpConnection<C>, TransportError>
    where
        C: Send + Sync + 'static,
    {
        let (stream, remote) = self.inner.accept().await?;
        debug!(%remote, "accepted tcp connection");
        TcpConnection::spawn(stream, router, config)
    }

    /// 持续接受连接直到监听器出错；已接入的连接在后台服务到对端断开。
    ///
    /// 单个连接初始化失败只记录日志，不影响后续接受。
    pub async fn serve<C>(
        &self,
        router: Arc<dyn Router<C>>,
        config: ProcessConfig<C>,
    ) -> Result<(), TransportError>
    where
        C: Clone + Send + Sync + 'static,
    {
        loop {
            let (stream, remote) = self.inner.accept().await?;
            if let Err(err) = TcpConnection::spawn(stream, router.clone(), config.clone()) {
                warn!(%remote, error = %err, "failed to set up tcp connection");
            }
        }
    }
}
