#![doc = r#"
# spark-rpc-tcp

## 设计动机（Why）
- **定位**：`spark-rpc` 协议引擎在 Tokio TCP 上的参考传输实现，同时是端到端测试的试验台；
- **架构角色**：只负责流式成帧、逐连接串行投递入站帧、提供出站 `Output`，以及在连接拆除时
  调用 `clean`；不承载任何协议语义。

## 核心契约（What）
- 帧边界严格遵循 4 字节大端总长前缀，超过 `max_packet_size` 的帧直接断开连接；
- 同一连接上同一时刻至多一个 `on_read` 在执行；
- 读任务退出后，连接上的全部未决调用都以 `SessionClosed` 解除阻塞，之后发起的调用同样立即失败。

## 实现策略（How）
- [`TcpConnection`]：读写半部各一个任务，出站帧经无界通道交给写任务；
- [`TcpServer`]：绑定、接受并为每个入站连接创建独立的协议引擎；
- [`read_frame`]：按长度前缀切帧并在分配缓冲前校验上限。

## 风险与考量（Trade-offs）
- 出站方向没有背压，写得比对端读得快时帧会在内存中堆积；
- 未提供重连与保活，由上层按需组合。
"#]

mod connection;
mod error;
mod frame;
mod listener;

pub use connection::TcpConnection;
pub use error::TransportError;
pub use frame::read_frame;
pub use listener::TcpServer;
