#![doc = r#"
# spark-rpc

## 设计动机（Why）
- **定位**：与传输无关的 RPC 多路复用协议引擎。传输层只负责收发有序字节流，
  本 crate 负责成帧、编码、路由，以及在单条连接上关联大量并发在途的请求与应答。
- **架构角色**：TCP、WebSocket 等传输实现通过 [`Process::on_read`] 投递入站帧，
  并提供一个 [`Output`] 写出出站帧；除此之外核心不回调任何连接管理接口。

## 核心契约（What）
- 线上格式：4 字节大端总长前缀 + 两种可互换的固定头布局之一（见 [`wire`]）；
- 每个入站包恰好交给一条已注册的处理链一次，每个包恰好归还池中一次；
- 每个请求的应答被交还给正在等待它的调用方；没有应答时调用方以明确的错误解除阻塞。

## 实现策略（How）
- [`Process`]：数据过滤 → 编码器逆变换 → 解包 → 拦截钩子 → 包过滤 → 路由 → 负载限制 → 处理链；
- [`RpcProcess`]：在 `Process` 的拦截钩子上按会话号分拣应答，实现 `call` / `async_call` / `notify`；
- 包与上下文均经由可替换的对象池取得与归还。

## 风险与考量（Trade-offs）
- 处理器与异步回调运行在连接的读路径上，不得执行阻塞 I/O，需要出站请求时应改用 `call`/`async_call`；
- 路由表在流量开始前注册完成，之后只读。
"#]

pub mod codec;
pub mod context;
pub mod encoder;
pub mod error;
pub mod metadata;
pub mod packet;
pub mod process;
pub mod protocol;
pub mod router;
pub mod rpc;
pub mod settings;
pub mod wire;

pub use codec::{JsonCodec, MessageCodec};
#[cfg(feature = "protobuf")]
pub use codec::ProtobufCodec;
pub use context::{Context, ContextPool, FreeListContextPool};
pub use encoder::{IdentityEncoder, PacketEncoder, XorEncoder};
pub use error::{ErrorCode, Result, RpcError};
pub use metadata::Metadata;
pub use packet::{Cmd, FLAG_ERROR, FreeListPacketPool, Packet, PacketPool, PoolStats, Route};
pub use process::{
    DataFilter, FilterAction, Interception, Interceptor, LoadLimit, Output, PacketFilter, Process,
    ProcessConfig, default_config,
};
pub use protocol::{Payload, Protocol};
pub use router::{DefaultRouter, Handler, HandlerChain, Router, handler};
pub use rpc::{CallOptions, ResponseFilter, RpcProcess, Spawner};
pub use settings::RpcSettings;
pub use wire::{IdPacketCodec, PacketCodec, UriPacketCodec, WireLayout};
