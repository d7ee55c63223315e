//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 把套接字失败、帧边界违规与协议引擎错误归入同一个枚举，调用方只需匹配一处；
//! - 协议引擎的 [`RpcError`] 原样保留，不在传输层重新分类。

use spark_rpc::RpcError;
use thiserror::Error;

/// TCP 适配层的错误域。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 绑定、建连或读写套接字失败。
    #[error("tcp i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// 长度前缀声明的帧超过配置上限，连接随即关闭。
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// 长度前缀小于前缀自身，字节流已经失去同步。
    #[error("frame length {len} is shorter than its own length prefix")]
    FrameTooShort { len: usize },

    /// 协议引擎返回的错误。
    #[error(transparent)]
    Rpc(#[from] RpcError),
}
