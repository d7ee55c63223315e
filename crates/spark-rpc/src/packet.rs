//! 包：线上通信的基本单元，以及它的对象池。
//!
//! # 生命周期（What）
//! - 解码或编码前从 [`PacketPool`] 取出；
//! - 由线上编解码器或 [`Protocol`](crate::protocol::Protocol) 的构造方法填充；
//! - 被处理链或 `call` 恰好消费一次后归还池中。
//!
//! 归还时池会调用 [`Packet::reset`] 清空全部字段，仅保留内部暂存缓冲与字符串容量，
//! 因此包在归还后不得再被引用。所有权模型保证同一个包不会被归还两次。

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use spin::Mutex;

use crate::error::{ErrorCode, Result, RpcError};
use crate::metadata::Metadata;

/// 错误标志位：负载是错误编码，而非正常业务负载。
pub const FLAG_ERROR: u8 = 0x01;

/// 包命令字，决定关联方式与是否期望应答。
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Cmd {
    /// 单向通知，不期望应答，不登记会话。
    #[default]
    Notify = 0,
    /// 请求，期望一个携带相同会话号的应答。
    Request = 1,
    /// 应答。
    Response = 2,
}

impl Cmd {
    /// 由线上字节还原命令字。
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Cmd::Notify),
            1 => Ok(Cmd::Request),
            2 => Ok(Cmd::Response),
            other => Err(RpcError::new(
                ErrorCode::UnexpectedCode,
                format!("unknown packet cmd {other}"),
            )),
        }
    }
}

/// 路由键：字符串 URI 或 32 位数值消息 ID，二者在同一个包上互斥。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    /// 字符串 URI。
    Uri(String),
    /// 数值消息 ID，`0` 保留表示“未携带”。
    Id(u32),
}

impl From<&str> for Route {
    fn from(value: &str) -> Self {
        Route::Uri(value.to_owned())
    }
}

impl From<String> for Route {
    fn from(value: String) -> Self {
        Route::Uri(value)
    }
}

impl From<u32> for Route {
    fn from(value: u32) -> Self {
        Route::Id(value)
    }
}

/// 内存中的包。
///
/// `uri` 与 `msg_id` 各自独立可写，线上布局只会携带其中之一；路由时非零 `msg_id` 优先。
#[derive(Clone, Debug, Default)]
pub struct Packet {
    cmd: Cmd,
    flag: u8,
    reserved: u8,
    session_id: u64,
    uri: String,
    msg_id: u32,
    payload: Bytes,
    metadata: Metadata,
    pub(crate) buffer: Vec<u8>,
}

impl Packet {
    /// 创建空包。
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmd(&self) -> Cmd {
        self.cmd
    }

    pub fn set_cmd(&mut self, cmd: Cmd) {
        self.cmd = cmd;
    }

    /// 原始标志字节。
    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flag = flag;
    }

    /// 负载是否为错误编码。
    pub fn is_error(&self) -> bool {
        self.flag & FLAG_ERROR != 0
    }

    pub fn set_error(&mut self, on: bool) {
        if on {
            self.flag |= FLAG_ERROR;
        } else {
            self.flag &= !FLAG_ERROR;
        }
    }

    /// 应用自定义的 8 个保留位。
    pub fn reserved(&self) -> u8 {
        self.reserved
    }

    pub fn set_reserved(&mut self, reserved: u8) {
        self.reserved = reserved;
    }

    /// 读取第 `bit` 个保留位，`bit >= 8` 时恒为 `false`。
    pub fn reserved_bit(&self, bit: u8) -> bool {
        bit < 8 && self.reserved & (1 << bit) != 0
    }

    /// 设置第 `bit` 个保留位，`bit >= 8` 时忽略。
    pub fn set_reserved_bit(&mut self, bit: u8, on: bool) {
        if bit >= 8 {
            return;
        }
        if on {
            self.reserved |= 1 << bit;
        } else {
            self.reserved &= !(1 << bit);
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// 覆盖 URI，复用已有字符串容量。
    pub fn set_uri(&mut self, uri: &str) {
        self.uri.clear();
        self.uri.push_str(uri);
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn set_msg_id(&mut self, msg_id: u32) {
        self.msg_id = msg_id;
    }

    /// 当前生效的路由键：非零 `msg_id` 优先。
    pub fn route(&self) -> Route {
        if self.msg_id != 0 {
            Route::Id(self.msg_id)
        } else {
            Route::Uri(self.uri.clone())
        }
    }

    /// 写入路由键，并清除另一种键。
    pub fn set_route(&mut self, route: &Route) {
        match route {
            Route::Uri(uri) => {
                self.set_uri(uri);
                self.msg_id = 0;
            }
            Route::Id(id) => {
                self.uri.clear();
                self.msg_id = *id;
            }
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// 清空全部字段，保留暂存缓冲与 URI 的容量。
    pub fn reset(&mut self) {
        self.cmd = Cmd::Notify;
        self.flag = 0;
        self.reserved = 0;
        self.session_id = 0;
        self.uri.clear();
        self.msg_id = 0;
        self.payload = Bytes::new();
        self.metadata.clear();
        self.buffer.clear();
    }

    /// 取走暂存缓冲中已编码的帧。
    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl PartialEq for Packet {
    /// 逐字段比较，不含内部暂存缓冲。
    fn eq(&self, other: &Self) -> bool {
        self.cmd == other.cmd
            && self.flag == other.flag
            && self.reserved == other.reserved
            && self.session_id == other.session_id
            && self.uri == other.uri
            && self.msg_id == other.msg_id
            && self.payload == other.payload
            && self.metadata == other.metadata
    }
}

impl Eq for Packet {}

/// 包对象池契约。
///
/// 每个从 `get` 取得的包都必须经由 `put` 恰好归还一次；`put` 负责清空字段。
pub trait PacketPool: Send + Sync + 'static {
    /// 取出一个字段已清空的包。
    fn get(&self) -> Packet;

    /// 归还包。
    fn put(&self, packet: Packet);
}

/// 池的计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计 `get` 次数。
    pub gets: u64,
    /// 累计 `put` 次数。
    pub puts: u64,
    /// 自由链表中空闲的包数量。
    pub idle: usize,
}

impl PoolStats {
    /// 尚未归还的包数量。
    pub fn outstanding(&self) -> u64 {
        self.gets.saturating_sub(self.puts)
    }
}

/// 暂存缓冲超过该容量的包归还时直接丢弃，避免单个大包长期占用内存。
const MAX_RETAINED_BUFFER: usize = 64 * 1024;

/// 基于自由链表的默认包池。
///
/// 内部以 `spin::Mutex<Vec<Packet>>` 作为自由链表，`capacity` 限制空闲包数量；
/// `gets`/`puts` 计数用于在测试中校验“恰好归还一次”的纪律。
pub struct FreeListPacketPool {
    free: Mutex<Vec<Packet>>,
    capacity: usize,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl FreeListPacketPool {
    /// 默认最多保留的空闲包数量。
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

impl Default for FreeListPacketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPool for FreeListPacketPool {
    fn get(&self) -> Packet {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.free.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut packet: Packet) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        if packet.buffer.capacity() > MAX_RETAINED_BUFFER {
            return;
        }
        packet.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(packet);
        }
    }
}
