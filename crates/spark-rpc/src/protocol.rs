//! 协议包装层：位于线上编解码器之上，负责会话号分配、请求/应答包构造与负载编解码。
//!
//! # 错误负载（What）
//! 携带错误标志的包，其负载不经过消息编解码器，而是固定编码为：
//!
//! ```text
//! code(2, BE) message(utf8, 余下全部字节)
//! ```
//!
//! 解码时长度不足 2 字节、错误码未知或描述不是合法 UTF-8，一律归为
//! [`ErrorCode::InvalidErrorPayload`]。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::MessageCodec;
use crate::encoder::PacketEncoder;
use crate::error::{ErrorCode, Result, RpcError};
use crate::metadata::Metadata;
use crate::packet::{Cmd, Packet, PacketPool, Route};
use crate::process::Output;
use crate::wire::{LENGTH_PREFIX, PacketCodec};

/// 负载的和类型：正常业务值或错误。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload<T> {
    /// 交给消息编解码器的业务值。
    Value(T),
    /// 经错误编解码器编码、并置位错误标志的错误。
    Fault(ErrorCode, String),
}

impl<T> Payload<T> {
    /// 以错误码与描述构造错误负载。
    pub fn fault(code: ErrorCode, message: impl Into<String>) -> Self {
        Payload::Fault(code, message.into())
    }
}

impl<T> From<RpcError> for Payload<T> {
    fn from(err: RpcError) -> Self {
        Payload::Fault(err.code(), err.message().to_owned())
    }
}

/// 编码错误负载。
pub fn encode_fault(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + message.len());
    out.put_u16(code.as_u16());
    out.put_slice(message.as_bytes());
    out
}

/// 解码错误负载；负载本身非法时返回 `InvalidErrorPayload`。
pub fn decode_fault(data: &[u8]) -> RpcError {
    if data.len() < 2 {
        return RpcError::new(
            ErrorCode::InvalidErrorPayload,
            format!("error payload of {} bytes is too short", data.len()),
        );
    }
    let mut cursor = data;
    let raw = cursor.get_u16();
    let Some(code) = ErrorCode::from_u16(raw) else {
        return RpcError::new(
            ErrorCode::InvalidErrorPayload,
            format!("unknown error code {raw}"),
        );
    };
    match std::str::from_utf8(cursor) {
        Ok(message) => RpcError::new(code, message.to_owned()),
        Err(err) => RpcError::new(
            ErrorCode::InvalidErrorPayload,
            "error message is not valid utf-8",
        )
        .with_cause(err),
    }
}

/// 连接级的协议包装。
///
/// 每条连接持有一个实例；`sequence` 为该连接上出站请求分配单调递增的会话号，
/// 保证并发未决调用的会话号互不相同。
pub struct Protocol<C> {
    codec: C,
    wire: Arc<dyn PacketCodec>,
    encoder: Arc<dyn PacketEncoder>,
    pool: Arc<dyn PacketPool>,
    sequence: AtomicU64,
}

impl<C> Protocol<C> {
    pub fn new(
        codec: C,
        wire: Arc<dyn PacketCodec>,
        encoder: Arc<dyn PacketEncoder>,
        pool: Arc<dyn PacketPool>,
    ) -> Self {
        Self {
            codec,
            wire,
            encoder,
            pool,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn wire(&self) -> &Arc<dyn PacketCodec> {
        &self.wire
    }

    pub fn encoder(&self) -> &Arc<dyn PacketEncoder> {
        &self.encoder
    }

    pub fn pool(&self) -> &Arc<dyn PacketPool> {
        &self.pool
    }

    /// 分配下一个会话号，从 1 开始。
    pub fn next_session_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 从池中取包并写入命令字、路由键、新会话号与元数据。
    pub fn new_packet(&self, cmd: Cmd, route: &Route, metadata: Metadata) -> Packet {
        let mut packet = self.pool.get();
        packet.set_cmd(cmd);
        packet.set_route(route);
        packet.set_session_id(self.next_session_id());
        packet.set_metadata(metadata);
        packet
    }

    /// 为请求构造应答包：沿用路由键、保留位与会话号，标志清零。
    pub fn new_response(&self, request: &Packet, metadata: Metadata) -> Packet {
        let mut packet = self.pool.get();
        packet.set_cmd(Cmd::Response);
        packet.set_flag(0);
        packet.set_reserved(request.reserved());
        packet.set_session_id(request.session_id());
        packet.set_uri(request.uri());
        packet.set_msg_id(request.msg_id());
        packet.set_metadata(metadata);
        packet
    }

    /// 把错误写入负载并置位错误标志。
    pub fn marshal_fault(&self, packet: &mut Packet, code: ErrorCode, message: &str) {
        packet.set_error(true);
        packet.set_payload(encode_fault(code, message));
    }

    /// 以消息编解码器写入业务值，并清除错误标志。
    pub fn marshal_value<T>(&self, packet: &mut Packet, value: &T) -> Result<()>
    where
        C: MessageCodec<T>,
    {
        let bytes = self.codec.marshal(value)?;
        packet.set_error(false);
        packet.set_payload(bytes);
        Ok(())
    }

    pub fn payload_marshal<T>(&self, packet: &mut Packet, payload: &Payload<T>) -> Result<()>
    where
        C: MessageCodec<T>,
    {
        match payload {
            Payload::Value(value) => self.marshal_value(packet, value),
            Payload::Fault(code, message) => {
                self.marshal_fault(packet, *code, message);
                Ok(())
            }
        }
    }

    /// 先检查错误标志：置位时把负载还原为错误，否则交给消息编解码器。
    pub fn payload_unmarshal<T>(&self, packet: &Packet) -> Result<T>
    where
        C: MessageCodec<T>,
    {
        if packet.is_error() {
            return Err(decode_fault(packet.payload()));
        }
        self.codec.unmarshal(packet.payload())
    }

    /// 线上编码后对帧主体做出站变换，返回可直接写出的完整帧。
    pub fn marshal_frame<'a>(&self, packet: &'a mut Packet) -> Result<&'a mut [u8]> {
        let frame = self.wire.marshal(packet)?;
        if !self.encoder.is_identity() {
            self.encoder.encode(&mut frame[LENGTH_PREFIX..]);
        }
        Ok(frame)
    }

    /// 对帧主体做入站逆变换后解码进 `packet`。
    pub fn unmarshal_frame(&self, mut frame: BytesMut, packet: &mut Packet) -> Result<()> {
        if frame.len() > LENGTH_PREFIX && !self.encoder.is_identity() {
            self.encoder.decode(&mut frame[LENGTH_PREFIX..]);
        }
        self.wire.unmarshal(frame.freeze(), packet)
    }

    /// 编码并写出；包仍归调用方所有。
    pub fn send(&self, output: &dyn Output, packet: &mut Packet) -> Result<()> {
        let frame = self.marshal_frame(packet)?;
        output.write(frame)
    }
}
