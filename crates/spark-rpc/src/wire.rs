//! 线上帧格式与编解码器。
//!
//! 两种可互换的布局，均以 4 字节大端总长前缀开头（总长包含前缀本身），
//! 传输层据此完成流式分帧：
//!
//! ```text
//! URI 布局:   size(4) cmd(1) flag(1) reserved(1) uri_len(1) session_id(8) payload_size(4)
//!             uri(uri_len) payload(payload_size) metadata(rest)
//! 数值 ID 布局: size(4) cmd(1) flag(1) reserved(1) pad(1) session_id(8) payload_size(4)
//!             msg_id(4) payload(payload_size) metadata(rest)
//! ```
//!
//! 编码复用包内的暂存缓冲：容量足够时不分配，不足时按需增长。
//! 解码校验声明总长与实际缓冲长度，负载以 `Bytes::slice` 零拷贝引用输入帧。

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use serde::Deserialize;

use crate::error::{ErrorCode, Result, RpcError};
use crate::metadata::Metadata;
use crate::packet::{Cmd, Packet};

/// 长度前缀字节数。
pub const LENGTH_PREFIX: usize = 4;
/// URI 布局的固定头长度（含前缀）。
pub const URI_HEADER_LEN: usize = 20;
/// 数值 ID 布局的固定头长度（含前缀）。
pub const ID_HEADER_LEN: usize = 24;
/// 默认的单帧上限。
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// 线上布局选择。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireLayout {
    /// 以字符串 URI 为路由键。
    #[default]
    Uri,
    /// 以 32 位数值消息 ID 为路由键。
    MsgId,
}

impl WireLayout {
    /// 固定头长度。
    pub const fn header_len(self) -> usize {
        match self {
            WireLayout::Uri => URI_HEADER_LEN,
            WireLayout::MsgId => ID_HEADER_LEN,
        }
    }

    /// 构造该布局对应的编解码器。
    pub fn codec(self, max_packet_size: usize) -> Arc<dyn PacketCodec> {
        match self {
            WireLayout::Uri => Arc::new(UriPacketCodec::new(max_packet_size)),
            WireLayout::MsgId => Arc::new(IdPacketCodec::new(max_packet_size)),
        }
    }
}

/// 包与字节之间的编解码契约。
pub trait PacketCodec: Send + Sync + 'static {
    /// 本编解码器实现的布局。
    fn layout(&self) -> WireLayout;

    /// 将包编码进其暂存缓冲，返回完整帧（含长度前缀）。
    fn marshal<'a>(&self, packet: &'a mut Packet) -> Result<&'a mut [u8]>;

    /// 将完整帧解码进 `packet`；失败时 `packet` 不被修改。
    fn unmarshal(&self, frame: Bytes, packet: &mut Packet) -> Result<()>;
}

/// URI 布局编解码器。
#[derive(Clone, Copy, Debug)]
pub struct UriPacketCodec {
    max_packet_size: usize,
}

impl UriPacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: clamp_max(max_packet_size),
        }
    }
}

impl Default for UriPacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketCodec for UriPacketCodec {
    fn layout(&self) -> WireLayout {
        WireLayout::Uri
    }

    fn marshal<'a>(&self, packet: &'a mut Packet) -> Result<&'a mut [u8]> {
        let uri_len = u8::try_from(packet.uri().len()).map_err(|_| {
            RpcError::new(
                ErrorCode::Marshal,
                format!("uri `{}` longer than 255 bytes", packet.uri()),
            )
        })?;
        let total = URI_HEADER_LEN
            + packet.uri().len()
            + packet.payload().len()
            + packet.metadata().encoded_len();
        check_size(total, self.max_packet_size)?;

        write_frame(packet, total, |packet, buf| {
            buf.put_u8(packet.cmd() as u8);
            buf.put_u8(packet.flag());
            buf.put_u8(packet.reserved());
            buf.put_u8(uri_len);
            buf.put_u64(packet.session_id());
            buf.put_u32(packet.payload().len() as u32);
            buf.put_slice(packet.uri().as_bytes());
            buf.put_slice(packet.payload());
            packet.metadata().marshal_into(buf)
        })
    }

    fn unmarshal(&self, frame: Bytes, packet: &mut Packet) -> Result<()> {
        check_frame(&frame, URI_HEADER_LEN, self.max_packet_size)?;
        let mut header = &frame[LENGTH_PREFIX..URI_HEADER_LEN];
        let cmd = Cmd::from_u8(header.get_u8())?;
        let flag = header.get_u8();
        let reserved = header.get_u8();
        let uri_len = header.get_u8() as usize;
        let session_id = header.get_u64();
        let payload_size = header.get_u32() as usize;

        let uri_end = URI_HEADER_LEN + uri_len;
        let payload_end = body_end(&frame, uri_end, payload_size)?;
        let uri = std::str::from_utf8(&frame[URI_HEADER_LEN..uri_end]).map_err(|err| {
            RpcError::new(ErrorCode::Unmarshal, "uri is not valid utf-8").with_cause(err)
        })?;
        let metadata = Metadata::unmarshal(&frame[payload_end..])?;

        packet.set_cmd(cmd);
        packet.set_flag(flag);
        packet.set_reserved(reserved);
        packet.set_session_id(session_id);
        packet.set_uri(uri);
        packet.set_msg_id(0);
        packet.set_metadata(metadata);
        packet.set_payload(frame.slice(uri_end..payload_end));
        Ok(())
    }
}

/// 数值 ID 布局编解码器。
#[derive(Clone, Copy, Debug)]
pub struct IdPacketCodec {
    max_packet_size: usize,
}

impl IdPacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: clamp_max(max_packet_size),
        }
    }
}

impl Default for IdPacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketCodec for IdPacketCodec {
    fn layout(&self) -> WireLayout {
        WireLayout::MsgId
    }

    fn marshal<'a>(&self, packet: &'a mut Packet) -> Result<&'a mut [u8]> {
        let total = ID_HEADER_LEN + packet.payload().len() + packet.metadata().encoded_len();
        check_size(total, self.max_packet_size)?;

        write_frame(packet, total, |packet, buf| {
            buf.put_u8(packet.cmd() as u8);
            buf.put_u8(packet.flag());
            buf.put_u8(packet.reserved());
            buf.put_u8(0);
            buf.put_u64(packet.session_id());
            buf.put_u32(packet.payload().len() as u32);
            buf.put_u32(packet.msg_id());
            buf.put_slice(packet.payload());
            packet.metadata().marshal_into(buf)
        })
    }

    fn unmarshal(&self, frame: Bytes, packet: &mut Packet) -> Result<()> {
        check_frame(&frame, ID_HEADER_LEN, self.max_packet_size)?;
        let mut header = &frame[LENGTH_PREFIX..ID_HEADER_LEN];
        let cmd = Cmd::from_u8(header.get_u8())?;
        let flag = header.get_u8();
        let reserved = header.get_u8();
        header.advance(1);
        let session_id = header.get_u64();
        let payload_size = header.get_u32() as usize;
        let msg_id = header.get_u32();

        let payload_end = body_end(&frame, ID_HEADER_LEN, payload_size)?;
        let metadata = Metadata::unmarshal(&frame[payload_end..])?;

        packet.set_cmd(cmd);
        packet.set_flag(flag);
        packet.set_reserved(reserved);
        packet.set_session_id(session_id);
        packet.set_uri("");
        packet.set_msg_id(msg_id);
        packet.set_metadata(metadata);
        packet.set_payload(frame.slice(ID_HEADER_LEN..payload_end));
        Ok(())
    }
}

/// 单帧上限不能超过长度前缀可表达的范围。
fn clamp_max(max_packet_size: usize) -> usize {
    max_packet_size.min(u32::MAX as usize)
}

fn check_size(total: usize, max: usize) -> Result<()> {
    if total > max {
        return Err(RpcError::new(
            ErrorCode::PacketSize,
            format!("packet of {total} bytes exceeds limit {max}"),
        ));
    }
    Ok(())
}

fn check_frame(frame: &[u8], header_len: usize, max: usize) -> Result<()> {
    if frame.len() < header_len {
        return Err(RpcError::new(
            ErrorCode::PacketSize,
            format!("frame of {} bytes is shorter than header {header_len}", frame.len()),
        ));
    }
    check_size(frame.len(), max)?;
    let mut prefix = &frame[..LENGTH_PREFIX];
    let declared = prefix.get_u32() as usize;
    if declared != frame.len() {
        return Err(RpcError::new(
            ErrorCode::PacketSize,
            format!("declared size {declared} does not match frame length {}", frame.len()),
        ));
    }
    Ok(())
}

/// 校验变长区域并返回负载结束偏移。
fn body_end(frame: &[u8], start: usize, payload_size: usize) -> Result<usize> {
    start
        .checked_add(payload_size)
        .filter(|end| *end <= frame.len())
        .ok_or_else(|| {
            RpcError::new(
                ErrorCode::PacketSize,
                format!("payload of {payload_size} bytes overruns frame of {}", frame.len()),
            )
        })
}

/// 在包的暂存缓冲上写出长度前缀与主体；主体写失败时缓冲仍归还给包。
fn write_frame<'a, F>(packet: &'a mut Packet, total: usize, body: F) -> Result<&'a mut [u8]>
where
    F: FnOnce(&Packet, &mut Vec<u8>) -> Result<()>,
{
    let mut buf = packet.take_buffer();
    buf.clear();
    buf.reserve(total);
    buf.put_u32(total as u32);
    let written = body(packet, &mut buf);
    packet.buffer = buf;
    written?;
    debug_assert_eq!(packet.buffer.len(), total);
    Ok(&mut packet.buffer[..])
}
