//! 按 4 字节大端总长前缀从字节流中切出完整帧。

use std::io;

use bytes::{BufMut, BytesMut};
use spark_rpc::wire::LENGTH_PREFIX;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TransportError;

/// 读取一个完整帧，返回值包含长度前缀本身，可直接交给 `on_read`。
///
/// # 契约（What）
/// - 流在帧边界处结束返回 `Ok(None)`；前缀读到一半即遇到 EOF 同样视为对端关闭；
/// - 帧体读到一半遇到 EOF 返回 `Io(UnexpectedEof)`；
/// - 声明长度超过 `max_packet_size` 时在分配缓冲之前就返回 `FrameTooLarge`。
pub async fn read_frame<R>(
    reader: &mut R,
    max_packet_size: usize,
) -> Result<Option<BytesMut>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len < LENGTH_PREFIX {
        return Err(TransportError::FrameTooShort { len });
    }
    if len > max_packet_size {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_packet_size,
        });
    }

    let mut frame = BytesMut::with_capacity(len);
    frame.put_slice(&prefix);
    frame.resize(len, 0);
    reader.read_exact(&mut frame[LENGTH_PREFIX..]).await?;
    Ok(Some(frame))
}
