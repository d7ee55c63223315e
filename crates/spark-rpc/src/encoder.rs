//! 包编码器：作用在完整帧主体上的对称变换（恒等或混淆）。
//!
//! 变换只覆盖长度前缀之后的字节，且原地进行，传输层的流式分帧因此不受影响。
//! 出站路径在线上编码之后调用 `encode`，入站路径在解包之前调用 `decode`。

use crate::error::{ErrorCode, Result, RpcError};

/// 对称的帧主体变换。`decode(encode(x)) == x` 必须对任意输入成立。
pub trait PacketEncoder: Send + Sync + 'static {
    /// 出站变换。
    fn encode(&self, body: &mut [u8]);

    /// 入站逆变换。
    fn decode(&self, body: &mut [u8]);

    /// 恒等变换可让调用方跳过遍历。
    fn is_identity(&self) -> bool {
        false
    }
}

/// 不做任何变换。
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityEncoder;

impl PacketEncoder for IdentityEncoder {
    fn encode(&self, _body: &mut [u8]) {}

    fn decode(&self, _body: &mut [u8]) {}

    fn is_identity(&self) -> bool {
        true
    }
}

/// 以重复密钥逐字节异或的轻量混淆，仅用于规避明文嗅探，不提供机密性。
#[derive(Clone, Debug)]
pub struct XorEncoder {
    key: Box<[u8]>,
}

impl XorEncoder {
    /// 空密钥属于装配错误。
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(RpcError::new(
                ErrorCode::UnexpectedCode,
                "xor encoder requires a non-empty key",
            ));
        }
        Ok(Self {
            key: key.into_boxed_slice(),
        })
    }

    fn apply(&self, body: &mut [u8]) {
        for (byte, key) in body.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= key;
        }
    }
}

impl PacketEncoder for XorEncoder {
    fn encode(&self, body: &mut [u8]) {
        self.apply(body);
    }

    fn decode(&self, body: &mut [u8]) {
        self.apply(body);
    }
}
