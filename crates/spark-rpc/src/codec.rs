//! 消息编解码：应用负载与字节之间的转换，与包格式无关。
//!
//! `MessageCodec<T>` 以负载类型为参数，使同一个编解码器可以按各自的约束
//! （serde 或 prost）服务不同的消息类型；引擎其余部分只在需要编解码的调用点
//! 要求 `C: MessageCodec<T>`。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ErrorCode, Result, RpcError};

/// 负载类型 `T` 的编解码契约。
pub trait MessageCodec<T>: Send + Sync + 'static {
    /// 序列化负载。
    fn marshal(&self, value: &T) -> Result<Vec<u8>>;

    /// 反序列化负载。
    fn unmarshal(&self, data: &[u8]) -> Result<T>;
}

/// 基于 `serde_json` 的默认编解码器。
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> MessageCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|err| RpcError::new(ErrorCode::Marshal, "json encode failed").with_cause(err))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|err| {
            RpcError::new(ErrorCode::Unmarshal, "json decode failed").with_cause(err)
        })
    }
}

/// 基于 `prost` 的 Protobuf 编解码器。
#[cfg(feature = "protobuf")]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtobufCodec;

#[cfg(feature = "protobuf")]
impl<T> MessageCodec<T> for ProtobufCodec
where
    T: prost::Message + Default,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>> {
        Ok(value.encode_to_vec())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<T> {
        T::decode(data).map_err(|err| {
            RpcError::new(ErrorCode::Unmarshal, "protobuf decode failed").with_cause(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sum {
        sum: i64,
    }

    #[test]
    fn json_codec_encodes_struct_fields() {
        let bytes = MessageCodec::<Sum>::marshal(&JsonCodec, &Sum { sum: 5 }).expect("编码");
        assert_eq!(bytes, br#"{"sum":5}"#);
        let decoded: Sum = JsonCodec.unmarshal(&bytes).expect("解码");
        assert_eq!(decoded, Sum { sum: 5 });
    }

    #[test]
    fn json_decode_failure_is_unmarshal() {
        let err = MessageCodec::<Sum>::unmarshal(&JsonCodec, b"not json").expect_err("非法输入");
        assert!(err.is(ErrorCode::Unmarshal));
    }

    #[cfg(feature = "protobuf")]
    #[test]
    fn protobuf_codec_round_trips_message() {
        #[derive(Clone, PartialEq, prost::Message)]
        struct Add {
            #[prost(int64, tag = "1")]
            a: i64,
            #[prost(int64, tag = "2")]
            b: i64,
        }

        let bytes = ProtobufCodec.marshal(&Add { a: 2, b: 3 }).expect("编码");
        let decoded: Add = ProtobufCodec.unmarshal(&bytes).expect("解码");
        assert_eq!(decoded, Add { a: 2, b: 3 });
    }
}
