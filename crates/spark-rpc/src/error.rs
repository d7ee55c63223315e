//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为协议引擎的所有失败路径提供一个封闭的数值错误分类，使调用方能以 [`RpcError::is`] 做程序化判断，
//!   同时保留人类可读描述与底层原因链；
//! - 错误码的数值同时也是错误负载在线上的编码（见 [`crate::protocol`]），因此一经发布不得重排。
//!
//! ## 契约（What）
//! - [`ErrorCode`] 为 `#[repr(u16)]` 枚举，`from_u16` 与 `as_u16` 互逆；
//! - [`RpcError`] 可克隆、可跨线程传递，`source()` 暴露通过 [`RpcError::with_cause`] 附加的原因。

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// 本 crate 统一的结果别名。
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// 协议引擎的封闭错误分类。
///
/// 数值即线上错误负载中的 2 字节错误码。
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 无法归类的失败。
    Unknown = 0,
    /// 负载或帧序列化失败。
    Marshal = 1,
    /// 负载或帧反序列化失败。
    Unmarshal = 2,
    /// 当前上下文不支持该操作，例如对非请求包调用 `respond`。
    NotSupported = 3,
    /// 等待应答超时。
    Timeout = 4,
    /// 帧长度越界或声明长度与实际不符。
    PacketSize = 5,
    /// 出现未知命令字或装配缺失，属于配置错误。
    UnexpectedCode = 6,
    /// 连接已拆除，会话被强制终结。
    SessionClosed = 7,
    /// 错误负载本身无法解析。
    InvalidErrorPayload = 8,
    /// 路由表中找不到处理链，且未安装兜底链。
    RouteNotFound = 9,
    /// 同一路由键被重复注册。
    RouteConflict = 10,
    /// 元数据编码长度非法或被截断。
    MetadataSize = 11,
}

impl ErrorCode {
    const ALL: [ErrorCode; 12] = [
        ErrorCode::Unknown,
        ErrorCode::Marshal,
        ErrorCode::Unmarshal,
        ErrorCode::NotSupported,
        ErrorCode::Timeout,
        ErrorCode::PacketSize,
        ErrorCode::UnexpectedCode,
        ErrorCode::SessionClosed,
        ErrorCode::InvalidErrorPayload,
        ErrorCode::RouteNotFound,
        ErrorCode::RouteConflict,
        ErrorCode::MetadataSize,
    ];

    /// 返回线上使用的数值。
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// 超时类错误：调用方没有拿到应答，原因是等待到期或连接拆除。
    pub const fn is_timeout_class(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::SessionClosed)
    }

    /// 由线上数值还原错误码，未知数值返回 `None`。
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_u16() == value)
    }

    /// 稳定的 `<域>.<语义>` 字符串形式，用于日志字段。
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "spark.rpc.unknown",
            ErrorCode::Marshal => "spark.rpc.marshal_failed",
            ErrorCode::Unmarshal => "spark.rpc.unmarshal_failed",
            ErrorCode::NotSupported => "spark.rpc.not_supported",
            ErrorCode::Timeout => "spark.rpc.timeout",
            ErrorCode::PacketSize => "spark.rpc.packet_size",
            ErrorCode::UnexpectedCode => "spark.rpc.unexpected_code",
            ErrorCode::SessionClosed => "spark.rpc.session_closed",
            ErrorCode::InvalidErrorPayload => "spark.rpc.invalid_error_payload",
            ErrorCode::RouteNotFound => "spark.rpc.route_not_found",
            ErrorCode::RouteConflict => "spark.rpc.route_conflict",
            ErrorCode::MetadataSize => "spark.rpc.metadata_size",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// 协议引擎的类型化错误值。
///
/// # 契约说明（What）
/// - `code`：封闭分类中的错误码，决定程序化处理分支；
/// - `message`：面向排障人员的描述；
/// - `cause`：可选的底层原因，经 `source()` 暴露。
///
/// 以 Builder 风格叠加原因：`RpcError::new(code, msg).with_cause(err)`。
#[derive(Clone)]
pub struct RpcError {
    code: ErrorCode,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl RpcError {
    /// 构造错误。
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附加底层原因。
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 等待应答超时。
    pub fn timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// 连接拆除导致会话终结。
    pub fn session_closed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::SessionClosed, message)
    }

    /// 读取错误码。
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// 读取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 见 [`ErrorCode::is_timeout_class`]。
    pub fn is_timeout_class(&self) -> bool {
        self.code.is_timeout_class()
    }

    /// 判断错误码是否匹配，错误原因不参与比较。
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RpcError");
        debug.field("code", &self.code).field("message", &self.message);
        if let Some(cause) = &self.cause {
            debug.field("cause", &format_args!("{cause}"));
        }
        debug.finish()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for RpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wire_value() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0xFFFF), None);
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::other("socket reset");
        let err = RpcError::new(ErrorCode::Unmarshal, "bad frame").with_cause(io);
        assert!(err.is(ErrorCode::Unmarshal));
        assert_eq!(err.to_string(), "[spark.rpc.unmarshal_failed] bad frame");
        let source = err.source().expect("原因应可见");
        assert_eq!(source.to_string(), "socket reset");
    }

    #[test]
    fn teardown_counts_as_timeout_class() {
        let timeout_class: Vec<_> = ErrorCode::ALL
            .into_iter()
            .filter(|code| code.is_timeout_class())
            .collect();
        assert_eq!(timeout_class, [ErrorCode::Timeout, ErrorCode::SessionClosed]);
        assert!(RpcError::session_closed("gone").is_timeout_class());
        assert!(!RpcError::new(ErrorCode::RouteNotFound, "x").is_timeout_class());
    }
}
