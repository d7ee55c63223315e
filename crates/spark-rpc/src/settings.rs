//! 可序列化的引擎配置，供宿主从 TOML 文件装载后转换为 [`ProcessConfig`]。
//!
//! ```toml
//! layout = "msg_id"
//! max_packet_size = 1048576
//! call_timeout_ms = 3000
//! obfuscation_key = "spark"
//! ```
//!
//! 所有字段均可省略，未知字段视为配置错误。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::context::FreeListContextPool;
use crate::encoder::XorEncoder;
use crate::error::{ErrorCode, Result, RpcError};
use crate::packet::FreeListPacketPool;
use crate::process::ProcessConfig;
use crate::rpc::CallOptions;
use crate::wire::{DEFAULT_MAX_PACKET_SIZE, WireLayout};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcSettings {
    /// 线上布局。
    pub layout: WireLayout,
    /// 单帧上限（字节，含长度前缀）。
    pub max_packet_size: usize,
    /// 默认调用超时（毫秒），缺省表示不设超时。
    pub call_timeout_ms: Option<u64>,
    /// 非空时以重复密钥异或混淆帧主体。
    pub obfuscation_key: Option<String>,
    pub packet_pool_capacity: usize,
    pub context_pool_capacity: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            layout: WireLayout::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            call_timeout_ms: None,
            obfuscation_key: None,
            packet_pool_capacity: FreeListPacketPool::DEFAULT_CAPACITY,
            context_pool_capacity: FreeListContextPool::<()>::DEFAULT_CAPACITY,
        }
    }
}

impl RpcSettings {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|err| {
            RpcError::new(ErrorCode::UnexpectedCode, "invalid rpc settings").with_cause(err)
        })
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// 以默认超时构造调用选项。
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.call_timeout(),
            ..CallOptions::default()
        }
    }

    /// 转换为分发引擎配置；混淆密钥为空字符串时失败。
    pub fn into_config<C>(&self, codec: C) -> Result<ProcessConfig<C>>
    where
        C: Send + Sync + 'static,
    {
        let mut config = ProcessConfig::new(codec)
            .with_layout(self.layout)
            .with_max_packet_size(self.max_packet_size)
            .with_packet_pool(Arc::new(FreeListPacketPool::with_capacity(
                self.packet_pool_capacity,
            )))
            .with_context_pool(Arc::new(FreeListContextPool::<C>::with_capacity(
                self.context_pool_capacity,
            )));
        if let Some(key) = &self.obfuscation_key {
            config = config.with_encoder(Arc::new(XorEncoder::new(key.as_bytes().to_vec())?));
        }
        Ok(config)
    }
}
