//! 集成测试共用的内存传输与消息类型。
#![allow(dead_code)]

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spark_rpc::{JsonCodec, Output, RpcError, RpcProcess};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Add {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sum {
    pub sum: i64,
}

/// 按 `RUST_LOG` 安装测试用订阅器，重复调用无副作用。
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// 把写入的帧送进无界通道，模拟一条单向字节流。
pub fn pipe() -> (Arc<dyn Output>, mpsc::UnboundedReceiver<BytesMut>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let output = move |frame: &[u8]| -> Result<(), RpcError> {
        tx.send(BytesMut::from(frame))
            .map_err(|_| RpcError::session_closed("pipe closed"))
    };
    (Arc::new(output), rx)
}

/// 串行地把通道中的帧投递给对端，等同于传输层的读任务。
pub fn pump(mut rx: mpsc::UnboundedReceiver<BytesMut>, peer: Arc<RpcProcess<JsonCodec>>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let _ = peer.on_read(frame);
        }
    });
}

/// 只记录写出的帧，从不应答。
#[derive(Clone, Default)]
pub struct Capture {
    frames: Arc<Mutex<Vec<BytesMut>>>,
}

impl Capture {
    pub fn output(&self) -> Arc<dyn Output> {
        let frames = self.frames.clone();
        Arc::new(move |frame: &[u8]| -> Result<(), RpcError> {
            frames.lock().push(BytesMut::from(frame));
            Ok(())
        })
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn take(&self) -> Vec<BytesMut> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// 轮询直到至少捕获 `count` 帧。
    pub async fn wait_for(&self, count: usize) {
        while self.len() < count {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}
