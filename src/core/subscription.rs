//! 订阅句柄与回调隔离
//!
//! 事件总线和数据流共享同一套取消订阅句柄，以及"一个订阅者失败不影响其他订阅者"的执行方式

use crate::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// 订阅ID，进程内单调递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 原始数值
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// 取消订阅句柄
///
/// `unsubscribe()` 是幂等的：第一次调用返回 `true`，之后的调用不做任何事并返回 `false`。
/// 句柄被丢弃时不会自动取消订阅。
pub struct Unsubscribe {
    id: SubscriptionId,
    cancel: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Unsubscribe {
    pub(crate) fn new<F>(id: SubscriptionId, cancel: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            id,
            cancel: Box::new(cancel),
        }
    }

    /// 对应的订阅ID
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 取消订阅
    pub fn unsubscribe(&self) -> bool {
        (self.cancel)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").field("id", &self.id).finish()
    }
}

/// 在隔离环境中执行一个订阅者回调
///
/// 回调返回的错误和panic都会被捕获并记录，不会向上传播。返回回调是否成功。
pub(crate) fn run_isolated<F>(plugin_id: &str, topic: &str, callback: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(plugin_id = %plugin_id, topic = %topic, error = %e, "Subscriber failed");
            false
        }
        Err(payload) => {
            warn!(
                plugin_id = %plugin_id,
                topic = %topic,
                panic = %panic_message(payload.as_ref()),
                "Subscriber panicked"
            );
            false
        }
    }
}

/// 从panic负载中提取可读信息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
