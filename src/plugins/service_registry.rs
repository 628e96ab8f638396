//! 插件服务注册表
//!
//! 每个插件注册一张方法表，其他插件通过权限检查后以异步方式调用（进程内RPC）。
//! 所有调用无论成功与否都会记录到有界的调用历史中。

use crate::core::subscription::panic_message;
use crate::types::{now_ns, PluginId, TimestampNs, WILDCARD_CALLER};
use crate::{HubError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 服务方法
#[async_trait]
pub trait ServiceMethod: Send + Sync {
    /// 执行调用
    async fn invoke(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value>;
}

/// 异步闭包适配器
struct AsyncFnMethod<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> ServiceMethod for AsyncFnMethod<F>
where
    F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn invoke(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        (self.func)(args).await
    }
}

/// 同步闭包适配器
struct SyncFnMethod<F> {
    func: F,
}

#[async_trait]
impl<F> ServiceMethod for SyncFnMethod<F>
where
    F: Fn(Vec<serde_json::Value>) -> Result<serde_json::Value> + Send + Sync,
{
    async fn invoke(&self, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        (self.func)(args)
    }
}

/// 插件的方法表
#[derive(Clone, Default)]
pub struct ServiceTable {
    methods: BTreeMap<String, Arc<dyn ServiceMethod>>,
}

impl ServiceTable {
    /// 创建空方法表
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加异步方法
    pub fn method<F, Fut>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.insert(name, Arc::new(AsyncFnMethod { func }));
        self
    }

    /// 添加同步方法
    pub fn sync_method<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(Vec<serde_json::Value>) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(SyncFnMethod { func }));
        self
    }

    /// 添加自定义实现的方法
    pub fn handler(mut self, name: &str, handler: Arc<dyn ServiceMethod>) -> Self {
        self.insert(name, handler);
        self
    }

    /// 插入或替换方法
    pub fn insert(&mut self, name: &str, handler: Arc<dyn ServiceMethod>) {
        self.methods.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceMethod>> {
        self.methods.get(name).cloned()
    }

    /// 方法名（有序）
    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTable")
            .field("methods", &self.method_names())
            .finish()
    }
}

/// 调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Completed,
    Error,
}

/// 服务调用记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// 调用ID
    pub id: String,
    /// 调用序号
    pub sequence: u64,
    /// 被调用插件
    pub target_plugin: PluginId,
    pub method: String,
    pub args: Vec<serde_json::Value>,
    /// 调用方插件
    pub from_plugin: PluginId,
    pub timestamp: TimestampNs,
    pub status: CallStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 执行耗时（毫秒），调用前即被拒绝的记录没有耗时
    pub duration_ms: Option<f64>,
}

/// 调用历史过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallFilter {
    pub target_plugin: Option<PluginId>,
    pub from_plugin: Option<PluginId>,
    pub method: Option<String>,
    pub status: Option<CallStatus>,
    pub since: Option<TimestampNs>,
    pub limit: Option<usize>,
}

impl CallFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_plugin(mut self, plugin_id: &str) -> Self {
        self.target_plugin = Some(plugin_id.to_string());
        self
    }

    pub fn from_plugin(mut self, plugin_id: &str) -> Self {
        self.from_plugin = Some(plugin_id.to_string());
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, timestamp: TimestampNs) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, call: &ServiceCall) -> bool {
        self.target_plugin.as_ref().map_or(true, |p| &call.target_plugin == p)
            && self.from_plugin.as_ref().map_or(true, |p| &call.from_plugin == p)
            && self.method.as_ref().map_or(true, |m| &call.method == m)
            && self.status.map_or(true, |s| call.status == s)
            && self.since.map_or(true, |since| call.timestamp >= since)
    }
}

/// 服务注册表统计信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistryStats {
    pub registered_plugins: usize,
    pub total_methods: usize,
    pub permission_entries: usize,
    pub total_calls: usize,
    pub completed_calls: usize,
    pub failed_calls: usize,
    pub pending_calls: usize,
    /// 成功率（百分比，保留两位小数）
    pub success_rate: f64,
    /// 平均耗时（毫秒，保留两位小数）
    pub average_duration_ms: f64,
}

/// 服务注册表配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRegistryConfig {
    /// 调用历史容量
    pub max_call_history: usize,
}

impl Default for ServiceRegistryConfig {
    fn default() -> Self {
        Self { max_call_history: 100 }
    }
}

/// 插件服务注册表
#[derive(Clone)]
pub struct ServiceRegistry {
    /// 插件ID -> 方法表
    services: Arc<DashMap<PluginId, ServiceTable>>,
    /// 插件ID -> 允许的调用方
    permissions: Arc<DashMap<PluginId, HashSet<PluginId>>>,
    call_history: Arc<Mutex<VecDeque<ServiceCall>>>,
    sequence: Arc<AtomicU64>,
    config: ServiceRegistryConfig,
}

impl ServiceRegistry {
    /// 使用默认配置创建注册表
    pub fn new() -> Self {
        Self::with_config(ServiceRegistryConfig::default())
    }

    /// 使用指定配置创建注册表
    pub fn with_config(config: ServiceRegistryConfig) -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            permissions: Arc::new(DashMap::new()),
            call_history: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_call_history))),
            sequence: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    // === 注册与权限 ===

    /// 注册服务，替换该插件之前的整张方法表
    pub fn register_service(&self, plugin_id: &str, table: ServiceTable) {
        let methods = table.method_names();
        let replaced = self.services.insert(plugin_id.to_string(), table).is_some();
        debug!(plugin_id = %plugin_id, ?methods, replaced, "Registered service");
    }

    /// 设置允许调用该插件服务的插件列表，`"*"` 表示任意调用方
    pub fn set_permissions<I, S>(&self, plugin_id: &str, allowed_callers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<PluginId>,
    {
        let allowed: HashSet<PluginId> = allowed_callers.into_iter().map(Into::into).collect();
        debug!(plugin_id = %plugin_id, allowed = allowed.len(), "Set service permissions");
        self.permissions.insert(plugin_id.to_string(), allowed);
    }

    /// 获取权限列表（有序）；`None` 表示不受限
    pub fn get_permissions(&self, plugin_id: &str) -> Option<Vec<PluginId>> {
        self.permissions.get(plugin_id).map(|allowed| {
            let mut callers: Vec<PluginId> = allowed.iter().cloned().collect();
            callers.sort();
            callers
        })
    }

    /// 调用方是否有权调用目标插件的服务
    pub fn is_allowed(&self, target_plugin: &str, from_plugin: &str) -> bool {
        match self.permissions.get(target_plugin) {
            Some(allowed) => allowed.contains(from_plugin) || allowed.contains(WILDCARD_CALLER),
            None => true,
        }
    }

    /// 注销插件的服务和权限，返回是否存在已注册的服务
    pub fn unregister(&self, plugin_id: &str) -> bool {
        let removed = self.services.remove(plugin_id).is_some();
        self.permissions.remove(plugin_id);
        info!(plugin_id = %plugin_id, removed, "Unregistered service");
        removed
    }

    // === 调用 ===

    /// 调用目标插件的服务方法
    ///
    /// 失败时先记录调用历史，再把错误返回给调用方。
    pub async fn call_service(
        &self,
        target_plugin: &str,
        method: &str,
        from_plugin: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = ServiceCall {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            target_plugin: target_plugin.to_string(),
            method: method.to_string(),
            args: args.clone(),
            from_plugin: from_plugin.to_string(),
            timestamp: now_ns(),
            status: CallStatus::Pending,
            result: None,
            error: None,
            duration_ms: None,
        };

        let handler = match self.resolve(target_plugin, method, from_plugin) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(
                    target_plugin = %target_plugin,
                    method = %method,
                    from_plugin = %from_plugin,
                    error = %e,
                    "Service call rejected"
                );
                record.status = CallStatus::Error;
                record.error = Some(e.to_string());
                self.push_record(record);
                return Err(e);
            }
        };

        let call_id = record.id.clone();
        self.push_record(record);

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.invoke(args)).catch_unwind().await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HubError::ServiceInvocation {
                plugin: target_plugin.to_string(),
                method: method.to_string(),
                message: e.to_string(),
            }),
            Err(payload) => Err(HubError::ServiceInvocation {
                plugin: target_plugin.to_string(),
                method: method.to_string(),
                message: format!("method panicked: {}", panic_message(payload.as_ref())),
            }),
        };

        match &outcome {
            Ok(_) => debug!(
                target_plugin = %target_plugin,
                method = %method,
                from_plugin = %from_plugin,
                duration_ms,
                "Service call completed"
            ),
            Err(e) => warn!(
                target_plugin = %target_plugin,
                method = %method,
                from_plugin = %from_plugin,
                error = %e,
                "Service call failed"
            ),
        }

        self.finish_record(&call_id, &outcome, duration_ms);
        outcome
    }

    /// 权限 -> 服务 -> 方法，依次检查
    fn resolve(&self, target_plugin: &str, method: &str, from_plugin: &str) -> Result<Arc<dyn ServiceMethod>> {
        if !self.is_allowed(target_plugin, from_plugin) {
            return Err(HubError::PermissionDenied {
                caller: from_plugin.to_string(),
                target: target_plugin.to_string(),
            });
        }

        let table = self.services.get(target_plugin).ok_or_else(|| HubError::ServiceNotFound {
            plugin: target_plugin.to_string(),
        })?;

        table.get(method).ok_or_else(|| HubError::MethodNotFound {
            plugin: target_plugin.to_string(),
            method: method.to_string(),
        })
    }

    fn push_record(&self, record: ServiceCall) {
        let mut history = self.call_history.lock();
        history.push_back(record);
        while history.len() > self.config.max_call_history {
            history.pop_front();
        }
    }

    fn finish_record(&self, call_id: &str, outcome: &Result<serde_json::Value>, duration_ms: f64) {
        let mut history = self.call_history.lock();
        // 调用期间记录可能已被挤出历史或被 clear 清空
        if let Some(record) = history.iter_mut().rev().find(|c| c.id == call_id) {
            record.duration_ms = Some(duration_ms);
            match outcome {
                Ok(value) => {
                    record.status = CallStatus::Completed;
                    record.result = Some(value.clone());
                }
                Err(e) => {
                    record.status = CallStatus::Error;
                    record.error = Some(e.to_string());
                }
            }
        }
    }

    // === 只读查询 ===

    /// 所有已注册服务：插件ID -> 方法名
    pub fn get_available_services(&self) -> BTreeMap<PluginId, Vec<String>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().method_names()))
            .collect()
    }

    /// 指定插件有权调用的服务
    pub fn get_available_services_for(&self, plugin_id: &str) -> BTreeMap<PluginId, Vec<String>> {
        self.get_available_services()
            .into_iter()
            .filter(|(target, _)| self.is_allowed(target, plugin_id))
            .collect()
    }

    /// 最近的调用记录，按调用顺序排列；`None` 返回全部
    pub fn get_call_history(&self, limit: Option<usize>) -> Vec<ServiceCall> {
        let history = self.call_history.lock();
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        history.iter().skip(skip).cloned().collect()
    }

    /// 按条件过滤调用历史
    pub fn get_filtered_calls(&self, filter: &CallFilter) -> Vec<ServiceCall> {
        let history = self.call_history.lock();
        let matched: Vec<&ServiceCall> = history.iter().filter(|c| filter.matches(c)).collect();
        let skip = filter.limit.map_or(0, |limit| matched.len().saturating_sub(limit));
        matched.into_iter().skip(skip).cloned().collect()
    }

    /// 统计信息
    pub fn get_stats(&self) -> ServiceRegistryStats {
        let history = self.call_history.lock();
        let count = |status: CallStatus| history.iter().filter(|c| c.status == status).count();
        let completed_calls = count(CallStatus::Completed);
        let failed_calls = count(CallStatus::Error);
        let pending_calls = count(CallStatus::Pending);

        let finished = completed_calls + failed_calls;
        let success_rate = if finished == 0 {
            0.0
        } else {
            round2(completed_calls as f64 / finished as f64 * 100.0)
        };

        let durations: Vec<f64> = history.iter().filter_map(|c| c.duration_ms).collect();
        let average_duration_ms = if durations.is_empty() {
            0.0
        } else {
            round2(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        ServiceRegistryStats {
            registered_plugins: self.services.len(),
            total_methods: self.services.iter().map(|entry| entry.value().len()).sum(),
            permission_entries: self.permissions.len(),
            total_calls: history.len(),
            completed_calls,
            failed_calls,
            pending_calls,
            success_rate,
            average_duration_ms,
        }
    }

    /// 清空服务、权限和调用历史；调用序号继续递增
    pub fn clear(&self) {
        self.services.clear();
        self.permissions.clear();
        self.call_history.lock().clear();
        info!("Service registry cleared");
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
