//! 插件事件总线
//!
//! 同步发布/订阅：`emit` 返回前所有订阅者都已执行完毕，同一事件类型按订阅顺序投递。
//! 事件历史为有界队列，超出容量时丢弃最旧的事件。

use super::subscription::{run_isolated, SubscriptionId, Unsubscribe};
use crate::types::{now_ns, PluginId, TimestampNs};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// 事件回调
pub type EventCallback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// 事件，创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 事件ID
    pub id: String,
    /// 发布序号，历史记录的全序
    pub sequence: u64,
    /// 事件类型
    pub event_type: String,
    /// 事件负载
    pub data: serde_json::Value,
    /// 发布者插件ID
    pub from_plugin: PluginId,
    /// 发布时间
    pub timestamp: TimestampNs,
}

/// 订阅信息快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub event_type: String,
    pub plugin_id: PluginId,
    pub once: bool,
}

/// 事件历史过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub from_plugin: Option<PluginId>,
    /// 只保留该时间戳（含）之后的事件
    pub since: Option<TimestampNs>,
    /// 最多返回最近的多少条
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn from_plugin(mut self, plugin_id: &str) -> Self {
        self.from_plugin = Some(plugin_id.to_string());
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

    fn matches(&self, event: &Event) -> bool {
        self.event_type.as_ref().map_or(true, |t| &event.event_type == t)
            && self.from_plugin.as_ref().map_or(true, |p| &event.from_plugin == p)
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// 事件总线统计信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_subscriptions: usize,
    pub event_types: usize,
    pub history_size: usize,
    pub max_history: usize,
    pub events_emitted: u64,
    pub handler_failures: u64,
    /// 当前持有订阅的插件
    pub active_plugins: Vec<PluginId>,
}

/// 事件总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// 事件历史容量
    pub max_history: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { max_history: 100 }
    }
}

#[derive(Clone)]
struct EventSubscription {
    id: SubscriptionId,
    plugin_id: PluginId,
    callback: EventCallback,
    once: bool,
    /// 取消订阅或once订阅被消费后置为false
    active: Arc<AtomicBool>,
}

struct EventBusInner {
    /// 事件类型 -> 按订阅顺序排列的订阅者
    subscriptions: RwLock<HashMap<String, Vec<EventSubscription>>>,
    history: Mutex<VecDeque<Event>>,
    sequence: AtomicU64,
    events_emitted: AtomicU64,
    handler_failures: AtomicU64,
    config: EventBusConfig,
}

impl EventBusInner {
    fn remove_subscription(&self, event_type: &str, id: SubscriptionId) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(list) = subscriptions.get_mut(event_type) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscriptions.remove(event_type);
            }
        }
    }
}

/// 插件事件总线
///
/// 克隆得到的是同一条总线的另一个句柄。
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// 使用默认配置创建事件总线
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// 使用指定配置创建事件总线
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscriptions: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(config.max_history)),
                sequence: AtomicU64::new(0),
                events_emitted: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
                config,
            }),
        }
    }

    // === 发布 ===

    /// 发布事件
    ///
    /// 永不失败：订阅者返回的错误或panic会被记录，其余订阅者照常收到事件。
    pub fn emit(&self, event_type: &str, data: serde_json::Value, from_plugin: &str) {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            event_type: event_type.to_string(),
            data,
            from_plugin: from_plugin.to_string(),
            timestamp: now_ns(),
        };

        {
            let mut history = self.inner.history.lock();
            history.push_back(event.clone());
            while history.len() > self.inner.config.max_history {
                history.pop_front();
            }
        }
        self.inner.events_emitted.fetch_add(1, Ordering::Relaxed);

        // 先取快照再释放锁，回调中可以再次进入总线。once订阅在此被认领并移出列表。
        let targets = {
            let mut subscriptions = self.inner.subscriptions.write();
            match subscriptions.get_mut(event_type) {
                Some(list) => {
                    let snapshot = list.clone();
                    list.retain(|s| !s.once);
                    if list.is_empty() {
                        subscriptions.remove(event_type);
                    }
                    snapshot
                }
                None => Vec::new(),
            }
        };

        debug!(
            event_type = %event_type,
            from_plugin = %from_plugin,
            subscribers = targets.len(),
            "Event emitted"
        );

        for subscription in &targets {
            let live = if subscription.once {
                subscription.active.swap(false, Ordering::SeqCst)
            } else {
                subscription.active.load(Ordering::SeqCst)
            };
            if !live {
                continue;
            }

            let delivered = run_isolated(&subscription.plugin_id, event_type, || {
                (subscription.callback)(&event)
            });
            if !delivered {
                self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // === 订阅 ===

    /// 订阅事件类型，返回幂等的取消订阅句柄
    pub fn subscribe<F>(&self, event_type: &str, callback: F, plugin_id: &str, once: bool) -> Unsubscribe
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        let active = Arc::new(AtomicBool::new(true));
        let subscription = EventSubscription {
            id,
            plugin_id: plugin_id.to_string(),
            callback: Arc::new(callback),
            once,
            active: active.clone(),
        };

        self.inner
            .subscriptions
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(subscription);

        debug!(
            event_type = %event_type,
            plugin_id = %plugin_id,
            subscription_id = %id,
            once,
            "Plugin subscribed to event"
        );

        let bus: Weak<EventBusInner> = Arc::downgrade(&self.inner);
        let event_type = event_type.to_string();
        Unsubscribe::new(id, move || {
            let was_active = active.swap(false, Ordering::SeqCst);
            if let Some(inner) = bus.upgrade() {
                inner.remove_subscription(&event_type, id);
            }
            was_active
        })
    }

    /// 只接收一次的订阅
    pub fn once<F>(&self, event_type: &str, callback: F, plugin_id: &str) -> Unsubscribe
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, callback, plugin_id, true)
    }

    // === 只读查询 ===

    /// 按事件类型列出当前订阅
    pub fn get_subscriptions(&self) -> BTreeMap<String, Vec<SubscriptionInfo>> {
        let subscriptions = self.inner.subscriptions.read();
        subscriptions
            .iter()
            .map(|(event_type, list)| {
                let infos = list
                    .iter()
                    .map(|s| SubscriptionInfo {
                        id: s.id,
                        event_type: event_type.clone(),
                        plugin_id: s.plugin_id.clone(),
                        once: s.once,
                    })
                    .collect();
                (event_type.clone(), infos)
            })
            .collect()
    }

    /// 最近的事件，按发布顺序排列；`None` 返回全部历史
    pub fn get_event_history(&self, limit: Option<usize>) -> Vec<Event> {
        let history = self.inner.history.lock();
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        history.iter().skip(skip).cloned().collect()
    }

    /// 按条件过滤事件历史
    pub fn get_filtered_events(&self, filter: &EventFilter) -> Vec<Event> {
        let history = self.inner.history.lock();
        let matched: Vec<&Event> = history.iter().filter(|e| filter.matches(e)).collect();
        let skip = filter.limit.map_or(0, |limit| matched.len().saturating_sub(limit));
        matched.into_iter().skip(skip).cloned().collect()
    }

    /// 统计信息
    pub fn get_stats(&self) -> EventBusStats {
        let (total_subscriptions, event_types, active_plugins) = {
            let subscriptions = self.inner.subscriptions.read();
            let plugins: BTreeSet<PluginId> = subscriptions
                .values()
                .flatten()
                .map(|s| s.plugin_id.clone())
                .collect();
            (
                subscriptions.values().map(Vec::len).sum(),
                subscriptions.len(),
                plugins.into_iter().collect(),
            )
        };

        EventBusStats {
            total_subscriptions,
            event_types,
            history_size: self.inner.history.lock().len(),
            max_history: self.inner.config.max_history,
            events_emitted: self.inner.events_emitted.load(Ordering::Relaxed),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
            active_plugins,
        }
    }

    /// 清空订阅、历史和计数器
    pub fn clear(&self) {
        {
            let mut subscriptions = self.inner.subscriptions.write();
            for subscription in subscriptions.values().flatten() {
                subscription.active.store(false, Ordering::SeqCst);
            }
            subscriptions.clear();
        }
        self.inner.history.lock().clear();
        self.inner.events_emitted.store(0, Ordering::Relaxed);
        self.inner.handler_failures.store(0, Ordering::Relaxed);
        info!("Event bus cleared");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
