//! 共享数据流
//!
//! 命名的可变值容器，用于插件间共享状态。值通过 `set`/`update` 改变时同步通知所有订阅者。

use crate::core::subscription::{run_isolated, SubscriptionId, Unsubscribe};
use crate::types::PluginId;
use crate::{HubError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// 数据流回调
pub type StreamCallback = Arc<dyn Fn(&StreamUpdate) -> Result<()> + Send + Sync>;

/// 数据流变更通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub stream_id: String,
    pub value: serde_json::Value,
    pub previous: serde_json::Value,
    /// 变更后的版本号，初始值为版本0
    pub version: u64,
}

/// 数据流快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub owner_plugin: PluginId,
    pub value: serde_json::Value,
    pub version: u64,
    pub subscriber_count: usize,
}

/// 数据流存储统计信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStreamStats {
    pub total_streams: usize,
    pub total_subscribers: usize,
    /// 各插件拥有的数据流数量
    pub streams_by_owner: BTreeMap<PluginId, usize>,
}

#[derive(Clone)]
struct StreamSubscriber {
    id: SubscriptionId,
    plugin_id: PluginId,
    callback: StreamCallback,
    active: Arc<AtomicBool>,
}

struct StreamState {
    value: serde_json::Value,
    version: u64,
}

struct DataStreamInner {
    id: String,
    owner: PluginId,
    state: RwLock<StreamState>,
    subscribers: RwLock<Vec<StreamSubscriber>>,
}

/// 数据流句柄
///
/// 同一ID的所有句柄共享同一个值。
#[derive(Clone)]
pub struct DataStream {
    inner: Arc<DataStreamInner>,
}

impl DataStream {
    fn new(id: &str, initial: serde_json::Value, owner: &str) -> Self {
        Self {
            inner: Arc::new(DataStreamInner {
                id: id.to_string(),
                owner: owner.to_string(),
                state: RwLock::new(StreamState {
                    value: initial,
                    version: 0,
                }),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// 创建该数据流的插件
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// 当前值
    pub fn get(&self) -> serde_json::Value {
        self.inner.state.read().value.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// 设置新值并通知订阅者
    pub fn set(&self, value: serde_json::Value) {
        let update = {
            let mut state = self.inner.state.write();
            let previous = std::mem::replace(&mut state.value, value.clone());
            state.version += 1;
            StreamUpdate {
                stream_id: self.inner.id.clone(),
                value,
                previous,
                version: state.version,
            }
        };
        self.notify(&update);
    }

    /// 基于当前值计算新值并通知订阅者
    ///
    /// `f` 在锁外执行，可以读取同一个数据流。若执行期间数据流被其他写入修改，
    /// 会基于新值重新调用 `f`。
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(&serde_json::Value) -> serde_json::Value,
    {
        let update = loop {
            let (current, seen) = {
                let state = self.inner.state.read();
                (state.value.clone(), state.version)
            };
            let value = f(&current);

            let mut state = self.inner.state.write();
            if state.version != seen {
                continue;
            }
            let previous = std::mem::replace(&mut state.value, value.clone());
            state.version += 1;
            break StreamUpdate {
                stream_id: self.inner.id.clone(),
                value,
                previous,
                version: state.version,
            };
        };
        self.notify(&update);
    }

    /// 订阅值变更，返回幂等的取消订阅句柄
    pub fn subscribe<F>(&self, callback: F, plugin_id: &str) -> Unsubscribe
    where
        F: Fn(&StreamUpdate) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        let active = Arc::new(AtomicBool::new(true));
        self.inner.subscribers.write().push(StreamSubscriber {
            id,
            plugin_id: plugin_id.to_string(),
            callback: Arc::new(callback),
            active: active.clone(),
        });

        debug!(stream_id = %self.inner.id, plugin_id = %plugin_id, subscription_id = %id, "Plugin subscribed to stream");

        let stream: Weak<DataStreamInner> = Arc::downgrade(&self.inner);
        Unsubscribe::new(id, move || {
            let was_active = active.swap(false, Ordering::SeqCst);
            if let Some(inner) = stream.upgrade() {
                inner.subscribers.write().retain(|s| s.id != id);
            }
            was_active
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// 订阅者插件ID，按订阅顺序
    pub fn subscriber_plugins(&self) -> Vec<PluginId> {
        self.inner
            .subscribers
            .read()
            .iter()
            .map(|s| s.plugin_id.clone())
            .collect()
    }

    /// 两个句柄是否指向同一个数据流
    pub fn ptr_eq(&self, other: &DataStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn info(&self) -> StreamInfo {
        let state = self.inner.state.read();
        StreamInfo {
            id: self.inner.id.clone(),
            owner_plugin: self.inner.owner.clone(),
            value: state.value.clone(),
            version: state.version,
            subscriber_count: self.subscriber_count(),
        }
    }

    fn notify(&self, update: &StreamUpdate) {
        let targets = self.inner.subscribers.read().clone();
        debug!(stream_id = %self.inner.id, version = update.version, subscribers = targets.len(), "Stream updated");

        for subscriber in &targets {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            run_isolated(&subscriber.plugin_id, &self.inner.id, || (subscriber.callback)(update));
        }
    }

    /// 停用并移除所有订阅者
    fn close(&self) {
        let mut subscribers = self.inner.subscribers.write();
        for subscriber in subscribers.iter() {
            subscriber.active.store(false, Ordering::SeqCst);
        }
        subscribers.clear();
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("version", &self.version())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// 数据流存储
#[derive(Clone, Default)]
pub struct DataStreamStore {
    streams: Arc<RwLock<BTreeMap<String, DataStream>>>,
}

impl DataStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建数据流，ID已存在时返回错误
    pub fn create_stream(&self, id: &str, initial: serde_json::Value, owner_plugin: &str) -> Result<DataStream> {
        let mut streams = self.streams.write();
        if streams.contains_key(id) {
            return Err(HubError::StreamAlreadyExists { id: id.to_string() });
        }

        let stream = DataStream::new(id, initial, owner_plugin);
        streams.insert(id.to_string(), stream.clone());
        debug!(stream_id = %id, owner = %owner_plugin, "Created stream");
        Ok(stream)
    }

    /// 获取已有数据流，不存在时以 `initial` 创建
    pub fn get_or_create_stream(&self, id: &str, initial: serde_json::Value, owner_plugin: &str) -> DataStream {
        let mut streams = self.streams.write();
        streams
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(stream_id = %id, owner = %owner_plugin, "Created stream");
                DataStream::new(id, initial, owner_plugin)
            })
            .clone()
    }

    pub fn get_stream(&self, id: &str) -> Option<DataStream> {
        self.streams.read().get(id).cloned()
    }

    /// 订阅指定数据流
    pub fn subscribe_to_stream<F>(&self, id: &str, callback: F, plugin_id: &str) -> Result<Unsubscribe>
    where
        F: Fn(&StreamUpdate) -> Result<()> + Send + Sync + 'static,
    {
        let stream = self
            .get_stream(id)
            .ok_or_else(|| HubError::StreamNotFound { id: id.to_string() })?;
        Ok(stream.subscribe(callback, plugin_id))
    }

    /// 所有数据流的快照，按ID排序
    pub fn get_active_streams(&self) -> Vec<StreamInfo> {
        self.streams.read().values().map(DataStream::info).collect()
    }

    /// 数据流ID -> 订阅者插件ID
    pub fn get_all_subscribers(&self) -> BTreeMap<String, Vec<PluginId>> {
        self.streams
            .read()
            .iter()
            .map(|(id, stream)| (id.clone(), stream.subscriber_plugins()))
            .collect()
    }

    pub fn get_stats(&self) -> DataStreamStats {
        let streams = self.streams.read();
        let mut streams_by_owner = BTreeMap::new();
        for stream in streams.values() {
            *streams_by_owner.entry(stream.owner().to_string()).or_insert(0) += 1;
        }

        DataStreamStats {
            total_streams: streams.len(),
            total_subscribers: streams.values().map(DataStream::subscriber_count).sum(),
            streams_by_owner,
        }
    }

    /// 移除所有数据流并停用其订阅者
    pub fn clear(&self) {
        let removed: Vec<DataStream> = {
            let mut streams = self.streams.write();
            std::mem::take(&mut *streams).into_values().collect()
        };
        for stream in &removed {
            stream.close();
        }
        info!(streams = removed.len(), "Data stream store cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_create_rejects_existing_id() {
        let store = DataStreamStore::new();
        store.create_stream("theme", json!("light"), "settings").unwrap();

        let duplicate = store.create_stream("theme", json!("dark"), "other");
        assert!(matches!(duplicate, Err(HubError::StreamAlreadyExists { .. })));
        assert_eq!(store.get_stream("theme").unwrap().get(), json!("light"));
    }

    #[test]
    fn test_get_or_create_shares_value() {
        let store = DataStreamStore::new();
        let first = store.get_or_create_stream("counter", json!(0), "a");
        let second = store.get_or_create_stream("counter", json!(100), "b");

        assert!(first.ptr_eq(&second));
        assert_eq!(second.get(), json!(0));
        assert_eq!(second.owner(), "a");

        first.set(json!(5));
        assert_eq!(second.get(), json!(5));
        assert_eq!(second.version(), 1);
    }

    #[test]
    fn test_get_stream_missing() {
        let store = DataStreamStore::new();
        assert!(store.get_stream("nothing").is_none());
        assert!(matches!(
            store.subscribe_to_stream("nothing", |_: &StreamUpdate| Ok(()), "p"),
            Err(HubError::StreamNotFound { .. })
        ));
    }

    #[test]
    fn test_subscribers_notified_on_set_and_update() {
        let store = DataStreamStore::new();
        let stream = store.create_stream("counter", json!(1), "owner").unwrap();
        let updates = Arc::new(Mutex::new(Vec::new()));

        let sink = updates.clone();
        let handle = store
            .subscribe_to_stream(
                "counter",
                move |update: &StreamUpdate| {
                    sink.lock().push(update.clone());
                    Ok(())
                },
                "viewer",
            )
            .unwrap();

        stream.set(json!(2));
        stream.update(|current| json!(current.as_i64().unwrap_or(0) * 10));

        {
            let updates = updates.lock();
            assert_eq!(updates.len(), 2);
            assert_eq!(updates[0].previous, json!(1));
            assert_eq!(updates[0].value, json!(2));
            assert_eq!(updates[1].value, json!(20));
            assert_eq!(updates[1].version, 2);
        }

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        stream.set(json!(3));
        assert_eq!(updates.lock().len(), 2);
    }

    #[test]
    fn test_update_closure_can_read_same_stream() {
        let store = DataStreamStore::new();
        let stream = store.create_stream("score", json!(4), "game").unwrap();
        let reader = store.get_stream("score").unwrap();

        stream.update(|current| {
            let seen = reader.get().as_i64().unwrap_or(0);
            json!(current.as_i64().unwrap_or(0) + seen + reader.version() as i64)
        });

        assert_eq!(stream.get(), json!(8));
        assert_eq!(stream.version(), 1);
    }

    #[test]
    fn test_update_recomputes_after_concurrent_write() {
        let store = DataStreamStore::new();
        let stream = store.create_stream("score", json!(1), "game").unwrap();
        let writer = stream.clone();
        let mut runs = 0;

        stream.update(|current| {
            runs += 1;
            if runs == 1 {
                writer.set(json!(100));
            }
            json!(current.as_i64().unwrap_or(0) + 1)
        });

        assert_eq!(runs, 2);
        assert_eq!(stream.get(), json!(101));
        assert_eq!(stream.version(), 2);
    }

    #[test]
    fn test_failing_stream_subscriber_is_isolated() {
        let store = DataStreamStore::new();
        let stream = store.create_stream("doc", json!({}), "editor").unwrap();
        stream.subscribe(|_: &StreamUpdate| Err(HubError::subscriber("nope")), "bad");
        stream.subscribe(|_: &StreamUpdate| panic!("render crashed"), "worse");

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        stream.subscribe(
            move |update: &StreamUpdate| {
                *sink.lock() = Some(update.value.clone());
                Ok(())
            },
            "good",
        );

        stream.set(json!({"title": "Intro"}));
        assert_eq!(*seen.lock(), Some(json!({"title": "Intro"})));
    }

    #[test]
    fn test_introspection_and_clear() {
        let store = DataStreamStore::new();
        let a = store.create_stream("a", json!(1), "p1").unwrap();
        store.create_stream("b", json!(2), "p1").unwrap();
        store.create_stream("c", json!(3), "p2").unwrap();
        a.subscribe(|_: &StreamUpdate| Ok(()), "viewer");
        a.subscribe(|_: &StreamUpdate| Ok(()), "logger");

        let active = store.get_active_streams();
        assert_eq!(active.len(), 3);
        assert_eq!(active[0].id, "a");
        assert_eq!(active[0].subscriber_count, 2);

        let subscribers = store.get_all_subscribers();
        assert_eq!(subscribers["a"], vec!["viewer".to_string(), "logger".to_string()]);
        assert!(subscribers["b"].is_empty());

        let stats = store.get_stats();
        assert_eq!(stats.total_streams, 3);
        assert_eq!(stats.total_subscribers, 2);
        assert_eq!(stats.streams_by_owner["p1"], 2);

        store.clear();
        assert!(store.get_active_streams().is_empty());
        assert_eq!(a.subscriber_count(), 0);
    }
}
