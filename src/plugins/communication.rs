//! 跨插件通信中心
//!
//! 组合事件总线、服务注册表和数据流存储，为每个插件签发绑定了插件ID的能力对象。
//! 插件代码只通过 `PluginInterface` 与通信层交互，由宿主显式传入，不存在全局单例。

use super::data_stream::{DataStream, DataStreamStats, DataStreamStore, StreamInfo, StreamUpdate};
use super::service_registry::{ServiceCall, ServiceRegistry, ServiceRegistryStats, ServiceTable};
use crate::config::{HubConfig, SystemStreamsConfig};
use crate::core::{Event, EventBus, EventBusStats, SubscriptionInfo, Unsubscribe};
use crate::types::{PluginId, SYSTEM_PLUGIN_ID};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// 当前用户
pub const CURRENT_USER_STREAM: &str = "current-user";
/// 应用设置
pub const APP_SETTINGS_STREAM: &str = "app-settings";
/// 各插件状态
pub const PLUGIN_STATES_STREAM: &str = "plugin-states";

/// 调试快照中保留的最近事件/调用数量
const DEBUG_RECENT_LIMIT: usize = 10;

/// 通信中心统计信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub events: EventBusStats,
    pub services: ServiceRegistryStats,
    pub streams: DataStreamStats,
}

/// 调试快照，只读且可序列化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub subscriptions: BTreeMap<String, Vec<SubscriptionInfo>>,
    pub recent_events: Vec<Event>,
    pub recent_calls: Vec<ServiceCall>,
    pub available_services: BTreeMap<PluginId, Vec<String>>,
    pub active_streams: Vec<StreamInfo>,
    pub stream_subscribers: BTreeMap<String, Vec<PluginId>>,
    pub stats: HubStats,
}

/// 跨插件通信中心
#[derive(Clone)]
pub struct CommunicationHub {
    event_bus: EventBus,
    service_registry: ServiceRegistry,
    streams: DataStreamStore,
    system_streams: SystemStreamsConfig,
}

impl CommunicationHub {
    /// 使用默认配置创建通信中心
    pub fn new() -> Self {
        Self::with_config(&HubConfig::default())
    }

    /// 使用指定配置创建通信中心
    pub fn with_config(config: &HubConfig) -> Self {
        Self {
            event_bus: EventBus::with_config(config.event_bus.clone()),
            service_registry: ServiceRegistry::with_config(config.service_registry.clone()),
            streams: DataStreamStore::new(),
            system_streams: config.system_streams.clone(),
        }
    }

    /// 为插件签发能力对象
    pub fn get_interface(&self, plugin_id: &str) -> PluginInterface {
        PluginInterface {
            plugin_id: plugin_id.to_string(),
            events: PluginEvents {
                plugin_id: plugin_id.to_string(),
                bus: self.event_bus.clone(),
            },
            services: PluginServices {
                plugin_id: plugin_id.to_string(),
                registry: self.service_registry.clone(),
            },
            streams: PluginStreams {
                plugin_id: plugin_id.to_string(),
                store: self.streams.clone(),
            },
        }
    }

    // === 宿主操作 ===

    /// 设置插件服务的调用权限
    pub fn set_service_permissions<I, S>(&self, plugin_id: &str, allowed_callers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<PluginId>,
    {
        self.service_registry.set_permissions(plugin_id, allowed_callers);
    }

    /// 以 "system" 身份发布事件
    pub fn emit_system_event(&self, event_type: &str, data: serde_json::Value) {
        self.event_bus.emit(event_type, data, SYSTEM_PLUGIN_ID);
    }

    /// 创建（或获取已有的）系统数据流
    pub fn create_system_stream(&self, id: &str, initial: serde_json::Value) -> DataStream {
        self.streams.get_or_create_stream(id, initial, SYSTEM_PLUGIN_ID)
    }

    /// 初始化系统数据流：当前用户、应用设置、插件状态
    pub fn initialize_system_streams(&self) {
        self.create_system_stream(CURRENT_USER_STREAM, serde_json::Value::Null);
        self.create_system_stream(APP_SETTINGS_STREAM, self.system_streams.app_settings.clone());
        self.create_system_stream(PLUGIN_STATES_STREAM, serde_json::json!({}));
        info!("System streams initialized");
    }

    /// 插件卸载：只注销其服务
    ///
    /// 该插件的事件订阅和数据流订阅不会被移除，需要插件各自调用取消订阅句柄。
    pub fn cleanup_plugin(&self, plugin_id: &str) {
        self.service_registry.unregister(plugin_id);
        info!(plugin_id = %plugin_id, "Plugin cleaned up");
    }

    /// 重置全部状态
    pub fn clear(&self) {
        self.event_bus.clear();
        self.service_registry.clear();
        self.streams.clear();
        info!("Communication hub cleared");
    }

    // === 诊断 ===

    /// 跨三个组件的调试快照
    pub fn get_debug_info(&self) -> DebugInfo {
        DebugInfo {
            subscriptions: self.event_bus.get_subscriptions(),
            recent_events: self.event_bus.get_event_history(Some(DEBUG_RECENT_LIMIT)),
            recent_calls: self.service_registry.get_call_history(Some(DEBUG_RECENT_LIMIT)),
            available_services: self.service_registry.get_available_services(),
            active_streams: self.streams.get_active_streams(),
            stream_subscribers: self.streams.get_all_subscribers(),
            stats: self.get_stats(),
        }
    }

    pub fn get_stats(&self) -> HubStats {
        HubStats {
            events: self.event_bus.get_stats(),
            services: self.service_registry.get_stats(),
            streams: self.streams.get_stats(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn service_registry(&self) -> &ServiceRegistry {
        &self.service_registry
    }

    pub fn stream_store(&self) -> &DataStreamStore {
        &self.streams
    }
}

impl Default for CommunicationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 插件能力对象
#[derive(Clone)]
pub struct PluginInterface {
    plugin_id: PluginId,
    pub events: PluginEvents,
    pub services: PluginServices,
    pub streams: PluginStreams,
}

impl PluginInterface {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

/// 事件能力
#[derive(Clone)]
pub struct PluginEvents {
    plugin_id: PluginId,
    bus: EventBus,
}

impl PluginEvents {
    pub fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.bus.emit(event_type, data, &self.plugin_id);
    }

    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(event_type, callback, &self.plugin_id, false)
    }

    pub fn once<F>(&self, event_type: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.once(event_type, callback, &self.plugin_id)
    }
}

/// 服务能力
#[derive(Clone)]
pub struct PluginServices {
    plugin_id: PluginId,
    registry: ServiceRegistry,
}

impl PluginServices {
    /// 调用其他插件的服务
    pub async fn call(&self, target_plugin: &str, method: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        self.registry
            .call_service(target_plugin, method, &self.plugin_id, args)
            .await
    }

    /// 注册本插件的服务
    pub fn register(&self, table: ServiceTable) {
        self.registry.register_service(&self.plugin_id, table);
    }

    /// 本插件有权调用的服务
    pub fn get_available(&self) -> BTreeMap<PluginId, Vec<String>> {
        self.registry.get_available_services_for(&self.plugin_id)
    }
}

/// 数据流能力
#[derive(Clone)]
pub struct PluginStreams {
    plugin_id: PluginId,
    store: DataStreamStore,
}

impl PluginStreams {
    pub fn get(&self, id: &str) -> Option<DataStream> {
        self.store.get_stream(id)
    }

    pub fn create(&self, id: &str, initial: serde_json::Value) -> Result<DataStream> {
        self.store.create_stream(id, initial, &self.plugin_id)
    }

    pub fn get_or_create(&self, id: &str, initial: serde_json::Value) -> DataStream {
        self.store.get_or_create_stream(id, initial, &self.plugin_id)
    }

    pub fn subscribe<F>(&self, id: &str, callback: F) -> Result<Unsubscribe>
    where
        F: Fn(&StreamUpdate) -> Result<()> + Send + Sync + 'static,
    {
        self.store.subscribe_to_stream(id, callback, &self.plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::CallStatus;
    use crate::HubError;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_chat_permission_scenario() {
        let hub = CommunicationHub::new();
        let chat = hub.get_interface("chat");
        chat.services.register(
            ServiceTable::new().sync_method("sendMessage", |args| Ok(json!({ "delivered": args.len() }))),
        );
        hub.set_service_permissions("chat", ["ui"]);

        let ui = hub.get_interface("ui");
        let other = hub.get_interface("other");

        let ok = ui.services.call("chat", "sendMessage", vec![json!("hi")]).await.unwrap();
        assert_eq!(ok, json!({"delivered": 1}));

        let denied = other.services.call("chat", "sendMessage", vec![json!("hi")]).await;
        assert!(matches!(denied, Err(HubError::PermissionDenied { .. })));

        let last = hub.service_registry().get_call_history(Some(1));
        assert_eq!(last[0].status, CallStatus::Error);
        assert_eq!(last[0].from_plugin, "other");

        assert!(ui.services.get_available().contains_key("chat"));
        assert!(!other.services.get_available().contains_key("chat"));
    }

    #[test]
    fn test_lesson_completed_scenario() {
        let hub = CommunicationHub::new();
        let logger = hub.get_interface("logger");
        let viewer = hub.get_interface("course-viewer");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        logger.events.subscribe("lesson.completed", move |event: &Event| {
            sink.lock().push((event.data.clone(), event.from_plugin.clone()));
            Ok(())
        });

        viewer.events.emit("lesson.completed", json!({"id": 1}));

        assert_eq!(
            *received.lock(),
            vec![(json!({"id": 1}), "course-viewer".to_string())]
        );
        let history = hub.event_bus().get_event_history(Some(1));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "lesson.completed");
        assert_eq!(history[0].data, json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_cleanup_plugin_only_unregisters_services() {
        let hub = CommunicationHub::new();
        let chat = hub.get_interface("chat");
        let notes = hub.get_interface("notes");
        chat.services.register(ServiceTable::new().sync_method("ping", |_| Ok(json!("pong"))));
        notes.services.register(ServiceTable::new().sync_method("ping", |_| Ok(json!("pong"))));
        chat.events.subscribe("tick", |_: &Event| Ok(()));
        notes.streams.get_or_create("draft", json!(""));
        chat.streams.subscribe("draft", |_: &StreamUpdate| Ok(())).unwrap();

        hub.cleanup_plugin("chat");

        let ui = hub.get_interface("ui");
        assert!(matches!(
            ui.services.call("chat", "ping", vec![]).await,
            Err(HubError::ServiceNotFound { .. })
        ));
        assert_eq!(ui.services.call("notes", "ping", vec![]).await.unwrap(), json!("pong"));

        // 订阅仍然保留
        assert_eq!(hub.event_bus().get_stats().active_plugins, vec!["chat".to_string()]);
        assert_eq!(hub.stream_store().get_all_subscribers()["draft"], vec!["chat".to_string()]);
    }

    #[test]
    fn test_streams_through_facade_share_state() {
        let hub = CommunicationHub::new();
        let editor = hub.get_interface("editor");
        let preview = hub.get_interface("preview");

        let draft = editor.streams.create("draft", json!("v1")).unwrap();
        assert_eq!(draft.owner(), "editor");
        assert!(preview.streams.create("draft", json!("v0")).is_err());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        preview
            .streams
            .subscribe("draft", move |update: &StreamUpdate| {
                sink.lock().push(update.value.clone());
                Ok(())
            })
            .unwrap();

        let same = preview.streams.get_or_create("draft", json!("ignored"));
        same.set(json!("v2"));

        assert_eq!(draft.get(), json!("v2"));
        assert_eq!(*seen.lock(), vec![json!("v2")]);
        assert!(preview.streams.get("missing").is_none());
    }

    #[test]
    fn test_system_streams_and_events() {
        let hub = CommunicationHub::new();
        hub.initialize_system_streams();
        hub.initialize_system_streams();

        let streams = hub.stream_store().get_active_streams();
        let ids: Vec<&str> = streams.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![APP_SETTINGS_STREAM, CURRENT_USER_STREAM, PLUGIN_STATES_STREAM]);
        assert!(streams.iter().all(|s| s.owner_plugin == SYSTEM_PLUGIN_ID));

        let user = hub.get_interface("auth").streams.get(CURRENT_USER_STREAM).unwrap();
        assert_eq!(user.get(), serde_json::Value::Null);

        hub.emit_system_event("app.ready", json!({}));
        assert_eq!(hub.event_bus().get_event_history(Some(1))[0].from_plugin, SYSTEM_PLUGIN_ID);
    }

    #[tokio::test]
    async fn test_service_method_can_reenter_hub() {
        let hub = CommunicationHub::new();
        let progress = hub.get_interface("progress");
        let emitter = progress.clone();
        progress.services.register(ServiceTable::new().method("complete", move |args| {
            let emitter = emitter.clone();
            async move {
                emitter.events.emit("lesson.completed", args.first().cloned().unwrap_or_default());
                emitter.streams.get_or_create("completed-count", json!(0)).update(|v| json!(v.as_i64().unwrap_or(0) + 1));
                Ok::<_, HubError>(json!(true))
            }
        }));

        let viewer = hub.get_interface("course-viewer");
        assert_eq!(viewer.services.call("progress", "complete", vec![json!({"id": 3})]).await.unwrap(), json!(true));

        let events = hub.event_bus().get_event_history(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_plugin, "progress");
        assert_eq!(hub.stream_store().get_stream("completed-count").unwrap().get(), json!(1));
    }

    #[tokio::test]
    async fn test_debug_info_snapshot_and_clear() {
        let hub = CommunicationHub::new();
        hub.initialize_system_streams();
        let chat = hub.get_interface("chat");
        chat.services.register(ServiceTable::new().sync_method("ping", |_| Ok(json!("pong"))));
        chat.events.subscribe("tick", |_: &Event| Ok(()));
        for i in 0..15 {
            hub.emit_system_event("tick", json!(i));
        }
        hub.get_interface("ui").services.call("chat", "ping", vec![]).await.unwrap();

        let info = hub.get_debug_info();
        assert_eq!(info.recent_events.len(), 10);
        assert_eq!(info.recent_calls.len(), 1);
        assert_eq!(info.subscriptions["tick"].len(), 1);
        assert_eq!(info.active_streams.len(), 3);
        assert_eq!(info.stats.services.success_rate, 100.0);
        assert_eq!(info.stats.events.events_emitted, 15);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["recent_calls"][0]["status"], json!("completed"));

        hub.clear();
        let info = hub.get_debug_info();
        assert!(info.subscriptions.is_empty());
        assert!(info.recent_events.is_empty());
        assert!(info.recent_calls.is_empty());
        assert!(info.active_streams.is_empty());
        assert!(info.available_services.is_empty());
    }

    #[test]
    fn test_with_config_applies_caps_and_settings() {
        let mut config = HubConfig::default();
        config.event_bus.max_history = 2;
        config.system_streams.app_settings = json!({"theme": "dark"});
        let hub = CommunicationHub::with_config(&config);

        for i in 0..5 {
            hub.emit_system_event("tick", json!(i));
        }
        assert_eq!(hub.event_bus().get_event_history(None).len(), 2);

        hub.initialize_system_streams();
        let settings = hub.stream_store().get_stream(APP_SETTINGS_STREAM).unwrap();
        assert_eq!(settings.get(), json!({"theme": "dark"}));
    }
}
