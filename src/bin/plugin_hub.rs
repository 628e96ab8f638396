//! PluginHub 演示宿主
//!
//! 加载配置、签发插件能力对象、跑一轮典型的插件交互，最后输出调试快照

use anyhow::Context;
use plugin_hub::{
    generate_default_config_file, initialize, CommunicationHub, ConfigManager, Event, HubError, ServiceTable,
    StreamUpdate, PLUGIN_STATES_STREAM,
};
use serde_json::json;
use std::env;

/// 程序入口点
#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        tracing::error!("Host session failed: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.as_slice() {
        [_] => run_session(ConfigManager::new_default()).await,
        [_, command, path] if command == "init" => {
            generate_default_config_file(path)
                .await
                .with_context(|| format!("failed to write config file {}", path))?;
            println!("Wrote default configuration to {}", path);
            Ok(())
        }
        [_, path] if path != "init" => {
            let manager = ConfigManager::load_from_file(path)
                .await
                .with_context(|| format!("failed to load config file {}", path))?;
            run_session(manager).await
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// 模拟一次宿主会话
async fn run_session(manager: ConfigManager) -> anyhow::Result<()> {
    manager.validate()?;
    let config = manager.get_config();
    initialize(&config.logging)?;

    let hub = CommunicationHub::with_config(config);
    hub.initialize_system_streams();

    // 插件加载时由宿主签发能力对象
    let chat = hub.get_interface("chat");
    let ui = hub.get_interface("ui");
    let logger = hub.get_interface("logger");
    let viewer = hub.get_interface("course-viewer");

    chat.services.register(ServiceTable::new().sync_method("sendMessage", |args| {
        let text = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::generic("sendMessage expects a text argument"))?;
        Ok(json!({ "echo": text }))
    }));
    hub.set_service_permissions("chat", ["ui"]);

    let lessons = logger.events.subscribe("lesson.completed", |event: &Event| {
        tracing::info!(from = %event.from_plugin, data = %event.data, "Lesson completed");
        Ok(())
    });
    let states = logger.streams.subscribe(PLUGIN_STATES_STREAM, |update: &StreamUpdate| {
        tracing::info!(version = update.version, value = %update.value, "Plugin states changed");
        Ok(())
    })?;

    viewer.events.emit("lesson.completed", json!({ "id": 1 }));
    hub.emit_system_event("app.ready", json!({}));

    let reply = ui.services.call("chat", "sendMessage", vec![json!("hello")]).await?;
    tracing::info!(%reply, "Chat replied");
    match viewer.services.call("chat", "sendMessage", vec![json!("hi")]).await {
        Err(e) if e.is_rejection() => tracing::info!(error = %e, "Call rejected as expected"),
        Err(e) => return Err(e.into()),
        Ok(reply) => tracing::warn!(%reply, "Unpermitted call went through"),
    }

    if let Some(plugin_states) = viewer.streams.get(PLUGIN_STATES_STREAM) {
        if plugin_states.get().is_object() {
            plugin_states.update(|current| {
                with_plugin_state(current, "course-viewer", "ready").unwrap_or_else(|| current.clone())
            });
        } else {
            tracing::warn!(value = %plugin_states.get(), "plugin-states is not an object, skipping update");
        }
    }

    // 插件卸载
    lessons.unsubscribe();
    states.unsubscribe();
    hub.cleanup_plugin("chat");

    println!("{}", serde_json::to_string_pretty(&hub.get_debug_info())?);
    Ok(())
}

/// 在插件状态表中写入某个插件的状态；状态表不是对象时返回 `None`
fn with_plugin_state(states: &serde_json::Value, plugin_id: &str, state: &str) -> Option<serde_json::Value> {
    let mut next = states.as_object()?.clone();
    next.insert(plugin_id.to_string(), json!(state));
    Some(serde_json::Value::Object(next))
}

/// 打印使用说明
fn print_usage() {
    println!("PluginHub demo host");
    println!();
    println!("Usage:");
    println!("  plugin_hub                     # run with the default configuration");
    println!("  plugin_hub init <path>         # write a default config (.yaml or .toml)");
    println!("  plugin_hub <config_file>       # run with the given configuration");
}
