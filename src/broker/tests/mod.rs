mod topic;

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use super::channel::Channel;
use super::context::{Context, MetadataEvent};
use super::message::{Message, MessageId};
use crate::config::Settings;

pub(super) fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.scanner.interval_ms = 10;
    settings.scanner.refresh_interval_ms = 20;
    settings
}

pub(super) fn settings_in(dir: &Path) -> Settings {
    let mut settings = test_settings();
    settings.node.data_path = dir.to_string_lossy().into_owned();
    settings
}

pub(super) fn test_context(
    settings: Settings,
) -> (Arc<Context>, mpsc::UnboundedReceiver<MetadataEvent>) {
    let db = sled::Config::new().temporary(true).open().unwrap();
    Context::new(settings, db)
}

/// A channel with no owning topic.
pub(super) fn lone_channel(ctx: &Arc<Context>, name: &str) -> Arc<Channel> {
    Channel::new("orders", name, ctx.clone(), Weak::new()).unwrap()
}

pub(super) fn id(n: u64) -> MessageId {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(format!("{n:016x}").as_bytes());
    MessageId(raw)
}

pub(super) fn msg(n: u64) -> Arc<Message> {
    Arc::new(Message::new(id(n), format!("body-{n}")))
}

/// Poll `check` until it holds or `timeout` passes.
pub(super) async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
