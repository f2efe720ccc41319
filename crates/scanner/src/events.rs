use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::context::RequestContext;

/// Snapshot of the scanner published to subscribers and returned by status queries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub scanning: bool,
    pub last_scan: Option<SystemTime>,
    pub count: u32,
    pub folder_count: u32,
}

/// Fire-and-forget delivery of status updates.
pub trait Broker: Send + Sync {
    fn send_message(&self, ctx: &RequestContext, status: ScanStatus);
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerEvent {
    pub name: &'static str,
    pub broadcast_to_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub data: ScanStatus,
}

const EVENT_BUFFER: usize = 64;

/// In-process broker backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for EventBroker {
    fn send_message(&self, ctx: &RequestContext, status: ScanStatus) {
        let event = ServerEvent {
            name: "scanStatus",
            broadcast_to_all: ctx.broadcast_to_all(),
            user: ctx.user().map(str::to_string),
            data: status,
        };
        if self.tx.send(event).is_err() {
            debug!("No subscribers for scan status");
        }
    }
}
