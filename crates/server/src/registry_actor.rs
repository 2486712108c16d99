//! Registry actor. Owns the `SessionRegistry` and processes commands
//! sequentially.
//!
//! The registry runs as one tokio task. Connections and HTTP handlers reach
//! it through a cloneable `RegistryHandle` that sends `RegistryCommand`s
//! over a bounded mpsc channel. Lock-free reads of the session list go
//! through `ArcSwap`; observers follow changes on a broadcast channel.

use std::sync::Arc;

use agentscope_protocol::{ConnectionId, ObserverEvent, SessionList, SessionMessage};
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::ConnectionObserver;
use crate::registry::{DismissOutcome, SessionRegistry};
use crate::registry_command::RegistryCommand;

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

/// Handle to the running registry actor (cheap to Clone).
#[derive(Clone)]
pub struct RegistryHandle {
    command_tx: mpsc::Sender<RegistryCommand>,
    snapshot: Arc<ArcSwap<SessionList>>,
    events_tx: broadcast::Sender<ObserverEvent>,
}

impl RegistryHandle {
    /// Spawn the actor with an empty registry.
    pub fn spawn() -> RegistryHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionList::default()));

        tokio::spawn(registry_loop(
            SessionRegistry::new(),
            command_rx,
            snapshot.clone(),
            events_tx.clone(),
        ));

        RegistryHandle {
            command_tx,
            snapshot,
            events_tx,
        }
    }

    /// Send a command to the actor. Waits while the queue is full.
    pub async fn send(&self, cmd: RegistryCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "registry",
                event = "registry.channel_closed",
                "Registry actor gone, command dropped"
            );
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionList> {
        self.snapshot.load_full()
    }

    /// Follow registry changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.events_tx.subscribe()
    }

    pub async fn notify(&self, payload: Value) {
        self.send(RegistryCommand::Notification { payload }).await;
    }

    pub async fn dismiss(&self, id: ConnectionId) -> DismissOutcome {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Dismiss { id, reply }).await;
        rx.await.unwrap_or(DismissOutcome::NotFound)
    }

    pub async fn select(&self, id: Option<ConnectionId>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Select { id, reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn messages(&self, id: ConnectionId) -> Option<Vec<SessionMessage>> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::GetMessages { id, reply }).await;
        rx.await.ok().flatten()
    }
}

impl ConnectionObserver for RegistryHandle {
    fn on_message(&self, id: ConnectionId, text: String) -> BoxFuture<'_, ()> {
        self.send(RegistryCommand::Message { id, text }).boxed()
    }

    fn on_disconnect(&self, id: ConnectionId) -> BoxFuture<'_, ()> {
        self.send(RegistryCommand::Disconnected { id }).boxed()
    }
}

async fn registry_loop(
    mut registry: SessionRegistry,
    mut command_rx: mpsc::Receiver<RegistryCommand>,
    snapshot: Arc<ArcSwap<SessionList>>,
    events_tx: broadcast::Sender<ObserverEvent>,
) {
    let publish = |registry: &SessionRegistry, events: Vec<ObserverEvent>| {
        if events.is_empty() {
            return;
        }
        snapshot.store(Arc::new(registry.list()));
        for event in events {
            // No subscribers is fine; the snapshot stays current.
            let _ = events_tx.send(event);
        }
    };

    while let Some(cmd) = command_rx.recv().await {
        match cmd {
            RegistryCommand::Message { id, text } => {
                let events = registry.handle_message(id, &text);
                publish(&registry, events);
            }
            RegistryCommand::Disconnected { id } => {
                let events = registry.handle_disconnect(id);
                publish(&registry, events);
            }
            RegistryCommand::Notification { payload } => {
                publish(&registry, vec![ObserverEvent::Notification { payload }]);
            }
            RegistryCommand::Dismiss { id, reply } => {
                let (outcome, events) = registry.dismiss(id);
                publish(&registry, events);
                let _ = reply.send(outcome);
            }
            RegistryCommand::Select { id, reply } => {
                let known = match registry.select(id) {
                    Some(events) => {
                        publish(&registry, events);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(known);
            }
            RegistryCommand::GetMessages { id, reply } => {
                let _ = reply.send(registry.messages(id));
            }
        }
    }
    debug!(
        component = "registry",
        event = "registry.stopped",
        "Registry actor stopped"
    );
}

/// Log every observer event at debug level. Stands in for a UI when the
/// server runs headless.
pub fn spawn_event_log(mut rx: broadcast::Receiver<ObserverEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    debug!(
                        component = "observer",
                        event = "observer.event",
                        payload = %serde_json::to_string(&event).unwrap_or_default(),
                        "Registry event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "observer",
                        event = "observer.lagged",
                        skipped = skipped,
                        "Event log fell behind"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
