use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::{
    models::{DeploymentEvent, EventType},
    store::SqliteStore,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Receives deployment events. Delivery is fire-and-forget: a sink never fails the caller.
pub trait EventSink: Send + Sync {
    /// Records an event.
    fn log_event(&self, event: DeploymentEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DeploymentEvent>>,
}

/// Persists events to SQLite from a background task.
#[derive(Debug, Clone)]
pub struct SqliteEventSink {
    tx: mpsc::UnboundedSender<DeploymentEvent>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RecordingEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<DeploymentEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// The types of every event recorded so far.
    pub fn event_types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl SqliteEventSink {
    /// Spawns the writer task on the current runtime.
    pub fn spawn(store: SqliteStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeploymentEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = store.save_event(&event).await {
                    tracing::error!(range_id = %event.range_id, error = %e, "failed to persist event");
                }
            }
        });

        Self { tx }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl EventSink for TracingEventSink {
    fn log_event(&self, event: DeploymentEvent) {
        match event.event_type {
            EventType::DeploymentFailed | EventType::RouterError | EventType::NetworkError | EventType::VmError => {
                tracing::warn!(
                    range_id = %event.range_id,
                    vm_id = ?event.vm_id,
                    event = %event.event_type,
                    "{}",
                    event.message
                )
            }
            _ => tracing::info!(
                range_id = %event.range_id,
                vm_id = ?event.vm_id,
                event = %event.event_type,
                "{}",
                event.message
            ),
        }
    }
}

impl EventSink for RecordingEventSink {
    fn log_event(&self, event: DeploymentEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventSink for SqliteEventSink {
    fn log_event(&self, event: DeploymentEvent) {
        TracingEventSink.log_event(event.clone());
        if self.tx.send(event).is_err() {
            tracing::warn!("event writer has stopped");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
