//! Streaming bus for agent progress events.
//!
//! Many producers (one per event source) feed a single consumer. The
//! consumer owns the [`EventBus`]; producers hold an [`EventProducer`]
//! obtained from [`EventBus::producer`] and deregister on drop. Closing the
//! bus wakes a pending [`EventBus::recv`], which drains buffered events and
//! then yields `None` as the end-of-stream sentinel.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stage of the prompt → model → parser chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Prompt,
    Model,
    Parser,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Prompt => write!(f, "prompt"),
            NodeKind::Model => write!(f, "model"),
            NodeKind::Parser => write!(f, "parser"),
        }
    }
}

/// Typed progress signal emitted during an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    NodeStart {
        agent: String,
        node: NodeKind,
    },
    Token {
        agent: String,
        text: String,
    },
    ToolCall {
        agent: String,
        tool: String,
        input: serde_json::Value,
    },
    ToolResult {
        agent: String,
        tool: String,
        output: serde_json::Value,
    },
    /// A recoverable failure; the run continues.
    Retry {
        agent: String,
        attempt: u32,
        reason: String,
    },
    AgentComplete {
        agent: String,
        warning: Option<String>,
    },
    AgentError {
        agent: String,
        message: String,
    },
}

impl StreamEvent {
    /// Name of the agent that produced the event
    pub fn agent(&self) -> &str {
        match self {
            StreamEvent::NodeStart { agent, .. }
            | StreamEvent::Token { agent, .. }
            | StreamEvent::ToolCall { agent, .. }
            | StreamEvent::ToolResult { agent, .. }
            | StreamEvent::Retry { agent, .. }
            | StreamEvent::AgentComplete { agent, .. }
            | StreamEvent::AgentError { agent, .. } => agent,
        }
    }

    /// Whether this event ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::AgentComplete { .. } | StreamEvent::AgentError { .. }
        )
    }
}

/// Observed state of one agent run.
///
/// Only terminal events decide the outcome; retries never mark a run failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RunState {
    #[default]
    Waiting,
    Running,
    Done {
        warning: Option<String>,
    },
    Error {
        message: String,
    },
}

impl RunState {
    /// Fold an event into the state
    pub fn apply(&mut self, event: &StreamEvent) {
        if self.is_finished() {
            return;
        }
        *self = match event {
            StreamEvent::AgentComplete { warning, .. } => RunState::Done {
                warning: warning.clone(),
            },
            StreamEvent::AgentError { message, .. } => RunState::Error {
                message: message.clone(),
            },
            _ => RunState::Running,
        };
    }

    /// Whether a terminal event has been seen
    pub fn is_finished(&self) -> bool {
        matches!(self, RunState::Done { .. } | RunState::Error { .. })
    }
}

/// Receiver of runtime events.
///
/// The agent runtime only knows this interface, never the UI or transport
/// behind it.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: StreamEvent) {}
}

/// Sink that writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: StreamEvent) {
        match &event {
            StreamEvent::Token { .. } => {}
            StreamEvent::AgentError { agent, message } => {
                tracing::warn!(agent = %agent, message = %message, "Agent error")
            }
            StreamEvent::Retry {
                agent,
                attempt,
                reason,
            } => tracing::info!(agent = %agent, attempt, reason = %reason, "Agent retry"),
            other => tracing::debug!(agent = %other.agent(), event = ?other, "Agent event"),
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: StreamEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Event tagged with its producer and per-producer sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: String,
    pub seq: u64,
    pub event: StreamEvent,
}

/// Consumer side of the streaming bus.
pub struct EventBus {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    closed: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an open bus with no producers
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver,
            closed: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a producer for `source`
    pub fn producer(&self, source: impl Into<String>) -> EventProducer {
        self.active.fetch_add(1, Ordering::SeqCst);
        EventProducer {
            source: source.into(),
            sender: self.sender.clone(),
            closed: self.closed.clone(),
            active: Arc::clone(&self.active),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of producers still registered
    pub fn active_producers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Handle that can close the bus from another task
    pub fn closer(&self) -> BusCloser {
        BusCloser {
            closed: self.closed.clone(),
        }
    }

    /// Close the bus. Later calls are no-ops.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Receive the next event; `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.closed.is_cancelled() {
            return self.receiver.try_recv().ok();
        }
        tokio::select! {
            biased;
            envelope = self.receiver.recv() => envelope,
            _ = self.closed.cancelled() => self.receiver.try_recv().ok(),
        }
    }
}

/// Cloneable handle that closes an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusCloser {
    closed: CancellationToken,
}

impl BusCloser {
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Producer side of the streaming bus; deregisters on drop.
pub struct EventProducer {
    source: String,
    sender: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
    active: Arc<AtomicUsize>,
    seq: AtomicU64,
}

impl EventProducer {
    /// Source name this producer publishes under
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Publish an event; returns false if the bus is already closed.
    pub fn send(&self, event: StreamEvent) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.sender
            .send(Envelope {
                source: self.source.clone(),
                seq,
                event,
            })
            .is_ok()
    }
}

impl EventSink for EventProducer {
    fn emit(&self, event: StreamEvent) {
        self.send(event);
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn complete(agent: &str) -> StreamEvent {
        StreamEvent::AgentComplete {
            agent: agent.to_string(),
            warning: None,
        }
    }

    #[tokio::test]
    async fn test_per_producer_fifo() {
        let mut bus = EventBus::new();
        let a = bus.producer("a");
        let b = bus.producer("b");
        for i in 0..3 {
            a.send(StreamEvent::Token {
                agent: "a".into(),
                text: i.to_string(),
            });
            b.send(StreamEvent::Token {
                agent: "b".into(),
                text: i.to_string(),
            });
        }
        bus.close();

        let mut seen_a = Vec::new();
        while let Some(envelope) = bus.recv().await {
            if envelope.source == "a" {
                seen_a.push(envelope.seq);
            }
        }
        assert_eq!(seen_a, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_recv() {
        let mut bus = EventBus::new();
        let closer = bus.closer();
        let handle = tokio::spawn(async move { bus.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let mut bus = EventBus::new();
        let producer = bus.producer("late");
        bus.close();
        assert!(!producer.send(complete("late")));
        assert_eq!(bus.recv().await, None);
    }

    #[test]
    fn test_producers_deregister_on_drop() {
        let bus = EventBus::new();
        let first = bus.producer("x");
        let second = bus.producer("y");
        assert_eq!(bus.active_producers(), 2);
        drop(first);
        assert_eq!(bus.active_producers(), 1);
        drop(second);
        assert_eq!(bus.active_producers(), 0);
    }

    #[test]
    fn test_run_state_ignores_retries_and_post_terminal_events() {
        let mut state = RunState::default();
        state.apply(&StreamEvent::NodeStart {
            agent: "p".into(),
            node: NodeKind::Prompt,
        });
        assert_eq!(state, RunState::Running);
        state.apply(&StreamEvent::Retry {
            agent: "p".into(),
            attempt: 1,
            reason: "schema".into(),
        });
        assert_eq!(state, RunState::Running);
        state.apply(&StreamEvent::AgentComplete {
            agent: "p".into(),
            warning: Some("nothing found".into()),
        });
        state.apply(&StreamEvent::AgentError {
            agent: "p".into(),
            message: "late".into(),
        });
        assert_eq!(
            state,
            RunState::Done {
                warning: Some("nothing found".into())
            }
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(StreamEvent::NodeStart {
            agent: "planner".into(),
            node: NodeKind::Parser,
        })
        .unwrap();
        assert_eq!(json["type"], "node_start");
        assert_eq!(json["node"], "parser");
    }
}
