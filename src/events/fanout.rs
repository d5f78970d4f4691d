//! Long-lived event subscriptions with replay, resume, and heartbeats.
//!
//! A subscription is a forwarder task feeding a bounded outbound queue. The
//! task subscribes to live appends *before* snapshotting the tail, replays
//! the backlog, then follows live events, deduplicating by cursor — so a
//! subscriber observes one gap-free, strictly increasing `seq` sequence
//! across replay + live. A subscriber whose queue fills up is dropped (the
//! log is unaffected; reconnect + resume recovers).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::events::Event;
use crate::store::{RunStore, StoreError};

/// How a subscriber positions itself in the log.
///
/// Resume point: the max of `from_id` and `last_event_id` when either is
/// present; otherwise `tail − replay` when `replay` is set; otherwise the
/// current tail (live-only).
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeOptions {
    /// Replay the last N events.
    pub replay: Option<u64>,
    /// Resume after this seq (query parameter).
    pub from_id: Option<u64>,
    /// Resume after this seq (protocol-level `Last-Event-ID`).
    pub last_event_id: Option<u64>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_replay(mut self, n: u64) -> Self {
        self.replay = Some(n);
        self
    }

    #[must_use]
    pub fn with_from_id(mut self, seq: u64) -> Self {
        self.from_id = Some(seq);
        self
    }

    #[must_use]
    pub fn with_last_event_id(mut self, seq: u64) -> Self {
        self.last_event_id = Some(seq);
        self
    }

    pub(crate) fn resume_from(&self, tail: u64) -> u64 {
        match (self.from_id, self.last_event_id) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => match self.replay {
                Some(n) => tail.saturating_sub(n),
                None => tail,
            },
        }
    }
}

/// One frame delivered to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamFrame {
    /// Connection greeting; carries no SSE id.
    Hello {
        run_id: String,
        server_time: DateTime<Utc>,
    },
    /// A committed log event; its `seq` becomes the SSE id.
    Event(Event),
    /// Idle keepalive, rendered as an SSE comment.
    Heartbeat,
}

/// Handle to a live subscription.
pub struct EventSubscription {
    rx: flume::Receiver<StreamFrame>,
}

impl EventSubscription {
    /// Next frame, or `None` once the subscription ends (disconnect, drop,
    /// or store shutdown).
    pub async fn next_frame(&self) -> Option<StreamFrame> {
        self.rx.recv_async().await.ok()
    }

    /// Adapt into an async stream (plugs straight into SSE responders).
    pub fn into_stream(self) -> BoxStream<'static, StreamFrame> {
        self.rx.into_stream().boxed()
    }
}

/// Multiplexes a run's event log to any number of subscribers.
pub struct EventFanout {
    store: Arc<dyn RunStore>,
    heartbeat_interval: Duration,
    subscriber_buffer: usize,
}

impl EventFanout {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            heartbeat_interval: Duration::from_secs(10),
            subscriber_buffer: 256,
        }
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer.max(1);
        self
    }

    /// Attach a subscriber to `run_id`'s event stream.
    pub async fn subscribe(
        &self,
        run_id: &str,
        options: SubscribeOptions,
    ) -> Result<EventSubscription, StoreError> {
        // Live first, tail second: anything appended in between shows up in
        // both and is deduplicated by the cursor.
        let live = self.store.subscribe_events(run_id).await?;
        let tail = self.store.tail_seq(run_id).await?;
        let resume_from = options.resume_from(tail);
        let backlog = self.store.events_since(run_id, resume_from).await?;

        let (tx, rx) = flume::bounded(self.subscriber_buffer);
        let forwarder = Forwarder {
            store: Arc::clone(&self.store),
            run_id: run_id.to_string(),
            live,
            tx,
            cursor: resume_from,
            heartbeat_interval: self.heartbeat_interval,
        };
        tokio::spawn(forwarder.run(backlog));
        Ok(EventSubscription { rx })
    }
}

struct Forwarder {
    store: Arc<dyn RunStore>,
    run_id: String,
    live: broadcast::Receiver<Event>,
    tx: flume::Sender<StreamFrame>,
    cursor: u64,
    heartbeat_interval: Duration,
}

enum ForwardEnd {
    Disconnected,
    Backpressure,
}

impl Forwarder {
    async fn run(mut self, backlog: Vec<Event>) {
        if self
            .forward(StreamFrame::Hello {
                run_id: self.run_id.clone(),
                server_time: Utc::now(),
            })
            .is_err()
        {
            return;
        }

        for event in backlog {
            if event.seq <= self.cursor {
                continue;
            }
            self.cursor = event.seq;
            if self.forward(StreamFrame::Event(event)).is_err() {
                return;
            }
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // The first tick completes immediately; swallow it.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                received = self.live.recv() => match received {
                    Ok(event) => {
                        if event.seq <= self.cursor {
                            continue;
                        }
                        if event.seq > self.cursor + 1 {
                            if self.catch_up().await.is_err() {
                                return;
                            }
                            if event.seq <= self.cursor {
                                continue;
                            }
                        }
                        self.cursor = event.seq;
                        if self.forward(StreamFrame::Event(event)).is_err() {
                            return;
                        }
                        heartbeat.reset();
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(
                            target: "runloom::fanout",
                            run_id = %self.run_id,
                            missed,
                            "subscriber lagged the live channel; catching up from the log"
                        );
                        if self.catch_up().await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = heartbeat.tick() => {
                    if self.forward(StreamFrame::Heartbeat).is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Refill from the log after missing live notifications.
    async fn catch_up(&mut self) -> Result<(), ForwardEnd> {
        let events = match self.store.events_since(&self.run_id, self.cursor).await {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(
                    target: "runloom::fanout",
                    run_id = %self.run_id,
                    error = %err,
                    "failed to catch up subscriber from the log"
                );
                return Err(ForwardEnd::Disconnected);
            }
        };
        for event in events {
            if event.seq <= self.cursor {
                continue;
            }
            self.cursor = event.seq;
            self.forward(StreamFrame::Event(event))?;
        }
        Ok(())
    }

    fn forward(&self, frame: StreamFrame) -> Result<(), ForwardEnd> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                tracing::warn!(
                    target: "runloom::fanout",
                    run_id = %self.run_id,
                    buffer = self.tx.capacity().unwrap_or(0),
                    "dropping slow subscriber; outbound queue full"
                );
                Err(ForwardEnd::Backpressure)
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(ForwardEnd::Disconnected),
        }
    }
}
