use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{PushyError, Result};
use crate::events::event::{Event, EventPayload};
use crate::scheduler::JobId;
use crate::timer::Clock;

/// Owns every job's event log and the server-wide event id sequence.
pub struct EventPublisher {
    next_id: Arc<AtomicU64>,
    logs: RwLock<HashMap<JobId, Arc<EventLog>>>,
    clock: Clock,
}

impl EventPublisher {
    pub fn new(clock: Clock) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(0)),
            logs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Create the log for a new job.
    pub fn open(&self, job_id: JobId) -> Arc<EventLog> {
        let log = Arc::new(EventLog::new(job_id, self.next_id.clone(), self.clock));
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.insert(job_id, log.clone());
        log
    }

    pub fn log(&self, job_id: JobId) -> Option<Arc<EventLog>> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.get(&job_id).cloned()
    }

    /// Subscribe to a job's events, replaying everything after `last_event_id`.
    pub fn subscribe(&self, job_id: JobId, last_event_id: Option<u64>) -> Result<Subscription> {
        let log = self.log(job_id).ok_or(PushyError::JobNotFound(job_id))?;
        Ok(log.subscribe(last_event_id))
    }
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<Event>,
    closed: bool,
}

/// Append-only event history of one job.
pub struct EventLog {
    job_id: JobId,
    next_id: Arc<AtomicU64>,
    clock: Clock,
    state: Mutex<LogState>,
    changed: watch::Sender<usize>,
}

impl EventLog {
    fn new(job_id: JobId, next_id: Arc<AtomicU64>, clock: Clock) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            job_id,
            next_id,
            clock,
            state: Mutex::new(LogState::default()),
            changed,
        }
    }

    /// Append an event and wake subscribers. Returns `None` once the log is
    /// closed.
    pub fn publish(&self, payload: EventPayload) -> Option<Event> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            tracing::warn!(job_id = %self.job_id, event = %payload.name(), "Event published after job completion, dropped");
            return None;
        }

        // Timestamps stay strictly increasing within a job even when two
        // events land on the same clock reading.
        let mut timestamp = self.clock.now();
        if let Some(last) = state.events.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }

        let event = Event {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: payload.name(),
            job: self.job_id.simple().to_string(),
            timestamp,
            payload,
        };
        tracing::debug!(job_id = %self.job_id, id = event.id, event = %event.name, "Published event");
        state.events.push(event.clone());
        self.changed.send_replace(state.events.len());
        Some(event)
    }

    /// Mark the history complete. Subscribers drain what is left and stop.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        self.changed.send_replace(state.events.len());
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn events(&self) -> Vec<Event> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .clone()
    }

    pub fn subscribe(self: &Arc<Self>, last_event_id: Option<u64>) -> Subscription {
        let cursor = match last_event_id {
            Some(last) => {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.events.partition_point(|e| e.id <= last)
            }
            None => 0,
        };
        Subscription {
            log: self.clone(),
            cursor,
            changed: self.changed.subscribe(),
        }
    }
}

/// Cursor over a job's events. Replays history, then follows live events.
pub struct Subscription {
    log: Arc<EventLog>,
    cursor: usize,
    changed: watch::Receiver<usize>,
}

impl Subscription {
    /// Next event, waiting for one if needed. `None` after the last event of
    /// a completed job.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            self.changed.borrow_and_update();
            {
                let state = self.log.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(event) = state.events.get(self.cursor) {
                    self.cursor += 1;
                    return Some(event.clone());
                }
                if state.closed {
                    return None;
                }
            }
            if self.changed.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Forward the subscription into a channel-backed stream. The forwarding
    /// task stops when the stream is dropped or the job's history ends.
    pub fn into_stream(mut self) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = self.next() => match event {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
