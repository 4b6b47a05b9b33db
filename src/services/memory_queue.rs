//! In-process queue with the same delivery semantics as [`RedisQueue`].
//!
//! Used for local runs and tests. Timing is driven by `tokio::time`, so a
//! paused test clock controls visibility timeouts.
//!
//! [`RedisQueue`]: crate::services::queue::RedisQueue

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::models::work_item::{DeadLetter, ReceiptHandle, WorkItem};
use crate::services::queue::{QueueDepth, QueueError, WorkQueue};

#[derive(Debug, Clone)]
struct Message {
    id: Uuid,
    body: String,
    delivery_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<Uuid, InFlight>,
    dead: VecDeque<DeadLetter>,
}

pub struct MemoryQueue {
    name: String,
    settings: QueueSettings,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a panicking test thread; the state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return expired in-flight messages to the ready list, or dead-letter
    /// them once their deliveries are exhausted.
    fn reap(&self, state: &mut State, now: Instant) {
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(entry) = state.in_flight.remove(&id) else {
                continue;
            };
            let message = entry.message;
            if message.delivery_count >= self.settings.max_receive_count {
                tracing::warn!(
                    queue = %self.name,
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    "Moving message to dead-letter queue"
                );
                state.dead.push_back(DeadLetter {
                    message_id: message.id,
                    body: message.body,
                    delivery_count: message.delivery_count,
                    dead_lettered_at: Utc::now(),
                });
            } else {
                state.ready.push_back(message);
            }
        }
    }

    fn take(&self, state: &mut State, max_items: usize, now: Instant) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while items.len() < max_items {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.delivery_count += 1;
            items.push(WorkItem {
                message_id: message.id,
                body: message.body.clone(),
                receipt: ReceiptHandle::new(message.id, message.delivery_count),
                delivery_count: message.delivery_count,
            });
            state.in_flight.insert(
                message.id,
                InFlight {
                    message,
                    visible_at: now + self.settings.visibility_timeout,
                },
            );
        }
        items
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, body: String) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        self.lock().ready.push_back(Message {
            id,
            body,
            delivery_count: 0,
        });
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, max_items: usize, wait: Duration) -> Result<Vec<WorkItem>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            // Registered before inspecting state so an enqueue in between is not missed.
            let notified = self.notify.notified();

            let next_expiry = {
                let now = Instant::now();
                let mut state = self.lock();
                self.reap(&mut state, now);
                let items = self.take(&mut state, max_items, now);
                if !items.is_empty() || now >= deadline {
                    return Ok(items);
                }
                state.in_flight.values().map(|entry| entry.visible_at).min()
            };

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let (id, count) = receipt
            .parse()
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.to_string()))?;
        let mut state = self.lock();
        match state.in_flight.get(&id) {
            Some(entry) if entry.message.delivery_count == count => {
                state.in_flight.remove(&id);
                Ok(())
            }
            _ => Err(QueueError::ReceiptExpired(receipt.to_string())),
        }
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut state = self.lock();
        self.reap(&mut state, Instant::now());
        Ok(QueueDepth {
            visible: state.ready.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead_lettered: state.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let mut state = self.lock();
        self.reap(&mut state, Instant::now());
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn redrive(&self, limit: usize) -> Result<usize, QueueError> {
        let moved = {
            let mut state = self.lock();
            let mut moved = 0;
            while moved < limit {
                let Some(letter) = state.dead.pop_front() else {
                    break;
                };
                state.ready.push_back(Message {
                    id: letter.message_id,
                    body: letter.body,
                    delivery_count: 0,
                });
                moved += 1;
            }
            moved
        };
        if moved > 0 {
            self.notify.notify_waiters();
        }
        Ok(moved)
    }
}
