/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Per-session set of push-connected viewers.
//!
//! Every client gets a bounded queue of pre-serialised envelopes and a pump
//! task that forwards them to its transport. The producer side never waits:
//! a full queue drops its oldest entry (newest-wins), a dead transport gets
//! detached on the next broadcast. Memory per session is bounded by
//! clients × (queue capacity + 1 in-flight envelope).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use facestream_types::{protocol::ServerEnvelope, SessionId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The transport for one subscriber is gone.
#[derive(Debug)]
pub struct SinkClosed;

/// One subscriber's transport. The WebSocket actor implements this; tests
/// plug in recording fakes.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one serialised envelope. Resolves once the transport has
    /// accepted it; erroring detaches the subscriber.
    async fn deliver(&self, text: Arc<String>) -> Result<(), SinkClosed>;

    /// The session is gone and the farewell has been delivered; the
    /// transport may now close the connection.
    async fn hangup(&self) {}
}

pub type SubscriberId = String;

struct ClientSlot {
    queue: Arc<Mutex<VecDeque<Arc<String>>>>,
    notify: Arc<Notify>,
    closing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    pump: JoinHandle<()>,
}

pub struct SubscriberSet {
    session_id: SessionId,
    capacity: usize,
    clients: Mutex<HashMap<SubscriberId, ClientSlot>>,
}

impl SubscriberSet {
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        Self {
            session_id,
            capacity,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Add a client and start its pump. Re-attaching an id replaces the old
    /// slot.
    pub fn attach(&self, id: SubscriberId, sink: Arc<dyn FrameSink>) {
        let queue: Arc<Mutex<VecDeque<Arc<String>>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let closing = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(pump_loop(
            sink,
            Arc::clone(&queue),
            Arc::clone(&notify),
            Arc::clone(&closing),
            Arc::clone(&closed),
        ));

        let slot = ClientSlot {
            queue,
            notify,
            closing,
            closed,
            dropped: Arc::new(AtomicU64::new(0)),
            pump,
        };
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = clients.insert(id.clone(), slot) {
            old.pump.abort();
        }
        debug!(
            "subscriber {id} attached to session {} ({} total)",
            self.session_id,
            clients.len()
        );
    }

    /// Remove a client immediately; pending frames for it are discarded.
    pub fn detach(&self, id: &str) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        match clients.remove(id) {
            Some(slot) => {
                slot.pump.abort();
                debug!(
                    "subscriber {id} detached from session {} ({} left)",
                    self.session_id,
                    clients.len()
                );
                true
            }
            None => false,
        }
    }

    /// Fan one frame out to every live client. Serialises the envelope once,
    /// never blocks, evicts the oldest queued frame of any client that has
    /// fallen behind, and detaches clients whose transport already failed.
    pub fn broadcast(&self, jpeg: &[u8], timestamp_ms: i64) -> usize {
        let envelope = ServerEnvelope::Frame {
            session_id: self.session_id.clone(),
            data: base64::encode(jpeg),
            timestamp: timestamp_ms,
        };
        let text = Arc::new(envelope.to_json());

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let dead: Vec<SubscriberId> = clients
            .iter()
            .filter(|(_, slot)| slot.closed.load(Ordering::Acquire))
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            if let Some(slot) = clients.remove(&id) {
                slot.pump.abort();
                info!("dropping subscriber {id}: transport closed");
            }
        }

        for slot in clients.values() {
            let mut queue = slot.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::FRAMES_DROPPED_TOTAL.inc();
            }
            queue.push_back(Arc::clone(&text));
            drop(queue);
            slot.notify.notify_one();
        }
        clients.len()
    }

    /// Best-effort `stream_stopped` to everyone, then drop the whole set.
    pub fn close_all(&self, message: &str) {
        let envelope = ServerEnvelope::StreamStopped {
            session_id: self.session_id.clone(),
            message: message.to_string(),
        };
        let text = Arc::new(envelope.to_json());

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for (_, slot) in clients.drain() {
            let mut queue = slot.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.clear();
            queue.push_back(Arc::clone(&text));
            drop(queue);
            // The pump delivers the farewell, then exits on the closing flag.
            slot.closing.store(true, Ordering::Release);
            slot.notify.notify_one();
        }
    }

    pub fn count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Frames dropped for one client by the newest-wins policy.
    pub fn dropped(&self, id: &str) -> u64 {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|slot| slot.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|slot| slot.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for SubscriberSet {
    fn drop(&mut self) {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for slot in clients.values() {
            slot.pump.abort();
        }
    }
}

/// Forward queued envelopes to one sink. At most one envelope is in flight,
/// which together with the bounded queue caps per-client memory.
async fn pump_loop(
    sink: Arc<dyn FrameSink>,
    queue: Arc<Mutex<VecDeque<Arc<String>>>>,
    notify: Arc<Notify>,
    closing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    loop {
        loop {
            let next = {
                let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };
            let Some(text) = next else { break };
            if sink.deliver(text).await.is_err() {
                closed.store(true, Ordering::Release);
                return;
            }
        }
        if closing.load(Ordering::Acquire) {
            sink.hangup().await;
            return;
        }
        notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{wait_until, RecordingSink};
    use std::time::Duration;

    fn frame_payload(n: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, n, 0xFF, 0xD9]
    }

    #[tokio::test]
    async fn fast_subscriber_receives_every_frame_in_order() {
        let set = SubscriberSet::new("s1".to_string(), 4);
        let sink = Arc::new(RecordingSink::instant());
        set.attach("c1".to_string(), sink.clone());

        for n in 0..10u8 {
            set.broadcast(&frame_payload(n), n as i64);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_until(Duration::from_secs(2), || sink.received_count() == 10).await;

        let texts = sink.received();
        assert_eq!(texts.len(), 10);
        for (i, text) in texts.iter().enumerate() {
            assert!(text.contains(&format!("\"timestamp\":{i}")));
        }
        assert_eq!(set.dropped("c1"), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_newest_frames_and_drop_count() {
        let set = SubscriberSet::new("s1".to_string(), 2);
        let slow = Arc::new(RecordingSink::with_delay(Duration::from_millis(40)));
        set.attach("slow".to_string(), slow.clone());

        for n in 0..20u8 {
            set.broadcast(&frame_payload(n), n as i64);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Everything still queued or in flight drains eventually.
        wait_until(Duration::from_secs(5), || {
            slow.received_count() as u64 + set.dropped("slow") == 20
        })
        .await;

        let timestamps = slow.received_timestamps();
        // Order is preserved and the final frame always arrives: the queue
        // drops from the front, never the back.
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*timestamps.last().unwrap(), 19);
        assert!(set.dropped("slow") > 0);
    }

    #[tokio::test]
    async fn failed_sink_is_detached_on_next_broadcast() {
        let set = SubscriberSet::new("s1".to_string(), 4);
        let flaky = Arc::new(RecordingSink::failing_after(1));
        set.attach("flaky".to_string(), flaky.clone());

        set.broadcast(&frame_payload(0), 0);
        wait_until(Duration::from_secs(2), || flaky.received_count() == 1).await;
        set.broadcast(&frame_payload(1), 1);
        // Second delivery fails; the following broadcast sweeps the client.
        wait_until(Duration::from_secs(2), || {
            set.broadcast(&frame_payload(2), 2) == 0
        })
        .await;
        assert_eq!(set.count(), 0);
    }

    #[tokio::test]
    async fn close_all_sends_farewell_then_empties_the_set() {
        let set = SubscriberSet::new("s1".to_string(), 4);
        let a = Arc::new(RecordingSink::instant());
        let b = Arc::new(RecordingSink::instant());
        set.attach("a".to_string(), a.clone());
        set.attach("b".to_string(), b.clone());

        set.broadcast(&frame_payload(0), 0);
        set.close_all("transcoder exited");
        assert_eq!(set.count(), 0);

        for sink in [&a, &b] {
            let sink = Arc::clone(sink);
            wait_until(Duration::from_secs(2), move || {
                sink.received()
                    .last()
                    .map(|t| t.contains("stream_stopped"))
                    .unwrap_or(false)
            })
            .await;
        }
        let last = a.received().last().cloned().unwrap();
        assert!(last.contains("transcoder exited"));
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let set = SubscriberSet::new("s1".to_string(), 4);
        set.attach("c1".to_string(), Arc::new(RecordingSink::instant()));
        assert!(set.detach("c1"));
        assert!(!set.detach("c1"));
        assert_eq!(set.count(), 0);
    }
}
