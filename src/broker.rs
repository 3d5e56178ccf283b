use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;

/// Outbound queue depth per attached client.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

struct QueueState {
    items: VecDeque<Envelope>,
    closed: bool,
}

/// One attached WebSocket client.
///
/// The bounded queue and the close flag share a mutex, so `close` is
/// idempotent and cannot interleave with an enqueue. Closing keeps already
/// queued envelopes; the write loop drains them before it sees `None`.
pub struct Client {
    id: u64,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    cancelled: CancellationToken,
    dropped: AtomicU64,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(CLIENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            cancelled: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue an envelope without blocking. When the queue is full the oldest
    /// envelope is dropped to make room. Returns `false` once closed.
    pub fn enqueue(&self, env: Envelope) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(env);
        }
        self.notify.notify_one();
        true
    }

    /// Next envelope for the write loop; `None` after close once the queue
    /// is drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(env) = state.items.pop_front() {
                    return Some(env);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the client. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if first {
            self.cancelled.cancel();
            self.notify.notify_one();
        }
        first
    }

    /// Drop everything still queued and close. Used when the socket is
    /// already broken and nothing else can be delivered.
    pub fn abort(&self) {
        self.state.lock().items.clear();
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fires once the client is closed; the read loop selects on it.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancelled
    }

    pub fn queued(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Envelopes discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The set of clients attached to one session.
///
/// Not synchronized itself; the session wraps it in its client lock.
#[derive(Default)]
pub struct ClientSet {
    clients: HashMap<u64, Arc<Client>>,
}

impl ClientSet {
    pub fn insert(&mut self, client: Arc<Client>) {
        self.clients.insert(client.id(), client);
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<Client>> {
        self.clients.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Enqueue `env` to every client. Never blocks on a slow consumer.
    pub fn broadcast(&self, env: &Envelope) {
        for client in self.clients.values() {
            client.enqueue(env.clone());
        }
    }

    /// Close every client and empty the set.
    pub fn close_all(&mut self) {
        for (_, client) in self.clients.drain() {
            client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Status};
    use std::time::Duration;

    fn numbered(i: usize) -> Envelope {
        Envelope::new("output", serde_json::json!({ "n": i }))
    }

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let client = Client::new();
        for i in 0..3 {
            assert!(client.enqueue(numbered(i)));
        }
        for i in 0..3 {
            let env = client.recv().await.expect("should receive");
            assert_eq!(env.payload["n"], i);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let client = Client::with_capacity(4);
        for i in 0..10 {
            client.enqueue(numbered(i));
        }
        assert_eq!(client.queued(), 4);
        assert_eq!(client.dropped(), 6);
        let first = client.recv().await.unwrap();
        assert_eq!(first.payload["n"], 6);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_enqueue() {
        let client = Client::new();
        assert!(client.close());
        assert!(!client.close());
        assert!(client.cancelled().is_cancelled());
        assert!(!client.enqueue(numbered(0)));
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_keeps_pending_envelopes_for_the_writer() {
        let client = Client::new();
        client.enqueue(Envelope::status(Status::Closed, Some("panic_stop"), chrono::Utc::now()));
        client.close();
        let env = client.recv().await.expect("final status should be drained");
        assert_eq!(env.payload["reason"], "panic_stop");
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn abort_discards_pending() {
        let client = Client::new();
        client.enqueue(numbered(1));
        client.abort();
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_enqueue_and_close() {
        let client = Client::new();
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.enqueue(numbered(7));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv should wake")
            .unwrap();
        assert_eq!(got.unwrap().payload["n"], 7);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("close should wake recv")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_others() {
        let mut set = ClientSet::default();
        let slow = Client::new();
        let fast = Client::new();
        set.insert(slow.clone());
        set.insert(fast.clone());

        for i in 0..1000 {
            set.broadcast(&numbered(i));
            let env = fast.recv().await.unwrap();
            assert_eq!(env.payload["n"], i);
        }
        assert_eq!(slow.queued(), CLIENT_QUEUE_CAPACITY);
        assert_eq!(slow.dropped(), 1000 - CLIENT_QUEUE_CAPACITY as u64);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn close_all_empties_the_set() {
        let mut set = ClientSet::default();
        let a = Client::new();
        let b = Client::new();
        set.insert(a.clone());
        set.insert(b.clone());
        set.close_all();
        assert!(set.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }
}
