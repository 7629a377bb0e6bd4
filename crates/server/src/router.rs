//! Router: in-memory agent/client connection registries, presence broadcast,
//! chat-frame routing, and the per-agent offline queue.
//!
//! Registries and queues are process-local and come up empty on every
//! restart, so nothing here touches the Store. A single
//! `tokio::sync::RwLock` guards each `HashMap`; per-agent operations
//! dominate and reads (routing lookups) vastly outnumber writes
//! (admission/eviction).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};

use relay_protocol::{ErrorCode, Frame};

/// Bound on each handle's outbound mpsc channel. A slow consumer backs up
/// the channel rather than growing it unboundedly; the writer task is the
/// only thing that ever drains it.
const HANDLE_CHANNEL_CAPACITY: usize = 256;

/// Close code sent to a handle evicted by a same-id takeover.
pub const CLOSE_CODE_CONFLICT: u16 = 4001;

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// One entry in an agent's offline queue: a `chat.request` frame captured at
/// `enqueued_at`, plus a delivery-attempt counter.
struct QueuedRequest {
    frame: Frame,
    enqueued_at: Instant,
    attempts: u32,
}

/// A single connection's outbound side: a channel into its writer task plus
/// the bookkeeping the Router needs to enforce health and ordering.
pub struct AgentHandle {
    pub agent_id: String,
    tx: mpsc::Sender<RouterOutbound>,
    last_activity: std::sync::Mutex<Instant>,
}

pub struct ClientHandle {
    pub agent_id: String,
    pub device_id: String,
    tx: mpsc::Sender<RouterOutbound>,
    last_activity: std::sync::Mutex<Instant>,
}

/// What the Router hands a writer task: either a frame to serialize and
/// send, or an instruction to close the socket with a specific code.
pub enum RouterOutbound {
    Frame(Frame),
    Close(u16),
}

impl AgentHandle {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    async fn send(&self, outbound: RouterOutbound) -> bool {
        self.tx.send(outbound).await.is_ok()
    }
}

impl ClientHandle {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    async fn send(&self, outbound: RouterOutbound) -> bool {
        self.tx.send(outbound).await.is_ok()
    }
}

/// Key for the client registry: a device only ever binds to one agent, but
/// the registry is keyed on the pair so lookups by `(agent_id, device_id)`
/// and iteration-by-`agent_id` are both direct.
type ClientKey = (String, String);

struct AgentQueue {
    entries: std::collections::VecDeque<QueuedRequest>,
}

impl AgentQueue {
    fn new() -> Self {
        Self {
            entries: std::collections::VecDeque::new(),
        }
    }
}

pub struct RouterConfig {
    pub offline_queue_max: usize,
    pub offline_ttl: Duration,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub msg_max_bytes: usize,
}

/// The Router's full in-memory state: live agent handles, live client
/// handles, and each agent's offline `chat.request` queue.
pub struct Router {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    clients: RwLock<HashMap<ClientKey, Arc<ClientHandle>>>,
    queues: RwLock<HashMap<String, AgentQueue>>,
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Agent handle admission: evict any existing handle for this
    /// `agent_id`, install the new one, broadcast `presence(online=true)`,
    /// and drain the offline queue. Returns the new handle and a receiver
    /// the caller's writer task drains.
    pub async fn admit_agent(
        self: &Arc<Self>,
        agent_id: &str,
    ) -> (Arc<AgentHandle>, mpsc::Receiver<RouterOutbound>) {
        let (tx, rx) = mpsc::channel(HANDLE_CHANNEL_CAPACITY);
        let handle = Arc::new(AgentHandle {
            agent_id: agent_id.to_string(),
            tx,
            last_activity: std::sync::Mutex::new(Instant::now()),
        });

        let prior = {
            let mut agents = self.agents.write().await;
            agents.insert(agent_id.to_string(), Arc::clone(&handle))
        };

        if let Some(prior) = prior {
            // Same agent_id re-admitted while the old handle is still live:
            // evict it with CONFLICT. No extra presence flap — the new
            // admission's presence(online=true) below is the only signal.
            prior.send(RouterOutbound::Close(CLOSE_CODE_CONFLICT)).await;
        } else {
            self.broadcast_presence(agent_id, true).await;
        }

        self.drain_offline_queue(agent_id, &handle).await;

        (handle, rx)
    }

    /// Client handle admission: install under `(agent_id, device_id)`
    /// and immediately send a presence snapshot for the bound agent.
    pub async fn admit_client(
        self: &Arc<Self>,
        agent_id: &str,
        device_id: &str,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<RouterOutbound>) {
        let (tx, rx) = mpsc::channel(HANDLE_CHANNEL_CAPACITY);
        let handle = Arc::new(ClientHandle {
            agent_id: agent_id.to_string(),
            device_id: device_id.to_string(),
            tx,
            last_activity: std::sync::Mutex::new(Instant::now()),
        });

        {
            let mut clients = self.clients.write().await;
            clients.insert((agent_id.to_string(), device_id.to_string()), Arc::clone(&handle));
        }

        handle
            .send(RouterOutbound::Frame(self.presence_snapshot(agent_id).await))
            .await;

        (handle, rx)
    }

    /// Build a `presence` frame reflecting an agent's current live state,
    /// for admission snapshots and explicit `presence.request` resync.
    pub async fn presence_snapshot(&self, agent_id: &str) -> Frame {
        let online = self.agents.read().await.contains_key(agent_id);
        Frame::Presence {
            agent_id: agent_id.to_string(),
            online,
            ts: serde_json::Value::from(now_unix()),
        }
    }

    /// Remove an agent handle, broadcasting `presence(online=false)` unless
    /// the registry now holds a *different* (newer) handle for this
    /// `agent_id` — a takeover already replaced it and already wouldn't emit
    /// an offline flap for the evicted handle.
    pub async fn remove_agent(&self, agent_id: &str, handle: &Arc<AgentHandle>) {
        let was_current = {
            let mut agents = self.agents.write().await;
            match agents.get(agent_id) {
                Some(current) if Arc::ptr_eq(current, handle) => {
                    agents.remove(agent_id);
                    true
                }
                _ => false,
            }
        };
        if was_current {
            self.broadcast_presence(agent_id, false).await;
        }
    }

    pub async fn remove_client(&self, agent_id: &str, device_id: &str, handle: &Arc<ClientHandle>) {
        let mut clients = self.clients.write().await;
        if let Some(current) = clients.get(&(agent_id.to_string(), device_id.to_string()))
            && Arc::ptr_eq(current, handle)
        {
            clients.remove(&(agent_id.to_string(), device_id.to_string()));
        }
    }

    async fn broadcast_presence(&self, agent_id: &str, online: bool) {
        let frame = Frame::Presence {
            agent_id: agent_id.to_string(),
            online,
            ts: serde_json::Value::from(now_unix()),
        };
        let clients = self.clients.read().await;
        for (key, handle) in clients.iter() {
            if key.0 == agent_id {
                handle.send(RouterOutbound::Frame(frame.clone())).await;
            }
        }
    }

    /// Chat-request routing: validate, forward, enqueue, ack. `sender` is the originating
    /// client handle; the caller already parsed the incoming `Frame`.
    pub async fn route_chat_request(
        &self,
        sender: &ClientHandle,
        request_id: String,
        agent_id: String,
        session_id: String,
        text: String,
    ) {
        if agent_id != sender.agent_id {
            sender
                .send(RouterOutbound::Frame(Frame::error(
                    Some(request_id),
                    ErrorCode::Unauthorized,
                    "agent_id does not match this connection's paired agent",
                )))
                .await;
            return;
        }

        if text.len() > self.config.msg_max_bytes {
            sender
                .send(RouterOutbound::Frame(Frame::error(
                    Some(request_id),
                    ErrorCode::MessageTooLarge,
                    "text exceeds the maximum message size",
                )))
                .await;
            return;
        }

        let frame = Frame::ChatRequest {
            request_id: request_id.clone(),
            agent_id: agent_id.clone(),
            session_id,
            text,
            ts: Some(serde_json::Value::from(now_unix())),
        };

        let live_agent = self.agents.read().await.get(&agent_id).cloned();
        if let Some(agent) = live_agent {
            agent.send(RouterOutbound::Frame(frame)).await;
            sender
                .send(RouterOutbound::Frame(Frame::MessageSent { request_id }))
                .await;
            return;
        }

        let queued = self.enqueue_offline(&agent_id, frame).await;
        if queued {
            sender
                .send(RouterOutbound::Frame(Frame::MessageSent { request_id }))
                .await;
        } else {
            sender
                .send(RouterOutbound::Frame(Frame::error(
                    Some(request_id),
                    ErrorCode::AgentOffline,
                    "agent is offline and its queue is full",
                )))
                .await;
        }
    }

    /// Chat-response routing: fan out to every live client bound to
    /// `agent_id`. Intentionally not request-scoped — a response can reach
    /// multiple browser tabs watching the same agent. `sender` is the
    /// originating agent handle; an agent may only emit responses under its
    /// own `agent_id`.
    pub async fn route_chat_response(
        &self,
        sender: &AgentHandle,
        agent_id: String,
        request_id: String,
        session_id: String,
        reply: String,
    ) {
        if agent_id != sender.agent_id {
            sender
                .send(RouterOutbound::Frame(Frame::error(
                    Some(request_id),
                    ErrorCode::Unauthorized,
                    "agent_id does not match this connection's authenticated agent",
                )))
                .await;
            return;
        }

        let frame = Frame::ChatResponse {
            request_id,
            agent_id: agent_id.clone(),
            session_id,
            reply,
            ts: Some(serde_json::Value::from(now_unix())),
        };
        let clients = self.clients.read().await;
        for (key, handle) in clients.iter() {
            if key.0 == agent_id {
                handle.send(RouterOutbound::Frame(frame.clone())).await;
            }
        }
    }

    /// Offline-queue enqueue: FIFO displacement of the oldest entry when full.
    /// Returns `false` only when `offline_queue_max` is configured to zero.
    async fn enqueue_offline(&self, agent_id: &str, frame: Frame) -> bool {
        if self.config.offline_queue_max == 0 {
            return false;
        }
        let mut queues = self.queues.write().await;
        let queue = queues.entry(agent_id.to_string()).or_insert_with(AgentQueue::new);
        if queue.entries.len() >= self.config.offline_queue_max {
            queue.entries.pop_front();
        }
        queue.entries.push_back(QueuedRequest {
            frame,
            enqueued_at: Instant::now(),
            attempts: 0,
        });
        true
    }

    /// Offline-queue drain: deliver entries in insertion order, dropping expired ones
    /// and discarding any that fail delivery 3 times. Removes the queue
    /// entirely once drained.
    async fn drain_offline_queue(&self, agent_id: &str, agent: &Arc<AgentHandle>) {
        let mut entries = {
            let mut queues = self.queues.write().await;
            match queues.remove(agent_id) {
                Some(q) => q.entries,
                None => return,
            }
        };

        let mut redeliver = std::collections::VecDeque::new();
        while let Some(mut entry) = entries.pop_front() {
            if entry.enqueued_at.elapsed() > self.config.offline_ttl {
                continue;
            }
            entry.attempts += 1;
            if agent.send(RouterOutbound::Frame(entry.frame.clone())).await {
                continue;
            }
            if entry.attempts < 3 {
                redeliver.push_back(entry);
            }
        }

        if !redeliver.is_empty() {
            let mut queues = self.queues.write().await;
            queues.insert(agent_id.to_string(), AgentQueue { entries: redeliver });
        }
    }

    /// Periodic TTL sweep: drop expired entries from every agent's
    /// queue without requiring an admission to trigger cleanup.
    pub async fn sweep_offline_queues(&self) {
        let mut queues = self.queues.write().await;
        queues.retain(|_agent_id, queue| {
            queue
                .entries
                .retain(|entry| entry.enqueued_at.elapsed() <= self.config.offline_ttl);
            !queue.entries.is_empty()
        });
    }

    /// Health sweep: ping every live handle, then close any
    /// whose `last_activity` exceeds the idle timeout.
    pub async fn health_sweep(&self) {
        let ping = Frame::Ping {
            ts: Some(serde_json::Value::from(now_unix())),
        };

        let agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        for agent in agents {
            if agent.idle_for() > self.config.idle_timeout {
                agent.send(RouterOutbound::Close(1000)).await;
            } else {
                agent.send(RouterOutbound::Frame(ping.clone())).await;
            }
        }

        let clients: Vec<_> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            if client.idle_for() > self.config.idle_timeout {
                client.send(RouterOutbound::Close(1000)).await;
            } else {
                client.send(RouterOutbound::Frame(ping.clone())).await;
            }
        }
    }

    pub async fn note_agent_activity(&self, handle: &AgentHandle) {
        handle.touch();
    }

    pub async fn note_client_activity(&self, handle: &ClientHandle) {
        handle.touch();
    }

    pub async fn live_agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn agent_is_connected(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    pub async fn live_client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_router() -> Arc<Router> {
        Arc::new(Router::new(RouterConfig {
            offline_queue_max: 10,
            offline_ttl: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
            msg_max_bytes: 32 * 1024,
        }))
    }

    async fn drain_one(rx: &mut mpsc::Receiver<RouterOutbound>) -> RouterOutbound {
        rx.recv().await.expect("expected a routed frame")
    }

    #[tokio::test]
    async fn agent_admission_broadcasts_presence_online() {
        let router = test_router();
        let (_client, mut client_rx) = router.admit_client("a1", "d1").await;
        // initial snapshot is offline since the agent hasn't connected yet
        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::Presence { online, .. }) => assert!(!online),
            _ => panic!("expected presence snapshot"),
        }

        let (_agent, _agent_rx) = router.admit_agent("a1").await;
        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::Presence { online, agent_id, .. }) => {
                assert!(online);
                assert_eq!(agent_id, "a1");
            }
            _ => panic!("expected presence online"),
        }
    }

    #[tokio::test]
    async fn agent_disconnect_broadcasts_presence_offline() {
        let router = test_router();
        let (_client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await; // initial snapshot

        let (agent, _agent_rx) = router.admit_agent("a1").await;
        let _ = drain_one(&mut client_rx).await; // presence online

        router.remove_agent("a1", &agent).await;
        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::Presence { online, .. }) => assert!(!online),
            _ => panic!("expected presence offline"),
        }
    }

    #[tokio::test]
    async fn same_agent_reconnect_evicts_without_extra_presence_flap() {
        let router = test_router();
        let (_client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await; // initial snapshot

        let (agent1, mut agent1_rx) = router.admit_agent("a1").await;
        let _ = drain_one(&mut client_rx).await; // presence online #1
        let _ = agent1;

        let (_agent2, _agent2_rx) = router.admit_agent("a1").await;
        // the evicted handle gets a CONFLICT close
        match agent1_rx.recv().await {
            Some(RouterOutbound::Close(code)) => assert_eq!(code, CLOSE_CODE_CONFLICT),
            Some(RouterOutbound::Frame(_)) => panic!("expected a close, not a frame"),
            None => panic!("expected conflict close, channel closed instead"),
        }
        // clients observe exactly one more presence(online) event, not two
        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::Presence { online, .. }) => assert!(online),
            _ => panic!("expected presence online"),
        }
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn at_most_one_live_agent_handle() {
        let router = test_router();
        let (_h1, _r1) = router.admit_agent("a1").await;
        let (_h2, _r2) = router.admit_agent("a1").await;
        assert_eq!(router.live_agent_count().await, 1);
    }

    #[tokio::test]
    async fn chat_request_rejects_mismatched_agent_id() {
        let router = test_router();
        let (client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await;

        router
            .route_chat_request(&client, "r1".into(), "other-agent".into(), "s1".into(), "hi".into())
            .await;

        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::Unauthorized)
            }
            _ => panic!("expected unauthorized error"),
        }
    }

    #[tokio::test]
    async fn chat_request_rejects_oversized_text() {
        let router = test_router();
        let (client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await;

        let huge = "x".repeat(33 * 1024);
        router
            .route_chat_request(&client, "r1".into(), "a1".into(), "s1".into(), huge)
            .await;

        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::MessageTooLarge)
            }
            _ => panic!("expected message-too-large error"),
        }
    }

    #[tokio::test]
    async fn chat_request_forwards_to_live_agent_and_acks_sender() {
        let router = test_router();
        let (_agent, mut agent_rx) = router.admit_agent("a1").await;
        let (client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await; // presence snapshot

        router
            .route_chat_request(&client, "r1".into(), "a1".into(), "s1".into(), "hi".into())
            .await;

        match drain_one(&mut agent_rx).await {
            RouterOutbound::Frame(Frame::ChatRequest { request_id, .. }) => assert_eq!(request_id, "r1"),
            _ => panic!("expected chat.request forwarded to agent"),
        }
        match drain_one(&mut client_rx).await {
            RouterOutbound::Frame(Frame::MessageSent { request_id }) => assert_eq!(request_id, "r1"),
            _ => panic!("expected message_sent ack"),
        }
    }

    #[tokio::test]
    async fn offline_queue_bounds_to_ten_and_keeps_newest() {
        let router = test_router();
        let (client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await;

        for i in 0..12 {
            router
                .route_chat_request(&client, format!("r{i}"), "a1".into(), "s1".into(), "hi".into())
                .await;
            let _ = drain_one(&mut client_rx).await; // message_sent ack
        }

        let (_agent, mut agent_rx) = router.admit_agent("a1").await;
        let _ = drain_one(&mut client_rx).await; // presence online to client

        let mut delivered = Vec::new();
        while let Ok(RouterOutbound::Frame(Frame::ChatRequest { request_id, .. })) = agent_rx.try_recv() {
            delivered.push(request_id);
        }
        assert_eq!(delivered.len(), 10);
        assert_eq!(delivered.first().unwrap(), "r2");
        assert_eq!(delivered.last().unwrap(), "r11");
    }

    #[tokio::test]
    async fn offline_queue_discards_entries_past_ttl() {
        let router = Arc::new(Router::new(RouterConfig {
            offline_queue_max: 10,
            offline_ttl: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
            msg_max_bytes: 32 * 1024,
        }));
        let (client, mut client_rx) = router.admit_client("a1", "d1").await;
        let _ = drain_one(&mut client_rx).await;

        router
            .route_chat_request(&client, "r1".into(), "a1".into(), "s1".into(), "hi".into())
            .await;
        let _ = drain_one(&mut client_rx).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let (_agent, mut agent_rx) = router.admit_agent("a1").await;
        let _ = drain_one(&mut client_rx).await; // presence online
        assert!(agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chat_response_fans_out_to_all_bound_clients() {
        let router = test_router();
        let (agent, _agent_rx) = router.admit_agent("a1").await;
        let (_c1, mut c1_rx) = router.admit_client("a1", "d1").await;
        let (_c2, mut c2_rx) = router.admit_client("a1", "d2").await;
        let _ = drain_one(&mut c1_rx).await;
        let _ = drain_one(&mut c2_rx).await;

        router
            .route_chat_response(&agent, "a1".into(), "r1".into(), "s1".into(), "hello".into())
            .await;

        match drain_one(&mut c1_rx).await {
            RouterOutbound::Frame(Frame::ChatResponse { reply, .. }) => assert_eq!(reply, "hello"),
            _ => panic!("expected chat.response on client 1"),
        }
        match drain_one(&mut c2_rx).await {
            RouterOutbound::Frame(Frame::ChatResponse { reply, .. }) => assert_eq!(reply, "hello"),
            _ => panic!("expected chat.response on client 2"),
        }
    }

    #[tokio::test]
    async fn chat_response_rejects_agent_id_mismatch() {
        let router = test_router();
        let (agent, _agent_rx) = router.admit_agent("a1").await;
        let (_c1, mut c1_rx) = router.admit_client("a2", "d1").await;
        let _ = drain_one(&mut c1_rx).await; // presence snapshot

        router
            .route_chat_response(&agent, "a2".into(), "r1".into(), "s1".into(), "hello".into())
            .await;

        assert!(
            c1_rx.try_recv().is_err(),
            "client bound to a2 should not receive a response from agent a1"
        );
    }

    #[tokio::test]
    async fn health_sweep_closes_idle_handles() {
        let router = Arc::new(Router::new(RouterConfig {
            offline_queue_max: 10,
            offline_ttl: Duration::from_secs(60),
            idle_timeout: Duration::from_millis(10),
            ping_interval: Duration::from_secs(30),
            msg_max_bytes: 32 * 1024,
        }));
        let (_agent, mut agent_rx) = router.admit_agent("a1").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        router.health_sweep().await;
        match drain_one(&mut agent_rx).await {
            RouterOutbound::Close(code) => assert_eq!(code, 1000),
            _ => panic!("expected idle close"),
        }
    }
}
