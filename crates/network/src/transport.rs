//! The shared in-memory transport.

use dashmap::DashMap;
use distlab_types::{now_millis, Envelope, NodeId};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Why an envelope was dropped instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NetworkPartition,
    PacketLoss,
}

impl DropReason {
    /// Wire name used in `message_dropped` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NetworkPartition => "network_partition",
            DropReason::PacketLoss => "packet_loss",
        }
    }
}

/// Per-node delivery callback, invoked with the delivery clone.
pub type DeliveryHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Observation hook invoked for every dropped envelope.
pub type DropHook = Arc<dyn Fn(&Envelope, DropReason) + Send + Sync>;

/// In-memory network shared by all nodes in a session.
///
/// Supports:
/// - per-node delivery handler registry
/// - uniform latency window `[min, max]` (may be zero)
/// - packet-loss probability in `[0, 1]`
/// - directed partition matrix (bidirectional = both orderings)
/// - a drop-observation hook
///
/// Loss and latency draws come from a seedable ChaCha8 RNG so runs are
/// reproducible when a seed is supplied.
pub struct NetworkTransport {
    handlers: DashMap<NodeId, DeliveryHandler>,
    drop_hook: RwLock<Option<DropHook>>,
    /// Latency window (min, max).
    latency: RwLock<(Duration, Duration)>,
    /// Loss probability, clamped to [0, 1].
    packet_loss: RwLock<f64>,
    /// Directed partition pairs. `(a, b)` present means a→b is blocked.
    partitions: RwLock<HashSet<(NodeId, NodeId)>>,
    rng: Mutex<ChaCha8Rng>,
    closed: Arc<AtomicBool>,
}

impl NetworkTransport {
    pub fn new() -> Self {
        Self::with_rng(ChaCha8Rng::from_entropy())
    }

    /// Transport with a fixed seed for reproducible loss/latency draws.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(rng: ChaCha8Rng) -> Self {
        Self {
            handlers: DashMap::new(),
            drop_hook: RwLock::new(None),
            latency: RwLock::new((Duration::ZERO, Duration::ZERO)),
            packet_loss: RwLock::new(0.0),
            partitions: RwLock::new(HashSet::new()),
            rng: Mutex::new(rng),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    // ─── Handler Registry ───

    /// Register the delivery handler for a node. Replaces any previous one.
    pub fn register_handler(&self, node: NodeId, handler: DeliveryHandler) {
        self.handlers.insert(node, handler);
    }

    /// Remove a node's delivery handler.
    pub fn unregister_handler(&self, node: &NodeId) {
        self.handlers.remove(node);
    }

    /// Set the drop-observation hook.
    pub fn on_drop(&self, hook: DropHook) {
        *self.drop_hook.write() = Some(hook);
    }

    // ─── Send Path ───

    /// Send an envelope. Never blocks; delivery (if any) happens on a
    /// detached task after the sampled delay.
    ///
    /// Order of checks: closed → partition → loss → handler lookup. A
    /// missing handler is silent — delivery is best-effort and the sender is
    /// not informed.
    pub fn send(&self, env: Envelope) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if self.is_partitioned(&env.from, &env.to) {
            trace!(from = %env.from, to = %env.to, "drop: partition");
            self.observe_drop(&env, DropReason::NetworkPartition);
            return;
        }

        let loss = *self.packet_loss.read();
        if loss > 0.0 && self.rng.lock().gen::<f64>() < loss {
            trace!(from = %env.from, to = %env.to, "drop: packet loss");
            self.observe_drop(&env, DropReason::PacketLoss);
            return;
        }

        let handler = match self.handlers.get(&env.to) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };

        let delay = self.sample_latency();
        let closed = Arc::clone(&self.closed);
        let deliver = move || {
            if closed.load(Ordering::Acquire) {
                return;
            }
            handler(env.clone_for_delivery(now_millis()));
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    deliver();
                });
            }
            // No runtime (synchronous tests): deliver inline, or on a plain
            // thread when a delay was sampled.
            Err(_) if delay.is_zero() => deliver(),
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    deliver();
                });
            }
        }
    }

    fn observe_drop(&self, env: &Envelope, reason: DropReason) {
        if let Some(hook) = self.drop_hook.read().clone() {
            hook(env, reason);
        }
    }

    fn sample_latency(&self) -> Duration {
        let (min, max) = *self.latency.read();
        if max <= min {
            return min;
        }
        let span = (max - min).as_millis() as u64;
        if span == 0 {
            return min;
        }
        let jitter = self.rng.lock().gen_range(0..span);
        min + Duration::from_millis(jitter)
    }

    // ─── Network Characteristics ───

    /// Set the delivery latency window.
    pub fn set_latency(&self, min: Duration, max: Duration) {
        *self.latency.write() = (min, max);
    }

    /// Set the loss probability, clamped to `[0, 1]`.
    pub fn set_packet_loss(&self, probability: f64) {
        *self.packet_loss.write() = probability.clamp(0.0, 1.0);
    }

    pub fn packet_loss(&self) -> f64 {
        *self.packet_loss.read()
    }

    // ─── Partition Management ───

    /// Check whether messages from `from` to `to` are blocked.
    pub fn is_partitioned(&self, from: &NodeId, to: &NodeId) -> bool {
        self.partitions
            .read()
            .contains(&(from.clone(), to.clone()))
    }

    /// Enable or disable a directed partition.
    pub fn set_partition(&self, from: NodeId, to: NodeId, enabled: bool) {
        let mut partitions = self.partitions.write();
        if enabled {
            partitions.insert((from, to));
        } else {
            partitions.remove(&(from, to));
        }
    }

    /// Block both orderings between two nodes.
    pub fn create_bidirectional_partition(&self, a: NodeId, b: NodeId) {
        let mut partitions = self.partitions.write();
        partitions.insert((a.clone(), b.clone()));
        partitions.insert((b, a));
    }

    /// Remove a directed partition.
    pub fn heal_partition(&self, from: NodeId, to: NodeId) {
        self.set_partition(from, to, false);
    }

    /// Remove both orderings between two nodes.
    pub fn heal_bidirectional_partition(&self, a: NodeId, b: NodeId) {
        let mut partitions = self.partitions.write();
        partitions.remove(&(a.clone(), b.clone()));
        partitions.remove(&(b, a));
    }

    /// Restore full connectivity.
    pub fn clear_all_partitions(&self) {
        self.partitions.write().clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Snapshot of network configuration for state frames.
    pub fn network_stats(&self) -> serde_json::Value {
        let (min, max) = *self.latency.read();
        let partitions: Vec<serde_json::Value> = self
            .partitions
            .read()
            .iter()
            .map(|(from, to)| serde_json::json!({"from": from, "to": to}))
            .collect();
        serde_json::json!({
            "minLatencyMs": min.as_millis() as u64,
            "maxLatencyMs": max.as_millis() as u64,
            "packetLoss": *self.packet_loss.read(),
            "partitions": partitions,
        })
    }

    /// Shut the transport down. In-flight deliveries observe the flag and
    /// abort; subsequent sends are no-ops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.handlers.clear();
    }
}

impl Default for NetworkTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("handlers", &self.handlers.len())
            .field("latency", &*self.latency.read())
            .field("packet_loss", &*self.packet_loss.read())
            .field("partitions", &self.partitions.read().len())
            .finish()
    }
}
