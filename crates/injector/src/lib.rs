//! Fault injection: immediate and virtual-time-scheduled failures.
//!
//! The injector mutates nodes and links through two seam traits so it stays
//! decoupled from the concrete plugin and transport. Crashes preserve node
//! identity; partitions are purely a link property and never alter node
//! state. In-flight message drops stay observable through the transport's
//! drop hook, not here.

use distlab_engine::VirtualTime;
use distlab_events::{kind, Event, EventBus};
use distlab_types::NodeId;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Scheduler wake cadence (wall time).
const SCHEDULER_TICK: Duration = Duration::from_millis(10);

/// Seam for crashing and recovering nodes. Implemented by the session over
/// the active plugin.
pub trait NodeFaults: Send + Sync {
    fn crash_node(&self, node: &NodeId);
    fn recover_node(&self, node: &NodeId);
}

/// Seam for partitioning and delaying links. Implemented by the session over
/// the transport.
pub trait LinkFaults: Send + Sync {
    fn create_partition(&self, from: &NodeId, to: &NodeId);
    fn heal_partition(&self, from: &NodeId, to: &NodeId);
    fn set_latency(&self, min: Duration, max: Duration);
}

/// Kind of injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Crash,
    Partition,
    Delay,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Crash => "crash",
            FailureKind::Partition => "partition",
            FailureKind::Delay => "delay",
        }
    }
}

/// A failure specification: what to break, when, and for how long.
#[derive(Debug, Clone)]
pub struct Failure {
    pub id: String,
    pub kind: FailureKind,
    /// Node id for crashes/delays; `"from:to"` for partitions.
    pub target: String,
    /// Offset from scheduling time (virtual time).
    pub start_offset: Duration,
    /// How long the failure lasts. Zero means permanent.
    pub duration: Duration,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Failure {
    fn param_node(&self, key: &str) -> Option<NodeId> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(NodeId::from)
    }

    fn param_bool(&self, key: &str) -> bool {
        self.params
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn param_millis(&self, key: &str) -> Option<Duration> {
        self.params
            .get(key)
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone)]
struct ScheduledEntry {
    failure: Failure,
    /// Virtual-time threshold in milliseconds.
    execute_at: u64,
    is_recover: bool,
}

/// Coordinates crash/partition/delay events against virtual-time schedules.
pub struct Injector {
    nodes: Arc<dyn NodeFaults>,
    links: Arc<dyn LinkFaults>,
    bus: Arc<EventBus>,
    clock: VirtualTime,

    active: Mutex<HashMap<String, Failure>>,
    scheduled: Mutex<Vec<ScheduledEntry>>,
    id_seq: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Injector {
    pub fn new(
        nodes: Arc<dyn NodeFaults>,
        links: Arc<dyn LinkFaults>,
        bus: Arc<EventBus>,
        clock: VirtualTime,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            nodes,
            links,
            bus,
            clock,
            active: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(Vec::new()),
            id_seq: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    fn next_id(&self) -> String {
        format!("failure-{}", self.id_seq.fetch_add(1, Ordering::Relaxed))
    }

    // ─── Immediate API ───

    /// Crash a node now.
    pub fn inject_crash(&self, node: &NodeId) -> Failure {
        let failure = Failure {
            id: self.next_id(),
            kind: FailureKind::Crash,
            target: node.to_string(),
            start_offset: Duration::ZERO,
            duration: Duration::ZERO,
            params: serde_json::Map::new(),
        };
        self.active
            .lock()
            .insert(failure.id.clone(), failure.clone());

        self.nodes.crash_node(node);
        info!(node = %node, failure = %failure.id, "crash injected");
        self.bus.emit(Event::with_fields(
            kind::NODE_CRASHED,
            [("nodeId", json!(node)), ("failureId", json!(failure.id))],
        ));
        failure
    }

    /// Recover a crashed node now, retiring its active crash failure.
    pub fn recover_node(&self, node: &NodeId) {
        let target = node.to_string();
        self.active
            .lock()
            .retain(|_, f| !(f.kind == FailureKind::Crash && f.target == target));

        self.nodes.recover_node(node);
        info!(node = %node, "node recovered");
        self.bus.emit(Event::with_fields(
            kind::NODE_RECOVERED,
            [("nodeId", json!(node))],
        ));
    }

    /// Partition a link now.
    pub fn inject_partition(&self, from: &NodeId, to: &NodeId, bidirectional: bool) -> Failure {
        let mut params = serde_json::Map::new();
        params.insert("from".into(), json!(from));
        params.insert("to".into(), json!(to));
        params.insert("bidirectional".into(), json!(bidirectional));

        let failure = Failure {
            id: self.next_id(),
            kind: FailureKind::Partition,
            target: format!("{from}:{to}"),
            start_offset: Duration::ZERO,
            duration: Duration::ZERO,
            params,
        };
        self.active
            .lock()
            .insert(failure.id.clone(), failure.clone());

        self.links.create_partition(from, to);
        if bidirectional {
            self.links.create_partition(to, from);
        }
        info!(%from, %to, bidirectional, "partition injected");
        self.bus.emit(Event::with_fields(
            kind::PARTITION_CREATED,
            [
                ("from", json!(from)),
                ("to", json!(to)),
                ("bidirectional", json!(bidirectional)),
                ("failureId", json!(failure.id)),
            ],
        ));
        failure
    }

    /// Heal a link now, retiring the matching active partition failure.
    pub fn heal_partition(&self, from: &NodeId, to: &NodeId, bidirectional: bool) {
        let target = format!("{from}:{to}");
        self.active
            .lock()
            .retain(|_, f| !(f.kind == FailureKind::Partition && f.target == target));

        self.links.heal_partition(from, to);
        if bidirectional {
            self.links.heal_partition(to, from);
        }
        info!(%from, %to, bidirectional, "partition healed");
        self.bus.emit(Event::with_fields(
            kind::PARTITION_HEALED,
            [
                ("from", json!(from)),
                ("to", json!(to)),
                ("bidirectional", json!(bidirectional)),
            ],
        ));
    }

    /// Reverse every still-active failure and drop all pending schedules.
    pub fn clear_all(&self) {
        let active: Vec<Failure> = self.active.lock().drain().map(|(_, f)| f).collect();
        self.scheduled.lock().clear();

        for failure in active {
            self.revert(&failure);
        }
    }

    /// Currently active failures.
    pub fn active_failures(&self) -> Vec<Failure> {
        self.active.lock().values().cloned().collect()
    }

    // ─── Scheduling ───

    /// Schedule a failure at `now + start_offset` on the virtual clock; if
    /// its duration is non-zero, a paired recovery is scheduled as well.
    pub fn schedule_failure(&self, failure: Failure) {
        let now = self.clock.now_millis();
        let execute_at = now + failure.start_offset.as_millis() as u64;

        let mut scheduled = self.scheduled.lock();
        if !failure.duration.is_zero() {
            scheduled.push(ScheduledEntry {
                failure: failure.clone(),
                execute_at: execute_at + failure.duration.as_millis() as u64,
                is_recover: true,
            });
        }
        scheduled.push(ScheduledEntry {
            failure,
            execute_at,
            is_recover: false,
        });
    }

    /// Spawn the background scheduler. It wakes every 10ms of wall time and
    /// applies entries whose virtual execute-time has passed.
    pub fn start(self: &Arc<Self>) {
        let injector = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SCHEDULER_TICK) => {}
                    _ = shutdown_rx.changed() => return,
                }

                let now = injector.clock.now_millis();
                let due: Vec<ScheduledEntry> = {
                    let mut scheduled = injector.scheduled.lock();
                    let (due, remaining) = scheduled
                        .drain(..)
                        .partition(|entry| entry.execute_at <= now);
                    *scheduled = remaining;
                    due
                };

                for entry in due {
                    debug!(
                        failure = %entry.failure.id,
                        kind = entry.failure.kind.as_str(),
                        recover = entry.is_recover,
                        "executing scheduled entry"
                    );
                    if entry.is_recover {
                        injector.revert(&entry.failure);
                    } else {
                        injector.apply(&entry.failure);
                    }
                }
            }
        });
    }

    /// Stop the scheduler task.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn apply(&self, failure: &Failure) {
        match failure.kind {
            FailureKind::Crash => {
                self.inject_crash(&NodeId::from(failure.target.clone()));
            }
            FailureKind::Partition => {
                if let (Some(from), Some(to)) =
                    (failure.param_node("from"), failure.param_node("to"))
                {
                    self.inject_partition(&from, &to, failure.param_bool("bidirectional"));
                }
            }
            FailureKind::Delay => {
                if let Some(delay) = failure.param_millis("delayMs") {
                    self.links.set_latency(delay, delay);
                    self.active
                        .lock()
                        .insert(failure.id.clone(), failure.clone());
                }
            }
        }
    }

    fn revert(&self, failure: &Failure) {
        match failure.kind {
            FailureKind::Crash => {
                self.recover_node(&NodeId::from(failure.target.clone()));
            }
            FailureKind::Partition => {
                if let (Some(from), Some(to)) =
                    (failure.param_node("from"), failure.param_node("to"))
                {
                    self.heal_partition(&from, &to, failure.param_bool("bidirectional"));
                }
            }
            FailureKind::Delay => {
                self.active.lock().remove(&failure.id);
                self.links.set_latency(Duration::ZERO, Duration::ZERO);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct FaultLog {
        crashes: PlMutex<Vec<String>>,
        recoveries: PlMutex<Vec<String>>,
        partitions: PlMutex<Vec<(String, String)>>,
        heals: PlMutex<Vec<(String, String)>>,
    }

    impl NodeFaults for FaultLog {
        fn crash_node(&self, node: &NodeId) {
            self.crashes.lock().push(node.to_string());
        }
        fn recover_node(&self, node: &NodeId) {
            self.recoveries.lock().push(node.to_string());
        }
    }

    impl LinkFaults for FaultLog {
        fn create_partition(&self, from: &NodeId, to: &NodeId) {
            self.partitions
                .lock()
                .push((from.to_string(), to.to_string()));
        }
        fn heal_partition(&self, from: &NodeId, to: &NodeId) {
            self.heals.lock().push((from.to_string(), to.to_string()));
        }
        fn set_latency(&self, _min: Duration, _max: Duration) {}
    }

    fn injector() -> (Arc<Injector>, Arc<FaultLog>, VirtualTime) {
        let log = Arc::new(FaultLog::default());
        let clock = VirtualTime::default();
        let injector = Arc::new(Injector::new(
            log.clone(),
            log.clone(),
            Arc::new(EventBus::new()),
            clock.clone(),
        ));
        (injector, log, clock)
    }

    #[test]
    fn test_crash_then_recover_updates_registry() {
        let (injector, log, _) = injector();
        let failure = injector.inject_crash(&"n1".into());
        assert_eq!(injector.active_failures().len(), 1);
        assert_eq!(failure.kind, FailureKind::Crash);
        assert_eq!(log.crashes.lock().as_slice(), ["n1"]);

        injector.recover_node(&"n1".into());
        assert!(injector.active_failures().is_empty());
        assert_eq!(log.recoveries.lock().as_slice(), ["n1"]);
    }

    #[test]
    fn test_bidirectional_partition_hits_both_orderings() {
        let (injector, log, _) = injector();
        injector.inject_partition(&"a".into(), &"b".into(), true);
        assert_eq!(
            log.partitions.lock().as_slice(),
            [("a".to_string(), "b".to_string()), ("b".to_string(), "a".to_string())]
        );

        injector.heal_partition(&"a".into(), &"b".into(), true);
        assert_eq!(log.heals.lock().len(), 2);
        assert!(injector.active_failures().is_empty());
    }

    #[test]
    fn test_clear_all_reverses_active_failures() {
        let (injector, log, _) = injector();
        injector.inject_crash(&"n1".into());
        injector.inject_partition(&"a".into(), &"b".into(), false);

        injector.clear_all();
        assert!(injector.active_failures().is_empty());
        assert_eq!(log.recoveries.lock().as_slice(), ["n1"]);
        assert_eq!(log.heals.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_failure_fires_at_virtual_threshold() {
        let (injector, log, clock) = injector();
        injector.schedule_failure(Failure {
            id: "f1".into(),
            kind: FailureKind::Crash,
            target: "n1".into(),
            start_offset: Duration::from_millis(500),
            duration: Duration::ZERO,
            params: serde_json::Map::new(),
        });
        injector.start();

        // Virtual time has not reached the threshold yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.crashes.lock().is_empty());

        // Advance virtual time past the threshold.
        clock.advance(Duration::from_millis(600));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.crashes.lock().as_slice(), ["n1"]);
        injector.stop();
    }

    #[tokio::test]
    async fn test_duration_schedules_paired_recovery() {
        let (injector, log, clock) = injector();
        injector.schedule_failure(Failure {
            id: "f1".into(),
            kind: FailureKind::Crash,
            target: "n1".into(),
            start_offset: Duration::ZERO,
            duration: Duration::from_millis(200),
            params: serde_json::Map::new(),
        });
        injector.start();

        clock.advance(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.crashes.lock().len(), 1);
        assert!(log.recoveries.lock().is_empty());

        clock.advance(Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.recoveries.lock().as_slice(), ["n1"]);
        injector.stop();
    }
}
