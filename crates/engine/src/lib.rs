//! Tick-driven scheduling engine.
//!
//! The engine owns virtual time and the run mode, and drives every
//! registered node's `tick` once per quantum:
//!
//! - **Realtime**: ticks fire every `tick_rate / speed` of wall time.
//! - **Step**: the loop blocks until an external step signal arrives.
//! - **Paused**: no ticks, no virtual-time advance.
//!
//! Each tick advances virtual time by exactly `tick_rate` regardless of real
//! elapsed time; the speed multiplier only changes wall-clock pacing.
//! Node iteration order within a tick is unspecified — distributed nodes
//! make local progress in parallel.

use distlab_events::{kind, EventBus};
use distlab_node::TickNode;
use distlab_types::NodeId;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Execution mode of the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMode {
    Realtime,
    Step,
    Paused,
}

impl SimulationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationMode::Realtime => "realtime",
            SimulationMode::Step => "step",
            SimulationMode::Paused => "paused",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Speed multiplier, clamped to [0.1, 10.0] when applied.
    pub speed: f64,
    /// Virtual-time advance per tick.
    pub tick_rate: Duration,
    /// Start in step mode instead of realtime.
    pub step_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            tick_rate: Duration::from_millis(100),
            step_mode: false,
        }
    }
}

const MIN_SPEED: f64 = 0.1;
const MAX_SPEED: f64 = 10.0;

/// Shared monotone virtual-time handle (epoch of the simulation start, in
/// milliseconds). Cheap to clone; the injector polls it for scheduling.
#[derive(Debug, Clone, Default)]
pub struct VirtualTime(Arc<AtomicU64>);

impl VirtualTime {
    pub fn now_millis(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn now(&self) -> Duration {
        Duration::from_millis(self.now_millis())
    }

    /// Advance the clock. Called once per engine tick; exposed for tests
    /// that drive virtual time directly.
    pub fn advance(&self, by: Duration) -> u64 {
        self.0
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel)
            + by.as_millis() as u64
    }
}

/// Tick-driven simulation engine.
///
/// The tick loop runs as one detached task per engine; `stop` signals the
/// shutdown channel and every derived activity exits without further side
/// effects.
pub struct Engine {
    nodes: RwLock<Vec<Arc<dyn TickNode>>>,
    bus: Arc<EventBus>,
    config: EngineConfig,

    mode: RwLock<SimulationMode>,
    speed: RwLock<f64>,
    virtual_time: VirtualTime,
    running: AtomicBool,

    step_tx: mpsc::Sender<()>,
    step_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(bus: Arc<EventBus>, config: EngineConfig) -> Self {
        let (step_tx, step_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = watch::channel(false);
        let speed = config.speed.clamp(MIN_SPEED, MAX_SPEED);
        Self {
            nodes: RwLock::new(Vec::new()),
            bus,
            config,
            mode: RwLock::new(SimulationMode::Paused),
            speed: RwLock::new(speed),
            virtual_time: VirtualTime::default(),
            running: AtomicBool::new(false),
            step_tx,
            step_rx: Mutex::new(Some(step_rx)),
            shutdown_tx,
        }
    }

    // ─── Node Registry ───

    pub fn add_node(&self, node: Arc<dyn TickNode>) {
        self.nodes.write().push(node);
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<dyn TickNode>> {
        self.nodes.read().iter().find(|n| n.id() == id).cloned()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().iter().map(|n| n.id().clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    // ─── Lifecycle ───

    /// Start every registered node and begin the tick loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.mode.write() = if self.config.step_mode {
            SimulationMode::Step
        } else {
            SimulationMode::Realtime
        };

        for node in self.nodes.read().iter() {
            node.start();
        }

        info!(
            mode = self.mode().as_str(),
            speed = self.speed(),
            nodes = self.node_count(),
            "simulation started"
        );
        self.bus.emit(distlab_events::Event::with_fields(
            kind::SIMULATION_STARTED,
            [
                ("mode", json!(self.mode().as_str())),
                ("speed", json!(self.speed())),
            ],
        ));

        let engine = Arc::clone(self);
        let mut step_rx = self
            .step_rx
            .lock()
            .take()
            .expect("engine started more than once");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            engine.run(&mut step_rx, &mut shutdown_rx).await;
        });
    }

    /// Stop the loop, stop every node, and prevent further ticks.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        for node in self.nodes.read().iter() {
            node.stop();
        }

        info!("simulation stopped");
        self.bus.emit(distlab_events::Event::with_fields(
            kind::SIMULATION_STOPPED,
            [],
        ));
    }

    async fn run(&self, step_rx: &mut mpsc::Receiver<()>, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if !self.is_running() {
                return;
            }

            match self.mode() {
                SimulationMode::Realtime => {
                    self.tick();
                    let pacing = self.config.tick_rate.div_f64(self.speed());
                    tokio::select! {
                        _ = tokio::time::sleep(pacing) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }
                SimulationMode::Step => {
                    tokio::select! {
                        signal = step_rx.recv() => {
                            if signal.is_none() {
                                return;
                            }
                            self.tick();
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }
                SimulationMode::Paused => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }
            }
        }
    }

    /// One quantum: advance virtual time, tick every node.
    ///
    /// The node list is snapshotted first so no lock is held across a
    /// node's `tick`.
    fn tick(&self) {
        let now = self.virtual_time.advance(self.config.tick_rate);

        let nodes: Vec<Arc<dyn TickNode>> = self.nodes.read().clone();
        for node in &nodes {
            node.tick();
        }

        debug!(virtual_time = now, "tick");
        self.bus.emit(distlab_events::Event::with_fields(
            kind::SIMULATION_TICK,
            [("virtualTime", json!(now))],
        ));
    }

    // ─── Mode Control ───

    pub fn pause(&self) {
        *self.mode.write() = SimulationMode::Paused;
        self.bus.emit(distlab_events::Event::with_fields(
            kind::SIMULATION_PAUSED,
            [],
        ));
    }

    pub fn resume(&self) {
        let mode = if self.config.step_mode {
            SimulationMode::Step
        } else {
            SimulationMode::Realtime
        };
        *self.mode.write() = mode;
        self.bus.emit(distlab_events::Event::with_fields(
            kind::SIMULATION_RESUMED,
            [("mode", json!(mode.as_str()))],
        ));
    }

    /// Signal one step. Only meaningful in step mode; extra signals beyond
    /// the channel capacity are discarded.
    pub fn step(&self) {
        let _ = self.step_tx.try_send(());
    }

    /// Signal `n` steps.
    pub fn step_n(&self, n: usize) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Apply a speed multiplier, clamped to [0.1, 10.0].
    pub fn set_speed(&self, speed: f64) {
        *self.speed.write() = speed.clamp(MIN_SPEED, MAX_SPEED);
    }

    // ─── Introspection ───

    pub fn mode(&self) -> SimulationMode {
        *self.mode.read()
    }

    pub fn speed(&self) -> f64 {
        *self.speed.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn virtual_time(&self) -> VirtualTime {
        self.virtual_time.clone()
    }

    pub fn tick_rate(&self) -> Duration {
        self.config.tick_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distlab_types::StateMap;
    use std::sync::atomic::AtomicUsize;

    struct CountingNode {
        id: NodeId,
        ticks: AtomicUsize,
    }

    impl CountingNode {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                ticks: AtomicUsize::new(0),
            })
        }
    }

    impl TickNode for CountingNode {
        fn id(&self) -> &NodeId {
            &self.id
        }
        fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        fn snapshot(&self) -> StateMap {
            StateMap::new()
        }
        fn crash(&self) {}
        fn recover(&self) {}
    }

    fn step_engine() -> (Arc<Engine>, Arc<CountingNode>) {
        let engine = Arc::new(Engine::new(
            Arc::new(EventBus::new()),
            EngineConfig {
                step_mode: true,
                ..Default::default()
            },
        ));
        let node = CountingNode::new("n1");
        engine.add_node(node.clone());
        (engine, node)
    }

    #[tokio::test]
    async fn test_step_mode_ticks_on_signal() {
        let (engine, node) = step_engine();
        engine.start();

        engine.step_n(3);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(node.ticks.load(Ordering::SeqCst), 3);
        // Virtual time advanced by tick_rate per step.
        assert_eq!(engine.virtual_time().now_millis(), 300);
        engine.stop();
    }

    #[tokio::test]
    async fn test_paused_engine_does_not_tick() {
        let (engine, node) = step_engine();
        engine.start();
        engine.pause();
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.step();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.ticks.load(Ordering::SeqCst), 0);

        engine.resume();
        engine.step();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.ticks.load(Ordering::SeqCst), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn test_stop_prevents_further_ticks() {
        let (engine, node) = step_engine();
        engine.start();
        engine.step();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop();

        let before = node.ticks.load(Ordering::SeqCst);
        engine.step();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.ticks.load(Ordering::SeqCst), before);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_realtime_mode_ticks_by_itself() {
        let engine = Arc::new(Engine::new(
            Arc::new(EventBus::new()),
            EngineConfig {
                tick_rate: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let node = CountingNode::new("n1");
        engine.add_node(node.clone());
        engine.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop();
        assert!(node.ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_speed_clamp() {
        let engine = Engine::new(Arc::new(EventBus::new()), EngineConfig::default());
        engine.set_speed(0.0);
        assert_eq!(engine.speed(), 0.1);
        engine.set_speed(100.0);
        assert_eq!(engine.speed(), 10.0);
        engine.set_speed(2.5);
        assert_eq!(engine.speed(), 2.5);
    }
}
