//! ## credence-core::tracker
//! **Coordinator of all live balances**
//!
//! [`BalanceTracker`] owns the registry of connected nodes, the aggregate
//! positive balance, the two decay models, the store handle and the callback
//! queue. It is driven by the connection layer through [`ConnectionEvents`]
//! and reports priority status changes through [`BalanceObserver`].
//!
//! The ledger lock (registry plus total) is never held while a node lock is
//! taken, nor across store I/O or callback actions.
//!
//! The total is the sum of the positive balances last reported by each node.
//! Nodes report after every change of their stored balance; time cost of an
//! idle node is folded in by the periodic flush, so the total lags the live
//! balances by at most one flush interval.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use credence_config::TrackerConfig;
use credence_telemetry::{EventLogger, MetricsRecorder};
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::balance::{NodeBalance, NodeState, PriceFactors};
use crate::clock::{AbsTime, Clock, TimerDriver};
use crate::decay::{DecayModel, ExpiredValue};
use crate::error::{BalanceError, StoreError};
use crate::node_id::NodeId;
use crate::store::{BalanceDb, BalanceRecord, DecayOffsets, KeyValueStore};
use crate::timer::{spawn_dispatcher, CallbackQueue, Target};

/// Receives priority status changes of tracked nodes. Called with no
/// tracker or balance lock held.
pub trait BalanceObserver: Send + Sync {
    /// The node's positive balance became non-zero.
    fn priority_gained(&self, _id: &NodeId) {}

    /// The node's positive balance has been used up.
    fn priority_lost(&self, _id: &NodeId) {}

    /// The priority reached the forecast armed by
    /// [`NodeBalance::watch_min_priority`].
    fn priority_update(&self, _id: &NodeId, _estimate: i64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BalanceObserver for NoopObserver {}

/// Connection lifecycle notifications from the connection registry.
pub trait ConnectionEvents {
    fn on_connect(&self, id: NodeId, capacity: u64) -> Arc<NodeBalance>;

    fn on_disconnect(&self, id: &NodeId) -> Result<(), BalanceError>;

    /// Changes the rate of future time cost only; balances are untouched.
    fn on_capacity_changed(&self, id: &NodeId, capacity: u64);
}

/// A live node and the positive balance it last reported.
struct Tracked {
    node: Arc<NodeBalance>,
    reported: ExpiredValue,
    seq: u64,
}

#[derive(Default)]
struct Ledger {
    total: ExpiredValue,
    nodes: HashMap<NodeId, Tracked>,
}

struct Settings {
    pos_factors: PriceFactors,
    neg_factors: PriceFactors,
    pos_expiration_secs: u64,
    neg_expiration_secs: u64,
}

/// State shared between the tracker, its nodes and the dispatcher.
pub(crate) struct Shared {
    clock: Arc<dyn Clock>,
    pos_decay: DecayModel,
    neg_decay: DecayModel,
    db: BalanceDb,
    queue: Arc<CallbackQueue>,
    ledger: Mutex<Ledger>,
    settings: RwLock<Settings>,
    observer: Arc<dyn BalanceObserver>,
    metrics: MetricsRecorder,
    pos_threshold: u64,
    neg_threshold: u64,
    flush_interval: Duration,
    stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn queue(&self) -> &CallbackQueue {
        &self.queue
    }

    pub(crate) fn observer(&self) -> Arc<dyn BalanceObserver> {
        self.observer.clone()
    }

    pub(crate) fn offsets(&self, at: AbsTime) -> DecayOffsets {
        DecayOffsets {
            pos: self.pos_decay.log_offset(at),
            neg: self.neg_decay.log_offset(at),
        }
    }

    /// Replaces a node's previously reported positive balance in the total.
    /// Reports older than the one already applied, and reports of nodes that
    /// have left the ledger, are dropped.
    pub(crate) fn report_pos(&self, node: &NodeBalance, seq: u64, pos: ExpiredValue) {
        let offset = self.pos_decay.log_offset(self.clock.now());
        let total = {
            let mut guard = self.ledger.lock();
            let ledger = &mut *guard;
            let Some(tracked) = ledger.nodes.get_mut(&node.id()) else {
                return;
            };
            if !std::ptr::eq(Arc::as_ptr(&tracked.node), node) || tracked.seq >= seq {
                return;
            }
            ledger.total.add_exp(pos);
            ledger.total.sub_exp(tracked.reported);
            tracked.reported = pos;
            tracked.seq = seq;
            ledger.total.value(offset)
        };
        self.metrics.set_total_token_amount(total);
    }

    /// Writes a node record, or deletes it when both balances are at or below
    /// their persistence thresholds. Failures are logged and counted here.
    pub(crate) fn persist(&self, id: &NodeId, record: &BalanceRecord) -> Result<(), StoreError> {
        let offsets = self.offsets(self.clock.now());
        let droppable = record.pos.value(offsets.pos) <= self.pos_threshold
            && record.neg.value(offsets.neg) <= self.neg_threshold;
        let result = if droppable {
            self.db.remove(id)
        } else {
            self.db.save(id, record)
        };
        if let Err(err) = &result {
            self.metrics.persist_failures.inc();
            warn!(node = %id, error = %err, "Failed to persist balance");
        }
        result
    }

    pub(crate) fn priority_gained(&self, id: &NodeId) {
        EventLogger::log_event("priority_gained", vec![KeyValue::new("node", id.to_string())]);
        self.observer.priority_gained(id);
    }

    pub(crate) fn priority_lost(&self, id: &NodeId) {
        EventLogger::log_event("priority_lost", vec![KeyValue::new("node", id.to_string())]);
        self.observer.priority_lost(id);
    }

    pub(crate) fn callbacks_fired(&self, count: usize) {
        self.metrics.callbacks_fired.inc_by(count as u64);
    }

    fn node(&self, id: &NodeId) -> Option<Arc<NodeBalance>> {
        self.ledger.lock().nodes.get(id).map(|tracked| tracked.node.clone())
    }

    fn save_offsets(&self) -> Result<(), StoreError> {
        let result = self.db.save_offsets(&self.offsets(self.clock.now()));
        if let Err(err) = &result {
            self.metrics.persist_failures.inc();
            warn!(error = %err, "Failed to persist decay offsets");
        }
        result
    }

    /// Folds every live node to now, which brings the total up to date, and
    /// persists the nodes and the decay offsets. Keeps going on failure and
    /// reports the last error.
    fn flush_nodes(&self) -> Result<(), BalanceError> {
        let nodes: Vec<Arc<NodeBalance>> = self
            .ledger
            .lock()
            .nodes
            .values()
            .map(|tracked| tracked.node.clone())
            .collect();
        let mut result = Ok(());
        for node in &nodes {
            if let Some(record) = node.refresh() {
                if let Err(err) = self.persist(&node.id(), &record) {
                    result = Err(err.into());
                }
            }
        }
        if let Err(err) = self.save_offsets() {
            result = Err(err.into());
        }
        debug!(nodes = nodes.len(), "Flushed balances");
        result
    }
}

impl TimerDriver for Shared {
    fn next_deadline(&self) -> Option<AbsTime> {
        self.queue.next_deadline()
    }

    fn fire_due(&self, now: AbsTime) {
        while let Some(target) = self.queue.pop_due(now) {
            match target {
                Target::Node { id, generation } => {
                    if let Some(node) = self.node(&id) {
                        node.on_timer(generation);
                    }
                }
                Target::Flush => {
                    // Errors were already logged per record.
                    let _ = self.flush_nodes();
                    self.queue.schedule(now + self.flush_interval, Target::Flush);
                }
            }
        }
    }
}

/// Tracks the balances of all connected nodes.
pub struct BalanceTracker {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BalanceTracker {
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn KeyValueStore>, config: &TrackerConfig) -> Self {
        Self::with_observer(clock, store, config, Arc::new(NoopObserver))
    }

    /// Builds a tracker, restoring the persisted decay offsets. Uses the
    /// clock's own timer firing when it offers one (simulated time) and a
    /// dispatcher thread otherwise.
    pub fn with_observer(
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        config: &TrackerConfig,
        observer: Arc<dyn BalanceObserver>,
    ) -> Self {
        let db = BalanceDb::new(store);
        let metrics = MetricsRecorder::new();
        let now = clock.now();

        let offsets = db.load_offsets().unwrap_or_else(|err| {
            metrics.persist_failures.inc();
            warn!(error = %err, "Failed to load decay offsets, starting from zero");
            None
        });
        let offsets = offsets.unwrap_or_default();
        let pos_decay = DecayModel::new();
        pos_decay.set_log_offset(now, offsets.pos);
        pos_decay.set_rate(now, DecayModel::rate_for_time_constant(config.pos_expiration_secs));
        let neg_decay = DecayModel::new();
        neg_decay.set_log_offset(now, offsets.neg);
        neg_decay.set_rate(now, DecayModel::rate_for_time_constant(config.neg_expiration_secs));

        let flush_interval = Duration::from_secs(config.flush_interval_secs.max(1));
        let shared = Arc::new(Shared {
            clock,
            pos_decay,
            neg_decay,
            db,
            queue: Arc::new(CallbackQueue::new()),
            ledger: Mutex::new(Ledger::default()),
            settings: RwLock::new(Settings {
                pos_factors: config.pos_factors.into(),
                neg_factors: config.neg_factors.into(),
                pos_expiration_secs: config.pos_expiration_secs,
                neg_expiration_secs: config.neg_expiration_secs,
            }),
            observer,
            metrics,
            pos_threshold: config.pos_persist_threshold,
            neg_threshold: config.neg_persist_threshold,
            flush_interval,
            stopped: AtomicBool::new(false),
        });
        shared.queue.schedule(now + flush_interval, Target::Flush);

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let driver: Weak<dyn TimerDriver> = weak;
        let dispatcher = if shared.clock.attach(driver.clone()) {
            None
        } else {
            match spawn_dispatcher(shared.queue.clone(), shared.clock.clone(), driver) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!(error = %err, "Failed to start callback dispatcher");
                    None
                }
            }
        };

        info!(
            pos_expiration_secs = config.pos_expiration_secs,
            neg_expiration_secs = config.neg_expiration_secs,
            flush_interval_secs = flush_interval.as_secs(),
            "Balance tracker started"
        );
        Self {
            shared,
            dispatcher: Mutex::new(dispatcher),
        }
    }

    /// Starts tracking a node, restoring its persisted balance. A store
    /// failure is logged and the node starts from zero. Connecting an already
    /// tracked node returns the live handle; after [`Self::stop`] the returned
    /// node is detached.
    #[instrument(skip(self), fields(node = %id))]
    pub fn connect(&self, id: NodeId, capacity: u64) -> Arc<NodeBalance> {
        let shared = &self.shared;
        let factors = {
            let settings = shared.settings.read();
            (settings.pos_factors, settings.neg_factors)
        };
        let now = shared.clock.now();
        if shared.stopped.load(Ordering::Acquire) {
            let state = NodeState::restored(BalanceRecord::default(), capacity, factors, now);
            return NodeBalance::new(id, Weak::new(), state);
        }
        if let Some(node) = shared.node(&id) {
            return node;
        }

        let record = shared.db.load(&id).unwrap_or_else(|err| {
            shared.metrics.persist_failures.inc();
            warn!(error = %err, "Failed to load balance, starting from zero");
            None
        });
        let record = record.unwrap_or_default();
        let node = NodeBalance::new(
            id,
            Arc::downgrade(shared),
            NodeState::restored(record, capacity, factors, now),
        );

        let offset = shared.pos_decay.log_offset(now);
        let (node, inserted, tracked, total) = {
            let mut guard = shared.ledger.lock();
            let ledger = &mut *guard;
            let (node, inserted) = match ledger.nodes.entry(id) {
                Entry::Occupied(entry) => (entry.get().node.clone(), false),
                Entry::Vacant(entry) => {
                    entry.insert(Tracked {
                        node: node.clone(),
                        reported: record.pos,
                        seq: 0,
                    });
                    ledger.total.add_exp(record.pos);
                    (node, true)
                }
            };
            (node, inserted, ledger.nodes.len(), ledger.total.value(offset))
        };
        if !inserted {
            return node;
        }

        shared.metrics.tracked_nodes.set(tracked as i64);
        shared.metrics.set_total_token_amount(total);
        node.activate();

        let (pos, neg) = node.get_balance();
        info!(capacity, pos, neg, "Node connected");
        EventLogger::log_event(
            "connect",
            vec![
                KeyValue::new("node", id.to_string()),
                KeyValue::new("pos", pos as i64),
                KeyValue::new("neg", neg as i64),
            ],
        );
        node
    }

    /// Stops tracking a node: folds its balance to now, drops its callbacks,
    /// removes its last reported balance from the total and persists the
    /// final record. The node is discarded even when the write fails; the
    /// failure is returned.
    #[instrument(skip(self), fields(node = %id))]
    pub fn disconnect(&self, id: &NodeId) -> Result<(), BalanceError> {
        let shared = &self.shared;
        let Some(node) = shared.node(id) else {
            return Ok(());
        };
        let Some(record) = node.detach() else {
            return Ok(());
        };

        let offsets = shared.offsets(record.last_update);
        let (tracked, total) = {
            let mut guard = shared.ledger.lock();
            let ledger = &mut *guard;
            if ledger
                .nodes
                .get(id)
                .is_some_and(|live| Arc::ptr_eq(&live.node, &node))
            {
                if let Some(removed) = ledger.nodes.remove(id) {
                    ledger.total.sub_exp(removed.reported);
                }
            }
            (ledger.nodes.len(), ledger.total.value(offsets.pos))
        };
        shared.metrics.tracked_nodes.set(tracked as i64);
        shared.metrics.set_total_token_amount(total);

        let pos = record.pos.value(offsets.pos);
        let neg = record.neg.value(offsets.neg);
        info!(pos, neg, "Node disconnected");
        EventLogger::log_event(
            "disconnect",
            vec![
                KeyValue::new("node", id.to_string()),
                KeyValue::new("pos", pos.min(i64::MAX as u64) as i64),
                KeyValue::new("neg", neg.min(i64::MAX as u64) as i64),
            ],
        );

        shared.persist(id, &record)?;
        Ok(())
    }

    /// Sum of the positive balances of all tracked nodes. Time cost is
    /// reflected once the node has been touched since it accrued, or at the
    /// latest by the next periodic flush.
    pub fn total_token_amount(&self) -> u64 {
        let offset = self.shared.pos_decay.log_offset(self.shared.clock.now());
        self.shared.ledger.lock().total.value(offset)
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<NodeBalance>> {
        self.shared.node(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.shared.ledger.lock().nodes.len()
    }

    /// Price factors applied to nodes connected from now on.
    pub fn set_default_factors(&self, pos: PriceFactors, neg: PriceFactors) {
        let mut settings = self.shared.settings.write();
        settings.pos_factors = pos;
        settings.neg_factors = neg;
    }

    pub fn default_factors(&self) -> (PriceFactors, PriceFactors) {
        let settings = self.shared.settings.read();
        (settings.pos_factors, settings.neg_factors)
    }

    /// Changes the expiration time constants (seconds, zero disables decay).
    /// Decay accumulated so far is kept.
    pub fn set_expiration_tcs(&self, pos_secs: u64, neg_secs: u64) {
        let now = self.shared.clock.now();
        self.shared
            .pos_decay
            .set_rate(now, DecayModel::rate_for_time_constant(pos_secs));
        self.shared
            .neg_decay
            .set_rate(now, DecayModel::rate_for_time_constant(neg_secs));
        let mut settings = self.shared.settings.write();
        settings.pos_expiration_secs = pos_secs;
        settings.neg_expiration_secs = neg_secs;
    }

    pub fn expiration_tcs(&self) -> (u64, u64) {
        let settings = self.shared.settings.read();
        (settings.pos_expiration_secs, settings.neg_expiration_secs)
    }

    /// Ids in `[start, stop)` with a persisted positive balance, in id order.
    /// Live nodes appear as of their last write or flush.
    pub fn positive_balance_ids(
        &self,
        start: &NodeId,
        stop: Option<&NodeId>,
        max: usize,
    ) -> Result<Vec<NodeId>, BalanceError> {
        Ok(self.shared.db.positive_ids(start, stop, max)?)
    }

    /// Persists all live balances and the decay offsets now.
    pub fn flush(&self) -> Result<(), BalanceError> {
        self.shared.flush_nodes()
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.shared.metrics
    }

    /// Halts callback dispatch, disconnects (and so persists) every tracked
    /// node and saves the decay offsets. Further calls do nothing.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<(), BalanceError> {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.queue.stop();
        if let Some(handle) = self.dispatcher.lock().take() {
            // An action running on the dispatcher may itself call stop.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Callback dispatcher panicked");
            }
        }

        let ids: Vec<NodeId> = self.shared.ledger.lock().nodes.keys().copied().collect();
        let mut result = Ok(());
        for id in &ids {
            if let Err(err) = self.disconnect(id) {
                result = Err(err);
            }
        }
        if let Err(err) = self.shared.save_offsets() {
            result = Err(err.into());
        }
        info!(nodes = ids.len(), "Balance tracker stopped");
        result
    }
}

impl ConnectionEvents for BalanceTracker {
    fn on_connect(&self, id: NodeId, capacity: u64) -> Arc<NodeBalance> {
        self.connect(id, capacity)
    }

    fn on_disconnect(&self, id: &NodeId) -> Result<(), BalanceError> {
        self.disconnect(id)
    }

    fn on_capacity_changed(&self, id: &NodeId, capacity: u64) {
        if let Some(node) = self.shared.node(id) {
            debug!(node = %id, capacity, "Capacity changed");
            node.set_capacity(capacity);
        }
    }
}

impl Drop for BalanceTracker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "Balance tracker stopped with errors");
        }
    }
}
