//! ## credence-core::balance
//! **Per-connection balance valuation**
//!
//! A [`NodeBalance`] holds the positive (credit) and negative (debt) balance
//! of one connected peer. Nothing runs in the background: the balance is a
//! continuous function of time that is folded forward to the current instant
//! whenever the node is touched.
//!
//! Lock discipline: the node lock is taken first and released before the
//! tracker ledger is updated; the callback queue may be touched while the
//! node lock is held. Callback actions and observer notifications run after
//! every lock has been released.
//!
//! Because the ledger is updated after the node lock is gone, reports of two
//! mutations of one node may reach it in either order. Each report carries a
//! sequence number taken under the node lock and the ledger keeps only the
//! newest one.

mod callback;
mod factors;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::AbsTime;
use crate::decay::ExpiredValue;
use crate::error::BalanceError;
use crate::node_id::NodeId;
use crate::store::{BalanceRecord, DecayOffsets};
use crate::timer::Target;
use crate::tracker::Shared;

pub use callback::{CallbackAction, CallbackKind};
pub use factors::{PriceFactors, MAX_BALANCE};

use callback::{CallbackList, Slot};

/// Below this a price is treated as zero when inverting the cost model.
const MIN_PRICE: f64 = 1e-100;

/// Checks closer than this are scheduled exactly; later ones a bit early so
/// that small changes of the rate do not force a reschedule.
const EXACT_CHECK_WINDOW: Duration = Duration::from_secs(1);

/// Stored positive and negative balance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    pub pos: ExpiredValue,
    pub neg: ExpiredValue,
}

impl Balances {
    fn from_values(pos: u64, neg: u64, offsets: DecayOffsets) -> Self {
        let mut balances = Self::default();
        balances.pos.add(pos.min(MAX_BALANCE) as i64, offsets.pos);
        balances.neg.add(neg.min(MAX_BALANCE) as i64, offsets.neg);
        balances
    }

    /// Present values, never above [`MAX_BALANCE`].
    pub fn values(&self, offsets: DecayOffsets) -> (u64, u64) {
        (
            self.pos.value(offsets.pos).min(MAX_BALANCE),
            self.neg.value(offsets.neg).min(MAX_BALANCE),
        )
    }

    fn priority(&self, offsets: DecayOffsets, capacity: u64) -> i64 {
        let (pos, neg) = self.values(offsets);
        if !self.pos.is_zero() {
            (pos / capacity.max(1)) as i64
        } else {
            -(neg as i64)
        }
    }
}

pub(crate) struct NodeState {
    tracked: bool,
    capacity: u64,
    balance: Balances,
    pos_factors: PriceFactors,
    neg_factors: PriceFactors,
    sum_req_cost: u64,
    init_time: AbsTime,
    last_update: AbsTime,
    callbacks: CallbackList,
    has_priority: bool,
    next_check: Option<AbsTime>,
    timer_generation: u64,
    report_seq: u64,
}

impl NodeState {
    pub(crate) fn restored(
        record: BalanceRecord,
        capacity: u64,
        factors: (PriceFactors, PriceFactors),
        now: AbsTime,
    ) -> Self {
        Self {
            tracked: true,
            capacity,
            balance: Balances {
                pos: record.pos,
                neg: record.neg,
            },
            pos_factors: factors.0,
            neg_factors: factors.1,
            sum_req_cost: 0,
            init_time: now,
            last_update: now,
            callbacks: CallbackList::default(),
            has_priority: false,
            next_check: None,
            timer_generation: 0,
            report_seq: 0,
        }
    }

    /// Balance after `dt` of service at `capacity` starting from `from`,
    /// with `avg_req_cost` of request cost per nanosecond on top of the time
    /// price. Positive balance is spent first; the remaining time accrues
    /// debt. `offsets` should be taken at the middle of the period since the
    /// cost is applied continuously.
    fn reduced_balance(
        &self,
        from: Balances,
        dt: Duration,
        offsets: DecayOffsets,
        capacity: u64,
        avg_req_cost: f64,
    ) -> Balances {
        let mut balance = from;
        let mut dt = dt.as_nanos() as f64;
        if !balance.pos.is_zero() {
            let factor =
                self.pos_factors.time_price(capacity) + self.pos_factors.request_factor * avg_req_cost;
            let diff = -((dt * factor) as i64);
            let applied = balance.pos.add(diff, offsets.pos);
            if applied == diff {
                dt = 0.0;
            } else {
                dt += applied as f64 / factor;
            }
        }
        if dt > 0.0 {
            let factor =
                self.neg_factors.time_price(capacity) + self.neg_factors.request_factor * avg_req_cost;
            balance.neg.add((dt * factor) as i64, offsets.neg);
        }
        balance
    }

    /// Balance at `now` without modifying the state.
    fn current(&self, shared: &Shared, now: AbsTime) -> Balances {
        if self.capacity == 0 || now <= self.last_update {
            return self.balance;
        }
        let dt = now - self.last_update;
        let offsets = shared.offsets(self.last_update + dt / 2);
        self.reduced_balance(self.balance, dt, offsets, self.capacity, 0.0)
    }

    /// Folds the time cost since the last update into the stored balance.
    /// Inactive (zero capacity) nodes accrue nothing.
    fn update(&mut self, shared: &Shared, now: AbsTime) {
        if self.capacity != 0 && now > self.last_update {
            self.balance = self.current(shared, now);
            self.last_update = now;
        }
    }

    fn record(&self, now: AbsTime) -> BalanceRecord {
        BalanceRecord {
            pos: self.balance.pos,
            neg: self.balance.neg,
            last_update: now,
        }
    }

    /// Request cost per nanosecond, doubled for a pessimistic forecast. Only
    /// meaningful once the session has lasted more than a second.
    fn avg_request_cost(&self) -> f64 {
        let session = self.last_update.saturating_since(self.init_time);
        if session > Duration::from_secs(1) {
            self.sum_req_cost as f64 * 2.0 / session.as_nanos() as f64
        } else {
            0.0
        }
    }

    fn estimate(
        &self,
        ctx: &Context<'_>,
        until: AbsTime,
        capacity: u64,
        assume_positive_balance: bool,
    ) -> i64 {
        if until <= ctx.now {
            return self.balance.priority(ctx.offsets, capacity);
        }
        let avg_req_cost = if assume_positive_balance {
            0.0
        } else {
            self.avg_request_cost()
        };
        let dt = until - ctx.now;
        let offsets = ctx.shared.offsets(ctx.now + dt / 2);
        self.reduced_balance(self.balance, dt, offsets, capacity, avg_req_cost)
            .priority(ctx.shared.offsets(until), capacity)
    }

    /// Time until the priority at the node's own capacity drops to
    /// `priority`, or `None` if the current rates never get it there.
    fn time_until(&self, offsets: DecayOffsets, priority: i64) -> Option<Duration> {
        let (pos, neg) = self.balance.values(offsets);
        let mut dt = 0.0;
        if pos != 0 {
            let price = self.pos_factors.time_price(self.capacity);
            if price < MIN_PRICE {
                return None;
            }
            if priority > 0 {
                let target = (priority as u64).saturating_mul(self.capacity);
                if target > pos {
                    return None;
                }
                return Some(Duration::from_nanos(((pos - target) as f64 / price) as u64));
            }
            dt = pos as f64 / price;
        } else if priority > 0 {
            return None;
        }
        let debt = priority.unsigned_abs();
        if debt > neg {
            let price = self.neg_factors.time_price(self.capacity);
            if price < MIN_PRICE {
                return None;
            }
            dt += (debt - neg) as f64 / price;
        }
        Some(Duration::from_nanos(dt as u64))
    }

    fn cancel_timer(&mut self) {
        if self.next_check.take().is_some() {
            self.timer_generation += 1;
        }
    }
}

/// Per-call view of the tracker: the instant and decay offsets the whole
/// operation is evaluated at.
pub(crate) struct Context<'a> {
    shared: &'a Shared,
    now: AbsTime,
    offsets: DecayOffsets,
}

/// Work left over once the node lock has been released.
#[must_use]
struct Effects {
    /// New positive balance for the tracker total, with its sequence number.
    report: Option<(u64, ExpiredValue)>,
    gained_priority: bool,
    fired: Vec<CallbackAction>,
}

/// Balance state of one connected peer.
///
/// Every operation on a node that is no longer tracked (disconnected, or
/// whose tracker has stopped) is a no-op returning zero values.
pub struct NodeBalance {
    id: NodeId,
    me: Weak<NodeBalance>,
    shared: Weak<Shared>,
    state: Mutex<NodeState>,
}

impl NodeBalance {
    pub(crate) fn new(id: NodeId, shared: Weak<Shared>, state: NodeState) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            shared,
            state: Mutex::new(state),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_tracked(&self) -> bool {
        self.shared.strong_count() > 0 && self.state.lock().tracked
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    /// Stored balances as of the last update, without time cost applied.
    pub fn raw_balance(&self) -> Balances {
        self.state.lock().balance
    }

    /// Positive and negative balance at the current instant of the tracker's
    /// clock. The clock is the only time source of a node, so there is no way
    /// to ask for another instant. Nothing is written back.
    pub fn get_balance(&self) -> (u64, u64) {
        self.peek(|st, ctx| st.current(ctx.shared, ctx.now).values(ctx.offsets))
            .unwrap_or_default()
    }

    /// Priority at the clock's current instant, evaluated at `capacity`
    /// rather than the node's assigned capacity: `pos / capacity` while there
    /// is credit, `-neg` otherwise. Like [`Self::get_balance`] it reads the
    /// tracker clock instead of taking an instant.
    pub fn priority(&self, capacity: u64) -> i64 {
        self.peek(|st, ctx| {
            st.current(ctx.shared, ctx.now)
                .priority(ctx.offsets, capacity)
        })
        .unwrap_or_default()
    }

    pub fn price_factors(&self) -> (PriceFactors, PriceFactors) {
        let st = self.state.lock();
        (st.pos_factors, st.neg_factors)
    }

    /// Credits (or debits) the positive balance and returns the balance
    /// before and after. Debits clamp at zero and never create debt.
    pub fn add_balance(&self, amount: i64) -> Result<(u64, u64), BalanceError> {
        let outcome = self.mutate_balance(|st, ctx| {
            let old = st.balance.pos.value(ctx.offsets.pos).min(MAX_BALANCE);
            if amount > 0 && old.saturating_add(amount as u64) > MAX_BALANCE {
                return Err(BalanceError::Overflow);
            }
            st.balance.pos.add(amount, ctx.offsets.pos);
            let new = st.balance.pos.value(ctx.offsets.pos).min(MAX_BALANCE);
            Ok((old, new, st.record(ctx.now)))
        });
        match outcome {
            None => Ok((0, 0)),
            Some(Err(err)) => Err(err),
            Some(Ok((old, new, record))) => {
                debug!(node = %self.id, old, new, "Balance adjusted");
                self.store_best_effort(&record);
                Ok((old, new))
            }
        }
    }

    /// Replaces both balances.
    pub fn set_balance(&self, pos: u64, neg: u64) -> Result<(), BalanceError> {
        if pos > MAX_BALANCE || neg > MAX_BALANCE {
            return Err(BalanceError::Overflow);
        }
        let record = self.mutate_balance(|st, ctx| {
            st.balance = Balances::from_values(pos, neg, ctx.offsets);
            st.record(ctx.now)
        });
        if let Some(record) = record {
            debug!(node = %self.id, pos, neg, "Balance set");
            self.store_best_effort(&record);
        }
        Ok(())
    }

    /// Charges the cost of a served request. Credit is spent first (priced
    /// with the positive request factor); whatever it does not cover becomes
    /// debt priced with the negative request factor. Returns the amount taken
    /// from the positive balance and the amount added to the negative one.
    pub fn request_served(&self, cost: u64) -> (u64, u64) {
        self.mutate(|st, ctx| {
            let mut remaining = cost as f64;
            let mut pos_used = 0;
            if !st.balance.pos.is_zero() {
                let factor = st.pos_factors.request_factor;
                if factor != 0.0 {
                    let charge = -((remaining * factor) as i64);
                    let applied = st.balance.pos.add(charge, ctx.offsets.pos);
                    pos_used = applied.unsigned_abs();
                    remaining = if applied == charge {
                        0.0
                    } else {
                        remaining * (1.0 - applied as f64 / charge as f64)
                    };
                } else {
                    remaining = 0.0;
                }
            }
            let mut neg_added = 0;
            if remaining > 0.0 && st.neg_factors.request_factor != 0.0 {
                let charge = (remaining * st.neg_factors.request_factor) as i64;
                neg_added = st.balance.neg.add(charge, ctx.offsets.neg).unsigned_abs();
            }
            st.sum_req_cost = st.sum_req_cost.saturating_add(cost);
            (pos_used, neg_added)
        })
        .unwrap_or_default()
    }

    /// Lowest priority the node is expected to have until `until` when served
    /// at `capacity`. Priority only decreases under continued service, so this
    /// is the priority at `until`.
    ///
    /// With `assume_positive_balance` only the time price is projected;
    /// otherwise request cost is assumed to keep arriving at twice the
    /// session's average rate.
    pub fn estimated_min_priority(
        &self,
        until: AbsTime,
        capacity: u64,
        assume_positive_balance: bool,
    ) -> i64 {
        self.mutate(|st, ctx| st.estimate(ctx, until, capacity, assume_positive_balance))
            .unwrap_or_default()
    }

    /// Computes the pessimistic forecast for `until` and arms the
    /// [`CallbackKind::PriorityUpdate`] callback at that value, so the
    /// observer hears about it once the forecast has been reached.
    pub fn watch_min_priority(&self, until: AbsTime, capacity: u64) -> i64 {
        let Some(shared) = self.shared.upgrade() else {
            return 0;
        };
        let observer = shared.observer();
        let id = self.id;
        self.mutate(|st, ctx| {
            let estimate = st.estimate(ctx, until, capacity, false);
            st.callbacks.insert(
                Slot::Kind(CallbackKind::PriorityUpdate),
                estimate,
                Box::new(move || observer.priority_update(&id, estimate)),
            );
            estimate
        })
        .unwrap_or_default()
    }

    /// Positive balance that has to be added now so that the priority is
    /// still at least `priority` after `after` of service at `capacity`.
    /// `u64::MAX` if no admissible amount suffices.
    pub fn pos_balance_missing(&self, priority: i64, capacity: u64, after: Duration) -> u64 {
        self.peek(|st, ctx| {
            let (pos, neg) = st.current(ctx.shared, ctx.now).values(ctx.offsets);
            let mut after = u64::try_from(after.as_nanos()).unwrap_or(u64::MAX);
            let mut target = priority;
            if target < 0 {
                let price = st.neg_factors.time_price(capacity);
                let time_cost = (after as f64 * price) as u64;
                let debt = target.unsigned_abs();
                if time_cost.saturating_add(neg) < debt {
                    return 0;
                }
                if debt > neg && price > MIN_PRICE {
                    let debt_time = ((debt - neg) as f64 / price) as u64;
                    after = after.saturating_sub(debt_time);
                }
                target = 0;
            }
            let price = st.pos_factors.time_price(capacity);
            let required =
                ((target as f64 * capacity as f64 + after as f64 * price) as u64).saturating_add(1);
            if required >= MAX_BALANCE {
                return u64::MAX;
            }
            required.saturating_sub(pos)
        })
        .unwrap_or_default()
    }

    /// Replaces the cost model. Armed callbacks are rescheduled against the
    /// new rates.
    pub fn set_price_factors(&self, pos: PriceFactors, neg: PriceFactors) {
        self.mutate(|st, _| {
            st.pos_factors = pos;
            st.neg_factors = neg;
        });
    }

    /// Arms `action` to run once the priority is at or below `threshold`,
    /// replacing any callback of the same kind. Fires right away if the
    /// threshold is already reached on an active node.
    pub fn add_callback(&self, kind: CallbackKind, threshold: i64, action: CallbackAction) {
        self.mutate(|st, _| st.callbacks.insert(Slot::Kind(kind), threshold, action));
    }

    /// Cancels a pending callback. Returns `false` if there was none, which
    /// includes the case where it has already fired.
    pub fn remove_callback(&self, kind: CallbackKind) -> bool {
        let mut st = self.state.lock();
        if !st.tracked {
            return false;
        }
        let removed = st.callbacks.remove(Slot::Kind(kind));
        if st.callbacks.is_empty() {
            st.cancel_timer();
        }
        removed
    }

    /// Time until the priority reaches `priority` at the current rates.
    pub fn time_until(&self, priority: i64) -> Option<Duration> {
        self.mutate(|st, ctx| st.time_until(ctx.offsets, priority))
            .flatten()
    }

    /// Capacity changes alter the future rate only. A node going from zero
    /// capacity to non-zero starts accruing from now.
    pub(crate) fn set_capacity(&self, capacity: u64) {
        self.mutate(|st, ctx| {
            if st.capacity == 0 && capacity != 0 {
                st.last_update = ctx.now;
            }
            st.capacity = capacity;
        });
    }

    /// Re-evaluates callbacks when a queue entry comes due.
    pub(crate) fn on_timer(&self, generation: u64) {
        self.mutate(|st, _| {
            if st.timer_generation == generation {
                st.next_check = None;
            }
        });
    }

    /// Arms priority status tracking for a freshly connected node.
    pub(crate) fn activate(&self) {
        self.mutate_balance(|_, _| ());
    }

    /// Folds the time cost up to now into the balance (and so into the
    /// tracker total) and returns the persistable record.
    pub(crate) fn refresh(&self) -> Option<BalanceRecord> {
        self.mutate(|st, ctx| st.record(ctx.now))
    }

    /// Folds the balance to now and stops tracking. Pending callbacks are
    /// dropped without running. Returns the final record; reports still in
    /// flight are ignored by the tracker once the node has left the ledger.
    pub(crate) fn detach(&self) -> Option<BalanceRecord> {
        let shared = self.shared.upgrade()?;
        let now = shared.clock().now();
        let mut st = self.state.lock();
        if !st.tracked {
            return None;
        }
        st.update(&shared, now);
        st.tracked = false;
        st.callbacks.clear();
        st.cancel_timer();
        Some(st.record(now))
    }

    /// Runs when the positive balance has been used up.
    fn priority_exhausted(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let now = shared.clock().now();
        let record = {
            let mut st = self.state.lock();
            if !st.tracked || !st.has_priority {
                return;
            }
            st.has_priority = false;
            let balance = st.current(&shared, now);
            BalanceRecord {
                pos: balance.pos,
                neg: balance.neg,
                last_update: now,
            }
        };
        let _ = shared.persist(&self.id, &record);
        shared.priority_lost(&self.id);
    }

    fn store_best_effort(&self, record: &BalanceRecord) {
        if let Some(shared) = self.shared.upgrade() {
            // Failures are logged and counted by the tracker.
            let _ = shared.persist(&self.id, record);
        }
    }

    fn peek<R>(&self, op: impl FnOnce(&NodeState, &Context<'_>) -> R) -> Option<R> {
        let shared = self.shared.upgrade()?;
        let now = shared.clock().now();
        let ctx = Context {
            shared: &*shared,
            now,
            offsets: shared.offsets(now),
        };
        let st = self.state.lock();
        if !st.tracked {
            return None;
        }
        Some(op(&st, &ctx))
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut NodeState, &Context<'_>) -> R) -> Option<R> {
        self.mutate_with(false, op)
    }

    /// Like [`Self::mutate`], additionally re-evaluating the priority status.
    fn mutate_balance<R>(&self, op: impl FnOnce(&mut NodeState, &Context<'_>) -> R) -> Option<R> {
        self.mutate_with(true, op)
    }

    fn mutate_with<R>(
        &self,
        check_status: bool,
        op: impl FnOnce(&mut NodeState, &Context<'_>) -> R,
    ) -> Option<R> {
        let shared = self.shared.upgrade()?;
        let now = shared.clock().now();
        let ctx = Context {
            shared: &*shared,
            now,
            offsets: shared.offsets(now),
        };
        let (result, effects) = {
            let mut st = self.state.lock();
            if !st.tracked {
                return None;
            }
            let before = st.balance.pos;
            st.update(&shared, now);
            let result = op(&mut st, &ctx);
            let effects = self.settle(&mut st, &ctx, before, check_status);
            (result, effects)
        };
        self.apply(&shared, effects);
        Some(result)
    }

    /// Priority status, due callbacks and the next check, all under the node
    /// lock.
    fn settle(
        &self,
        st: &mut NodeState,
        ctx: &Context<'_>,
        before: ExpiredValue,
        check_status: bool,
    ) -> Effects {
        let mut gained_priority = false;
        if check_status && !st.has_priority && !st.balance.pos.is_zero() {
            st.has_priority = true;
            gained_priority = true;
            let me = self.me.clone();
            st.callbacks.insert(
                Slot::PriorityStatus,
                0,
                Box::new(move || {
                    if let Some(node) = me.upgrade() {
                        node.priority_exhausted();
                    }
                }),
            );
        }

        let report = (st.balance.pos != before).then(|| {
            st.report_seq += 1;
            (st.report_seq, st.balance.pos)
        });

        let fired = if st.capacity != 0 && !st.callbacks.is_empty() {
            let priority = st.balance.priority(ctx.offsets, st.capacity);
            st.callbacks.take_reached(priority)
        } else {
            Vec::new()
        };

        self.schedule_check(st, ctx);

        Effects {
            report,
            gained_priority,
            fired,
        }
    }

    fn schedule_check(&self, st: &mut NodeState, ctx: &Context<'_>) {
        let due_in = match st.callbacks.highest_threshold() {
            Some(threshold) if st.capacity != 0 => st.time_until(ctx.offsets, threshold),
            _ => None,
        };
        let Some(mut due_in) = due_in else {
            st.cancel_timer();
            return;
        };
        if due_in > EXACT_CHECK_WINDOW {
            due_in = (due_in - EXACT_CHECK_WINDOW) * 7 / 8 + EXACT_CHECK_WINDOW;
        }
        let at = ctx.now + due_in.max(Duration::from_nanos(1));
        if st.next_check.map_or(true, |next| next > at) {
            st.timer_generation += 1;
            st.next_check = Some(at);
            ctx.shared.queue().schedule(
                at,
                Target::Node {
                    id: self.id,
                    generation: st.timer_generation,
                },
            );
        }
    }

    fn apply(&self, shared: &Shared, effects: Effects) {
        if let Some((seq, pos)) = effects.report {
            shared.report_pos(self, seq, pos);
        }
        if effects.gained_priority {
            shared.priority_gained(&self.id);
        }
        if !effects.fired.is_empty() {
            shared.callbacks_fired(effects.fired.len());
        }
        for action in effects.fired {
            action();
        }
    }
}

impl std::fmt::Debug for NodeBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBalance")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
