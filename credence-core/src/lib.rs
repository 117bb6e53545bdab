//! # credence-core
//!
//! Balance tracking and priority accounting for connected peers.
//!
//! Every connected node carries a positive balance (prepaid credit) and a
//! negative balance (accrued debt). Connection time and served requests are
//! charged against them through linear price factors, both balances expire
//! exponentially, and the resulting priority drives admission and eviction
//! decisions in the layer above.
//!
//! ### Key Submodules:
//! - `balance`: per-node valuation, forecasting and threshold callbacks
//! - `tracker`: registry of live nodes, aggregate total, persistence and lifecycle
//! - `decay`: shared logarithmic expiration curve
//! - `clock` / `timer`: virtual time and the callback queue
//! - `store`: ordered key-value persistence contract

pub mod balance;
pub mod clock;
pub mod decay;
pub mod error;
pub mod node_id;
pub mod store;
mod timer;
pub mod tracker;

pub mod prelude {
    pub use crate::balance::*;
    pub use crate::clock::*;
    pub use crate::error::*;
    pub use crate::node_id::NodeId;
    pub use crate::tracker::*;
}

pub use balance::{
    Balances, CallbackAction, CallbackKind, NodeBalance, PriceFactors, MAX_BALANCE,
};
pub use clock::{AbsTime, Clock, SimulatedClock, SystemClock, TimerDriver};
pub use decay::{DecayModel, ExpiredValue, Fixed64};
pub use error::{BalanceError, StoreError};
pub use node_id::NodeId;
pub use store::{BalanceDb, BalanceRecord, DecayOffsets, KeyValueStore, MemoryStore};
pub use tracker::{BalanceObserver, BalanceTracker, ConnectionEvents, NoopObserver};
