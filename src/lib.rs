//! On-device network observatory and policy enforcer.
//!
//! Terminates TCP/UDP traffic arriving over a TUN device, re-originates it
//! through native sockets, accounts every datagram into per-5-tuple flows,
//! and feeds completed flows into per-application behavioral profiles with
//! ensemble anomaly scoring on top.
//!
//! The host supplies the TUN handle, the OS ownership lookup, and the
//! storage/alert sinks through the traits in [`hooks`]; [`engine::Engine`]
//! owns everything else.

pub mod analyzer;
pub mod anomaly;
pub mod blocklist;
pub mod buffer_pool;
pub mod config;
pub mod engine;
pub mod flow;
pub mod hooks;
pub mod packet;
pub mod profile;
pub mod proxy;
pub mod stats;

pub use anomaly::{AnomalyEnsemble, AnomalyResult, Severity};
pub use blocklist::Blocklist;
pub use config::Config;
pub use engine::{Engine, EngineHooks, EngineStats};
pub use flow::{Flow, FlowKey, FlowSnapshot};
pub use hooks::{
    AlertSink, AnomalyAlert, FeedbackVerdict, FlowRecord, OwnerResolver, PersistenceSink,
    ProfileRecord, TunReader, TunWriter,
};
pub use profile::{AppProfile, Maturity};
