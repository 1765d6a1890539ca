//! The network core of a lightweight Electrum-family client: a pool of
//! concurrent sessions against remote indexing servers, a main-server
//! election and failover loop, a checkpoint-verifying header
//! synchronizer, and the script-hash subscription machinery that drives
//! wallet synchronization.
//!
//! The wallet data model and the persistent header database stay outside
//! this crate, consumed through the [`wallet::Wallet`] and
//! [`store::HeaderStore`] contracts.

pub mod config;
pub mod error;
pub mod network;
pub mod server;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod wallet;

mod rpc;
mod sync;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::NetworkOptions;
pub use error::{broadcast_failure_reason, SessionError};
pub use network::{
    BroadcastFailure, Callback, EventKind, Network, NetworkEvent, SwitchReason,
};
pub use server::{
    Protocol, Proxy, ProxyKind, ServerRegistry, ServerSpecError, ServerState, SvServer, UserAuth,
};
pub use session::{ProtocolVersion, SvSession, Tip};
pub use store::{ChainId, HeaderError, HeaderStore, MemoryHeaderStore};
pub use subscriptions::{history_status, SubscriptionTable, WalletRef};
pub use wallet::Wallet;
