//! Client side of the dashboard socket.
//!
//! A [`Transport`] keeps one logical connection alive and fans frames out to
//! listeners. The [`Correlator`] turns request/result frame pairs into
//! awaitable calls. Each [`DomainCache`] mirrors one server-owned collection
//! and follows the server's broadcasts, and the [`Coordinator`] reloads all
//! of them whenever a connection is (re)established.

pub mod cache;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod families;
pub mod listeners;
pub mod rpc;
pub mod transport;
pub mod ws;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test_support;

pub use {
    cache::{Change, Collection, DomainCache, Snapshot},
    client::DashboardClient,
    coordinator::{ConnectionState, Coordinator, Established, Resync, Signal},
    error::{Error, Result},
    families::{LogsCache, ModelsCache, PresetsCache, RouterStatusCache},
    listeners::ListenerId,
    rpc::Correlator,
    transport::{Connector, LinkEvent, ListenerGuard, Session, Transport},
    ws::WsConnector,
};
