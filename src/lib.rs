//! peerdock: drive remote container hosts over peer-to-peer links.
//!
//! One [`manager::ConnectionManager`] owns any number of Connections. Each
//! Connection has a single live peer at most, and a [`remote::Remote`] that
//! correlates commands with responses, multiplexes terminal sessions and
//! smooths telemetry for that peer alone.

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod listing;
pub mod manager;
pub mod mux;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod router;
pub mod session;
pub mod stats;
pub mod store;
pub mod terminal;
pub mod transport;
