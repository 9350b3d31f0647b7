//! # colonyd - Cluster coordination for plugin daemons
//!
//! Nodes hosting plugin processes cooperate through a shared coordination
//! store: they heartbeat, elect a master, vote on each other's addresses,
//! publish which plugins they host, and forward requests to the node that
//! hosts the target plugin.
//!
//! ## Architecture
//! ```text
//! Client → colonyd (A) ──redirect──→ colonyd (B) → Plugin
//!              ↓                         ↓
//!           Redis (cluster state, master lock, new-node channel)
//! ```

pub mod cluster;
pub mod config;
pub mod routes;
pub mod state;
pub mod store;
