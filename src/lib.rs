//! Offline-first persistence and sync layer for an invoicing app.
//!
//! Two independent components share one connectivity signal:
//! - [`mediator::NetworkMediator`] serves reads from versioned cache
//!   partitions or the network, by strategy.
//! - [`sync::SyncEngine`] buffers writes in an [`store::OfflineStore`] and
//!   delivers them to the backend once connectivity returns.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod mediator;
pub mod store;
pub mod sync;
