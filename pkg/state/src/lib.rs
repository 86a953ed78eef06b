//! The broker's object substrate.
//!
//! A SlateDB-backed key-value store ([`client::StateStore`]), a broadcast
//! log of mutations ([`watch::EventLog`]), and a typed registry layer
//! ([`registry::Registry`]) providing optimistic concurrency and
//! finalizer-aware deletion on top of raw bytes.

pub mod client;
pub mod registry;
pub mod watch;
