//! Core event and identity substrate for an IRC server daemon: the registry of
//! named entity tables, a dense-integer keyspace allocator, per-object ancillary
//! storage, a priority-ordered lifecycle watch bus, the socket/timer/signal event
//! engine, and numeric-nickname plus connection-rate-defense (IPcheck) allocation.
//!
//! Each module is independently usable; `engine` is the one most of the others
//! exist to serve (numnick/IPcheck bookkeeping is driven by the connections the
//! engine hands back, ancillary/watch/registry back the object model an embedder
//! builds on top).

pub mod ancillary;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipcheck;
pub mod keyspace;
pub mod numnick;
pub mod registry;
pub mod time;
pub mod watch;

pub use config::Config;
pub use error::{CoreError, CoreResult};
