//! Crate-wide error type for the core's synchronous APIs.

use thiserror::Error;

/// Failure modes for the core's synchronous entry points (§7 of the design doc).
///
/// Asynchronous failures (`ERROR`, `EOF`, `SIGNAL`, `EXPIRE`) are not modeled here —
/// those are delivered as [`crate::engine::Event`] values to generator callbacks, not
/// as `Result` errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("no such registry table: {0}")]
    NoSuchTable(String),

    #[error("magic number mismatch for table {0}")]
    MagicMismatch(String),

    #[error("duplicate name in table {table}: {name}")]
    DuplicateName { table: String, name: String },

    #[error("registration rejected by hook (code {0})")]
    RejectedByHook(i32),

    #[error("keyspace exhausted (max reached)")]
    KeyspaceExhausted,

    #[error("ancillary key destroyed or unknown")]
    UnknownAncillaryKey,

    #[error("numnick space exhausted for this server")]
    NumnickExhausted,

    #[error("numnick string is malformed: {0}")]
    InvalidNumnick(String),

    #[error("no server registered for numnick {0}")]
    NoSuchServer(String),

    #[error("connection throttled by IPcheck policy")]
    ConnectionThrottled,

    #[error("connection counter would overflow")]
    CounterOverflow,

    #[error("invalid socket state transition")]
    InvalidStateTransition,

    #[error("generator is already marked for destruction")]
    AlreadyDestroying,

    #[error("engine backend i/o error: {0}")]
    BackendIo(String),

    #[error("consecutive backend errors exceeded threshold; restart required")]
    BackendRestartRequired,

    #[error("no such socket generator")]
    UnknownSocket,

    #[error("no such timer generator")]
    UnknownTimer,

    #[error("no such signal generator")]
    UnknownSignal,
}

pub type CoreResult<T> = Result<T, CoreError>;
