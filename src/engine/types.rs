//! Shared vocabulary for the event engine (§3.1-3.3).
//!
//! The original C core tags every generator (socket, signal, timer) with the same
//! flag set and distinguishes event types with a small enum; we keep both as
//! first-class Rust types instead of the original's bitfield-in-an-int and
//! `enum EventType` pair, but the bit positions and event names are unchanged so
//! anyone who has read `ircd_events.h` recognizes them immediately.

use std::fmt;

bitflags::bitflags! {
    /// Per-generator state bits (`GEN_ACTIVE`, `GEN_DESTROY`, ... in `ircd_events.h`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GenFlags: u8 {
        /// Clear only between delivery of `DESTROY` and final deallocation.
        const ACTIVE  = 0b0000_0001;
        /// Deletion requested; no further non-`DESTROY` events will be generated.
        const DESTROY = 0b0000_0010;
        /// Currently executing (guards against destroying mid-callback).
        const MARKED  = 0b0000_0100;
        /// Re-enqueue after the current callback returns (periodic timers, or a
        /// timer re-armed from within its own callback).
        const READD   = 0b0000_1000;
        /// Last observed event for this generator was an error.
        const ERROR   = 0b0001_0000;
    }
}

impl Default for GenFlags {
    fn default() -> Self {
        GenFlags::ACTIVE
    }
}

/// The kind of event synthesized for a generator (§3.1 `enum EventType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
    Accept,
    Connect,
    Eof,
    Error,
    Signal,
    Expire,
    Destroy,
}

/// Which generator collection an [`Event`](super::Event) belongs to, and its
/// identity within that collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorHandle {
    Socket(mio::Token),
    Timer(GeneratorId),
    Signal(GeneratorId),
}

/// Dense id minted from the engine's generator counter; used for timers and
/// signals (sockets are addressed by their `mio::Token` directly, since mio
/// already needs one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeneratorId(pub u32);

/// An ephemeral event record delivered synchronously to a generator's callback.
#[derive(Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub generator: GeneratorHandle,
    /// Auxiliary payload: an errno for `Error`, a signal number for `Signal`,
    /// unused (0) otherwise.
    pub data: i64,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("generator", &self.generator)
            .field("data", &self.data)
            .finish()
    }
}

/// Socket state machine (§3.2). Transitions are validated by
/// [`SocketState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Listening,
    Connected,
    Datagram,
    ConnectDg,
    NotSock,
}

impl SocketState {
    /// Whether moving from `self` to `next` is a legal transition per §3.2's table:
    /// `CONNECTING -> CONNECTED` only; `DATAGRAM <-> CONNECTDG`; everything else
    /// (including `LISTENING`/`CONNECTED`/`NOTSOCK`) is terminal.
    pub fn can_transition_to(self, next: SocketState) -> bool {
        matches!(
            (self, next),
            (SocketState::Connecting, SocketState::Connected)
                | (SocketState::Datagram, SocketState::ConnectDg)
                | (SocketState::ConnectDg, SocketState::Datagram)
        )
    }

    /// Whether the engine should arm the socket's `mask` for readable/writable
    /// interest, or instead ignore it and watch a fixed direction (§3.2's table).
    pub fn uses_interest_mask(self) -> bool {
        matches!(self, SocketState::Connected | SocketState::Datagram | SocketState::ConnectDg)
    }
}

bitflags::bitflags! {
    /// A socket's event-interest mask (§3.2). Only consulted when
    /// [`SocketState::uses_interest_mask`] is true.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

/// How a [`Interest`] mutation combines with the socket's current mask
/// (§3.2 "Mask mutations").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskAction {
    Set,
    Add,
    Del,
}

impl MaskAction {
    pub fn apply(self, current: Interest, delta: Interest) -> Interest {
        match self {
            MaskAction::Set => delta,
            MaskAction::Add => current | delta,
            MaskAction::Del => current & !delta,
        }
    }
}
