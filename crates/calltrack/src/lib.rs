//! Passive SIP dialog and registration tracking.
//!
//! The tracker consumes parsed SIP messages (see the `sipmsg` crate for
//! the view contract) together with the endpoints they were observed on,
//! and maintains a per-dialog state machine over sharded hash tables of
//! call entries and registration bindings. Each processed message may
//! produce one semantic lifecycle event (call started, call ended, call
//! attempted, authentication failed, registration created / deleted /
//! expired), delivered to a caller-supplied sink as a self-contained
//! snapshot. Entries expire through per-entry timers; a message that was
//! never answered still reports its outcome when the timer fires.
//!
//! The tracker is an observer, not a SIP element: it neither originates
//! nor forwards anything, and when messages were missed on the wire it
//! recovers a plausible dialog state instead of rejecting the dialog.

mod config;
pub use config::{Config, StateTimeouts};

mod hash;
pub use hash::hash32;

mod key;
mod info;
pub use info::CallAttr;

mod entry;
pub use entry::{CallFlags, CallState, MsgRing, MsgSummary, StateRing};

mod shard;
pub use shard::TableStats;

mod matcher;
pub use matcher::MatchClass;

mod state;
mod fork;
mod timer;

mod events;
pub use events::{EvFlags, EventKind, EventRecord, EventSink};

mod reg;

mod track;
pub use track::{CallTracker, DialogInfo, Processed};

/// Errors surfaced by [`CallTracker::process_message`]. Every variant
/// means "this message changed nothing"; none of them poisons the
/// tracker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message is not fully parsed or lacks From/To/Call-ID/CSeq")]
    ParseInsufficient,
    #[error("entry allocation failed: memory budget exceeded")]
    AllocExhausted,
    #[error("dialog key exceeds the maximum key size")]
    KeySpaceExceeded,
    #[error("failed to schedule the entry expiration timer")]
    TimerStart,
}
