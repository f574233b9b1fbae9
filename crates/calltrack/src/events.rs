use sipmsg::{Field, NetPair};

use crate::entry::{CallEntry, CallFlags, CallState, MsgRing, StateRing};
use crate::info::{CallAttr, ATTR_COUNT};
use crate::shard::Arena;

bitflags::bitflags! {
    /// One bit per event kind, recording which events an entry has
    /// already produced. The bitset only grows, with two deliberate
    /// exceptions: fork children inherit their parent's bits, and the
    /// REGISTER replacement rule clears the attempt/auth bits of a
    /// reused entry (both observable through [`CallFlags`]).
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct EvFlags: u16 {
        const CALL_START   = 1;
        const CALL_END     = 1 << 1;
        const CALL_ATTEMPT = 1 << 2;
        const AUTH_FAILED  = 1 << 3;
        const ACTION_LOG   = 1 << 4;
        const REG_NEW      = 1 << 5;
        const REG_DEL      = 1 << 6;
        const REG_EXPIRED  = 1 << 7;
        const SUB_NEW      = 1 << 8;
        const SUB_DEL      = 1 << 9;
    }
}

/// The semantic events a tracked dialog can produce.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum EventKind {
    #[default]
    None,
    CallStart,
    CallEnd,
    CallAttempt,
    AuthFailed,
    ActionLog,
    RegNew,
    RegDel,
    RegExpired,
    SubNew,
    SubDel,
}

impl EventKind {
    pub(crate) fn flag(self) -> EvFlags {
        match self {
            EventKind::None => EvFlags::empty(),
            EventKind::CallStart => EvFlags::CALL_START,
            EventKind::CallEnd => EvFlags::CALL_END,
            EventKind::CallAttempt => EvFlags::CALL_ATTEMPT,
            EventKind::AuthFailed => EvFlags::AUTH_FAILED,
            EventKind::ActionLog => EvFlags::ACTION_LOG,
            EventKind::RegNew => EvFlags::REG_NEW,
            EventKind::RegDel => EvFlags::REG_DEL,
            EventKind::RegExpired => EvFlags::REG_EXPIRED,
            EventKind::SubNew => EvFlags::SUB_NEW,
            EventKind::SubDel => EvFlags::SUB_DEL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::None => "none",
            EventKind::CallStart => "call_start",
            EventKind::CallEnd => "call_end",
            EventKind::CallAttempt => "call_attempt",
            EventKind::AuthFailed => "auth_failed",
            EventKind::ActionLog => "action_log",
            EventKind::RegNew => "reg_new",
            EventKind::RegDel => "reg_del",
            EventKind::RegExpired => "reg_expired",
            EventKind::SubNew => "sub_new",
            EventKind::SubDel => "sub_del",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The sink receiving event snapshots. Called strictly outside any shard
/// lock; the record is valid only for the duration of the call and must
/// be copied if retained.
pub type EventSink = Box<dyn Fn(&EventRecord) + Send + Sync>;

/// Synthesized final status for entries that expire without a real one.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Synth {
    pub status: u16,
    pub reason: &'static str,
}

pub(crate) const TIMEOUT_REASON: &str = "internal: call state timeout";

/// Default snapshot buffer capacity, sized for the worst-case attribute
/// budgets with ample headroom.
pub const EVENT_BUF_SIZE: usize = 2048;

/// A self-contained snapshot of one semantic event. All byte fields
/// point into the record's own buffer; nothing references entry memory
/// after the snapshot is filled.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub kind: EventKind,
    /// Set when the buffer filled up mid-snapshot; earlier fields are
    /// intact, later attributes are absent.
    pub truncated: bool,

    /// Wall-clock unix timestamps.
    pub ts: i64,
    pub created_ts: i64,
    pub started_ts: i64,
    pub forked_ts: i64,

    /// Endpoints in the dialog-creating direction.
    pub endpoints: NetPair,
    /// Final or winning reply status; may be synthesized on timeout.
    pub status: u16,

    // Diagnostics.
    pub state: CallState,
    pub state_ring: StateRing,
    pub msg_ring: MsgRing,
    pub last_ev: EventKind,
    pub ev_flags: EvFlags,
    pub call_flags: CallFlags,
    pub cseq: [u32; 2],
    pub repl_cseq: [u32; 2],
    pub reqs_no: [u32; 2],
    pub repls_no: [u32; 2],
    pub reqs_retr_no: [u32; 2],
    pub repls_retr_no: [u32; 2],
    /// Position of this event in the entry's emission sequence.
    pub evs_no: u32,

    callid: Field,
    reason: Field,
    attrs: [Field; ATTR_COUNT],
    from_tag: Field,
    to_tag: Field,
    buf: Vec<u8>,
    cap: usize,
}

impl Default for EventRecord {
    fn default() -> Self {
        Self::new(EVENT_BUF_SIZE)
    }
}

impl EventRecord {
    /// A record with a caller-chosen snapshot buffer capacity.
    pub fn new(cap: usize) -> Self {
        Self {
            kind: EventKind::None,
            truncated: false,
            ts: 0,
            created_ts: 0,
            started_ts: 0,
            forked_ts: 0,
            endpoints: NetPair::default(),
            status: 0,
            state: CallState::None,
            state_ring: StateRing::default(),
            msg_ring: MsgRing::default(),
            last_ev: EventKind::None,
            ev_flags: EvFlags::empty(),
            call_flags: CallFlags::empty(),
            cseq: [0; 2],
            repl_cseq: [0; 2],
            reqs_no: [0; 2],
            repls_no: [0; 2],
            reqs_retr_no: [0; 2],
            repls_retr_no: [0; 2],
            evs_no: 0,
            callid: Field::default(),
            reason: Field::default(),
            attrs: [Field::default(); ATTR_COUNT],
            from_tag: Field::default(),
            to_tag: Field::default(),
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn call_id(&self) -> &[u8] {
        self.callid.get(&self.buf)
    }

    pub fn reason(&self) -> &[u8] {
        self.reason.get(&self.buf)
    }

    pub fn attr(&self, a: CallAttr) -> &[u8] {
        self.attrs[a.idx()].get(&self.buf)
    }

    pub fn from_tag(&self) -> &[u8] {
        self.from_tag.get(&self.buf)
    }

    pub fn to_tag(&self) -> &[u8] {
        self.to_tag.get(&self.buf)
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Copy `val` into the snapshot buffer, truncating at capacity.
    fn put(&mut self, val: &[u8]) -> Field {
        let space = self.cap - self.buf.len();
        let n = val.len().min(space);
        if n < val.len() {
            self.truncated = true;
        }
        let offs = self.buf.len() as u32;
        self.buf.extend_from_slice(&val[..n]);
        Field::new(offs, n as u32)
    }
}

/// Record `kind` in the entry's event bitset. Returns true when the sink
/// should actually see the event, false when it was already produced.
///
/// CallAttempt is special for forked dialogs: the attempt is a property
/// of the whole (CallID, FromTag) family, so the decision merges the
/// bitsets of every sibling in the shard before answering.
pub(crate) fn update_event(arena: &mut Arena<CallEntry>, idx: u32, kind: EventKind) -> bool {
    let flag = kind.flag();
    if flag.is_empty() {
        return false;
    }

    if kind == EventKind::CallAttempt {
        let e = arena.at(idx);
        if e.flags
            .intersects(CallFlags::FORK_CHILD | CallFlags::FORK_PARENT)
        {
            let callid = e.callid().to_vec();
            let mut merged = e.ev_flags;
            for j in arena.list_indices() {
                if j != idx {
                    let sib = arena.at(j);
                    if sib.callid() == callid.as_slice() {
                        merged |= sib.ev_flags;
                    }
                }
            }
            if merged.intersects(EvFlags::CALL_ATTEMPT | EvFlags::CALL_START | EvFlags::CALL_END) {
                // Some leg already reported an outcome; mark this one so
                // it stays quiet for good.
                arena.at_mut(idx).ev_flags |= EvFlags::CALL_ATTEMPT;
                return false;
            }
        }
    }

    let e = arena.at_mut(idx);
    if e.ev_flags.contains(flag) {
        return false;
    }
    e.ev_flags |= flag;
    true
}

/// Compute the terminal event for an entry whose timer expired without a
/// message-driven outcome, per its current state. When the outcome has
/// to be synthesized (no final reply was ever seen), the entry's stored
/// status is clobbered to match the report.
pub(crate) fn final_timeout_event(e: &mut CallEntry) -> (EventKind, Option<Synth>) {
    use sipmsg::Method;

    let synth = Synth {
        status: 408,
        reason: TIMEOUT_REASON,
    };

    match e.state {
        CallState::FirstInvite | CallState::EarlyDialog => {
            e.repl_status[0] = synth.status;
            (EventKind::CallAttempt, Some(synth))
        }
        CallState::Established => {
            e.repl_status[0] = synth.status;
            (EventKind::CallEnd, Some(synth))
        }
        CallState::Bye | CallState::ByeReplied => (EventKind::CallEnd, None),
        CallState::NegReply => {
            if e.saw_auth_failure() {
                (EventKind::AuthFailed, None)
            } else {
                // Deferred from the negative reply, to catch a late
                // forked 2xx that would have upgraded the dialog.
                (EventKind::CallAttempt, None)
            }
        }
        CallState::Canceled => (EventKind::CallAttempt, None),
        CallState::NonInvFinished => {
            if e.method == Method::Register && !e.ev_flags.contains(EvFlags::REG_DEL) {
                (EventKind::RegExpired, None)
            } else {
                (EventKind::None, None)
            }
        }
        CallState::NonInvNegReply => {
            if e.saw_auth_failure() {
                (EventKind::AuthFailed, None)
            } else {
                (EventKind::None, None)
            }
        }
        CallState::None | CallState::Init | CallState::FirstNonInvite => {
            if e.method == Method::Invite {
                e.repl_status[0] = synth.status;
                (EventKind::CallAttempt, Some(synth))
            } else {
                (EventKind::None, None)
            }
        }
    }
}

/// Fill a snapshot from the entry, under the entry's shard lock. The
/// layout is fixed: CallID first, then the reason (possibly the
/// synthesized one), then the remaining attributes in declaration order,
/// then the dialog tags. Once the buffer fills, remaining attributes are
/// skipped but everything already written stays valid.
pub(crate) fn fill_record(
    rec: &mut EventRecord,
    kind: EventKind,
    e: &CallEntry,
    synth: Option<Synth>,
) {
    let cap = rec.cap;
    *rec = EventRecord::new(cap);

    rec.kind = kind;
    rec.ts = time::OffsetDateTime::now_utc().unix_timestamp();
    rec.created_ts = e.created_ts;
    rec.started_ts = e.started_ts;
    rec.forked_ts = e.forked_ts;
    rec.endpoints = e.endpoints;
    rec.status = match synth {
        Some(s) => s.status,
        None => e.winning_status(),
    };

    rec.state = e.state;
    rec.state_ring = e.state_ring;
    rec.msg_ring = e.msg_ring;
    rec.last_ev = e.last_ev;
    rec.ev_flags = e.ev_flags;
    rec.call_flags = e.flags;
    rec.cseq = e.cseq;
    rec.repl_cseq = e.repl_cseq;
    rec.reqs_no = e.reqs_no;
    rec.repls_no = e.repls_no;
    rec.reqs_retr_no = e.reqs_retr_no;
    rec.repls_retr_no = e.repls_retr_no;
    rec.evs_no = e.evs_no;

    rec.callid = rec.put(e.callid());

    let reason_bytes = match synth {
        Some(s) => s.reason.as_bytes(),
        None => e.attr(CallAttr::Reason),
    };
    rec.reason = rec.put(reason_bytes);
    rec.attrs[CallAttr::Reason.idx()] = rec.reason;

    for a in CallAttr::ALL {
        if a == CallAttr::Reason {
            continue;
        }
        if rec.truncated {
            break;
        }
        rec.attrs[a.idx()] = rec.put(e.attr(a));
    }

    if !rec.truncated {
        rec.from_tag = rec.put(e.from_tag());
        rec.to_tag = rec.put(e.to_tag());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_flag_round_trip() {
        for k in [
            EventKind::CallStart,
            EventKind::CallEnd,
            EventKind::CallAttempt,
            EventKind::AuthFailed,
            EventKind::RegNew,
            EventKind::RegDel,
            EventKind::RegExpired,
            EventKind::SubNew,
            EventKind::SubDel,
        ] {
            assert_eq!(k.flag().bits().count_ones(), 1, "{k}");
        }
        assert!(EventKind::None.flag().is_empty());
    }

    #[test]
    fn test_record_put_truncates() {
        let mut rec = EventRecord::new(8);
        let f = rec.put(b"0123456789");
        assert!(rec.truncated);
        assert_eq!(f.get(rec.buf()), b"01234567");
    }
}
