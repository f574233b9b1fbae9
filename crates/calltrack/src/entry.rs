use std::sync::atomic::AtomicU32;
use std::time::Instant;

use sipmsg::{Field, Method, NetPair};

use crate::events::{EvFlags, EventKind};
use crate::info::{CallAttr, CallInfo};
use crate::key::CallKey;
use crate::shard::{Link, Node, RegHandle};
use crate::timer::TimerSlot;

bitflags::bitflags! {
    /// Per-entry condition bits. They accumulate over the entry's life
    /// and ride along in every event snapshot, so a sink can tell a
    /// first-use entry from a reused or forked one.
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct CallFlags: u16 {
        /// Linked into a shard (cleared once unlinked).
        const HASHED            = 1;
        /// Entry was reused for a new dialog identity instead of forked.
        const REUSED            = 1 << 1;
        /// Reused specifically by the REGISTER replacement rule.
        const REG_REPLACED_HACK = 1 << 2;
        const FORK_CHILD        = 1 << 3;
        const FORK_PARENT       = 1 << 4;
        /// A CANCEL was observed for this dialog.
        const CANCELED          = 1 << 5;
        /// The tracker itself shortened the entry's life (quick-expire).
        const INTERNAL_CANCEL   = 1 << 6;
        /// The expiration timer fired for this entry.
        const TIMEOUT           = 1 << 7;
    }
}

/// Dialog state. Each state carries a default expiration timeout in the
/// tracker configuration.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum CallState {
    #[default]
    None,
    Init,
    FirstInvite,
    EarlyDialog,
    NegReply,
    Established,
    Bye,
    ByeReplied,
    Canceled,
    FirstNonInvite,
    NonInvNegReply,
    NonInvFinished,
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            CallState::None => "none",
            CallState::Init => "init",
            CallState::FirstInvite => "first_invite",
            CallState::EarlyDialog => "early_dialog",
            CallState::NegReply => "neg_reply",
            CallState::Established => "established",
            CallState::Bye => "bye",
            CallState::ByeReplied => "bye_replied",
            CallState::Canceled => "canceled",
            CallState::FirstNonInvite => "first_non_invite",
            CallState::NonInvNegReply => "non_inv_neg_reply",
            CallState::NonInvFinished => "non_inv_finished",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) const STATE_RING_LEN: usize = 10;
pub(crate) const MSG_RING_LEN: usize = 16;

/// Ring of the most recent states an entry entered, oldest first when
/// iterated. Sized so a full dialog's transitions fit; event snapshots
/// carry it for post-mortem inspection.
#[derive(Copy, Clone, Default, Debug)]
pub struct StateRing {
    items: [CallState; STATE_RING_LEN],
    pos: u8,
    len: u8,
}

impl StateRing {
    pub(crate) fn push(&mut self, s: CallState) {
        self.items[self.pos as usize] = s;
        self.pos = (self.pos + 1) % STATE_RING_LEN as u8;
        self.len = (self.len + 1).min(STATE_RING_LEN as u8);
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CallState> + '_ {
        let (len, pos) = (self.len as usize, self.pos as usize);
        (0..len).map(move |i| self.items[(pos + STATE_RING_LEN - len + i) % STATE_RING_LEN])
    }
}

/// One observed message, condensed for the diagnostics ring.
#[derive(Copy, Clone, Default, Debug)]
pub struct MsgSummary {
    pub dir: u8,
    pub request: bool,
    pub method: Method,
    pub status: u16,
    pub cseq: u32,
    pub retr: bool,
}

/// Ring of the most recent messages applied to an entry, retransmissions
/// included.
#[derive(Copy, Clone, Default, Debug)]
pub struct MsgRing {
    items: [MsgSummary; MSG_RING_LEN],
    pos: u8,
    len: u8,
}

impl MsgRing {
    pub(crate) fn push(&mut self, m: MsgSummary) {
        self.items[self.pos as usize] = m;
        self.pos = (self.pos + 1) % MSG_RING_LEN as u8;
        self.len = (self.len + 1).min(MSG_RING_LEN as u8);
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MsgSummary> + '_ {
        let (len, pos) = (self.len as usize, self.pos as usize);
        (0..len).map(move |i| self.items[(pos + MSG_RING_LEN - len + i) % MSG_RING_LEN])
    }
}

#[inline]
pub(crate) fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 407
}

/// One tracked dialog. Lives in a shard's slot arena; every field is
/// protected by the shard mutex except `refs`, which is additionally
/// read on the release path.
pub(crate) struct CallEntry {
    pub(crate) link: Link,
    /// The pooled buffer holding the key region followed by the
    /// attribute region. Returned to the pool when the slot recycles.
    pub(crate) buf: Box<[u8]>,
    pub(crate) key: CallKey,
    pub(crate) info: CallInfo,

    /// Per-direction request CSeq (0 = dialog-creating direction).
    pub(crate) cseq: [u32; 2],
    /// Per-direction reply CSeq.
    pub(crate) repl_cseq: [u32; 2],
    pub(crate) reqs_no: [u32; 2],
    pub(crate) repls_no: [u32; 2],
    pub(crate) reqs_retr_no: [u32; 2],
    pub(crate) repls_retr_no: [u32; 2],
    /// Winning reply status per direction; only replies to the creating
    /// method overwrite it.
    pub(crate) repl_status: [u16; 2],

    pub(crate) hash_bucket: u32,
    /// The method that created this entry.
    pub(crate) method: Method,
    pub(crate) flags: CallFlags,
    pub(crate) state: CallState,

    /// Which semantic events this entry already produced.
    pub(crate) ev_flags: EvFlags,
    /// Count of events emitted so far (the snapshot's generation
    /// position).
    pub(crate) evs_no: u32,
    pub(crate) last_ev: EventKind,

    /// Non-owning, generation-checked link to a registration binding.
    pub(crate) reg_link: Option<RegHandle>,

    pub(crate) created_ts: i64,
    pub(crate) started_ts: i64,
    pub(crate) forked_ts: i64,

    pub(crate) state_ring: StateRing,
    pub(crate) msg_ring: MsgRing,

    pub(crate) timer: TimerSlot,
    pub(crate) refs: AtomicU32,

    /// Endpoints in the dialog-creating direction.
    pub(crate) endpoints: NetPair,
}

impl Node for CallEntry {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

impl CallEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut buf: Box<[u8]>,
        key_cap: usize,
        callid: &[u8],
        from_tag: &[u8],
        to_tag: &[u8],
        method: Method,
        hash_bucket: u32,
        endpoints: NetPair,
        now: Instant,
        wall: i64,
    ) -> CallEntry {
        let mut key = CallKey::default();
        key.init(&mut buf, key_cap, callid, from_tag, to_tag);

        let mut info = CallInfo::default();
        info.init(Field::new(key_cap as u32, (buf.len() - key_cap) as u32));

        let mut state_ring = StateRing::default();
        state_ring.push(CallState::Init);

        CallEntry {
            link: Link::default(),
            buf,
            key,
            info,
            cseq: [0; 2],
            repl_cseq: [0; 2],
            reqs_no: [0; 2],
            repls_no: [0; 2],
            reqs_retr_no: [0; 2],
            repls_retr_no: [0; 2],
            repl_status: [0; 2],
            hash_bucket,
            method,
            flags: CallFlags::empty(),
            state: CallState::Init,
            ev_flags: EvFlags::empty(),
            evs_no: 0,
            last_ev: EventKind::None,
            reg_link: None,
            created_ts: wall,
            started_ts: 0,
            forked_ts: 0,
            state_ring,
            msg_ring: MsgRing::default(),
            timer: TimerSlot::new(now),
            refs: AtomicU32::new(0),
            endpoints,
        }
    }

    #[inline]
    pub(crate) fn callid(&self) -> &[u8] {
        self.key.callid(&self.buf)
    }

    #[inline]
    pub(crate) fn from_tag(&self) -> &[u8] {
        self.key.from_tag(&self.buf)
    }

    #[inline]
    pub(crate) fn to_tag(&self) -> &[u8] {
        self.key.to_tag(&self.buf)
    }

    #[inline]
    pub(crate) fn attr(&self, a: CallAttr) -> &[u8] {
        self.info.get(&self.buf, a)
    }

    #[inline]
    pub(crate) fn attr_set(&self, a: CallAttr) -> bool {
        self.info.is_set(a)
    }

    pub(crate) fn append_attr(&mut self, a: CallAttr, val: &[u8]) {
        let CallEntry { info, buf, .. } = self;
        info.append(buf, a, val);
    }

    pub(crate) fn overwrite_attr(&mut self, a: CallAttr, val: &[u8]) {
        let CallEntry { info, buf, .. } = self;
        info.overwrite(buf, a, val);
    }

    pub(crate) fn set_to_tag(&mut self, tag: &[u8]) -> bool {
        let CallEntry { key, buf, .. } = self;
        key.set_to_tag(buf, tag)
    }

    pub(crate) fn replace_from_tag(&mut self, tag: &[u8]) -> bool {
        let CallEntry { key, buf, .. } = self;
        key.replace_from_tag(buf, tag)
    }

    /// Enter a new state, recording the transition in the diagnostics
    /// ring.
    pub(crate) fn enter_state(&mut self, s: CallState) {
        if s != self.state {
            self.state = s;
            self.state_ring.push(s);
        }
    }

    /// The winning status of the dialog as seen so far: the creating
    /// direction's reply status, falling back to the reverse direction.
    pub(crate) fn winning_status(&self) -> u16 {
        if self.repl_status[0] != 0 {
            self.repl_status[0]
        } else {
            self.repl_status[1]
        }
    }

    pub(crate) fn saw_auth_failure(&self) -> bool {
        is_auth_status(self.repl_status[0]) || is_auth_status(self.repl_status[1])
    }
}
