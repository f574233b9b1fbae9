use std::time::Instant;

use pool::BufPool;
use sipmsg::{Method, SipMsg};

use crate::entry::{CallEntry, CallFlags, CallState};
use crate::events::EvFlags;
use crate::info::{default_region_size, CallAttr};
use crate::key::CallKey;
use crate::matcher::MatchClass;
use crate::shard::Arena;
use crate::Error;

/// What to do with a partially matching message.
pub(crate) enum ForkOutcome {
    /// Update the matched entry in place (possibly with its key
    /// rewritten).
    InPlace,
    /// A new entry forked off the match; the caller links it into the
    /// shard and starts its timer.
    Fork(CallEntry),
    /// The message cannot be tracked (allocation or key-space failure).
    Failed(Error),
}

fn final_negative(state: CallState) -> bool {
    matches!(state, CallState::NegReply | CallState::NonInvNegReply)
}

/// Decide between updating, reusing and forking for a partial or
/// callid-only match, per the dialog-recovery rules:
///
/// - a re-authentication with a changed from-tag rewrites the key of a
///   negatively finished entry in place;
/// - a REGISTER refresh under the same Call-ID reuses a finished
///   REGISTER entry outright (the "replacement" rule), clearing its
///   attempt/auth event bits so the new cycle reports its own outcome;
/// - a first to-tag is adopted in place when the key has room;
/// - a new leg after a negative final reply takes over the stored
///   to-tag;
/// - anything else becomes a fork inheriting the parent's counters,
///   event bits and attributes.
pub(crate) fn fork_or_update(
    arena: &mut Arena<CallEntry>,
    pool: &BufPool,
    idx: u32,
    class: MatchClass,
    dir: usize,
    msg: &SipMsg,
    shard: u32,
    now: Instant,
    wall: i64,
) -> ForkOutcome {
    debug_assert!(matches!(class, MatchClass::Partial | MatchClass::CallId));

    let mft = msg.from_tag();
    let mtt = msg.to_tag();

    if class == MatchClass::CallId {
        let e = arena.at_mut(idx);

        // Re-auth with a fresh from-tag: the challenged dialog carries
        // on under its new identity.
        if final_negative(e.state) && e.saw_auth_failure() && e.key.has_tag_space(mft.len()) {
            if e.replace_from_tag(mft) && e.set_to_tag(mtt) {
                e.flags |= CallFlags::REUSED;
                tracing::debug!(state = %e.state, "rewrote key of challenged entry for re-auth");
                return ForkOutcome::InPlace;
            }
        }

        // REGISTER replacement: a finished REGISTER entry under the
        // same Call-ID is the same registration talking again.
        if msg.method() == Method::Register
            && e.method == Method::Register
            && matches!(
                e.state,
                CallState::NonInvFinished | CallState::NonInvNegReply
            )
            && e.replace_from_tag(mft)
            && e.set_to_tag(mtt)
        {
            e.flags |= CallFlags::REUSED | CallFlags::REG_REPLACED_HACK;
            e.ev_flags
                .remove(EvFlags::CALL_ATTEMPT | EvFlags::AUTH_FAILED);
            tracing::debug!("reused finished REGISTER entry for a new cycle");
            return ForkOutcome::InPlace;
        }

        return fork(arena, pool, idx, msg, dir, shard, now, wall);
    }

    let e = arena.at_mut(idx);
    let ett_empty = e.to_tag().is_empty();

    // An empty stored to-tag adopts the newly learned one. Seen from
    // the far side (dir 1) that tag is the message's *from*-tag.
    if ett_empty {
        let learned = if dir == 0 { mtt } else { mft };
        if learned.is_empty() || e.set_to_tag(learned) {
            return ForkOutcome::InPlace;
        }
        // No room for the tag: a fork gets a fresh, right-sized key.
        return fork(arena, pool, idx, msg, dir, shard, now, wall);
    }

    // Other partial matches from the far side are in-dialog traffic for
    // the entry as it stands; forking is a creator-side affair.
    if dir == 1 {
        return ForkOutcome::InPlace;
    }

    // Stored to-tag present. After a negative final reply, the same
    // method starting over takes the key with it; a provisional 100 is
    // transaction noise and changes nothing.
    if final_negative(e.state) && msg.method() == e.method {
        if msg.request() || msg.status != 100 {
            if !e.set_to_tag(mtt) {
                return fork(arena, pool, idx, msg, dir, shard, now, wall);
            }
        }
        return ForkOutcome::InPlace;
    }

    // A REGISTER refresh reply habitually carries a fresh to-tag per
    // transaction; adopt it rather than forking a finished entry per
    // refresh.
    if e.method == Method::Register
        && e.state == CallState::NonInvFinished
        && msg.method() == Method::Register
    {
        if !mtt.is_empty() && mtt != e.to_tag() {
            let _ = e.set_to_tag(mtt);
        }
        return ForkOutcome::InPlace;
    }

    if !mtt.is_empty() && mtt != e.to_tag() {
        // A genuinely new leg of a live dialog.
        return fork(arena, pool, idx, msg, dir, shard, now, wall);
    }

    ForkOutcome::InPlace
}

/// Create a sibling entry for a new dialog leg, inheriting enough of the
/// parent that duplicate events stay suppressed and retransmission
/// detection keeps working.
fn fork(
    arena: &mut Arena<CallEntry>,
    pool: &BufPool,
    parent_idx: u32,
    msg: &SipMsg,
    dir: usize,
    shard: u32,
    now: Instant,
    wall: i64,
) -> ForkOutcome {
    struct Seed {
        callid: Vec<u8>,
        cseq: [u32; 2],
        repl_cseq: [u32; 2],
        reqs_no: [u32; 2],
        repls_no: [u32; 2],
        reqs_retr_no: [u32; 2],
        repls_retr_no: [u32; 2],
        ev_flags: EvFlags,
        method: Method,
        endpoints: sipmsg::NetPair,
        attrs: Vec<(CallAttr, Vec<u8>)>,
    }

    let seed = {
        let p = arena.at(parent_idx);
        Seed {
            callid: p.callid().to_vec(),
            cseq: p.cseq,
            repl_cseq: p.repl_cseq,
            reqs_no: p.reqs_no,
            repls_no: p.repls_no,
            reqs_retr_no: p.reqs_retr_no,
            repls_retr_no: p.repls_retr_no,
            ev_flags: p.ev_flags,
            method: p.method,
            endpoints: p.endpoints,
            attrs: CallAttr::ALL
                .iter()
                .filter(|a| p.attr_set(**a))
                .map(|a| (*a, p.attr(*a).to_vec()))
                .collect(),
        }
    };

    // The child's key is the dialog identity as this message names it,
    // expressed in the creator direction.
    let (ftag, ttag) = if dir == 0 {
        (msg.from_tag(), msg.to_tag())
    } else {
        (msg.to_tag(), msg.from_tag())
    };

    let Some(key_cap) = CallKey::reserve_for(seed.callid.len(), ftag.len(), ttag.len()) else {
        return ForkOutcome::Failed(Error::KeySpaceExceeded);
    };
    let Some(buf) = pool.alloc(key_cap + default_region_size()) else {
        return ForkOutcome::Failed(Error::AllocExhausted);
    };

    let mut child = CallEntry::new(
        buf,
        key_cap,
        &seed.callid,
        ftag,
        ttag,
        seed.method,
        shard,
        seed.endpoints,
        now,
        wall,
    );
    child.cseq = seed.cseq;
    child.repl_cseq = seed.repl_cseq;
    child.reqs_no = seed.reqs_no;
    child.repls_no = seed.repls_no;
    child.reqs_retr_no = seed.reqs_retr_no;
    child.repls_retr_no = seed.repls_retr_no;
    child.ev_flags = seed.ev_flags;
    child.flags |= CallFlags::FORK_CHILD;
    child.forked_ts = wall;
    for (a, v) in &seed.attrs {
        child.append_attr(*a, v);
    }

    let p = arena.at_mut(parent_idx);
    p.flags |= CallFlags::FORK_PARENT;
    if p.forked_ts == 0 {
        p.forked_ts = wall;
    }
    tracing::debug!(dir, "forking new dialog leg");

    ForkOutcome::Fork(child)
}

#[cfg(test)]
mod test {
    use super::*;
    use sipmsg::{MsgBuilder, NetPair};

    fn mk_arena_with(callid: &[u8], ftag: &[u8], ttag: &[u8], method: Method) -> (Arena<CallEntry>, u32) {
        let mut a = Arena::new();
        let buf = vec![0u8; 1024].into_boxed_slice();
        let e = CallEntry::new(
            buf,
            256,
            callid,
            ftag,
            ttag,
            method,
            0,
            NetPair::default(),
            Instant::now(),
            0,
        );
        let (idx, _) = a.insert_head(e);
        (a, idx)
    }

    fn reply(status: u16, callid: &[u8], ftag: &[u8], ttag: &[u8], cseq: u32, m: Method) -> sipmsg::SipMsg {
        MsgBuilder::reply(status, b"r")
            .from(b"sip:a@y", ftag)
            .to(b"sip:b@y", ttag)
            .call_id(callid)
            .cseq(cseq, m)
            .build()
    }

    #[test]
    fn test_adopts_first_to_tag() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F", b"", Method::Invite);
        let pool = BufPool::new(None);
        let msg = reply(180, b"c1", b"F", b"B1", 1, Method::Invite);

        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::Partial,
            0,
            &msg,
            0,
            Instant::now(),
            0,
        );
        assert!(matches!(out, ForkOutcome::InPlace));
        assert_eq!(arena.at(idx).to_tag(), b"B1");
    }

    #[test]
    fn test_far_side_partial_adopts_to_tag() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F", b"", Method::Invite);
        let pool = BufPool::new(None);

        // In-dialog request from the far side, seen before any reply
        // taught us its tag: the message's from-tag is the to-tag the
        // entry has been waiting for.
        let msg = MsgBuilder::request(Method::Bye, b"sip:a@y")
            .from(b"sip:b@y", b"B-far")
            .to(b"sip:a@y", b"F")
            .call_id(b"c1")
            .cseq(2, Method::Bye)
            .build();
        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::Partial,
            1,
            &msg,
            0,
            Instant::now(),
            0,
        );
        assert!(matches!(out, ForkOutcome::InPlace));
        assert_eq!(arena.at(idx).to_tag(), b"B-far");
        assert_eq!(arena.at(idx).from_tag(), b"F");
    }

    #[test]
    fn test_neg_reply_leg_takes_over_to_tag() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F", b"B1", Method::Invite);
        arena.at_mut(idx).enter_state(CallState::NegReply);
        let pool = BufPool::new(None);

        let msg = reply(180, b"c1", b"F", b"B2", 1, Method::Invite);
        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::Partial,
            0,
            &msg,
            0,
            Instant::now(),
            0,
        );
        assert!(matches!(out, ForkOutcome::InPlace));
        assert_eq!(arena.at(idx).to_tag(), b"B2");
    }

    #[test]
    fn test_live_dialog_new_leg_forks() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F", b"B1", Method::Invite);
        {
            let e = arena.at_mut(idx);
            e.enter_state(CallState::Established);
            e.ev_flags |= EvFlags::CALL_START;
            e.cseq[0] = 1;
            e.append_attr(CallAttr::FromUri, b"sip:a@y");
        }
        let pool = BufPool::new(None);

        let msg = reply(200, b"c1", b"F", b"B2", 1, Method::Invite);
        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::Partial,
            0,
            &msg,
            0,
            Instant::now(),
            7,
        );
        let ForkOutcome::Fork(child) = out else {
            panic!("expected a fork");
        };
        assert_eq!(child.to_tag(), b"B2");
        assert_eq!(child.from_tag(), b"F");
        assert!(child.flags.contains(CallFlags::FORK_CHILD));
        // Inherited event bits suppress a duplicate CallStart.
        assert!(child.ev_flags.contains(EvFlags::CALL_START));
        assert_eq!(child.cseq[0], 1);
        assert_eq!(child.attr(CallAttr::FromUri), b"sip:a@y");
        assert!(arena.at(idx).flags.contains(CallFlags::FORK_PARENT));
        assert_eq!(child.forked_ts, 7);
    }

    #[test]
    fn test_register_replacement_reuses_entry() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F1", b"B1", Method::Register);
        {
            let e = arena.at_mut(idx);
            e.enter_state(CallState::NonInvFinished);
            e.ev_flags |= EvFlags::REG_NEW | EvFlags::CALL_ATTEMPT;
        }
        let pool = BufPool::new(None);

        let msg = MsgBuilder::request(Method::Register, b"sip:reg.y")
            .from(b"sip:u@y", b"F2")
            .to(b"sip:u@y", b"")
            .call_id(b"c1")
            .cseq(10, Method::Register)
            .build();
        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::CallId,
            0,
            &msg,
            0,
            Instant::now(),
            0,
        );
        assert!(matches!(out, ForkOutcome::InPlace));
        let e = arena.at(idx);
        assert_eq!(e.from_tag(), b"F2");
        assert_eq!(e.to_tag(), b"");
        assert!(e.flags.contains(CallFlags::REUSED));
        assert!(e.flags.contains(CallFlags::REG_REPLACED_HACK));
        // RegNew stays (refreshes are silent); the attempt bit is reset.
        assert!(e.ev_flags.contains(EvFlags::REG_NEW));
        assert!(!e.ev_flags.contains(EvFlags::CALL_ATTEMPT));
    }

    #[test]
    fn test_auth_retry_rewrites_key() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F1", b"B1", Method::Invite);
        {
            let e = arena.at_mut(idx);
            e.enter_state(CallState::NegReply);
            e.repl_status[0] = 407;
        }
        let pool = BufPool::new(None);

        let msg = MsgBuilder::request(Method::Invite, b"sip:b@y")
            .from(b"sip:a@y", b"F2-new")
            .to(b"sip:b@y", b"")
            .call_id(b"c1")
            .cseq(2, Method::Invite)
            .build();
        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::CallId,
            0,
            &msg,
            0,
            Instant::now(),
            0,
        );
        assert!(matches!(out, ForkOutcome::InPlace));
        let e = arena.at(idx);
        assert_eq!(e.from_tag(), b"F2-new");
        assert_eq!(e.to_tag(), b"");
        assert!(e.flags.contains(CallFlags::REUSED));
    }

    #[test]
    fn test_alloc_failure_surfaces() {
        let (mut arena, idx) = mk_arena_with(b"c1", b"F", b"B1", Method::Invite);
        arena.at_mut(idx).enter_state(CallState::Established);
        // A pool with no budget cannot host the fork.
        let pool = BufPool::new(Some(0));

        let msg = reply(200, b"c1", b"F", b"B2", 1, Method::Invite);
        let out = fork_or_update(
            &mut arena,
            &pool,
            idx,
            MatchClass::Partial,
            0,
            &msg,
            0,
            Instant::now(),
            0,
        );
        assert!(matches!(out, ForkOutcome::Failed(Error::AllocExhausted)));
    }
}
