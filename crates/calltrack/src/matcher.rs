use sipmsg::{Method, SipMsg};

use crate::entry::CallEntry;
use crate::shard::Arena;

/// How strongly a message matched an entry, weakest to strongest.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum MatchClass {
    None,
    CallId,
    Partial,
    Full,
}

/// Classify `msg` against one entry, returning the class and direction
/// (0 = dialog-creating direction). `None` when the Call-IDs differ.
fn classify(e: &CallEntry, msg: &SipMsg) -> Option<(MatchClass, usize)> {
    if e.callid() != msg.call_id() {
        return None;
    }

    let eft = e.from_tag();
    let ett = e.to_tag();
    let mft = msg.from_tag();
    let mtt = msg.to_tag();

    if mft == eft {
        if !mtt.is_empty() && mtt == ett {
            return Some((MatchClass::Full, 0));
        }
        // Same from-tag with an absent or different to-tag: the dialog
        // family matches even if this particular leg is new.
        return Some((gate(e, msg, mtt), 0));
    }

    if !ett.is_empty() && mft == ett {
        if !mtt.is_empty() && mtt == eft {
            return Some((MatchClass::Full, 1));
        }
        return Some((MatchClass::Partial, 1));
    }

    if !mtt.is_empty() && mtt == eft {
        // Swapped pair: the message's to-tag names the dialog creator,
        // an in-dialog request from the far side seen before we learned
        // its tag.
        return Some((MatchClass::Partial, 1));
    }

    Some((MatchClass::CallId, 0))
}

/// The partial-match gate: an outbound request without a to-tag may not
/// join a dialog created by a different method, so it degrades to a
/// CallID-only match (and will typically fork). ACK and CANCEL aimed at
/// an INVITE entry are exempt; they legitimately carry no to-tag while
/// the INVITE is unanswered.
fn gate(e: &CallEntry, msg: &SipMsg, mtt: &[u8]) -> MatchClass {
    if msg.request()
        && mtt.is_empty()
        && msg.method() != e.method
        && !(e.method == Method::Invite && matches!(msg.method(), Method::Ack | Method::Cancel))
    {
        return MatchClass::CallId;
    }
    MatchClass::Partial
}

/// Walk the shard and return the best-matching entry, its class and the
/// message direction. A full match wins outright; among weaker matches
/// the tie-breaking order is: same method as the message, equal CSeq,
/// then (for a message CSeq beyond both candidates) a saved
/// auth-failure status, then the greater CSeq.
pub(crate) fn best_match(
    arena: &Arena<CallEntry>,
    msg: &SipMsg,
) -> (Option<u32>, MatchClass, usize) {
    let mut best: Option<(u32, MatchClass, usize)> = None;

    for idx in arena.list_indices() {
        let e = arena.at(idx);
        let Some((class, dir)) = classify(e, msg) else {
            continue;
        };
        if class == MatchClass::Full {
            return (Some(idx), class, dir);
        }
        best = match best {
            None => Some((idx, class, dir)),
            Some(cur) if prefer(arena, msg, (idx, class, dir), cur) => Some((idx, class, dir)),
            Some(cur) => Some(cur),
        };
    }

    match best {
        Some((idx, class, dir)) => (Some(idx), class, dir),
        None => (None, MatchClass::None, 0),
    }
}

/// True when candidate `new` beats `cur`.
fn prefer(
    arena: &Arena<CallEntry>,
    msg: &SipMsg,
    new: (u32, MatchClass, usize),
    cur: (u32, MatchClass, usize),
) -> bool {
    let (n_idx, n_class, n_dir) = new;
    let (c_idx, c_class, c_dir) = cur;

    if n_class != c_class {
        return n_class > c_class;
    }

    let en = arena.at(n_idx);
    let ec = arena.at(c_idx);

    if n_class == MatchClass::CallId {
        // An entry still waiting for its to-tag is the better host for
        // an unrelated-tag message.
        let n_open = en.to_tag().is_empty();
        let c_open = ec.to_tag().is_empty();
        if n_open != c_open {
            return n_open;
        }
    }

    let m = msg.method();
    let n_same = en.method == m;
    let c_same = ec.method == m;
    if n_same != c_same {
        return n_same;
    }

    let q = msg.cseq.num;
    let n_cseq = en.cseq[n_dir];
    let c_cseq = ec.cseq[c_dir];
    if (n_cseq == q) != (c_cseq == q) {
        return n_cseq == q;
    }

    if q > n_cseq && q > c_cseq {
        // The message continues some dialog beyond both candidates;
        // a challenged entry expecting the re-auth wins.
        let n_auth = en.saw_auth_failure();
        let c_auth = ec.saw_auth_failure();
        if n_auth != c_auth {
            return n_auth;
        }
    }

    n_cseq > c_cseq
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::CallEntry;
    use sipmsg::{MsgBuilder, NetPair};
    use std::time::Instant;

    fn mk_entry(callid: &[u8], ftag: &[u8], ttag: &[u8], method: Method) -> CallEntry {
        let buf = vec![0u8; 1024].into_boxed_slice();
        CallEntry::new(
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
        )
    }

    fn arena_with(entries: Vec<CallEntry>) -> (Arena<CallEntry>, Vec<u32>) {
        let mut a = Arena::new();
        let idxs = entries
            .into_iter()
            .map(|e| a.insert_head(e).0)
            .collect::<Vec<_>>();
        (a, idxs)
    }

    fn req(method: Method, callid: &[u8], ftag: &[u8], ttag: &[u8], cseq: u32) -> sipmsg::SipMsg {
        MsgBuilder::request(method, b"sip:x@y")
            .from(b"sip:a@y", ftag)
            .to(b"sip:b@y", ttag)
            .call_id(callid)
            .cseq(cseq, method)
            .build()
    }

    fn repl(status: u16, callid: &[u8], ftag: &[u8], ttag: &[u8], cseq: u32) -> sipmsg::SipMsg {
        MsgBuilder::reply(status, b"r")
            .from(b"sip:a@y", ftag)
            .to(b"sip:b@y", ttag)
            .call_id(callid)
            .cseq(cseq, Method::Invite)
            .build()
    }

    #[test]
    fn test_classes() {
        let (a, idxs) = arena_with(vec![mk_entry(b"c1", b"ft", b"tt", Method::Invite)]);

        // All three components: full, direction 0.
        let (i, class, dir) = best_match(&a, &req(Method::Invite, b"c1", b"ft", b"tt", 2));
        assert_eq!((i, class, dir), (Some(idxs[0]), MatchClass::Full, 0));

        // Swapped tags: full, direction 1.
        let (_, class, dir) = best_match(&a, &req(Method::Bye, b"c1", b"tt", b"ft", 1));
        assert_eq!((class, dir), (MatchClass::Full, 1));

        // Same from-tag, missing to-tag, same method: partial dir 0.
        let (_, class, dir) = best_match(&a, &req(Method::Invite, b"c1", b"ft", b"", 2));
        assert_eq!((class, dir), (MatchClass::Partial, 0));

        // Unrelated tags: callid-only.
        let (_, class, _) = best_match(&a, &req(Method::Invite, b"c1", b"other", b"", 1));
        assert_eq!(class, MatchClass::CallId);

        // Different callid: nothing.
        let (i, class, _) = best_match(&a, &req(Method::Invite, b"c2", b"ft", b"tt", 1));
        assert_eq!((i, class), (None, MatchClass::None));
    }

    #[test]
    fn test_match_symmetry_for_new_dialog() {
        // Entry created with no to-tag yet.
        let (a, _) = arena_with(vec![mk_entry(b"c1", b"F", b"", Method::Invite)]);

        // The same request again: partial, direction 0.
        let (_, class, dir) = best_match(&a, &req(Method::Invite, b"c1", b"F", b"", 1));
        assert_eq!((class, dir), (MatchClass::Partial, 0));

        // A reply bringing the to-tag: partial, direction 0 (replies
        // keep the requester's From).
        let (_, class, dir) = best_match(&a, &repl(180, b"c1", b"F", b"B", 1));
        assert_eq!((class, dir), (MatchClass::Partial, 0));
    }

    #[test]
    fn test_swapped_partial_direction_1() {
        let (a, _) = arena_with(vec![mk_entry(b"c1", b"F", b"B", Method::Invite)]);

        // In-dialog request from the far side: its from-tag is our
        // to-tag.
        let (_, class, dir) = best_match(&a, &req(Method::Bye, b"c1", b"B", b"", 1));
        assert_eq!((class, dir), (MatchClass::Partial, 1));
    }

    #[test]
    fn test_gate_downgrades_foreign_method() {
        let (a, _) = arena_with(vec![mk_entry(b"c1", b"F", b"", Method::Invite)]);

        // A REGISTER reusing the dialog identity must not join the
        // INVITE entry.
        let (_, class, _) = best_match(&a, &req(Method::Register, b"c1", b"F", b"", 1));
        assert_eq!(class, MatchClass::CallId);

        // ACK and CANCEL are exempt.
        let (_, class, _) = best_match(&a, &req(Method::Ack, b"c1", b"F", b"", 1));
        assert_eq!(class, MatchClass::Partial);
        let (_, class, _) = best_match(&a, &req(Method::Cancel, b"c1", b"F", b"", 1));
        assert_eq!(class, MatchClass::Partial);
    }

    #[test]
    fn test_tie_break_prefers_auth_challenged_entry() {
        let mut plain = mk_entry(b"c1", b"F1", b"B1", Method::Invite);
        plain.cseq[0] = 1;
        let mut challenged = mk_entry(b"c1", b"F2", b"B2", Method::Invite);
        challenged.cseq[0] = 1;
        challenged.repl_status[0] = 401;

        let (a, idxs) = arena_with(vec![plain, challenged]);

        // CSeq 2 exceeds both; the challenged entry expects the re-auth.
        let (i, class, _) = best_match(&a, &req(Method::Invite, b"c1", b"F3", b"", 2));
        assert_eq!(class, MatchClass::CallId);
        assert_eq!(i, Some(idxs[1]));
    }

    #[test]
    fn test_tie_break_prefers_equal_cseq() {
        let mut one = mk_entry(b"c1", b"F1", b"B1", Method::Invite);
        one.cseq[0] = 3;
        let mut two = mk_entry(b"c1", b"F2", b"B2", Method::Invite);
        two.cseq[0] = 2;

        let (a, idxs) = arena_with(vec![one, two]);

        let (i, _, _) = best_match(&a, &req(Method::Invite, b"c1", b"F9", b"", 2));
        assert_eq!(i, Some(idxs[1]));
    }

    #[test]
    fn test_callid_match_prefers_open_to_tag() {
        let closed = mk_entry(b"c1", b"F1", b"B1", Method::Invite);
        let open = mk_entry(b"c1", b"F2", b"", Method::Invite);

        let (a, idxs) = arena_with(vec![closed, open]);

        let (i, class, _) = best_match(&a, &req(Method::Invite, b"c1", b"F9", b"", 1));
        assert_eq!(class, MatchClass::CallId);
        assert_eq!(i, Some(idxs[1]));
    }
}
