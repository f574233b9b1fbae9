use sipmsg::{Method, SipMsg};

use crate::entry::{is_auth_status, CallEntry, CallFlags, CallState, MsgSummary};
use crate::events::EventKind;
use crate::info::CallAttr;
use crate::timer::TimerPolicy;

/// What one message did to an entry: how to program the timer, which
/// event to consider emitting, and whether the message was a
/// retransmission.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Transition {
    pub timer: TimerPolicy,
    pub event: EventKind,
    pub retr: bool,
}

impl Transition {
    fn unchanged(retr: bool) -> Self {
        Self {
            timer: TimerPolicy::ExtendOnly,
            event: EventKind::None,
            retr,
        }
    }
}

/// Drive the entry's state machine with one message. `dir` is 0 for the
/// dialog-creating direction. All entry bookkeeping happens here:
/// CSeq/status tracking, counters, diagnostics rings, and the
/// opportunistic attribute captures (UA, R-URI, Contact, Reason).
pub(crate) fn update_state(e: &mut CallEntry, msg: &SipMsg, dir: usize) -> Transition {
    let tr = if msg.request() {
        on_request(e, msg, dir)
    } else {
        on_reply(e, msg, dir)
    };

    e.msg_ring.push(MsgSummary {
        dir: dir as u8,
        request: msg.request(),
        method: msg.method(),
        status: msg.status,
        cseq: msg.cseq.num,
        retr: tr.retr,
    });

    // Attribute pickups are append-if-absent: the first sighting wins.
    if msg.request() {
        if !msg.ruri.is_empty() {
            e.append_attr(CallAttr::RUri, msg.fld(msg.ruri));
        }
        if !msg.ua.is_empty() {
            let a = if dir == 0 { CallAttr::UA } else { CallAttr::UAS };
            e.append_attr(a, msg.fld(msg.ua));
        }
        if let Some(c) = msg.contact0() {
            e.append_attr(CallAttr::Contact, msg.fld(c.uri));
        }
    } else if !msg.ua.is_empty() {
        e.append_attr(CallAttr::UAS, msg.fld(msg.ua));
    }

    tr
}

fn on_request(e: &mut CallEntry, msg: &SipMsg, dir: usize) -> Transition {
    let m = msg.method;
    let cseq = msg.cseq.num;
    let max_cseq = e.cseq[dir].max(e.repl_cseq[dir]);

    // PRACK and UPDATE never drive state; an in-dialog request at or
    // below the direction's high-water CSeq is a retransmission (ACK and
    // CANCEL legitimately reuse their INVITE's CSeq).
    let ignored = matches!(m, Method::Prack | Method::Update);
    let retr = cseq < max_cseq || (cseq == max_cseq && !matches!(m, Method::Ack | Method::Cancel));
    if ignored || retr {
        e.reqs_retr_no[dir] += 1;
        return Transition::unchanged(true);
    }

    e.cseq[dir] = cseq;
    e.reqs_no[dir] += 1;

    // A REGISTER refresh of a live binding keeps the entry as-is but
    // picks up the (possibly changed) contact; the reply stretches the
    // timer.
    if m == Method::Register && e.reg_link.is_some() && msg.to_tag().is_empty() {
        if let Some(c) = msg.contact0() {
            let uri = msg.fld(c.uri);
            e.overwrite_attr(CallAttr::Contact, uri);
        }
        return Transition::unchanged(false);
    }

    let has_totag = !msg.to_tag().is_empty();

    let (next, event) = match (e.state, m) {
        (
            CallState::Init
            | CallState::FirstInvite
            | CallState::EarlyDialog
            | CallState::Established
            | CallState::NegReply,
            Method::Bye,
        ) => (CallState::Bye, EventKind::CallEnd),

        (
            CallState::Init | CallState::FirstInvite | CallState::EarlyDialog,
            Method::Cancel,
        ) => {
            // The attempt is reported at final timeout, once a late 2xx
            // can no longer overturn it.
            e.flags |= CallFlags::CANCELED;
            (CallState::Canceled, EventKind::None)
        }

        // An in-dialog INVITE on a virgin entry: we joined mid-dialog.
        (CallState::Init, Method::Invite) if has_totag => {
            (CallState::Established, EventKind::CallStart)
        }
        (CallState::Init | CallState::NegReply, Method::Invite) => {
            (CallState::FirstInvite, EventKind::None)
        }

        (CallState::FirstInvite | CallState::EarlyDialog, Method::Ack | Method::Notify)
            if has_totag =>
        {
            return Transition::unchanged(false);
        }
        // Any other in-dialog request before the 2xx means the dialog
        // exists; recover the established state.
        (CallState::FirstInvite | CallState::EarlyDialog, _) if has_totag => {
            (CallState::Established, EventKind::CallStart)
        }

        (CallState::Init, Method::Ack) => return Transition::unchanged(false),
        (CallState::Init | CallState::NonInvNegReply, _) => {
            (CallState::FirstNonInvite, EventKind::None)
        }

        _ => return Transition::unchanged(false),
    };

    e.enter_state(next);
    Transition {
        timer: TimerPolicy::Force,
        event,
        retr: false,
    }
}

fn on_reply(e: &mut CallEntry, msg: &SipMsg, dir: usize) -> Transition {
    let status = msg.status;
    let cm = msg.cseq.method;
    let cseq = msg.cseq.num;
    let max_cseq = e.cseq[dir].max(e.repl_cseq[dir]);

    let ignored = matches!(cm, Method::Prack | Method::Update);
    // A reply is a retransmission when its CSeq is below the direction's
    // high-water mark, or when it repeats the reply CSeq without
    // improving on the stored status. A 2xx always beats a stored
    // non-2xx (the late forked answer).
    let retr = cseq < max_cseq
        || (cseq == e.repl_cseq[dir]
            && status <= e.repl_status[dir]
            && !(status / 100 == 2 && e.repl_status[dir] / 100 != 2));
    if ignored || retr {
        e.repls_retr_no[dir] += 1;
        return Transition::unchanged(true);
    }

    let prev_status = e.repl_status[dir];
    e.repl_cseq[dir] = cseq;
    e.repls_no[dir] += 1;
    // Only replies to the creating method may set the dialog's winning
    // status; an in-dialog OPTIONS reply must not overwrite it.
    if cm == e.method {
        e.repl_status[dir] = status;
    }
    if !msg.reason.is_empty() {
        let reason = msg.fld(msg.reason);
        e.overwrite_attr(CallAttr::Reason, reason);
    }

    let has_totag = !msg.to_tag().is_empty();
    let ok2xx = (200..300).contains(&status);
    let neg = status >= 300;

    let (next, event) = match cm {
        Method::Invite => match e.state {
            CallState::Init
            | CallState::FirstInvite
            | CallState::EarlyDialog
            | CallState::NegReply
                if ok2xx =>
            {
                (CallState::Established, EventKind::CallStart)
            }
            CallState::Init
            | CallState::FirstInvite
            | CallState::EarlyDialog
            | CallState::NegReply
                if neg =>
            {
                // A lone auth challenge is routine; the same challenge
                // twice on one direction means the re-auth failed too.
                let ev = if is_auth_status(status) && prev_status == status {
                    EventKind::AuthFailed
                } else {
                    EventKind::None
                };
                (CallState::NegReply, ev)
            }
            CallState::Init | CallState::FirstInvite
                if (101..200).contains(&status) && has_totag =>
            {
                (CallState::EarlyDialog, EventKind::None)
            }
            _ => return Transition::unchanged(false),
        },

        Method::Bye => match e.state {
            CallState::Init
            | CallState::FirstInvite
            | CallState::EarlyDialog
            | CallState::Established
            | CallState::Bye
            | CallState::NegReply => (CallState::ByeReplied, EventKind::CallEnd),
            _ => return Transition::unchanged(false),
        },

        Method::Cancel => match e.state {
            // A CANCEL reply without its request still cancels.
            CallState::Init | CallState::FirstInvite | CallState::EarlyDialog => {
                e.flags |= CallFlags::CANCELED;
                (CallState::Canceled, EventKind::CallAttempt)
            }
            _ => return Transition::unchanged(false),
        },

        Method::Register => match e.state {
            CallState::Init
            | CallState::FirstNonInvite
            | CallState::NonInvNegReply
            | CallState::NonInvFinished
                if ok2xx =>
            {
                // The registration outcome (new vs delete, and the
                // binding timeout) is refined by the caller.
                (CallState::NonInvFinished, EventKind::RegNew)
            }
            CallState::Init | CallState::FirstNonInvite | CallState::NonInvNegReply if neg => {
                let ev = if is_auth_status(status) && prev_status == status {
                    EventKind::AuthFailed
                } else {
                    EventKind::None
                };
                (CallState::NonInvNegReply, ev)
            }
            _ => return Transition::unchanged(false),
        },

        _ => match e.state {
            CallState::Init | CallState::FirstNonInvite | CallState::NonInvNegReply if ok2xx => {
                (CallState::NonInvFinished, EventKind::None)
            }
            CallState::Init | CallState::FirstNonInvite if neg => {
                (CallState::NonInvNegReply, EventKind::None)
            }
            _ => return Transition::unchanged(false),
        },
    };

    e.enter_state(next);
    Transition {
        timer: TimerPolicy::Force,
        event,
        retr: false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sipmsg::{MsgBuilder, NetPair};
    use std::time::Instant;

    fn entry(method: Method) -> CallEntry {
        let buf = vec![0u8; 512].into_boxed_slice();
        CallEntry::new(
            buf,
            128,
            b"cid-test",
            b"ft-a",
            b"",
            method,
            0,
            NetPair::default(),
            Instant::now(),
            1_700_000_000,
        )
    }

    fn invite(cseq: u32) -> sipmsg::SipMsg {
        MsgBuilder::request(Method::Invite, b"sip:b@x")
            .from(b"sip:a@x", b"ft-a")
            .to(b"sip:b@x", b"")
            .call_id(b"cid-test")
            .cseq(cseq, Method::Invite)
            .build()
    }

    fn reply(status: u16, cseq: u32, method: Method, totag: &[u8]) -> sipmsg::SipMsg {
        MsgBuilder::reply(status, b"x")
            .from(b"sip:a@x", b"ft-a")
            .to(b"sip:b@x", totag)
            .call_id(b"cid-test")
            .cseq(cseq, method)
            .build()
    }

    #[test]
    fn test_invite_dialog_happy_path() {
        let mut e = entry(Method::Invite);

        let tr = update_state(&mut e, &invite(1), 0);
        assert_eq!(e.state, CallState::FirstInvite);
        assert_eq!(tr.event, EventKind::None);
        assert!(matches!(tr.timer, TimerPolicy::Force));

        let tr = update_state(&mut e, &reply(100, 1, Method::Invite, b""), 0);
        assert_eq!(e.state, CallState::FirstInvite);
        assert!(matches!(tr.timer, TimerPolicy::ExtendOnly));
        assert!(!tr.retr);

        update_state(&mut e, &reply(180, 1, Method::Invite, b"tt-b"), 0);
        assert_eq!(e.state, CallState::EarlyDialog);

        let tr = update_state(&mut e, &reply(200, 1, Method::Invite, b"tt-b"), 0);
        assert_eq!(e.state, CallState::Established);
        assert_eq!(tr.event, EventKind::CallStart);
        assert_eq!(e.repl_status[0], 200);
    }

    #[test]
    fn test_request_retransmission() {
        let mut e = entry(Method::Invite);
        update_state(&mut e, &invite(1), 0);

        let tr = update_state(&mut e, &invite(1), 0);
        assert!(tr.retr);
        assert_eq!(e.reqs_retr_no[0], 1);
        assert_eq!(e.state, CallState::FirstInvite);
        assert_eq!(e.reqs_no[0], 1);

        // Lower CSeq is also a retransmission (or reordering); same
        // treatment.
        let tr = update_state(&mut e, &invite(0), 0);
        assert!(tr.retr);
        assert_eq!(e.reqs_retr_no[0], 2);
    }

    #[test]
    fn test_reply_retransmission_and_late_2xx() {
        let mut e = entry(Method::Invite);
        update_state(&mut e, &invite(1), 0);
        update_state(&mut e, &reply(486, 1, Method::Invite, b"tt-1"), 0);
        assert_eq!(e.state, CallState::NegReply);

        // The same 486 again: retransmission.
        let tr = update_state(&mut e, &reply(486, 1, Method::Invite, b"tt-1"), 0);
        assert!(tr.retr);
        assert_eq!(e.repls_retr_no[0], 1);

        // But a 2xx with the same CSeq is the late forked answer, not a
        // retransmission.
        let tr = update_state(&mut e, &reply(200, 1, Method::Invite, b"tt-2"), 0);
        assert!(!tr.retr);
        assert_eq!(e.state, CallState::Established);
        assert_eq!(tr.event, EventKind::CallStart);
    }

    #[test]
    fn test_prack_update_never_drive_state() {
        let mut e = entry(Method::Invite);
        update_state(&mut e, &invite(1), 0);
        update_state(&mut e, &reply(180, 1, Method::Invite, b"tt-b"), 0);
        assert_eq!(e.state, CallState::EarlyDialog);

        let prack = MsgBuilder::request(Method::Prack, b"sip:b@x")
            .from(b"sip:a@x", b"ft-a")
            .to(b"sip:b@x", b"tt-b")
            .call_id(b"cid-test")
            .cseq(2, Method::Prack)
            .build();
        let tr = update_state(&mut e, &prack, 0);
        assert!(tr.retr);
        assert_eq!(e.state, CallState::EarlyDialog);
        // Its CSeq is recorded only as ring history, not as state.
        assert_eq!(e.cseq[0], 1);
    }

    #[test]
    fn test_auth_failed_needs_same_status_twice() {
        let mut e = entry(Method::Invite);
        update_state(&mut e, &invite(1), 0);

        let tr = update_state(&mut e, &reply(401, 1, Method::Invite, b"tt-1"), 0);
        assert_eq!(e.state, CallState::NegReply);
        assert_eq!(tr.event, EventKind::None);

        update_state(&mut e, &invite(2), 0);
        assert_eq!(e.state, CallState::FirstInvite);

        let tr = update_state(&mut e, &reply(401, 2, Method::Invite, b"tt-2"), 0);
        assert_eq!(tr.event, EventKind::AuthFailed);
        assert_eq!(e.state, CallState::NegReply);
    }

    #[test]
    fn test_bye_from_either_side() {
        let mut e = entry(Method::Invite);
        update_state(&mut e, &invite(1), 0);
        update_state(&mut e, &reply(200, 1, Method::Invite, b"tt-b"), 0);

        let bye = MsgBuilder::request(Method::Bye, b"sip:a@x")
            .from(b"sip:b@x", b"tt-b")
            .to(b"sip:a@x", b"ft-a")
            .call_id(b"cid-test")
            .cseq(1, Method::Bye)
            .build();
        let tr = update_state(&mut e, &bye, 1);
        assert_eq!(e.state, CallState::Bye);
        assert_eq!(tr.event, EventKind::CallEnd);
        assert_eq!(e.cseq[1], 1);

        let ok = reply(200, 1, Method::Bye, b"");
        let tr = update_state(&mut e, &ok, 1);
        assert_eq!(e.state, CallState::ByeReplied);
        assert_eq!(tr.event, EventKind::CallEnd);
        // BYE replies do not overwrite the INVITE dialog's status.
        assert_eq!(e.repl_status[1], 0);
    }

    #[test]
    fn test_in_dialog_options_reply_keeps_status() {
        let mut e = entry(Method::Invite);
        update_state(&mut e, &invite(1), 0);
        update_state(&mut e, &reply(200, 1, Method::Invite, b"tt-b"), 0);
        assert_eq!(e.repl_status[0], 200);

        let tr = update_state(&mut e, &reply(486, 2, Method::Options, b"tt-b"), 0);
        assert!(!tr.retr);
        assert_eq!(e.repl_status[0], 200);
        assert_eq!(e.state, CallState::Established);
    }

    #[test]
    fn test_register_lifecycle() {
        let mut e = entry(Method::Register);
        let reg = MsgBuilder::request(Method::Register, b"sip:reg.x")
            .from(b"sip:u@x", b"ft-a")
            .to(b"sip:u@x", b"")
            .call_id(b"cid-test")
            .cseq(1, Method::Register)
            .contact_expires(b"sip:u@10.0.0.1", 3600)
            .build();
        update_state(&mut e, &reg, 0);
        assert_eq!(e.state, CallState::FirstNonInvite);
        assert_eq!(e.attr(CallAttr::Contact), b"sip:u@10.0.0.1");

        update_state(&mut e, &reply(401, 1, Method::Register, b"tt-1"), 0);
        assert_eq!(e.state, CallState::NonInvNegReply);

        let reg2 = MsgBuilder::request(Method::Register, b"sip:reg.x")
            .from(b"sip:u@x", b"ft-a")
            .to(b"sip:u@x", b"")
            .call_id(b"cid-test")
            .cseq(2, Method::Register)
            .contact_expires(b"sip:u@10.0.0.1", 3600)
            .build();
        update_state(&mut e, &reg2, 0);
        assert_eq!(e.state, CallState::FirstNonInvite);

        let tr = update_state(&mut e, &reply(200, 2, Method::Register, b"tt-2"), 0);
        assert_eq!(e.state, CallState::NonInvFinished);
        assert_eq!(tr.event, EventKind::RegNew);
    }
}
