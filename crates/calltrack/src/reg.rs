use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use sipmsg::{parse_uri_short, uri_short_cmp, HdrFlags, SipMsg};

use crate::config::Config;
use crate::entry::{CallEntry, CallFlags};
use crate::events::{EvFlags, EventKind};
use crate::info::CallAttr;
use crate::shard::{CallHandle, Link, Node, RegHandle, Table};
use crate::timer::TimerPolicy;
use crate::track::Inner;

/// Forced remaining lifetime of a call entry whose binding was deleted
/// or superseded.
pub(crate) const QUICK_EXPIRE: Duration = Duration::from_secs(1);

/// A cached (AOR, Contact) binding, owned by the registration table and
/// tied to the REGISTER call entry that created it. Both links are
/// generation-checked, so either side may disappear first.
pub(crate) struct RegEntry {
    pub(crate) link: Link,
    buf: Box<[u8]>,
    aor_len: u32,
    contact_len: u32,
    pub(crate) hash_bucket: u32,
    pub(crate) owner: CallHandle,
    pub(crate) refs: AtomicU32,
}

impl Node for RegEntry {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

impl RegEntry {
    fn new(mut buf: Box<[u8]>, aor: &[u8], contact: &[u8], bucket: u32, owner: CallHandle) -> Self {
        buf[..aor.len()].copy_from_slice(aor);
        buf[aor.len()..aor.len() + contact.len()].copy_from_slice(contact);
        Self {
            link: Link::default(),
            buf,
            aor_len: aor.len() as u32,
            contact_len: contact.len() as u32,
            hash_bucket: bucket,
            owner,
            refs: AtomicU32::new(1), // the shard's reference
        }
    }

    pub(crate) fn aor(&self) -> &[u8] {
        &self.buf[..self.aor_len as usize]
    }

    pub(crate) fn contact(&self) -> &[u8] {
        &self.buf[self.aor_len as usize..(self.aor_len + self.contact_len) as usize]
    }

    fn into_buf(self) -> Box<[u8]> {
        self.buf
    }
}

/// Canonical hash key for an AOR: `user@host[:port]` with the host
/// lowercased, or the trimmed lowercased raw value when it does not
/// parse. Two values that compare equal under the short-form comparison
/// always produce the same key.
pub(crate) fn short_key(raw: &[u8]) -> Vec<u8> {
    match parse_uri_short(raw) {
        Ok(u) => {
            let mut k = Vec::with_capacity(u.user.len() + u.host.len() + 8);
            k.extend_from_slice(u.user);
            k.push(b'@');
            k.extend(u.host.iter().map(|b| b.to_ascii_lowercase()));
            if let Some(p) = u.port {
                k.push(b':');
                k.extend_from_slice(p.to_string().as_bytes());
            }
            k
        }
        Err(_) => raw
            .iter()
            .copied()
            .filter(|b| !b" \t\r\n".contains(b))
            .map(|b| b.to_ascii_lowercase())
            .collect(),
    }
}

/// Refine a final 2xx REGISTER reply into the registration outcome and
/// the entry timeout to apply:
///
/// - a saved `*` contact, a matched reply contact with `expires=0`, an
///   `Expires: 0` without a per-contact value, or the saved contact
///   missing from a complete reply contact list all mean the binding is
///   gone (`RegDel`);
/// - otherwise the binding is alive (`RegNew`) for max(Expires header,
///   contact expires) plus the configured delta;
/// - with no saved contact at all (a ping-style REGISTER) the state's
///   default timeout applies.
pub(crate) fn classify_reg_reply(
    e: &CallEntry,
    msg: &SipMsg,
    cfg: &Config,
) -> (EventKind, Duration) {
    let default_to = cfg.timeouts.non_inv_finished;
    let delta = cfg.reg_delta as u64;

    let saved = e.attr(CallAttr::Contact);
    if saved.is_empty() {
        return (EventKind::RegNew, default_to);
    }
    if saved == b"*" {
        return (EventKind::RegDel, default_to);
    }

    let hdr_expires = msg
        .hdr_flags
        .contains(HdrFlags::EXPIRES)
        .then_some(msg.expires);

    let matched = msg
        .contacts
        .entries
        .iter()
        .find(|c| !c.star && uri_short_cmp(saved, msg.fld(c.uri)));

    match matched {
        Some(c) if c.has_expires && c.expires == 0 => (EventKind::RegDel, default_to),
        Some(c) => {
            let ce = if c.has_expires { c.expires } else { 0 };
            let secs = ce.max(hdr_expires.unwrap_or(0));
            if secs == 0 {
                if hdr_expires == Some(0) {
                    (EventKind::RegDel, default_to)
                } else {
                    (EventKind::RegNew, default_to)
                }
            } else {
                (EventKind::RegNew, Duration::from_secs(secs as u64 + delta))
            }
        }
        None if msg.contacts.complete => (EventKind::RegDel, default_to),
        None => {
            let to = match hdr_expires {
                Some(secs) if secs > 0 => Duration::from_secs(secs as u64 + delta),
                _ => default_to,
            };
            (EventKind::RegNew, to)
        }
    }
}

/// Install a binding for (AOR, Contact) owned by call entry `h`.
/// Returns false when the entry already carries a binding (a refresh:
/// the event is suppressed). Any pre-existing binding of the same pair
/// under a different Call-ID is detached and its owning entry
/// quick-expired, collapsing duplicate bindings.
///
/// Lock order: the call shard and the registration shard are never held
/// together; the call shard is re-taken at the end to attach the link.
pub(crate) fn apply_reg_new(inner: &Inner, h: CallHandle, aor: &[u8], contact: &[u8]) -> bool {
    {
        let mut g = inner.calls.shards[h.shard as usize].lock().unwrap();
        match g.get_mut(h.slot, h.gen) {
            Some(e) if e.reg_link.is_some() => return false,
            Some(_) => {}
            None => return false,
        }
    }

    let key = short_key(aor);
    let rs = Table::<RegEntry>::shard_idx(&key);

    let mut displaced: Vec<CallHandle> = Vec::new();
    let mut freed: Vec<Box<[u8]>> = Vec::new();
    let new_link;
    {
        let mut g = inner.regs.shards[rs].lock().unwrap();
        for j in g.list_indices() {
            let hit = {
                let r = g.at(j);
                uri_short_cmp(r.aor(), aor) && uri_short_cmp(r.contact(), contact)
            };
            if hit {
                displaced.push(g.at(j).owner);
                g.unlink(j);
                let r = g.free_slot(j);
                let prev = r.refs.fetch_sub(1, Ordering::Relaxed);
                debug_assert_eq!(prev, 1, "freeing a referenced binding");
                freed.push(r.into_buf());
            }
        }

        match inner.pool.alloc(aor.len() + contact.len()) {
            Some(buf) => {
                let r = RegEntry::new(buf, aor, contact, rs as u32, h);
                let (slot, gen) = g.insert_head(r);
                new_link = Some(RegHandle {
                    shard: rs as u32,
                    slot,
                    gen,
                });
            }
            None => {
                // Out of budget: the registration still happened on the
                // wire, so the event stands; only the cache misses out.
                tracing::warn!("registration binding not cached: allocation failed");
                new_link = None;
            }
        }
    }
    for b in freed {
        inner.pool.free(b);
    }

    for owner in displaced {
        if owner != h {
            tracing::debug!(?owner, "quick-expiring superseded registration owner");
            quick_expire(inner, owner);
        }
    }

    if let Some(rl) = new_link {
        let mut g = inner.calls.shards[h.shard as usize].lock().unwrap();
        match g.get_mut(h.slot, h.gen) {
            Some(e) => e.reg_link = Some(rl),
            None => {
                // The entry expired while the call shard was unlocked;
                // the freshly made binding has no owner and goes away.
                drop(g);
                detach_binding(inner, rl, h);
            }
        }
    }
    true
}

/// Remove the entry's own binding and sweep every remaining binding of
/// the AOR (and Contact, unless the delete was a `*`), quick-expiring
/// the owning entries of swept bindings.
pub(crate) fn apply_reg_del(inner: &Inner, h: CallHandle, aor: &[u8], contact: &[u8], star: bool) {
    let own = {
        let mut g = inner.calls.shards[h.shard as usize].lock().unwrap();
        match g.get_mut(h.slot, h.gen) {
            Some(e) => e.reg_link.take(),
            None => None,
        }
    };
    if let Some(rl) = own {
        detach_binding(inner, rl, h);
    }

    let key = short_key(aor);
    let rs = Table::<RegEntry>::shard_idx(&key);

    let mut owners: Vec<CallHandle> = Vec::new();
    let mut freed: Vec<Box<[u8]>> = Vec::new();
    {
        let mut g = inner.regs.shards[rs].lock().unwrap();
        for j in g.list_indices() {
            let hit = {
                let r = g.at(j);
                uri_short_cmp(r.aor(), aor) && (star || uri_short_cmp(r.contact(), contact))
            };
            if hit {
                owners.push(g.at(j).owner);
                g.unlink(j);
                let r = g.free_slot(j);
                let prev = r.refs.fetch_sub(1, Ordering::Relaxed);
                debug_assert_eq!(prev, 1, "freeing a referenced binding");
                freed.push(r.into_buf());
            }
        }
    }
    for b in freed {
        inner.pool.free(b);
    }
    for owner in owners {
        if owner != h {
            quick_expire(inner, owner);
        }
    }
}

/// Unlink and free a binding, but only while it is still owned by
/// `owner` (a newer binding may have recycled the slot).
pub(crate) fn detach_binding(inner: &Inner, rl: RegHandle, owner: CallHandle) {
    let buf = {
        let mut g = inner.regs.shards[rl.shard as usize].lock().unwrap();
        let owned = matches!(g.get_mut(rl.slot, rl.gen), Some(r) if r.owner == owner);
        if !owned {
            return;
        }
        g.unlink(rl.slot);
        let r = g.free_slot(rl.slot);
        let prev = r.refs.fetch_sub(1, Ordering::Relaxed);
        debug_assert_eq!(prev, 1, "freeing a referenced binding");
        r.into_buf()
    };
    inner.pool.free(buf);
}

/// Detach a call entry from its binding and force its timer down to the
/// quick-expire interval. Marks the entry so its eventual timeout stays
/// silent about the registration (the deletion was already accounted
/// for).
pub(crate) fn quick_expire(inner: &Inner, owner: CallHandle) {
    let mut g = inner.calls.shards[owner.shard as usize].lock().unwrap();
    let Some(e) = g.get_mut(owner.slot, owner.gen) else {
        return;
    };
    e.reg_link = None;
    e.ev_flags |= EvFlags::REG_DEL;
    e.flags |= CallFlags::INTERNAL_CANCEL;

    let now = Instant::now();
    if e.timer.update(now, QUICK_EXPIRE, TimerPolicy::Force) {
        let when = e.timer.expires;
        e.refs.fetch_add(1, Ordering::Relaxed);
        if inner.timer.schedule(when, owner).is_err() {
            e.refs.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sipmsg::{Method, MsgBuilder, NetPair};

    fn reg_entry(contact: &[u8]) -> CallEntry {
        let buf = vec![0u8; 1024].into_boxed_slice();
        let mut e = CallEntry::new(
            buf,
            256,
            b"cid-r",
            b"ft",
            b"",
            Method::Register,
            0,
            NetPair::default(),
            Instant::now(),
            0,
        );
        if !contact.is_empty() {
            e.append_attr(CallAttr::Contact, contact);
        }
        e
    }

    fn reply_with_contact(uri: &[u8], expires: Option<u32>) -> SipMsg {
        let b = MsgBuilder::reply(200, b"OK")
            .from(b"sip:u@x", b"ft")
            .to(b"sip:u@x", b"tt")
            .call_id(b"cid-r")
            .cseq(1, Method::Register);
        match expires {
            Some(secs) => b.contact_expires(uri, secs).build(),
            None => b.contact(uri).build(),
        }
    }

    #[test]
    fn test_classify_new_with_expires() {
        let cfg = Config {
            reg_delta: 30,
            ..Config::default()
        };
        let e = reg_entry(b"sip:u@10.0.0.1");
        let msg = reply_with_contact(b"sip:u@10.0.0.1", Some(3600));

        let (kind, to) = classify_reg_reply(&e, &msg, &cfg);
        assert_eq!(kind, EventKind::RegNew);
        assert_eq!(to, Duration::from_secs(3630));
    }

    #[test]
    fn test_classify_delete_expire_zero() {
        let cfg = Config::default();
        let e = reg_entry(b"sip:u@10.0.0.1");
        let msg = reply_with_contact(b"sip:u@10.0.0.1", Some(0));

        let (kind, _) = classify_reg_reply(&e, &msg, &cfg);
        assert_eq!(kind, EventKind::RegDel);
    }

    #[test]
    fn test_classify_delete_star_and_absence() {
        let cfg = Config::default();

        let star = reg_entry(b"*");
        let msg = reply_with_contact(b"sip:u@10.0.0.1", Some(60));
        assert_eq!(classify_reg_reply(&star, &msg, &cfg).0, EventKind::RegDel);

        // Saved contact absent from a complete reply contact list.
        let e = reg_entry(b"sip:u@10.0.0.2");
        assert_eq!(classify_reg_reply(&e, &msg, &cfg).0, EventKind::RegDel);
    }

    #[test]
    fn test_classify_incomplete_list_keeps_binding() {
        let cfg = Config::default();
        let e = reg_entry(b"sip:u@10.0.0.2");
        let msg = MsgBuilder::reply(200, b"OK")
            .from(b"sip:u@x", b"ft")
            .to(b"sip:u@x", b"tt")
            .call_id(b"cid-r")
            .cseq(1, Method::Register)
            .contact_expires(b"sip:u@10.0.0.1", 60)
            .contacts_incomplete()
            .expires(120)
            .build();

        let (kind, to) = classify_reg_reply(&e, &msg, &cfg);
        assert_eq!(kind, EventKind::RegNew);
        assert_eq!(to, Duration::from_secs(120));
    }

    #[test]
    fn test_classify_ping_register() {
        let cfg = Config::default();
        let e = reg_entry(b"");
        let msg = reply_with_contact(b"sip:u@10.0.0.1", Some(60));

        let (kind, to) = classify_reg_reply(&e, &msg, &cfg);
        assert_eq!(kind, EventKind::RegNew);
        assert_eq!(to, cfg.timeouts.non_inv_finished);
    }

    #[test]
    fn test_short_key_canonical() {
        assert_eq!(short_key(b"sip:U@EXAMPLE.org"), b"U@example.org".to_vec());
        assert_eq!(
            short_key(b"<sip:u@example.org:5080;lr>"),
            b"u@example.org:5080".to_vec()
        );
        // Values that compare equal hash equal.
        let a = b"<sip:bob@Biloxi.COM>;q=0.5";
        let b = b"sip:bob@biloxi.com";
        assert!(uri_short_cmp(a, b));
        assert_eq!(short_key(a), short_key(b));
        // Unparseable values degrade consistently.
        assert_eq!(short_key(b" Weird-Value "), b"weird-value".to_vec());
    }
}
