use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use pool::{BufPool, PoolStats};
use sipmsg::{NetPair, SipMsg};

use crate::entry::{CallEntry, CallFlags};
use crate::events::{self, EventKind, EventRecord, EventSink, Synth};
use crate::fork::{self, ForkOutcome};
use crate::info::{default_region_size, CallAttr};
use crate::key::CallKey;
use crate::matcher::{self, MatchClass};
use crate::reg::{self, RegEntry};
use crate::shard::{Arena, CallHandle, Table, TableStats};
use crate::timer::{TimerPolicy, TimerQueue, FIRE_GRACE};
use crate::{Config, Error};

/// Outcome of processing one message.
#[derive(Copy, Clone, Debug)]
pub struct Processed {
    /// The semantic event emitted to the sink, `None` when the message
    /// changed state silently (or was a retransmission).
    pub event: EventKind,
    /// How the message matched the call table.
    pub class: MatchClass,
    /// Message direction within its dialog (0 = dialog-creating).
    pub dir: usize,
}

/// A copy of one entry's tracking state, as returned by
/// [`CallTracker::probe`].
#[derive(Clone, Debug)]
pub struct DialogInfo {
    pub state: crate::CallState,
    pub flags: CallFlags,
    pub ev_flags: crate::EvFlags,
    pub method: sipmsg::Method,
    pub cseq: [u32; 2],
    pub repl_cseq: [u32; 2],
    pub repl_status: [u16; 2],
    pub reqs_retr_no: [u32; 2],
    pub repls_retr_no: [u32; 2],
    pub state_ring: crate::StateRing,
    /// Time until the entry's expiration timer fires.
    pub expires_in: std::time::Duration,
    pub has_binding: bool,
}

impl DialogInfo {
    fn of(e: &CallEntry) -> Self {
        Self {
            state: e.state,
            flags: e.flags,
            ev_flags: e.ev_flags,
            method: e.method,
            cseq: e.cseq,
            repl_cseq: e.repl_cseq,
            repl_status: e.repl_status,
            reqs_retr_no: e.reqs_retr_no,
            repls_retr_no: e.repls_retr_no,
            state_ring: e.state_ring,
            expires_in: e.timer.expires.saturating_duration_since(Instant::now()),
            has_binding: e.reg_link.is_some(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) cfg: Config,
    pub(crate) calls: Table<CallEntry>,
    pub(crate) regs: Table<RegEntry>,
    pub(crate) pool: BufPool,
    pub(crate) timer: TimerQueue,
    pub(crate) sink: EventSink,
}

/// The tracking engine. Clone-free: share it behind an `Arc` if several
/// capture threads feed it (every method takes `&self`).
///
/// Dropping the tracker stops the expiration service; entries still in
/// the tables are discarded without events.
pub struct CallTracker {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

fn now_wall() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

impl CallTracker {
    pub fn new(cfg: Config, sink: EventSink) -> Self {
        let pool = BufPool::new(cfg.mem_limit);
        let inner = Arc::new(Inner {
            cfg,
            calls: Table::new(),
            regs: Table::new(),
            pool,
            timer: TimerQueue::new(),
            sink,
        });

        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("calltrack-timer".into())
                .spawn(move || timer_worker(inner))
                .expect("failed to spawn the timer service thread")
        };

        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// Feed one observed message. Returns the match outcome and the
    /// event (if any) that was delivered to the sink; the sink is always
    /// invoked outside the tracker's locks.
    pub fn process_message(&self, msg: &SipMsg, pair: &NetPair) -> Result<Processed, Error> {
        if !msg.parsed_ok() {
            return Err(Error::ParseInsufficient);
        }
        let inner = &*self.inner;
        let now = Instant::now();
        let wall = now_wall();
        let shard = Table::<CallEntry>::shard_idx(msg.call_id());

        let mut guard = inner.calls.shards[shard].lock().unwrap();

        let (found, class, mut dir) = matcher::best_match(&guard, msg);

        let mut is_new = false;
        let idx = match (found, class) {
            (None, _) => {
                is_new = true;
                dir = 0;
                let e = new_entry(inner, msg, pair, shard as u32, now, wall)?;
                guard.insert_head(e).0
            }
            (Some(i), MatchClass::Full) => i,
            (Some(i), _) => match fork::fork_or_update(
                &mut guard,
                &inner.pool,
                i,
                class,
                dir,
                msg,
                shard as u32,
                now,
                wall,
            ) {
                ForkOutcome::InPlace => i,
                ForkOutcome::Fork(child) => {
                    is_new = true;
                    dir = 0;
                    guard.insert_head(child).0
                }
                ForkOutcome::Failed(err) => return Err(err),
            },
        };
        if is_new {
            let e = guard.at_mut(idx);
            e.flags |= CallFlags::HASHED;
            // The shard's reference.
            e.refs.fetch_add(1, Ordering::Relaxed);
        }

        let h = CallHandle {
            shard: shard as u32,
            slot: idx,
            gen: guard.gen_of(idx),
        };

        let tr = crate::state::update_state(guard.at_mut(idx), msg, dir);

        // Registration replies get refined into new/delete plus the
        // binding lifetime before the timer is programmed.
        let mut event = tr.event;
        let mut timer_after = inner.cfg.timeouts.for_state(guard.at(idx).state);
        let mut timer_policy = tr.timer;
        let mut reg_ctx: Option<(Vec<u8>, Vec<u8>, bool)> = None;
        if event == EventKind::RegNew {
            let e = guard.at(idx);
            let (kind, to) = reg::classify_reg_reply(e, msg, &inner.cfg);
            event = kind;
            if kind == EventKind::RegNew {
                timer_after = to;
                timer_policy = TimerPolicy::Force;
            }
            let aor = e.attr(CallAttr::ToUri).to_vec();
            let contact = e.attr(CallAttr::Contact).to_vec();
            let star = contact == b"*";
            reg_ctx = Some((aor, contact, star));
        }

        if is_new {
            let e = guard.at_mut(idx);
            e.timer.init(now, timer_after);
            let when = e.timer.expires;
            e.refs.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = inner.timer.schedule(when, h) {
                // Roll the fresh entry back entirely.
                e.refs.fetch_sub(1, Ordering::Relaxed);
                e.refs.fetch_sub(1, Ordering::Relaxed);
                e.flags.remove(CallFlags::HASHED);
                guard.unlink(idx);
                let freed = guard.free_slot(idx);
                drop(guard);
                inner.pool.free(freed.buf);
                return Err(err);
            }
        } else {
            let e = guard.at_mut(idx);
            if e.timer.update(now, timer_after, timer_policy) {
                let when = e.timer.expires;
                e.refs.fetch_add(1, Ordering::Relaxed);
                if inner.timer.schedule(when, h).is_err() {
                    e.refs.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        let mut record: Option<EventRecord> = None;
        match event {
            EventKind::None => {}
            EventKind::RegNew | EventKind::RegDel => {
                let (aor, contact, star) = reg_ctx.take().unwrap_or_default();

                // The registration cache has its own locks; respect the
                // ordering by releasing the call shard across the
                // mutation.
                drop(guard);
                let emit = match event {
                    EventKind::RegNew => reg::apply_reg_new(inner, h, &aor, &contact),
                    _ => {
                        reg::apply_reg_del(inner, h, &aor, &contact, star);
                        true
                    }
                };
                guard = inner.calls.shards[shard].lock().unwrap();

                let live = guard.get_mut(h.slot, h.gen).is_some();
                if emit && live && events::update_event(&mut guard, idx, event) {
                    record = Some(snapshot(&mut guard, idx, event, None, wall));
                } else {
                    event = EventKind::None;
                }
            }
            _ => {
                if events::update_event(&mut guard, idx, event) {
                    record = Some(snapshot(&mut guard, idx, event, None, wall));
                } else {
                    event = EventKind::None;
                }
            }
        }

        drop(guard);
        if let Some(rec) = &record {
            (inner.sink)(rec);
        }
        Ok(Processed { event, class, dir })
    }

    /// Diagnostic probe: a copy of the tracking state of the entry best
    /// matching a dialog identity (exact key match preferred, any entry
    /// of the Call-ID otherwise). For status pages and tests; the
    /// entry itself never escapes its shard lock.
    pub fn probe(&self, callid: &[u8], from_tag: &[u8], to_tag: &[u8]) -> Option<DialogInfo> {
        let shard = Table::<CallEntry>::shard_idx(callid);
        let g = self.inner.calls.shards[shard].lock().unwrap();
        let mut fallback = None;
        for i in g.list_indices() {
            let e = g.at(i);
            if e.callid() != callid {
                continue;
            }
            if e.from_tag() == from_tag && e.to_tag() == to_tag {
                return Some(DialogInfo::of(e));
            }
            if fallback.is_none() {
                fallback = Some(DialogInfo::of(e));
            }
        }
        fallback
    }

    pub fn call_stats(&self) -> TableStats {
        self.inner.calls.stats()
    }

    pub fn reg_stats(&self) -> TableStats {
        self.inner.regs.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl Drop for CallTracker {
    fn drop(&mut self) {
        self.inner.timer.stop();
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
        // The service is gone; cancel whatever timers remain so the
        // tables drop with every entry quiesced. With the worker joined
        // no callback can be mid-fire, so try_stop cannot fail.
        for shard in self.inner.calls.shards.iter() {
            let mut g = shard.lock().unwrap();
            for i in g.list_indices() {
                let stopped = g.at_mut(i).timer.try_stop();
                debug_assert!(stopped, "entry timer still firing after join");
            }
        }
    }
}

/// Build a fresh entry for an unmatched message. Replies create entries
/// too (we may have missed the request): the stored endpoints are then
/// the reversed pair, since entries keep the dialog-creating direction.
fn new_entry(
    inner: &Inner,
    msg: &SipMsg,
    pair: &NetPair,
    shard: u32,
    now: Instant,
    wall: i64,
) -> Result<CallEntry, Error> {
    let callid = msg.call_id();
    let ftag = msg.from_tag();
    let ttag = msg.to_tag();

    let Some(key_cap) = CallKey::reserve_for(callid.len(), ftag.len(), ttag.len()) else {
        return Err(Error::KeySpaceExceeded);
    };
    let Some(buf) = inner.pool.alloc(key_cap + default_region_size()) else {
        return Err(Error::AllocExhausted);
    };

    let endpoints = if msg.request() {
        *pair
    } else {
        pair.reversed()
    };

    let mut e = CallEntry::new(
        buf,
        key_cap,
        callid,
        ftag,
        ttag,
        msg.method(),
        shard,
        endpoints,
        now,
        wall,
    );
    e.append_attr(CallAttr::FromUri, msg.fld(msg.from.uri));
    e.append_attr(CallAttr::ToUri, msg.fld(msg.to.uri));
    e.append_attr(CallAttr::Method, msg.method().name().as_bytes());

    tracing::debug!(
        callid = %String::from_utf8_lossy(callid),
        method = %msg.method(),
        "tracking new dialog"
    );
    Ok(e)
}

/// Stamp event bookkeeping on the entry and take the snapshot, all
/// under the shard lock.
fn snapshot(
    arena: &mut Arena<CallEntry>,
    idx: u32,
    kind: EventKind,
    synth: Option<Synth>,
    wall: i64,
) -> EventRecord {
    let e = arena.at_mut(idx);
    e.evs_no += 1;
    if matches!(
        kind,
        EventKind::CallStart | EventKind::RegNew | EventKind::SubNew
    ) && e.started_ts == 0
    {
        e.started_ts = wall;
    }
    let mut rec = EventRecord::default();
    events::fill_record(&mut rec, kind, e, synth);
    e.last_ev = kind;
    rec
}

fn timer_worker(inner: Arc<Inner>) {
    while let Some(d) = inner.timer.next_due() {
        fire(&inner, d.target);
    }
    tracing::debug!("timer service stopped");
}

/// Expire one entry. The snapshot is completed under the shard lock,
/// the lock is released, and only then does the sink run; the heap
/// node's reference keeps the entry alive throughout.
fn fire(inner: &Inner, h: CallHandle) {
    let mut guard = inner.calls.shards[h.shard as usize].lock().unwrap();

    if guard.get_mut(h.slot, h.gen).is_none() {
        // Every queued node holds a reference, so the slot cannot have
        // been recycled under us.
        panic!("timer fired for a recycled call entry");
    }

    if guard.at(h.slot).timer.done {
        // A newer node (or the destructor) beat us to it.
        release_node(inner, guard, h);
        return;
    }

    let now = Instant::now();
    let expires = guard.at(h.slot).timer.expires;
    if expires.saturating_duration_since(now) > FIRE_GRACE {
        // Extended while queued; re-arm for the remainder, keeping this
        // node's reference for the new node.
        drop(guard);
        if inner.timer.schedule(expires, h).is_err() {
            let guard = inner.calls.shards[h.shard as usize].lock().unwrap();
            release_node(inner, guard, h);
        }
        return;
    }

    {
        let e = guard.at_mut(h.slot);
        e.timer.fired = true;
        e.timer.done = true;
        e.flags |= CallFlags::TIMEOUT;
    }

    let (kind, synth) = events::final_timeout_event(guard.at_mut(h.slot));
    let mut record: Option<EventRecord> = None;
    if kind != EventKind::None && events::update_event(&mut guard, h.slot, kind) {
        record = Some(snapshot(&mut guard, h.slot, kind, synth, now_wall()));
    }

    tracing::debug!(
        state = %guard.at(h.slot).state,
        event = %kind,
        "call entry expired"
    );

    let reg_link = guard.at_mut(h.slot).reg_link.take();
    guard.unlink(h.slot);
    {
        let e = guard.at_mut(h.slot);
        e.flags.remove(CallFlags::HASHED);
        // The shard's reference.
        e.refs.fetch_sub(1, Ordering::Relaxed);
    }

    // Drops the node's own reference and frees the slot if it was the
    // last; the guard is released inside.
    release_node(inner, guard, h);

    if let Some(rl) = reg_link {
        reg::detach_binding(inner, rl, h);
    }
    if let Some(rec) = record {
        (inner.sink)(&rec);
    }
}

/// Give up a heap node's reference on an entry; the last reference off a
/// detached entry recycles the slot and returns its buffer to the pool
/// (outside the shard lock).
fn release_node(inner: &Inner, mut guard: MutexGuard<'_, Arena<CallEntry>>, h: CallHandle) {
    if guard.get_mut(h.slot, h.gen).is_none() {
        return;
    }
    let prev = guard.at(h.slot).refs.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev >= 1, "reference underflow");
    if prev == 1 {
        assert!(
            !guard.is_linked(h.slot),
            "last reference dropped on a linked entry"
        );
        let freed = guard.free_slot(h.slot);
        drop(guard);
        inner.pool.free(freed.buf);
    }
}
