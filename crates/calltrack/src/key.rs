use sipmsg::Field;

/// Hard cap on CallID + FromTag + ToTag storage within one entry.
pub(crate) const MAX_KEY_BYTES: usize = 384;
/// Space reserved for a from-tag when the creating message had none.
pub(crate) const FROM_TAG_RESERVE: usize = 50;
/// Space reserved for a future to-tag when the creating message had none.
pub(crate) const TO_TAG_RESERVE: usize = 50;
/// Tags shorter than this still reserve this much, so a replacement tag
/// of ordinary length fits without reallocating the entry.
pub(crate) const MIN_TAG_RESERVE: usize = 32;

/// The dialog identity of a call entry: CallID, FromTag and ToTag laid
/// out contiguously, in that order, at the front of the entry's buffer.
/// The region sizes are fixed at entry creation; tag setters write in
/// place and fail (returning false) rather than grow, and the caller
/// forks a new entry instead.
#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct CallKey {
    pub callid: Field,
    pub from_tag: Field,
    pub to_tag: Field,
    /// Total bytes reserved for the key region at the start of the
    /// entry buffer.
    cap: u32,
}

/// Reserve size for one tag: observed length, padded up to the minimum,
/// or the default reserve when the tag is absent.
fn tag_reserve(observed: usize, default: usize) -> usize {
    if observed == 0 {
        default
    } else {
        observed.max(MIN_TAG_RESERVE)
    }
}

impl CallKey {
    /// Bytes to reserve for a key over the given component lengths, or
    /// None when the combination exceeds the key cap.
    pub(crate) fn reserve_for(callid: usize, from_tag: usize, to_tag: usize) -> Option<usize> {
        let need = callid
            + tag_reserve(from_tag, FROM_TAG_RESERVE)
            + tag_reserve(to_tag, TO_TAG_RESERVE);
        (need <= MAX_KEY_BYTES && callid > 0).then_some(need)
    }

    /// Lay the key out in `buf[..cap]`. The caller sizes `cap` with
    /// [`CallKey::reserve_for`], so the components are known to fit.
    pub(crate) fn init(
        &mut self,
        buf: &mut [u8],
        cap: usize,
        callid: &[u8],
        from_tag: &[u8],
        to_tag: &[u8],
    ) {
        debug_assert!(callid.len() + from_tag.len() + to_tag.len() <= cap);
        self.cap = cap as u32;

        buf[..callid.len()].copy_from_slice(callid);
        self.callid = Field::new(0, callid.len() as u32);

        let fo = self.callid.end() as usize;
        buf[fo..fo + from_tag.len()].copy_from_slice(from_tag);
        self.from_tag = Field::new(fo as u32, from_tag.len() as u32);

        let to = self.from_tag.end() as usize;
        buf[to..to + to_tag.len()].copy_from_slice(to_tag);
        self.to_tag = Field::new(to as u32, to_tag.len() as u32);
    }

    pub(crate) fn callid<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        self.callid.get(buf)
    }

    pub(crate) fn from_tag<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        self.from_tag.get(buf)
    }

    pub(crate) fn to_tag<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        self.to_tag.get(buf)
    }

    /// Set (or replace) the to-tag in place. Fails when the tag does not
    /// fit in the space remaining after the from-tag region.
    pub(crate) fn set_to_tag(&mut self, buf: &mut [u8], tag: &[u8]) -> bool {
        let start = self.from_tag.end() as usize;
        if start + tag.len() > self.cap as usize {
            return false;
        }
        buf[start..start + tag.len()].copy_from_slice(tag);
        self.to_tag = Field::new(start as u32, tag.len() as u32);
        true
    }

    /// Replace the from-tag, shifting the to-tag region so the layout
    /// invariant (three contiguous regions, in order) holds. Fails when
    /// the combined components no longer fit.
    pub(crate) fn replace_from_tag(&mut self, buf: &mut [u8], tag: &[u8]) -> bool {
        let callid_end = self.callid.end() as usize;
        let to_len = self.to_tag.len as usize;
        if callid_end + tag.len() + to_len > self.cap as usize {
            return false;
        }

        // Save the to-tag bytes before the from-tag write can clobber
        // them. The key cap bounds the copy.
        let mut saved = [0u8; MAX_KEY_BYTES];
        saved[..to_len].copy_from_slice(self.to_tag.get(buf));

        buf[callid_end..callid_end + tag.len()].copy_from_slice(tag);
        self.from_tag = Field::new(callid_end as u32, tag.len() as u32);

        let to_start = self.from_tag.end() as usize;
        buf[to_start..to_start + to_len].copy_from_slice(&saved[..to_len]);
        self.to_tag = Field::new(to_start as u32, to_len as u32);
        true
    }

    /// Would a replacement from-tag of `from_len` bytes plus the default
    /// to-tag reservation fit this key's region?
    pub(crate) fn has_tag_space(&self, from_len: usize) -> bool {
        self.callid.len as usize + tag_reserve(from_len, FROM_TAG_RESERVE) + TO_TAG_RESERVE
            <= self.cap as usize
    }
}
