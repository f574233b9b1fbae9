use sipmsg::Field;

/// The named attributes a call entry carries, in their storage order
/// within event snapshots.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum CallAttr {
    FromUri,
    ToUri,
    Method,
    RUri,
    Contact,
    Reason,
    UA,
    UAS,
}

pub(crate) const ATTR_COUNT: usize = 8;

impl CallAttr {
    pub const ALL: [CallAttr; ATTR_COUNT] = [
        CallAttr::FromUri,
        CallAttr::ToUri,
        CallAttr::Method,
        CallAttr::RUri,
        CallAttr::Contact,
        CallAttr::Reason,
        CallAttr::UA,
        CallAttr::UAS,
    ];

    #[inline]
    pub(crate) fn idx(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallAttr::FromUri => "from_uri",
            CallAttr::ToUri => "to_uri",
            CallAttr::Method => "method",
            CallAttr::RUri => "r_uri",
            CallAttr::Contact => "contact",
            CallAttr::Reason => "reason",
            CallAttr::UA => "ua",
            CallAttr::UAS => "uas",
        }
    }
}

struct Budget {
    min: usize,
    default: usize,
    max: usize,
}

// Per-attribute length budgets. `default` sizes the shared region at
// entry creation, `max` caps what a single value may occupy, and `min`
// is a guaranteed reservation: shared-region space other attributes may
// never consume while this one is below it.
const BUDGETS: [Budget; ATTR_COUNT] = [
    Budget { min: 0, default: 64, max: 96 },   // FromUri
    Budget { min: 0, default: 64, max: 96 },   // ToUri
    Budget { min: 0, default: 16, max: 16 },   // Method
    Budget { min: 0, default: 64, max: 96 },   // RUri
    Budget { min: 0, default: 64, max: 160 },  // Contact
    Budget { min: 64, default: 64, max: 64 },  // Reason
    Budget { min: 0, default: 64, max: 64 },   // UA
    Budget { min: 0, default: 48, max: 64 },   // UAS
];

/// Region bytes reserved for attributes at entry creation.
pub(crate) fn default_region_size() -> usize {
    BUDGETS.iter().map(|b| b.default.max(b.min)).sum()
}

/// The attribute bag of one call entry: up to [`ATTR_COUNT`] values
/// packed back-to-back in the entry buffer region following the key.
/// `used` is the high-water mark; deleting or shrinking an attribute
/// shifts everything above it down so the packing stays gap-free.
#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct CallInfo {
    /// Value of each attribute, absolute offsets into the entry buffer.
    attrs: [Field; ATTR_COUNT],
    /// Bytes reserved by each attribute's slot (>= value length; zero
    /// means absent).
    slots: [u16; ATTR_COUNT],
    /// The attribute region within the entry buffer.
    region: Field,
    used: u32,
}

impl CallInfo {
    pub(crate) fn init(&mut self, region: Field) {
        *self = Self {
            region,
            ..Self::default()
        };
    }

    #[inline]
    pub(crate) fn is_set(&self, attr: CallAttr) -> bool {
        self.slots[attr.idx()] != 0
    }

    pub(crate) fn get<'a>(&self, buf: &'a [u8], attr: CallAttr) -> &'a [u8] {
        self.attrs[attr.idx()].get(buf)
    }

    /// Append a value for an attribute that has no slot yet. Returns the
    /// bytes written (the value may be truncated to its budget and the
    /// remaining region space), or None when the attribute is already
    /// present.
    pub(crate) fn append(&mut self, buf: &mut [u8], attr: CallAttr, val: &[u8]) -> Option<usize> {
        if self.is_set(attr) {
            return None;
        }
        if val.is_empty() {
            return Some(0);
        }
        let free = (self.region.len as usize - self.used as usize)
            .saturating_sub(self.reserved_elsewhere(attr));
        let n = val.len().min(BUDGETS[attr.idx()].max).min(free);
        if n == 0 {
            return Some(0);
        }

        let offs = self.region.offs as usize + self.used as usize;
        buf[offs..offs + n].copy_from_slice(&val[..n]);
        self.attrs[attr.idx()] = Field::new(offs as u32, n as u32);
        self.slots[attr.idx()] = n as u16;
        self.used += n as u32;
        Some(n)
    }

    /// Replace an attribute's value. Writes in place when the new value
    /// fits the existing slot; otherwise deletes the slot (shifting the
    /// attributes packed above it) and appends at the high-water mark.
    pub(crate) fn overwrite(&mut self, buf: &mut [u8], attr: CallAttr, val: &[u8]) {
        let i = attr.idx();
        if !self.is_set(attr) {
            self.append(buf, attr, val);
            return;
        }
        let slot = self.slots[i] as usize;
        if val.len() <= slot {
            let offs = self.attrs[i].offs as usize;
            buf[offs..offs + val.len()].copy_from_slice(val);
            self.attrs[i].len = val.len() as u32;
            return;
        }
        self.delete(buf, attr);
        self.append(buf, attr, val);
    }

    /// Region bytes still spoken for by the minimum reservations of
    /// *other* attributes: each one's shortfall between its slot and
    /// its guaranteed minimum.
    fn reserved_elsewhere(&self, attr: CallAttr) -> usize {
        BUDGETS
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != attr.idx())
            .map(|(i, b)| b.min.saturating_sub(self.slots[i] as usize))
            .sum()
    }

    /// Remove an attribute's slot and compact the region: every byte
    /// above the slot moves down, and the Fields naming those bytes are
    /// shifted to match.
    pub(crate) fn delete(&mut self, buf: &mut [u8], attr: CallAttr) {
        let i = attr.idx();
        if !self.is_set(attr) {
            return;
        }
        let slot = self.slots[i] as usize;
        let start = self.attrs[i].offs as usize;
        let tail_end = self.region.offs as usize + self.used as usize;

        buf.copy_within(start + slot..tail_end, start);

        for j in 0..ATTR_COUNT {
            if self.slots[j] != 0 && self.attrs[j].offs > start as u32 {
                self.attrs[j].shift_down(slot as u32);
            }
        }
        self.attrs[i] = Field::default();
        self.slots[i] = 0;
        self.used -= slot as u32;
    }
}
