use crate::{Field, Method};

bitflags::bitflags! {
    /// Which headers the parser actually saw. The tracker requires
    /// `REQUIRED` before it will touch a message.
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct HdrFlags: u16 {
        const FROM        = 1;
        const TO          = 1 << 1;
        const CALLID      = 1 << 2;
        const CSEQ        = 1 << 3;
        const CONTACT     = 1 << 4;
        const EXPIRES     = 1 << 5;
        const MAX_EXPIRES = 1 << 6;
        const UA          = 1 << 7;

        const REQUIRED = Self::FROM.bits()
            | Self::TO.bits()
            | Self::CALLID.bits()
            | Self::CSEQ.bits();
    }
}

/// A parsed From or To header: the address URI and its tag parameter.
#[derive(Copy, Clone, Default, Debug)]
pub struct PAddr {
    pub uri: Field,
    pub tag: Field,
}

/// A parsed CSeq header.
#[derive(Copy, Clone, Default, Debug)]
pub struct PCSeq {
    pub num: u32,
    pub method: Method,
}

/// One parsed Contact header entry.
#[derive(Copy, Clone, Default, Debug)]
pub struct PContact {
    pub uri: Field,
    /// Value of the per-contact `expires` parameter; meaningful only
    /// when `has_expires` is set.
    pub expires: u32,
    pub has_expires: bool,
    /// The wildcard contact `*`.
    pub star: bool,
}

/// The parsed Contact header list. `complete` is set when the parser
/// consumed every Contact header of the message, so absence of a URI
/// from `entries` is meaningful.
#[derive(Clone, Default, Debug)]
pub struct ContactList {
    pub entries: Vec<PContact>,
    pub complete: bool,
}

/// The parsed view of one observed SIP message. All Fields resolve
/// against `buf`, which the view owns. Producing this view is the
/// parser's job; the tracker only reads it.
#[derive(Clone, Default, Debug)]
pub struct SipMsg {
    pub buf: Vec<u8>,

    /// Request method, `Undef` for replies.
    pub method: Method,
    /// Request URI, empty for replies.
    pub ruri: Field,
    /// Reply status code, 0 for requests.
    pub status: u16,
    /// Reply reason phrase, empty for requests.
    pub reason: Field,

    pub hdr_flags: HdrFlags,
    pub from: PAddr,
    pub to: PAddr,
    pub callid: Field,
    pub cseq: PCSeq,
    pub expires: u32,
    pub max_expires: u32,
    pub contacts: ContactList,
    pub ua: Field,
}

impl SipMsg {
    /// True for requests, false for replies.
    #[inline]
    pub fn request(&self) -> bool {
        self.status == 0
    }

    /// The method this message is about: the request method, or for a
    /// reply the method echoed in its CSeq.
    #[inline]
    pub fn method(&self) -> Method {
        if self.request() {
            self.method
        } else {
            self.cseq.method
        }
    }

    /// True when the view is complete enough to track: fully parsed
    /// From, To, Call-ID and CSeq.
    pub fn parsed_ok(&self) -> bool {
        self.hdr_flags.contains(HdrFlags::REQUIRED) && !self.callid.is_empty()
    }

    #[inline]
    pub fn fld(&self, f: Field) -> &[u8] {
        f.get(&self.buf)
    }

    #[inline]
    pub fn from_tag(&self) -> &[u8] {
        self.from.tag.get(&self.buf)
    }

    #[inline]
    pub fn to_tag(&self) -> &[u8] {
        self.to.tag.get(&self.buf)
    }

    #[inline]
    pub fn call_id(&self) -> &[u8] {
        self.callid.get(&self.buf)
    }

    /// First contact entry, if any.
    pub fn contact0(&self) -> Option<&PContact> {
        self.contacts.entries.first()
    }
}

/// MsgBuilder assembles a SipMsg view directly, without wire syntax.
/// Parser front ends map their own representations through it, and tests
/// use it to feed the tracker hand-built messages.
#[derive(Default)]
pub struct MsgBuilder {
    msg: SipMsg,
}

impl MsgBuilder {
    pub fn request(method: Method, ruri: &[u8]) -> Self {
        let mut b = Self::default();
        b.msg.method = method;
        b.msg.ruri = b.append(ruri);
        b
    }

    pub fn reply(status: u16, reason: &[u8]) -> Self {
        let mut b = Self::default();
        b.msg.status = status;
        b.msg.reason = b.append(reason);
        b
    }

    pub fn from(mut self, uri: &[u8], tag: &[u8]) -> Self {
        self.msg.from = PAddr {
            uri: self.append(uri),
            tag: self.append(tag),
        };
        self.msg.hdr_flags |= HdrFlags::FROM;
        self
    }

    pub fn to(mut self, uri: &[u8], tag: &[u8]) -> Self {
        self.msg.to = PAddr {
            uri: self.append(uri),
            tag: self.append(tag),
        };
        self.msg.hdr_flags |= HdrFlags::TO;
        self
    }

    pub fn call_id(mut self, callid: &[u8]) -> Self {
        self.msg.callid = self.append(callid);
        self.msg.hdr_flags |= HdrFlags::CALLID;
        self
    }

    pub fn cseq(mut self, num: u32, method: Method) -> Self {
        self.msg.cseq = PCSeq { num, method };
        self.msg.hdr_flags |= HdrFlags::CSEQ;
        self
    }

    pub fn contact(mut self, uri: &[u8]) -> Self {
        let star = uri == b"*";
        let entry = PContact {
            uri: self.append(uri),
            expires: 0,
            has_expires: false,
            star,
        };
        self.msg.contacts.entries.push(entry);
        self.msg.contacts.complete = true;
        self.msg.hdr_flags |= HdrFlags::CONTACT;
        self
    }

    pub fn contact_expires(mut self, uri: &[u8], expires: u32) -> Self {
        self = self.contact(uri);
        let last = self.msg.contacts.entries.last_mut().unwrap();
        last.expires = expires;
        last.has_expires = true;
        self
    }

    /// Mark the contact list as known-incomplete (the parser gave up on
    /// a later Contact header).
    pub fn contacts_incomplete(mut self) -> Self {
        self.msg.contacts.complete = false;
        self
    }

    pub fn expires(mut self, secs: u32) -> Self {
        self.msg.expires = secs;
        self.msg.hdr_flags |= HdrFlags::EXPIRES;
        self
    }

    pub fn max_expires(mut self, secs: u32) -> Self {
        self.msg.max_expires = secs;
        self.msg.hdr_flags |= HdrFlags::MAX_EXPIRES;
        self
    }

    pub fn ua(mut self, agent: &[u8]) -> Self {
        self.msg.ua = self.append(agent);
        self.msg.hdr_flags |= HdrFlags::UA;
        self
    }

    pub fn build(self) -> SipMsg {
        self.msg
    }

    fn append(&mut self, value: &[u8]) -> Field {
        let offs = self.msg.buf.len() as u32;
        self.msg.buf.extend_from_slice(value);
        Field::new(offs, value.len() as u32)
    }
}
