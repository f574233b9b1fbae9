// The parsed-message contract between a SIP parser front end and the
// dialog-tracking engine. Nothing here parses SIP wire syntax beyond the
// URI short form needed for registration contact matching: a parser fills
// in a SipMsg view and the engine consumes it.

mod field;
pub use field::Field;

mod method;
pub use method::Method;

mod msg;
pub use msg::{ContactList, HdrFlags, MsgBuilder, PAddr, PCSeq, PContact, SipMsg};

mod endpoint;
pub use endpoint::{EndPoint, NetPair, Proto};

mod uri;
pub use uri::{parse_uri_short, uri_short_cmp, Scheme, UriShort};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("URI has no scheme delimiter")]
    NoScheme,
    #[error("URI host part is empty")]
    EmptyHost,
    #[error("URI port is not a number")]
    BadPort,
}
