/// SIP request methods the tracker distinguishes. Anything else parses
/// as `Other`: it still creates and matches dialogs, it just never gets
/// method-specific treatment.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Method {
    #[default]
    Undef,
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Subscribe,
    Notify,
    Update,
    Prack,
    Info,
    Refer,
    Message,
    Publish,
    Other,
}

impl Method {
    /// Map a method token to its enum value. Comparison is exact:
    /// RFC 3261 method names are case-sensitive.
    pub fn from_token(token: &[u8]) -> Method {
        match token {
            b"INVITE" => Method::Invite,
            b"ACK" => Method::Ack,
            b"BYE" => Method::Bye,
            b"CANCEL" => Method::Cancel,
            b"REGISTER" => Method::Register,
            b"OPTIONS" => Method::Options,
            b"SUBSCRIBE" => Method::Subscribe,
            b"NOTIFY" => Method::Notify,
            b"UPDATE" => Method::Update,
            b"PRACK" => Method::Prack,
            b"INFO" => Method::Info,
            b"REFER" => Method::Refer,
            b"MESSAGE" => Method::Message,
            b"PUBLISH" => Method::Publish,
            b"" => Method::Undef,
            _ => Method::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Undef => "UNDEF",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Info => "INFO",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Publish => "PUBLISH",
            Method::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod test {
    use super::Method;

    #[test]
    fn test_round_trip() {
        for m in [
            Method::Invite,
            Method::Ack,
            Method::Bye,
            Method::Cancel,
            Method::Register,
            Method::Subscribe,
            Method::Prack,
        ] {
            assert_eq!(Method::from_token(m.name().as_bytes()), m);
        }
        // Method names are case-sensitive tokens.
        assert_eq!(Method::from_token(b"invite"), Method::Other);
        assert_eq!(Method::from_token(b""), Method::Undef);
    }
}
