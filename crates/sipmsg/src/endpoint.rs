use std::net::{IpAddr, Ipv4Addr};

bitflags::bitflags! {
    /// Transport protocol flags observed for an endpoint. A capture front
    /// end may see the same dialog over more than one transport, so this
    /// is a set rather than an enum. `IPV6` marks the address family on
    /// the wire independently of the address representation.
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct Proto: u8 {
        const UDP  = 1;
        const TCP  = 1 << 1;
        const SCTP = 1 << 2;
        const TLS  = 1 << 3;
        const DTLS = 1 << 4;
        const IPV6 = 1 << 5;
    }
}

/// One observed network endpoint: address, port and transport flags.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct EndPoint {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: Proto,
}

impl Default for EndPoint {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            proto: Proto::UDP,
        }
    }
}

impl EndPoint {
    pub fn new(addr: IpAddr, port: u16, proto: Proto) -> Self {
        let proto = if addr.is_ipv6() {
            proto | Proto::IPV6
        } else {
            proto
        };
        Self { addr, port, proto }
    }
}

impl std::fmt::Display for EndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port),
        }
    }
}

/// The (source, destination) pair a message was observed on.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct NetPair {
    pub src: EndPoint,
    pub dst: EndPoint,
}

impl NetPair {
    pub fn new(src: EndPoint, dst: EndPoint) -> Self {
        Self { src, dst }
    }

    /// The same pair as seen from the other direction. Entries store
    /// endpoints in the dialog-creating direction, so a dialog created
    /// by a reply stores the reversed pair.
    pub fn reversed(&self) -> NetPair {
        NetPair {
            src: self.dst,
            dst: self.src,
        }
    }
}
