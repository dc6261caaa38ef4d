//! Network endpoint model: IP addresses and host/port pairs.
//!
//! [`IpAddress`] stores every address as 16 bytes in network order, encoding
//! IPv4 in the v4-mapped-IPv6 form. [`HostPort`] carries an optional host
//! name, IP, port, and IPv6 scope id, and converts to and from the textual
//! and `sockaddr` representations used across the runtime.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Byte offset of the IPv4 address inside the v4-mapped form.
const IPV4_INDEX: usize = 12;

/// An IPv4 or IPv6 address as a fixed 16-byte array in network order.
///
/// IPv4 addresses use the v4-mapped encoding: ten zero bytes, `0xff 0xff`,
/// then the four address bytes. Equality, ordering, and hashing operate on
/// the full 16 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpAddress([u8; 16]);

impl IpAddress {
    /// 127.0.0.1 in v4-mapped form.
    pub const IPV4_LOCALHOST: IpAddress =
        IpAddress([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 127, 0, 0, 1]);
    /// ::1.
    pub const IPV6_LOCALHOST: IpAddress =
        IpAddress([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Builds an IPv4 address from a host-byte-order u32.
    pub fn from_ipv4(addr: u32) -> IpAddress {
        let b = addr.to_be_bytes();
        let mut octets = [0u8; 16];
        octets[10] = 0xff;
        octets[11] = 0xff;
        octets[IPV4_INDEX..].copy_from_slice(&b);
        IpAddress(octets)
    }

    pub fn from_octets(octets: [u8; 16]) -> IpAddress {
        IpAddress(octets)
    }

    pub fn octets(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_ipv4(&self) -> bool {
        const V4_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];
        self.0[..IPV4_INDEX] == V4_PREFIX
    }

    pub fn is_ipv6(&self) -> bool {
        !self.is_ipv4()
    }

    /// True for link-local addresses: 169.254.0.0/16 or fe80::/64.
    pub fn is_local_link(&self) -> bool {
        const V4_LOCAL: [u8; 14] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 169, 254];
        const V6_LOCAL: [u8; 8] = [0xfe, 0x80, 0, 0, 0, 0, 0, 0];
        self.0[..14] == V4_LOCAL || self.0[..8] == V6_LOCAL
    }

    /// The IPv4 part in host byte order. Meaningful only when `is_ipv4()`.
    pub fn ipv4(&self) -> u32 {
        u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]])
    }

    /// Fills in the family and address bytes of `addr`, leaving the port
    /// field untouched.
    pub fn to_sockaddr(&self, addr: &mut libc::sockaddr_storage) {
        if self.is_ipv4() {
            let sin = unsafe { &mut *(addr as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr.s_addr = u32::from_ne_bytes([self.0[12], self.0[13], self.0[14], self.0[15]]);
        } else {
            let sin6 = unsafe { &mut *(addr as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_addr.s6_addr = self.0;
        }
    }

    /// Extracts the address from a socket address structure. The family must
    /// be `AF_INET` or `AF_INET6` and `len` must cover the matching struct.
    pub fn from_sockaddr(addr: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<IpAddress> {
        match addr.ss_family as libc::c_int {
            libc::AF_INET => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return Err(Error::invalid_argument(
                        "sockaddr buffer too small for an IPv4 address",
                    ));
                }
                let sin = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
                Ok(IpAddress::from_ipv4(u32::from_be(sin.sin_addr.s_addr)))
            }
            libc::AF_INET6 => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(Error::invalid_argument(
                        "sockaddr buffer too small for an IPv6 address",
                    ));
                }
                let sin6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
                Ok(IpAddress(sin6.sin6_addr.s6_addr))
            }
            family => Err(Error::invalid_argument(format!(
                "sockaddr family {family} is neither AF_INET nor AF_INET6"
            ))),
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> IpAddress {
        IpAddress::from_ipv4(u32::from(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> IpAddress {
        IpAddress(addr.octets())
    }
}

impl FromStr for IpAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<IpAddress> {
        if s.is_empty() {
            return Err(Error::invalid_argument("empty IP address string"));
        }
        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(v4.into());
        }
        if let Ok(v6) = s.parse::<Ipv6Addr>() {
            return Ok(v6.into());
        }
        Err(Error::invalid_argument(format!(
            "`{s}` parses neither as IPv4 nor as IPv6"
        )))
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv4() {
            let b = &self.0[IPV4_INDEX..];
            Ipv4Addr::new(b[0], b[1], b[2], b[3]).fmt(f)
        } else {
            Ipv6Addr::from(self.0).fmt(f)
        }
    }
}

/// The byte length of the sockaddr struct matching a storage's family.
pub(crate) fn sockaddr_len(addr: &libc::sockaddr_storage) -> libc::socklen_t {
    if addr.ss_family as libc::c_int == libc::AF_INET {
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
    } else {
        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
    }
}

/// A network endpoint: optional host name, IP, port, and IPv6 scope id.
///
/// `is_valid()` means a non-zero port plus a host or an IP; `is_resolved()`
/// means a non-zero port plus an IP, i.e. the endpoint can be connected to
/// without a DNS step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPort {
    host: Option<String>,
    ip: Option<IpAddress>,
    port: Option<u16>,
    scope_id: Option<u32>,
}

impl HostPort {
    pub fn new() -> HostPort {
        HostPort::default()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
    pub fn ip(&self) -> Option<IpAddress> {
        self.ip
    }
    pub fn port(&self) -> Option<u16> {
        self.port
    }
    pub fn scope_id(&self) -> Option<u32> {
        self.scope_id
    }

    pub fn set_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
    pub fn set_ip(mut self, ip: IpAddress) -> Self {
        self.ip = Some(ip);
        self
    }
    pub fn set_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
    pub fn set_scope_id(mut self, scope_id: u32) -> Self {
        self.scope_id = Some(scope_id);
        self
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.port, Some(p) if p != 0) && (self.ip.is_some() || self.host.is_some())
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.port, Some(p) if p != 0) && self.ip.is_some()
    }

    /// Merges the fields set in `other` into this hostport.
    pub fn update(&mut self, other: &HostPort) {
        if let Some(host) = &other.host {
            self.host = Some(host.clone());
        }
        if let Some(ip) = other.ip {
            self.ip = Some(ip);
        }
        if let Some(port) = other.port {
            self.port = Some(port);
        }
        if let Some(scope_id) = other.scope_id {
            self.scope_id = Some(scope_id);
        }
    }

    pub(crate) fn update_ip(&mut self, ip: IpAddress) {
        self.ip = Some(ip);
    }

    /// The best representation for network use: `ip:port` when the IP is
    /// known (bracketing IPv6), else `host:port`. Fails if the port, or both
    /// the IP and the host, are missing.
    pub fn to_hostport_string(&self) -> Result<String> {
        let mut result = String::new();
        if let Some(ip) = self.ip {
            if ip.is_ipv6() {
                result = format!("[{ip}]");
            } else {
                result = ip.to_string();
            }
        } else if let Some(host) = &self.host {
            result.push_str(host);
        } else {
            return Err(Error::failed_precondition(
                "hostport has no host or ip specified",
            ));
        }
        match self.port {
            Some(port) => {
                result.push(':');
                result.push_str(&port.to_string());
                Ok(result)
            }
            None => Err(Error::failed_precondition("hostport has no port specified")),
        }
    }

    /// Builds a `sockaddr_storage` with the address, port, and scope id.
    /// Requires an IP and a port (a zero port is allowed so listeners can
    /// ask the system for an ephemeral port).
    pub fn to_sockaddr(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let (Some(ip), Some(port)) = (self.ip, self.port) else {
            return Err(Error::failed_precondition(
                "hostport is not resolved for sockaddr conversion",
            ));
        };
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        ip.to_sockaddr(&mut addr);
        if addr.ss_family as libc::c_int == libc::AF_INET6 {
            let sin6 = unsafe { &mut *(&mut addr as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_port = port.to_be();
            if let Some(scope_id) = self.scope_id {
                sin6.sin6_scope_id = scope_id.to_be();
            }
        } else {
            let sin = unsafe { &mut *(&mut addr as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_port = port.to_be();
        }
        let len = sockaddr_len(&addr);
        Ok((addr, len))
    }

    /// Extracts ip / port / scope id from a socket address structure.
    pub fn from_sockaddr(addr: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<HostPort> {
        let ip = IpAddress::from_sockaddr(addr, len)?;
        let mut hp = HostPort::new().set_ip(ip);
        if addr.ss_family as libc::c_int == libc::AF_INET {
            let sin = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            hp = hp.set_port(u16::from_be(sin.sin_port));
        } else {
            let sin6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            hp = hp.set_port(u16::from_be(sin6.sin6_port));
            if sin6.sin6_scope_id != 0 {
                hp = hp.set_scope_id(u32::from_be(sin6.sin6_scope_id));
            }
        }
        Ok(hp)
    }
}

impl FromStr for HostPort {
    type Err = Error;

    /// Parses `<host|ip>[:port]`. An empty string yields an empty hostport.
    /// `[addr]` is a pure IPv6 literal; otherwise the string is split on the
    /// last colon unless it ends in `]`. A bare IPv6 literal carrying a port
    /// without brackets is rejected, as are ports outside 1..=65535.
    fn from_str(s: &str) -> Result<HostPort> {
        if s.is_empty() {
            return Ok(HostPort::new());
        }
        let mut result = HostPort::new();
        let split = if s.ends_with(']') { None } else { s.rfind(':') };
        let host = &s[..split.unwrap_or(s.len())];
        let ip_host = if host.starts_with('[') && host.ends_with(']') {
            &host[1..host.len() - 1]
        } else {
            host
        };
        match ip_host.parse::<IpAddress>() {
            Ok(ip) => {
                if ip.is_ipv6() && ip_host == host && split.is_some() {
                    return Err(Error::invalid_argument(format!(
                        "an IPv6 hostport needs the [ip]:port form: `{s}`"
                    )));
                }
                result = result.set_ip(ip);
            }
            Err(_) => {
                result = result.set_host(host);
            }
        }
        if let Some(pos) = split {
            let port: u32 = s[pos + 1..]
                .parse()
                .map_err(|_| Error::invalid_argument(format!("cannot parse port in `{s}`")))?;
            if port == 0 || port > u16::MAX as u32 {
                return Err(Error::invalid_argument(format!(
                    "hostport port out of range: {port}"
                )));
            }
            result = result.set_port(port as u16);
        }
        Ok(result)
    }
}

impl fmt::Display for HostPort {
    /// Canonical form: the host, then the IP (bracketed when a host is also
    /// present or the IP is IPv6), then `:port`. An empty hostport prints
    /// as `[]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = String::new();
        if let Some(host) = &self.host {
            result.push_str(host);
        }
        if let Some(ip) = self.ip {
            let brackets = !result.is_empty() || ip.is_ipv6();
            if brackets {
                result.push('[');
            }
            result.push_str(&ip.to_string());
            if brackets {
                result.push(']');
            }
        }
        if let Some(port) = self.port {
            result.push(':');
            result.push_str(&port.to_string());
        }
        if result.is_empty() {
            result.push_str("[]");
        }
        f.write_str(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_mapped_form() {
        let ip: IpAddress = "127.0.0.1".parse().unwrap();
        assert!(ip.is_ipv4());
        assert!(!ip.is_ipv6());
        assert_eq!(ip, IpAddress::IPV4_LOCALHOST);
        assert_eq!(ip.ipv4(), 0x7f000001);
        assert_eq!(ip.to_string(), "127.0.0.1");
    }

    #[test]
    fn ipv6_parse_roundtrip() {
        for s in ["::1", "2001:db8::1", "fe80::dead:beef"] {
            let ip: IpAddress = s.parse().unwrap();
            assert!(ip.is_ipv6());
            assert_eq!(ip.to_string().parse::<IpAddress>().unwrap(), ip);
        }
        assert_eq!("::1".parse::<IpAddress>().unwrap(), IpAddress::IPV6_LOCALHOST);
    }

    #[test]
    fn v4_roundtrip_through_text() {
        for s in ["0.0.0.0", "10.1.2.3", "255.255.255.255"] {
            let ip: IpAddress = s.parse().unwrap();
            assert!(ip.is_ipv4());
            assert_eq!(ip.to_string(), s);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<IpAddress>().is_err());
        assert!("hostname".parse::<IpAddress>().is_err());
        assert!("300.1.2.3".parse::<IpAddress>().is_err());
    }

    #[test]
    fn local_link() {
        assert!("169.254.3.4".parse::<IpAddress>().unwrap().is_local_link());
        assert!("fe80::1".parse::<IpAddress>().unwrap().is_local_link());
        assert!(!"10.0.0.1".parse::<IpAddress>().unwrap().is_local_link());
        assert!(!"2001:db8::1".parse::<IpAddress>().unwrap().is_local_link());
    }

    #[test]
    fn sockaddr_roundtrip() {
        for s in ["192.168.1.7", "2001:db8::42"] {
            let ip: IpAddress = s.parse().unwrap();
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            ip.to_sockaddr(&mut addr);
            let len = sockaddr_len(&addr);
            assert_eq!(IpAddress::from_sockaddr(&addr, len).unwrap(), ip);
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a: IpAddress = "10.0.0.1".parse().unwrap();
        let b: IpAddress = "10.0.0.2".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn hostport_parse_empty() {
        let hp: HostPort = "".parse().unwrap();
        assert!(hp.host().is_none() && hp.ip().is_none() && hp.port().is_none());
    }

    #[test]
    fn hostport_parse_forms() {
        let hp: HostPort = "example.com:8080".parse().unwrap();
        assert_eq!(hp.host(), Some("example.com"));
        assert_eq!(hp.port(), Some(8080));

        let hp: HostPort = "10.0.0.1:443".parse().unwrap();
        assert_eq!(hp.ip().unwrap().to_string(), "10.0.0.1");
        assert_eq!(hp.port(), Some(443));

        let hp: HostPort = "[2001:db8::1]:22".parse().unwrap();
        assert_eq!(hp.ip().unwrap().to_string(), "2001:db8::1");
        assert_eq!(hp.port(), Some(22));

        // Bracketed literal without a port: ip set, port unset.
        let hp: HostPort = "[2001:db8::1]".parse().unwrap();
        assert_eq!(hp.ip().unwrap().to_string(), "2001:db8::1");
        assert_eq!(hp.port(), None);
    }

    #[test]
    fn hostport_parse_rejections() {
        // Port zero.
        assert!("foobar:0".parse::<HostPort>().is_err());
        // Port out of range.
        assert!("foobar:70000".parse::<HostPort>().is_err());
        // IPv6 literal with a port but no brackets.
        assert!("2001:db8::1:22".parse::<HostPort>().is_err());
    }

    #[test]
    fn hostport_string_roundtrip() {
        for s in ["example.com:8080", "10.0.0.1:443", "[2001:db8::1]:22"] {
            let hp: HostPort = s.parse().unwrap();
            let text = hp.to_hostport_string().unwrap();
            let back: HostPort = text.parse().unwrap();
            assert_eq!(back.port(), hp.port(), "for {s}");
            assert_eq!(back.ip(), hp.ip(), "for {s}");
            assert_eq!(back.host(), hp.host(), "for {s}");
        }
    }

    #[test]
    fn hostport_string_requires_endpoint() {
        assert!(HostPort::new().to_hostport_string().is_err());
        assert!(HostPort::new().set_port(80).to_hostport_string().is_err());
        assert!(HostPort::new()
            .set_host("example.com")
            .to_hostport_string()
            .is_err());
    }

    #[test]
    fn hostport_display_brackets_ip_next_to_host() {
        let hp = HostPort::new()
            .set_host("localhost")
            .set_ip(IpAddress::IPV4_LOCALHOST)
            .set_port(80);
        assert_eq!(hp.to_string(), "localhost[127.0.0.1]:80");
        let hp = HostPort::new().set_ip(IpAddress::IPV6_LOCALHOST).set_port(80);
        assert_eq!(hp.to_string(), "[::1]:80");
    }

    #[test]
    fn hostport_sockaddr_roundtrip() {
        let hp: HostPort = "[2001:db8::1]:4433".parse().unwrap();
        let (addr, len) = hp.to_sockaddr().unwrap();
        let back = HostPort::from_sockaddr(&addr, len).unwrap();
        assert_eq!(back.ip(), hp.ip());
        assert_eq!(back.port(), hp.port());
    }

    #[test]
    fn hostport_update_merges() {
        let mut hp: HostPort = "example.com:80".parse().unwrap();
        hp.update(&HostPort::new().set_ip(IpAddress::IPV4_LOCALHOST));
        assert_eq!(hp.host(), Some("example.com"));
        assert_eq!(hp.ip(), Some(IpAddress::IPV4_LOCALHOST));
        assert_eq!(hp.port(), Some(80));
    }
}
