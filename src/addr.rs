use std::fmt;

use thiserror::Error;

/// Default port used for SSH server addresses with no explicit port.
pub const SSH_DEFAULT_PORT: u16 = 22;

#[derive(Error, Debug)]
pub enum AddrError {
    #[error("missing port in address: {0}")]
    MissingPort(String),
    #[error("invalid port number: {0}")]
    InvalidPort(String),
}

/// An unresolved TCP address: host name (or literal) plus port number.
/// Equality is by value, so endpoints can key registry maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_lowercase(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6 literals are bracketed so the port separator stays unambiguous.
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host` or `host:port` into an [`Endpoint`], applying `default_port`
/// when none is given. A `default_port` of 0 means the port is required.
/// Hosts are lowercased; an explicit port of 0 also takes the default.
pub fn parse_addr(s: &str, default_port: u16) -> Result<Endpoint, AddrError> {
    let Some((host, port_str)) = split_host_port(s) else {
        if default_port == 0 {
            return Err(AddrError::MissingPort(s.to_string()));
        }
        return Ok(Endpoint::new(s, default_port));
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| AddrError::InvalidPort(port_str.to_string()))?;
    let port = if port == 0 { default_port } else { port };
    Ok(Endpoint::new(host, port))
}

/// Parses `[user@]host[:port]` into the user (empty when absent) and the
/// SSH server endpoint, defaulting the port to 22.
pub fn parse_ssh_user_addr(s: &str) -> Result<(String, Endpoint), AddrError> {
    let (user, rest) = match s.find('@') {
        Some(i) if i > 0 => (&s[..i], &s[i + 1..]),
        _ => ("", s),
    };
    let addr = parse_addr(rest, SSH_DEFAULT_PORT)?;
    Ok((user.to_string(), addr))
}

/// Splits the trailing `:port`, honoring bracketed IPv6 hosts. Returns None
/// when there is no port part; an unbracketed multi-colon string is treated
/// as a bare IPv6 host.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }

    let i = s.rfind(':')?;
    let host = &s[..i];
    if host.contains(':') {
        return None;
    }
    Some((host, &s[i + 1..]))
}
