use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Where a bus stream lives.
///
/// Parsed from `unix:/path/to.sock`, `tcp:host:port`, or a bare path (unix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at a filesystem path.
    Unix(PathBuf),
    /// TCP `host:port`, typically a serial-to-network bridge.
    Tcp(String),
}

impl Endpoint {
    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Endpoint::Unix(_) => "unix-domain-socket",
            Endpoint::Tcp(_) => "tcp",
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        if let Some(addr) = s.strip_prefix("tcp:") {
            let valid = addr
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }

        if s.contains("://") {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        Ok(Endpoint::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_prefix_and_bare_path() {
        assert_eq!(
            "unix:/tmp/bus.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/bus.sock"))
        );
        assert_eq!(
            "/tmp/bus.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/bus.sock"))
        );
    }

    #[test]
    fn parses_tcp() {
        assert_eq!(
            "tcp:127.0.0.1:4000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:4000".to_string())
        );
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
        assert!("tcp:localhost".parse::<Endpoint>().is_err());
        assert!("tcp::99".parse::<Endpoint>().is_err());
        assert!("serial://ttyUSB0".parse::<Endpoint>().is_err());
    }

    #[test]
    fn display_roundtrips() {
        for text in ["unix:/tmp/a.sock", "tcp:localhost:7000"] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }
}
