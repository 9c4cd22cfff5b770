use std::fmt;

/// The port assumed for a proxy address that doesn't specify one.
pub const DEFAULT_PROXY_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostPortError {
    #[error("missing port in address {0}")]
    MissingPort(String),
    #[error("too many colons in address {0}")]
    TooManyColons(String),
    #[error("missing ']' in address {0}")]
    MissingBracket(String),
    #[error("unexpected '[' or ']' in address {0}")]
    UnexpectedBracket(String),
}

/// Splits a string of the form "host:port", "[host]:port" or "[ipv6%zone]:port" into its host
/// and port parts. The brackets around an IPv6 host are removed.
///
/// The port is returned as-is and may be empty or not numeric, it is up to the caller to
/// validate it.
pub fn split_host_port(s: &str) -> Result<(&str, &str), HostPortError> {
    let colon = match s.rfind(':') {
        Some(i) => i,
        None => return Err(HostPortError::MissingPort(s.to_owned())),
    };

    let (host, check_from, check_close_from) = if s.starts_with('[') {
        let end = match s.find(']') {
            Some(i) => i,
            None => return Err(HostPortError::MissingBracket(s.to_owned())),
        };

        if end + 1 == s.len() {
            return Err(HostPortError::MissingPort(s.to_owned()));
        } else if end + 1 != colon {
            return match s.as_bytes()[end + 1] {
                b':' => Err(HostPortError::TooManyColons(s.to_owned())),
                _ => Err(HostPortError::MissingPort(s.to_owned())),
            };
        }

        (&s[1..end], 1, end + 1)
    } else {
        let host = &s[..colon];
        if host.contains(':') {
            return Err(HostPortError::TooManyColons(s.to_owned()));
        }

        (host, 0, 0)
    };

    if s[check_from..].contains('[') || s[check_close_from..].contains(']') {
        return Err(HostPortError::UnexpectedBracket(s.to_owned()));
    }

    Ok((host, &s[colon + 1..]))
}

/// Joins a host and a port into "host:port", placing brackets around hosts that contain a
/// colon (IPv6 literals).
pub fn join_host_port(host: &str, port: impl fmt::Display) -> String {
    match host.contains(':') {
        true => format!("[{host}]:{port}"),
        false => format!("{host}:{port}"),
    }
}

/// Splits an address into host and a numeric port.
pub fn parse_host_port(s: &str) -> Result<(&str, u16), String> {
    let (host, port) = split_host_port(s).map_err(|e| e.to_string())?;
    match port.parse::<u16>() {
        Ok(port) => Ok((host, port)),
        Err(_) => Err(format!("invalid port {port:?}")),
    }
}

/// The identity of a proxy: the network family it's reached over, its normalized "host:port"
/// address and its bare hostname. Derived once at construction, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    network: String,
    address: String,
    hostname: String,
}

impl ProxyEndpoint {
    /// Builds an endpoint from a configured proxy address. If the address has no port,
    /// [`DEFAULT_PROXY_PORT`] is appended. An address with a port is kept unchanged.
    pub fn new(network: impl Into<String>, addr: &str) -> Self {
        let (address, hostname) = match split_host_port(addr) {
            Ok((host, _)) => (addr.to_owned(), host.to_owned()),
            Err(_) => {
                let host = addr
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .unwrap_or(addr);

                (join_host_port(host, DEFAULT_PROXY_PORT), host.to_owned())
            }
        };

        Self {
            network: network.into(),
            address,
            hostname,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.network)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("example.com:8443", "example.com", "8443")]
    #[case("127.0.0.1:80", "127.0.0.1", "80")]
    #[case("[::1]:443", "::1", "443")]
    #[case("[fe80::1%eth0]:53", "fe80::1%eth0", "53")]
    #[case("host:", "host", "")]
    #[case(":9000", "", "9000")]
    fn splits_valid_addresses(#[case] input: &str, #[case] host: &str, #[case] port: &str) {
        assert_eq!(split_host_port(input), Ok((host, port)));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(split_host_port("example.com"), Err(HostPortError::MissingPort("example.com".into())));
        assert_eq!(split_host_port("::1"), Err(HostPortError::TooManyColons("::1".into())));
        assert_eq!(split_host_port("[::1]"), Err(HostPortError::MissingPort("[::1]".into())));
        assert_eq!(split_host_port("[::1]:80:80"), Err(HostPortError::TooManyColons("[::1]:80:80".into())));
        assert_eq!(split_host_port("[::1:80"), Err(HostPortError::MissingBracket("[::1:80".into())));
        assert_eq!(split_host_port("a]b:80"), Err(HostPortError::UnexpectedBracket("a]b:80".into())));
    }

    #[test]
    fn joins_with_brackets_only_for_ipv6() {
        assert_eq!(join_host_port("example.com", 443), "example.com:443");
        assert_eq!(join_host_port("::1", "8080"), "[::1]:8080");
    }

    #[rstest]
    #[case("proxy.example.com", "proxy.example.com:443", "proxy.example.com")]
    #[case("10.0.0.1", "10.0.0.1:443", "10.0.0.1")]
    #[case("::1", "[::1]:443", "::1")]
    #[case("[2001:db8::2]", "[2001:db8::2]:443", "2001:db8::2")]
    fn appends_default_port(#[case] input: &str, #[case] address: &str, #[case] hostname: &str) {
        let endpoint = ProxyEndpoint::new("udp", input);
        assert_eq!(endpoint.address(), address);
        assert_eq!(endpoint.hostname(), hostname);
        assert_eq!(endpoint.network(), "udp");
    }

    #[rstest]
    #[case("proxy.example.com:8443", "proxy.example.com")]
    #[case("[::1]:4433", "::1")]
    #[case("1.2.3.4:443", "1.2.3.4")]
    fn keeps_explicit_port(#[case] input: &str, #[case] hostname: &str) {
        let endpoint = ProxyEndpoint::new("udp", input);
        assert_eq!(endpoint.address(), input);
        assert_eq!(endpoint.hostname(), hostname);
    }

    #[test]
    fn parses_numeric_ports_only() {
        assert_eq!(parse_host_port("example.com:443"), Ok(("example.com", 443)));
        assert!(parse_host_port("example.com:https").is_err());
        assert!(parse_host_port("example.com:70000").is_err());
        assert!(parse_host_port("example.com").is_err());
    }
}
