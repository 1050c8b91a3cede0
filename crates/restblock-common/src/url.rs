//! Object URL grammar
//!
//! Only plain HTTP with a literal dotted-quad IPv4 host is accepted:
//!
//! ```text
//! http://<a.b.c.d>[:<port>]/<path>
//! ```
//!
//! There is no name resolution, no IPv6 and no other scheme.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// URLs (and reconstructed object paths) must be shorter than this
pub const URL_MAX_LEN: usize = 1024;

const SCHEME: &str = "http://";
const MAX_HOST_LEN: usize = 15; // 255.255.255.255
const DEFAULT_PORT: u16 = 80;

/// A parsed object store URL
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectUrl {
    raw: String,
    host: Ipv4Addr,
    port: u16,
    path: String,
}

impl ObjectUrl {
    /// Parse a URL of the form `http://a.b.c.d[:port]/path`
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        if url.len() >= URL_MAX_LEN {
            return Err(UrlError::TooLong(url.len()));
        }

        let rest = url.strip_prefix(SCHEME).ok_or(UrlError::MissingScheme)?;

        // Host: digits and dots only, terminated by ':' or '/'
        let host_len = rest
            .bytes()
            .take(MAX_HOST_LEN + 1)
            .position(|c| c == b':' || c == b'/')
            .ok_or(UrlError::InvalidHost)?;
        if host_len == 0 || host_len > MAX_HOST_LEN {
            return Err(UrlError::InvalidHost);
        }
        let host_str = &rest[..host_len];
        if let Some(c) = host_str.chars().find(|c| !c.is_ascii_digit() && *c != '.') {
            return Err(UrlError::InvalidHostChar(c));
        }
        let host: Ipv4Addr = host_str.parse().map_err(|_| UrlError::InvalidHost)?;
        let mut rest = &rest[host_len..];

        // Optional port
        let mut port = DEFAULT_PORT;
        if let Some(after_colon) = rest.strip_prefix(':') {
            let digits = after_colon
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count();
            if digits == 0 {
                return Err(UrlError::InvalidPort);
            }
            port = after_colon[..digits]
                .parse()
                .map_err(|_| UrlError::InvalidPort)?;
            rest = &after_colon[digits..];
        }

        if !rest.starts_with('/') {
            return Err(UrlError::MissingPath);
        }

        Ok(Self {
            raw: url.to_string(),
            host,
            port,
            path: rest.to_string(),
        })
    }

    /// The URL exactly as it was given
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub const fn host(&self) -> Ipv4Addr {
        self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Object path, always starting with `/`
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }

    /// Last path component (the object's file name)
    #[must_use]
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Build the URL of `filename` stored under this base URL.
    ///
    /// A `/` separator is inserted only when the base does not already end
    /// with one. Both the new URL and the new path must stay shorter than
    /// [`URL_MAX_LEN`].
    pub fn reconstruct(&self, filename: &str) -> Result<Self, UrlError> {
        let (url, path) = if self.raw.ends_with('/') {
            (
                format!("{}{filename}", self.raw),
                format!("{}{filename}", self.path),
            )
        } else {
            (
                format!("{}/{filename}", self.raw),
                format!("{}/{filename}", self.path),
            )
        };

        if url.len() >= URL_MAX_LEN {
            return Err(UrlError::TooLong(url.len()));
        }
        if path.len() >= URL_MAX_LEN {
            return Err(UrlError::TooLong(path.len()));
        }

        Ok(Self {
            raw: url,
            host: self.host,
            port: self.port,
            path,
        })
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}{}", self.host, self.port, self.path)
    }
}

impl fmt::Debug for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectUrl({:?})", self.raw)
    }
}

/// Errors that can occur when parsing an object URL
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("url is too long ({0} bytes, max {max})", max = URL_MAX_LEN - 1)]
    TooLong(usize),
    #[error("only http:// urls are supported")]
    MissingScheme,
    #[error("host must be a dotted-decimal IPv4 address")]
    InvalidHost,
    #[error("host contains invalid character: {0}")]
    InvalidHostChar(char),
    #[error("port must be a decimal number below 65536")]
    InvalidPort,
    #[error("path must start with '/'")]
    MissingPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_port() {
        let url = ObjectUrl::parse("http://10.0.0.1:8080/volumes/disk0").unwrap();
        assert_eq!(url.host(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(url.port(), 8080);
        assert_eq!(url.path(), "/volumes/disk0");
        assert_eq!(url.basename(), "disk0");
        assert_eq!(url.to_string(), "http://10.0.0.1:8080/volumes/disk0");
    }

    #[test]
    fn test_parse_default_port() {
        let url = ObjectUrl::parse("http://192.168.1.20/").unwrap();
        assert_eq!(url.port(), 80);
        assert_eq!(url.path(), "/");
        assert_eq!(url.to_string(), "http://192.168.1.20:80/");
    }

    #[test]
    fn test_parse_reconstruct_roundtrip() {
        for (a, b, c, d, port) in [(127, 0, 0, 1, 1), (255, 255, 255, 255, 65535), (1, 2, 3, 4, 80)] {
            let text = format!("http://{a}.{b}.{c}.{d}:{port}/obj/x");
            let url = ObjectUrl::parse(&text).unwrap();
            assert_eq!(url.to_string(), text);
            assert_eq!(ObjectUrl::parse(&url.to_string()).unwrap(), url);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            ObjectUrl::parse("https://1.2.3.4/x"),
            Err(UrlError::MissingScheme)
        );
        assert_eq!(ObjectUrl::parse("1.2.3.4/x"), Err(UrlError::MissingScheme));
        assert_eq!(
            ObjectUrl::parse("http://1.2.3.4:abc/x"),
            Err(UrlError::InvalidPort)
        );
        assert_eq!(
            ObjectUrl::parse("http://1.2.3.4:99999/x"),
            Err(UrlError::InvalidPort)
        );
        assert_eq!(
            ObjectUrl::parse("http://1.2.3.4:80x"),
            Err(UrlError::MissingPath)
        );
        assert_eq!(
            ObjectUrl::parse("http://1.2.3.4"),
            Err(UrlError::InvalidHost)
        );
        assert_eq!(
            ObjectUrl::parse("http://host.example/x"),
            Err(UrlError::InvalidHostChar('h'))
        );
        assert_eq!(
            ObjectUrl::parse("http://1.2.3/x"),
            Err(UrlError::InvalidHost)
        );
        assert_eq!(ObjectUrl::parse("http:///x"), Err(UrlError::InvalidHost));
        assert_eq!(
            ObjectUrl::parse("http://1111.2222.3333.4444/x"),
            Err(UrlError::InvalidHost)
        );
    }

    #[test]
    fn test_parse_too_long() {
        let url = format!("http://1.2.3.4/{}", "a".repeat(URL_MAX_LEN));
        assert!(matches!(ObjectUrl::parse(&url), Err(UrlError::TooLong(_))));
    }

    #[test]
    fn test_reconstruct_inserts_separator() {
        let base = ObjectUrl::parse("http://1.2.3.4:81/vols").unwrap();
        let obj = base.reconstruct("disk0").unwrap();
        assert_eq!(obj.as_str(), "http://1.2.3.4:81/vols/disk0");
        assert_eq!(obj.path(), "/vols/disk0");

        let base = ObjectUrl::parse("http://1.2.3.4/vols/").unwrap();
        let obj = base.reconstruct("disk0").unwrap();
        assert_eq!(obj.as_str(), "http://1.2.3.4/vols/disk0");
        assert_eq!(obj.path(), "/vols/disk0");
        assert_eq!(obj.port(), 80);
    }

    #[test]
    fn test_reconstruct_too_long() {
        let base = ObjectUrl::parse("http://1.2.3.4/vols").unwrap();
        let name = "n".repeat(URL_MAX_LEN);
        assert!(matches!(base.reconstruct(&name), Err(UrlError::TooLong(_))));
    }
}
