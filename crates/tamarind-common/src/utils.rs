//! Utility functions for Tamarind
//!
//! Node path validation, resource-to-path mapping, and endpoint parsing.

use std::fmt;
use std::str::FromStr;

use crate::error::KeeperError;

/// Port used when an endpoint omits one
pub const DEFAULT_PORT: u16 = 2181;

/// Validate an absolute node path.
///
/// Paths start with `/`, have no empty, `.` or `..` segments, no trailing
/// slash (except the root itself) and no NUL characters.
///
/// # Examples
///
/// ```
/// use tamarind_common::validate_path;
///
/// assert!(validate_path("/locks/product-1").is_ok());
/// assert!(validate_path("locks").is_err());
/// assert!(validate_path("/locks/").is_err());
/// ```
pub fn validate_path(path: &str) -> Result<(), KeeperError> {
    let invalid = || KeeperError::InvalidPath(path.to_string());

    if !path.starts_with('/') || path.contains('\0') {
        return Err(invalid());
    }
    if path == "/" {
        return Ok(());
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Parent of an absolute path, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a parent path and a single child segment.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Encode an arbitrary resource identifier as one path segment.
///
/// Alphanumerics, `-`, `_` and `.` pass through; every other byte is
/// percent-encoded, `%` included, so distinct identifiers never collide.
pub fn escape_segment(resource: &str) -> String {
    let mut out = String::with_capacity(resource.len());
    for byte in resource.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    if out == "." || out == ".." {
        out = out.replace('.', "%2E");
    }
    out
}

/// Map a resource identifier to its node path under `root`.
///
/// An identifier that already starts with `/` names the node path
/// directly; anything else becomes one escaped segment under `root`.
///
/// # Examples
///
/// ```
/// use tamarind_common::resource_path;
///
/// assert_eq!(resource_path("/locks", "product-42").unwrap(), "/locks/product-42");
/// assert_eq!(resource_path("/locks", "a/b").unwrap(), "/locks/a%2Fb");
/// assert_eq!(resource_path("/locks", "/taskid-list-lock").unwrap(), "/taskid-list-lock");
/// ```
pub fn resource_path(root: &str, resource: &str) -> Result<String, KeeperError> {
    if resource.is_empty() {
        return Err(KeeperError::BadArguments(
            "resource identifier must not be empty".to_string(),
        ));
    }
    if resource.starts_with('/') {
        validate_path(resource)?;
        return Ok(resource.to_string());
    }
    validate_path(root)?;
    Ok(join_path(root, &escape_segment(resource)))
}

/// A single `host:port` ensemble endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address string suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl FromStr for Endpoint {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || KeeperError::BadArguments(format!("invalid endpoint: '{}'", s));

        if raw.is_empty() || raw.contains('/') {
            return Err(invalid());
        }

        // Bracketed IPv6: [::1]:2181
        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(Endpoint::new(host, port));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() || host.contains(':') {
                    return Err(invalid());
                }
                let port: u16 = port.parse().map_err(|_| invalid())?;
                if port == 0 {
                    return Err(invalid());
                }
                Ok(Endpoint::new(host, port))
            }
            None => Ok(Endpoint::new(raw, DEFAULT_PORT)),
        }
    }
}

/// Parse an ordered endpoint list.
///
/// Each item may itself be a comma-separated connect string, so both
/// `["h1:2181", "h2:2181"]` and `["h1:2181,h2:2181"]` are accepted.
pub fn parse_endpoints<S: AsRef<str>>(items: &[S]) -> Result<Vec<Endpoint>, KeeperError> {
    let mut endpoints = Vec::new();
    for item in items {
        for part in item.as_ref().split(',') {
            if part.trim().is_empty() {
                continue;
            }
            endpoints.push(part.parse()?);
        }
    }
    if endpoints.is_empty() {
        return Err(KeeperError::BadArguments(
            "endpoint list is empty".to_string(),
        ));
    }
    Ok(endpoints)
}
