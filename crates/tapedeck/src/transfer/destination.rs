//! `user@host[:port]:/path` destination specs.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid destination {spec:?}: {reason}")]
pub struct DestinationError {
    pub spec: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Destination {
    pub fn parse(spec: &str) -> Result<Self, DestinationError> {
        let fail = |reason| DestinationError {
            spec: spec.to_string(),
            reason,
        };

        let (user, rest) = spec.split_once('@').ok_or_else(|| fail("missing user@"))?;
        if user.is_empty() {
            return Err(fail("empty user"));
        }

        let (host_part, path) = rest.rsplit_once(':').ok_or_else(|| fail("missing :path"))?;
        if path.is_empty() {
            return Err(fail("empty path"));
        }

        // host:port only when the suffix is numeric; otherwise it is all host
        let (host, port) = match host_part.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                let port: u16 = port.parse().map_err(|_| fail("port out of range"))?;
                (host, port)
            }
            _ => (host_part, DEFAULT_SSH_PORT),
        };
        if host.is_empty() {
            return Err(fail("empty host"));
        }
        if port == 0 {
            return Err(fail("port out of range"));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Remote path for `local`; a trailing `/` means "into this directory".
    pub fn remote_path_for(&self, local: &Path) -> String {
        if self.path.ends_with('/') {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}{}", self.path, name)
        } else {
            self.path.clone()
        }
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_SSH_PORT {
            write!(f, "{}@{}:{}", self.user, self.host, self.path)
        } else {
            write!(f, "{}@{}:{}:{}", self.user, self.host, self.port, self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_port() {
        let d = Destination::parse("rec@files.example:/srv/shows/").unwrap();
        assert_eq!(d.user, "rec");
        assert_eq!(d.host, "files.example");
        assert_eq!(d.port, 22);
        assert_eq!(d.path, "/srv/shows/");
    }

    #[test]
    fn test_parse_explicit_port() {
        let d = Destination::parse("rec@10.0.0.5:2222:/in/show.mp3").unwrap();
        assert_eq!(d.host, "10.0.0.5");
        assert_eq!(d.port, 2222);
        assert_eq!(d.path, "/in/show.mp3");
        assert_eq!(d.to_string(), "rec@10.0.0.5:2222:/in/show.mp3");
    }

    #[test]
    fn test_non_numeric_port_is_part_of_host() {
        let d = Destination::parse("rec@odd:name:/in").unwrap();
        assert_eq!(d.host, "odd:name");
        assert_eq!(d.port, 22);
    }

    #[test]
    fn test_malformed() {
        for spec in [
            "files.example:/srv",
            "@host:/srv",
            "rec@host",
            "rec@host:",
            "rec@:/srv",
            "rec@host:99999:/srv",
            "rec@host:0:/srv",
        ] {
            assert!(Destination::parse(spec).is_err(), "{} should be rejected", spec);
        }
    }

    #[test]
    fn test_trailing_slash_appends_basename() {
        let dir = Destination::parse("u@h:/srv/in/").unwrap();
        assert_eq!(dir.remote_path_for(Path::new("/rec/a.mp3")), "/srv/in/a.mp3");
        let file = Destination::parse("u@h:/srv/in/b.mp3").unwrap();
        assert_eq!(file.remote_path_for(Path::new("/rec/a.mp3")), "/srv/in/b.mp3");
    }
}
