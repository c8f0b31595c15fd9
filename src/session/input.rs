use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::SessionError;

/// Transport protocol of a session input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Srt,
    Rtmp,
    Udp,
    Hls,
    Rtsp,
    /// Resolve from the URL scheme.
    Auto,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Rtmp => "rtmp",
            Self::Udp => "udp",
            Self::Hls => "hls",
            Self::Rtsp => "rtsp",
            Self::Auto => "auto",
        }
    }

    /// Map a URL scheme to a concrete protocol.
    ///
    /// Resolution is purely scheme based; anything not in the table is
    /// rejected instead of guessed.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "srt" => Some(Self::Srt),
            "rtmp" | "rtmps" => Some(Self::Rtmp),
            "udp" | "rtp" => Some(Self::Udp),
            "http" | "https" => Some(Self::Hls),
            "rtsp" | "rtsps" => Some(Self::Rtsp),
            _ => None,
        }
    }

    /// Scheme used when a bare `host:port` is given with a declared protocol.
    fn default_scheme(&self) -> Option<&'static str> {
        match self {
            Self::Srt => Some("srt"),
            Self::Rtmp => Some("rtmp"),
            Self::Udp => Some("udp"),
            Self::Hls => Some("http"),
            Self::Rtsp => Some("rtsp"),
            Self::Auto => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "srt" => Ok(Self::Srt),
            "rtmp" => Ok(Self::Rtmp),
            "udp" => Ok(Self::Udp),
            "hls" => Ok(Self::Hls),
            "rtsp" => Ok(Self::Rtsp),
            "auto" | "" => Ok(Self::Auto),
            other => Err(SessionError::InvalidInput(format!(
                "unknown protocol '{}'",
                other
            ))),
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Auto
    }
}

/// Input descriptor of a session. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInput {
    pub url: String,
    pub declared_protocol: Protocol,
}

/// An input whose URL has been normalized and protocol resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub url: String,
    pub protocol: Protocol,
}

impl StreamInput {
    pub fn new(url: impl Into<String>, declared_protocol: Protocol) -> Self {
        Self {
            url: url.into(),
            declared_protocol,
        }
    }

    pub fn auto(url: impl Into<String>) -> Self {
        Self::new(url, Protocol::Auto)
    }

    /// Normalize the URL and resolve the concrete protocol.
    ///
    /// Errors:
    /// - `InvalidInput` for an empty or malformed URL, or a declared protocol
    ///   that contradicts the URL scheme.
    /// - `UnsupportedProtocol` when the scheme is not in the table.
    pub fn resolve(&self) -> Result<ResolvedInput, SessionError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(SessionError::InvalidInput("URL is empty".to_string()));
        }

        let url = match (raw.contains("://"), self.declared_protocol.default_scheme()) {
            (true, _) => raw.to_string(),
            (false, Some(scheme)) => format!("{}://{}", scheme, raw),
            (false, None) => {
                return Err(SessionError::UnsupportedProtocol(format!(
                    "no scheme in '{}'",
                    raw
                )))
            }
        };

        let parsed = Url::parse(&url)
            .map_err(|e| SessionError::InvalidInput(format!("malformed URL '{}': {}", raw, e)))?;

        let from_scheme = Protocol::from_scheme(parsed.scheme())
            .ok_or_else(|| SessionError::UnsupportedProtocol(parsed.scheme().to_string()))?;

        // SRT and UDP may run in listener mode with no remote host.
        let listener_capable = matches!(from_scheme, Protocol::Srt | Protocol::Udp);
        if !listener_capable && parsed.host_str().map_or(true, str::is_empty) {
            return Err(SessionError::InvalidInput(format!(
                "URL '{}' has no host",
                raw
            )));
        }

        match self.declared_protocol {
            Protocol::Auto => {}
            declared if declared != from_scheme => {
                return Err(SessionError::InvalidInput(format!(
                    "declared protocol {} does not match URL scheme '{}'",
                    declared,
                    parsed.scheme()
                )));
            }
            _ => {}
        }

        Ok(ResolvedInput {
            url,
            protocol: from_scheme,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_resolves_from_scheme() {
        let cases = [
            ("srt://host:1234", Protocol::Srt),
            ("rtmp://live.example.com/app/key", Protocol::Rtmp),
            ("RTMPS://live.example.com/app", Protocol::Rtmp),
            ("udp://239.0.0.1:5000", Protocol::Udp),
            ("https://cdn.example.com/live/index.m3u8", Protocol::Hls),
            ("rtsp://camera.local:554/stream1", Protocol::Rtsp),
        ];

        for (url, expected) in cases {
            let resolved = StreamInput::auto(url).resolve().unwrap();
            assert_eq!(resolved.protocol, expected, "{}", url);
        }
    }

    #[test]
    fn test_unknown_scheme_is_unsupported() {
        let err = StreamInput::auto("ftp://host/file.ts").resolve().unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedProtocol(_)));
    }

    #[test]
    fn test_bare_host_without_declared_protocol_is_unsupported() {
        let err = StreamInput::auto("host:1234").resolve().unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedProtocol(_)));
    }

    #[test]
    fn test_declared_protocol_prefixes_bare_host() {
        let resolved = StreamInput::new("host:1234", Protocol::Srt).resolve().unwrap();
        assert_eq!(resolved.url, "srt://host:1234");
        assert_eq!(resolved.protocol, Protocol::Srt);
    }

    #[test]
    fn test_declared_protocol_conflicting_with_scheme() {
        let err = StreamInput::new("rtmp://host/app", Protocol::Srt)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_url_is_invalid() {
        let err = StreamInput::auto("   ").resolve().unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
    }

    #[test]
    fn test_protocol_from_str_case_insensitive() {
        assert_eq!("SRT".parse::<Protocol>().unwrap(), Protocol::Srt);
        assert_eq!("Auto".parse::<Protocol>().unwrap(), Protocol::Auto);
        assert!("carrier-pigeon".parse::<Protocol>().is_err());
    }
}
