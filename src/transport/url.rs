// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Endpoint URL handling.
//!
//! The fabric accepts `tcp://host:port`, `udp://host:port` and
//! `http://host:port` endpoint URLs; the naming layer additionally
//! understands the pseudo-scheme `broadcast://channel_name`, which routes
//! a call through the broadcast path instead of a direct transport.

use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use url::Url;

use crate::error::MsgError;

/// Characters escaped when URL lists travel inside coordination-store
/// node values. Comma must be escaped because it is the list separator.
const VALUE_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b',')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// Wire transports plus the broadcast pseudo-scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Udp,
    Http,
    Broadcast,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
            Scheme::Http => "http",
            Scheme::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `scheme://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses an endpoint URL. `broadcast://name` keeps the channel name
    /// in `host` with port 0.
    pub fn parse(raw: &str) -> Result<Self, MsgError> {
        let parsed = Url::parse(raw).map_err(|_| MsgError::InvalidParam)?;
        let scheme = match parsed.scheme() {
            "tcp" => Scheme::Tcp,
            "udp" => Scheme::Udp,
            "http" => Scheme::Http,
            "broadcast" => Scheme::Broadcast,
            _ => return Err(MsgError::Unsupport),
        };
        let host = parsed
            .host_str()
            .ok_or(MsgError::InvalidParam)?
            .to_string();
        if scheme == Scheme::Broadcast {
            return Ok(Self { scheme, host, port: 0 });
        }
        let port = parsed
            .port_or_known_default()
            .ok_or(MsgError::InvalidParam)?;
        Ok(Self { scheme, host, port })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Percent-encodes one URL for inclusion in a comma-separated node value.
pub fn encode_url_value(s: &str) -> String {
    utf8_percent_encode(s, VALUE_ESCAPES).to_string()
}

/// Inverse of [`encode_url_value`].
pub fn decode_url_value(s: &str) -> Result<String, MsgError> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|_| MsgError::RecvInvalidData)
}

/// Joins URLs into a store node value.
pub fn join_url_list(urls: &[String]) -> String {
    urls.iter()
        .map(|u| encode_url_value(u))
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a store node value back into URLs. Empty segments are skipped.
pub fn split_url_list(value: &str) -> Result<Vec<String>, MsgError> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(decode_url_value)
        .collect()
}
