//! Request context construction.
//!
//! The context is the read-only record handed to the application for a
//! single request. Variable names mostly follow the CGI conventions of
//! RFC 3875; the TLS variables follow the names used by other Gemini
//! servers.

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::tls::{inspect_certificate, CertificateError, TlsSession};

/// Context variable names.
pub mod keys {
    pub const GEMINI_URL: &str = "GEMINI_URL";
    pub const HOSTNAME: &str = "HOSTNAME";
    pub const PATH_INFO: &str = "PATH_INFO";
    pub const QUERY_STRING: &str = "QUERY_STRING";
    pub const REMOTE_ADDR: &str = "REMOTE_ADDR";
    pub const REMOTE_HOST: &str = "REMOTE_HOST";
    pub const SERVER_NAME: &str = "SERVER_NAME";
    pub const SERVER_PORT: &str = "SERVER_PORT";
    pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
    pub const SERVER_SOFTWARE: &str = "SERVER_SOFTWARE";

    /// Keys present on every request.
    pub const SERVER: [&str; 10] = [
        GEMINI_URL,
        HOSTNAME,
        PATH_INFO,
        QUERY_STRING,
        REMOTE_ADDR,
        REMOTE_HOST,
        SERVER_NAME,
        SERVER_PORT,
        SERVER_PROTOCOL,
        SERVER_SOFTWARE,
    ];

    pub const AUTH_TYPE: &str = "AUTH_TYPE";
    pub const REMOTE_USER: &str = "REMOTE_USER";
    pub const TLS_CLIENT_HASH: &str = "TLS_CLIENT_HASH";
    pub const TLS_CLIENT_NOT_BEFORE: &str = "TLS_CLIENT_NOT_BEFORE";
    pub const TLS_CLIENT_NOT_AFTER: &str = "TLS_CLIENT_NOT_AFTER";
    pub const TLS_CLIENT_SERIAL_NUMBER: &str = "TLS_CLIENT_SERIAL_NUMBER";
    pub const TLS_CLIENT_VERIFIED: &str = "TLS_CLIENT_VERIFIED";
    pub const TLS_CIPHER: &str = "TLS_CIPHER";
    pub const TLS_VERSION: &str = "TLS_VERSION";

    /// Keys present only when the client presented a certificate.
    pub const IDENTITY: [&str; 9] = [
        AUTH_TYPE,
        REMOTE_USER,
        TLS_CLIENT_HASH,
        TLS_CLIENT_NOT_BEFORE,
        TLS_CLIENT_NOT_AFTER,
        TLS_CLIENT_SERIAL_NUMBER,
        TLS_CLIENT_VERIFIED,
        TLS_CIPHER,
        TLS_VERSION,
    ];
}

pub const SERVER_PROTOCOL: &str = "GEMINI";
pub const AUTH_TYPE_CERTIFICATE: &str = "CERTIFICATE";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Static server identity, shared read-only by all connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: String,
    pub port: u16,
    pub software: String,
}

impl ServerInfo {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            software: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Identity derived from the client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub common_name: Option<String>,
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: String,
    pub verified: bool,
    pub cipher: String,
    pub version: String,
}

/// Per-request context handed to the application.
#[derive(Debug, Clone)]
pub struct RequestContext {
    url: String,
    path: String,
    query: String,
    peer: SocketAddr,
    server: Arc<ServerInfo>,
    client_certificate: Option<CertificateDer<'static>>,
    identity: Option<ClientIdentity>,
}

impl RequestContext {
    /// Build the context for a parsed request.
    ///
    /// Certificate inspection failures are returned to the caller.
    pub fn build(
        url: &str,
        peer: SocketAddr,
        server: Arc<ServerInfo>,
        tls: &TlsSession,
    ) -> Result<Self, CertificateError> {
        let (path, query) = split_url(url);

        let (client_certificate, identity) = match &tls.peer_certificate {
            Some(cert) => {
                let info = inspect_certificate(cert.as_ref())?;
                let identity = ClientIdentity {
                    common_name: info.common_name,
                    fingerprint: info.fingerprint,
                    not_before: info.not_before,
                    not_after: info.not_after,
                    serial_number: info.serial_number,
                    verified: tls.verified,
                    cipher: tls.cipher.clone().unwrap_or_default(),
                    version: tls.version.clone().unwrap_or_default(),
                };
                (Some(cert.clone()), Some(identity))
            }
            None => (None, None),
        };

        Ok(Self {
            url: url.to_owned(),
            path,
            query,
            peer,
            server,
            client_certificate,
            identity,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// DER bytes of the client certificate, if one was presented.
    pub fn client_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.client_certificate.as_ref()
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Look up a single context variable.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            keys::GEMINI_URL => self.url.clone(),
            keys::HOSTNAME | keys::SERVER_NAME => self.server.hostname.clone(),
            keys::PATH_INFO => self.path.clone(),
            keys::QUERY_STRING => self.query.clone(),
            keys::REMOTE_ADDR | keys::REMOTE_HOST => self.peer.ip().to_string(),
            keys::SERVER_PORT => self.server.port.to_string(),
            keys::SERVER_PROTOCOL => SERVER_PROTOCOL.to_string(),
            keys::SERVER_SOFTWARE => self.server.software.clone(),
            _ => return self.identity.as_ref().and_then(|id| id.get(key)),
        };
        Some(value)
    }

    /// All string-valued context variables.
    ///
    /// The identity keys appear only when a client certificate was
    /// presented.
    pub fn vars(&self) -> BTreeMap<&'static str, String> {
        keys::SERVER
            .iter()
            .chain(&keys::IDENTITY)
            .filter_map(|&key| self.get(key).map(|value| (key, value)))
            .collect()
    }
}

impl ClientIdentity {
    fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            keys::AUTH_TYPE => AUTH_TYPE_CERTIFICATE.to_string(),
            keys::REMOTE_USER => self.common_name.clone().unwrap_or_default(),
            keys::TLS_CLIENT_HASH => self.fingerprint.clone(),
            keys::TLS_CLIENT_NOT_BEFORE => self.not_before.format(TIMESTAMP_FORMAT).to_string(),
            keys::TLS_CLIENT_NOT_AFTER => self.not_after.format(TIMESTAMP_FORMAT).to_string(),
            keys::TLS_CLIENT_SERIAL_NUMBER => self.serial_number.clone(),
            keys::TLS_CLIENT_VERIFIED => self.verified.to_string(),
            keys::TLS_CIPHER => self.cipher.clone(),
            keys::TLS_VERSION => self.version.clone(),
            _ => return None,
        };
        Some(value)
    }
}

/// Split a request URL into its raw path and query components. Nothing is
/// decoded or normalised: the scheme and authority are dropped and the rest
/// is cut at `?` and `#`.
fn split_url(url: &str) -> (String, String) {
    let rest = strip_scheme(url);
    let rest = match rest.strip_prefix("//") {
        Some(authority) => strip_authority(authority),
        None => rest,
    };
    let rest = rest.split_once('#').map_or(rest, |(before, _)| before);

    match rest.split_once('?') {
        Some((path, query)) => (path.to_owned(), query.to_owned()),
        None => (rest.to_owned(), String::new()),
    }
}

fn strip_scheme(url: &str) -> &str {
    match url.split_once(':') {
        Some((scheme, rest)) if is_scheme(scheme) => rest,
        _ => url,
    }
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn strip_authority(s: &str) -> &str {
    match s.find(['/', '?', '#']) {
        Some(i) => &s[i..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::client_cert_der;

    fn server() -> Arc<ServerInfo> {
        Arc::new(ServerInfo::new("example.org", 1965))
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:50123".parse().unwrap()
    }

    #[test]
    fn test_split_url() {
        assert_eq!(split_url("gemini://example.org/"), ("/".into(), "".into()));
        assert_eq!(
            split_url("gemini://example.org/search?hello%20world"),
            ("/search".into(), "hello%20world".into())
        );
        assert_eq!(split_url("gemini://example.org"), ("".into(), "".into()));
        assert_eq!(
            split_url("gemini://example.org:1965/a/b?x=1#frag"),
            ("/a/b".into(), "x=1".into())
        );
    }

    #[test]
    fn test_split_url_keeps_raw_text() {
        assert_eq!(
            split_url("gemini://example.org/caf\u{e9}?q=\u{e9}t\u{e9}"),
            ("/caf\u{e9}".into(), "q=\u{e9}t\u{e9}".into())
        );
        assert_eq!(
            split_url("gemini://example.org/a/../b c?x y"),
            ("/a/../b c".into(), "x y".into())
        );
        assert_eq!(
            split_url("gemini://example.org/%7Euser/./x"),
            ("/%7Euser/./x".into(), "".into())
        );
        assert_eq!(
            split_url("GEMINI://Example.ORG/Path;p?a?b"),
            ("/Path;p".into(), "a?b".into())
        );
    }

    #[test]
    fn test_split_relative_url() {
        assert_eq!(split_url("/docs?q"), ("/docs".into(), "q".into()));
        assert_eq!(split_url("//host/path"), ("/path".into(), "".into()));
        assert_eq!(split_url(""), ("".into(), "".into()));
        assert_eq!(split_url("example.org/x"), ("example.org/x".into(), "".into()));
    }

    #[test]
    fn test_context_without_certificate() {
        let ctx = RequestContext::build(
            "gemini://example.org/",
            peer(),
            server(),
            &TlsSession::default(),
        )
        .unwrap();

        let vars = ctx.vars();
        assert_eq!(vars[keys::GEMINI_URL], "gemini://example.org/");
        assert_eq!(vars[keys::PATH_INFO], "/");
        assert_eq!(vars[keys::QUERY_STRING], "");
        assert_eq!(vars[keys::REMOTE_ADDR], "192.0.2.7");
        assert_eq!(vars[keys::REMOTE_HOST], "192.0.2.7");
        assert_eq!(vars[keys::HOSTNAME], "example.org");
        assert_eq!(vars[keys::SERVER_NAME], "example.org");
        assert_eq!(vars[keys::SERVER_PORT], "1965");
        assert_eq!(vars[keys::SERVER_PROTOCOL], "GEMINI");
        assert!(vars[keys::SERVER_SOFTWARE].starts_with("gemini-server/"));

        assert!(ctx.client_certificate().is_none());
        assert!(ctx.identity().is_none());
        for key in keys::IDENTITY {
            assert!(!vars.contains_key(key), "unexpected key {key}");
        }
    }

    #[test]
    fn test_context_with_certificate() {
        let session = TlsSession {
            peer_certificate: Some(client_cert_der()),
            verified: true,
            cipher: Some("TLS13_AES_256_GCM_SHA384".into()),
            version: Some("TLSv1.3".into()),
        };

        let ctx =
            RequestContext::build("gemini://example.org/me", peer(), server(), &session).unwrap();
        let vars = ctx.vars();

        for key in keys::IDENTITY {
            assert!(vars.contains_key(key), "missing key {key}");
        }
        assert!(ctx.client_certificate().is_some());
        assert_eq!(vars[keys::AUTH_TYPE], "CERTIFICATE");
        assert_eq!(vars[keys::REMOTE_USER], "gemini-test-client");
        assert_eq!(vars[keys::TLS_CLIENT_HASH].len(), 64);
        assert_eq!(vars[keys::TLS_CLIENT_VERIFIED], "true");
        assert_eq!(vars[keys::TLS_CIPHER], "TLS13_AES_256_GCM_SHA384");
        assert_eq!(vars[keys::TLS_VERSION], "TLSv1.3");
        assert_eq!(vars[keys::TLS_CLIENT_SERIAL_NUMBER], "4660");
        assert_eq!(vars[keys::TLS_CLIENT_NOT_BEFORE], "2020-01-01T00:00:00Z");
        assert_eq!(vars[keys::TLS_CLIENT_NOT_AFTER], "2120-01-01T00:00:00Z");

        for (key, value) in &vars {
            assert_eq!(ctx.get(key).as_ref(), Some(value), "{key}");
        }
    }

    #[test]
    fn test_context_bad_certificate_propagates() {
        let session = TlsSession {
            peer_certificate: Some(CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01])),
            ..TlsSession::default()
        };

        let result = RequestContext::build("gemini://example.org/", peer(), server(), &session);
        assert!(result.is_err());
    }

    #[test]
    fn test_get() {
        let ctx = RequestContext::build(
            "gemini://example.org/a?b",
            peer(),
            server(),
            &TlsSession::default(),
        )
        .unwrap();
        assert_eq!(ctx.get(keys::QUERY_STRING).as_deref(), Some("b"));
        assert_eq!(ctx.get(keys::PATH_INFO).as_deref(), Some("/a"));
        assert_eq!(ctx.get(keys::REMOTE_HOST).as_deref(), Some("192.0.2.7"));
        assert_eq!(ctx.get(keys::AUTH_TYPE), None);
        assert_eq!(ctx.get("NOT_A_KEY"), None);
        assert_eq!(ctx.vars().len(), keys::SERVER.len());
    }
}
