//! TLS termination and client certificate handling.
//!
//! Gemini clients commonly present self-signed certificates as an identity
//! token, so the handshake accepts any client certificate (or none). When a
//! CA file or directory is configured, the chain is checked against those
//! roots after the handshake and the result is exposed as the `verified`
//! flag of the [`TlsSession`].

use chrono::{DateTime, Datelike, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    DigitallySignedStruct, DistinguishedName, ProtocolVersion, RootCertStore, ServerConfig,
    ServerConnection, SignatureScheme,
};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Errors raised while building the TLS acceptor.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] io::Error),
    #[error("no certificates found in '{}'", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in '{}'", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("no usable CA certificates found")]
    NoCaCertificates,
    #[error("invalid client CA configuration: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),
}

/// Errors raised while inspecting a client certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("malformed client certificate: {0}")]
    Parse(String),
    #[error("certificate timestamp out of range: {0}")]
    Timestamp(i64),
}

/// Certificate and CA locations. Without a certificate file an ad-hoc
/// self-signed certificate is generated for the server hostname.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
}

/// Transport metadata captured after the handshake.
#[derive(Debug, Clone, Default)]
pub struct TlsSession {
    pub peer_certificate: Option<CertificateDer<'static>>,
    pub verified: bool,
    pub cipher: Option<String>,
    pub version: Option<String>,
}

/// Fields extracted from a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    /// SHA-256 of the DER encoding, lowercase hex.
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Decimal serial number.
    pub serial_number: String,
}

/// Extract the identity fields from a DER encoded certificate.
pub fn inspect_certificate(der: &[u8]) -> Result<CertificateInfo, CertificateError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .map(|cn| cn.as_str())
        .transpose()
        .map_err(|e| CertificateError::Parse(e.to_string()))?
        .map(str::to_owned);

    let validity = cert.validity();

    Ok(CertificateInfo {
        common_name,
        fingerprint: hex::encode(Sha256::digest(der)),
        not_before: to_utc(validity.not_before.timestamp())?,
        not_after: to_utc(validity.not_after.timestamp())?,
        serial_number: cert.tbs_certificate.serial.to_string(),
    })
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(timestamp, 0).ok_or(CertificateError::Timestamp(timestamp))
}

/// Write a self-signed certificate and key for `hostname` into `dir`,
/// valid for one year. Existing files are reused so that clients pinning
/// the certificate keep working across restarts.
pub fn generate_ad_hoc_certificate(
    hostname: &str,
    dir: &Path,
) -> Result<(PathBuf, PathBuf), TlsError> {
    let certfile = dir.join(format!("{hostname}.crt"));
    let keyfile = dir.join(format!("{hostname}.key"));
    if certfile.exists() && keyfile.exists() {
        return Ok((certfile, keyfile));
    }

    info!(hostname, "Generating ad-hoc certificate");
    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, hostname);

    let today = Utc::now().date_naive();
    let expires = today + chrono::Days::new(365);
    params.not_before =
        rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after =
        rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&keyfile, key_pair.serialize_pem())
        .map_err(|e| TlsError::Io(keyfile.clone(), e))?;
    std::fs::write(&certfile, cert.pem()).map_err(|e| TlsError::Io(certfile.clone(), e))?;
    Ok((certfile, keyfile))
}

/// Server side TLS state shared by all connections.
#[derive(Clone)]
pub struct GeminiTls {
    acceptor: TlsAcceptor,
    ca_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl GeminiTls {
    /// Build the acceptor. `hostname` names the ad-hoc certificate when no
    /// certificate file is configured.
    pub fn new(settings: &TlsSettings, hostname: &str) -> Result<Self, TlsError> {
        let provider = Arc::new(crypto::ring::default_provider());

        let (certfile, keyfile) = match &settings.certfile {
            Some(certfile) => (
                certfile.clone(),
                settings.keyfile.clone().unwrap_or_else(|| certfile.clone()),
            ),
            None => {
                warn!("No TLS certificate configured, using an ad-hoc certificate");
                generate_ad_hoc_certificate(hostname, &std::env::temp_dir())?
            }
        };
        info!(
            certfile = %certfile.display(),
            keyfile = %keyfile.display(),
            "Loading TLS certificate"
        );

        let certs = load_certs(&certfile)?;
        let key = load_private_key(&keyfile)?;

        let ca_verifier = match load_ca_roots(settings)? {
            Some(roots) => Some(
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()?,
            ),
            None => None,
        };

        let client_verifier: Arc<dyn ClientCertVerifier> = Arc::new(AcceptAnyClientCert {
            provider: provider.clone(),
            ca_verifier: ca_verifier.clone(),
        });

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            ca_verifier,
        })
    }

    /// Run the server side of the handshake.
    pub async fn accept<IO>(&self, stream: IO) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.acceptor.accept(stream).await
    }

    /// Capture the metadata the request context needs from a finished
    /// handshake.
    pub fn session(&self, conn: &ServerConnection) -> TlsSession {
        let chain = conn.peer_certificates().unwrap_or_default();
        let peer_certificate = chain.first().cloned();
        let verified = match (&self.ca_verifier, chain.split_first()) {
            (Some(verifier), Some((end_entity, intermediates))) => verifier
                .verify_client_cert(end_entity, intermediates, UnixTime::now())
                .map_err(|e| debug!(error = %e, "Client certificate not verified"))
                .is_ok(),
            _ => false,
        };

        TlsSession {
            peer_certificate,
            verified,
            cipher: conn.negotiated_cipher_suite().map(|suite| {
                let suite = suite.suite();
                suite
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("{suite:?}"))
            }),
            version: conn.protocol_version().map(version_name),
        }
    }
}

fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{other:?}"),
    }
}

/// Requests a client certificate but accepts anything, including
/// self-signed certificates and no certificate at all. Handshake signatures
/// are still checked so the client must hold the private key.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
    ca_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.ca_verifier {
            Some(verifier) => verifier.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Collect trust anchors from the CA file and every `.pem`/`.crt` file in
/// the CA directory. Returns `None` when neither is configured.
fn load_ca_roots(settings: &TlsSettings) -> Result<Option<RootCertStore>, TlsError> {
    if settings.cafile.is_none() && settings.capath.is_none() {
        return Ok(None);
    }

    let mut candidates = Vec::new();
    if let Some(cafile) = &settings.cafile {
        candidates.extend(load_certs(cafile)?);
    }
    if let Some(capath) = &settings.capath {
        let entries =
            std::fs::read_dir(capath).map_err(|e| TlsError::Io(capath.to_path_buf(), e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| TlsError::Io(capath.to_path_buf(), e))?
                .path();
            let is_cert = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("pem" | "crt")
            );
            if !is_cert {
                continue;
            }
            match load_certs(&path) {
                Ok(certs) => candidates.extend(certs),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping CA file"),
            }
        }
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(candidates);
    debug!(added, ignored, "Loaded client CA certificates");

    if roots.is_empty() {
        return Err(TlsError::NoCaCertificates);
    }
    Ok(Some(roots))
}
