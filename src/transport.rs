//! Session transport and TLS helpers
//!
//! A session owns exactly one [`Transport`]. STARTTLS swaps the plain
//! variant for the encrypted one wrapping the same stream; nothing is
//! stacked on top of the old value.

use crate::error::{Error, Result};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, ServerName};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// How the peer certificate is validated during the upgrade.
#[derive(Clone, Default)]
pub enum TlsTrust {
    /// Mozilla's root program via `webpki-roots`.
    #[default]
    WebPki,
    /// Only the given root certificates.
    Roots(Vec<CertificateDer<'static>>),
    /// Accept any certificate. Local proxies often present self-signed
    /// certificates for a name they impersonate.
    AcceptAny,
}

impl TlsTrust {
    /// Trust the certificates found in a PEM file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no
    /// certificate.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Config(format!("Cannot open {}: {e}", path.display())))?;
        let certs = rustls_pemfile::certs(&mut io::BufReader::new(file))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::Config(format!("Invalid PEM in {}: {e}", path.display())))?;
        if certs.is_empty() {
            return Err(Error::Config(format!(
                "No certificate found in {}",
                path.display()
            )));
        }
        Ok(Self::Roots(certs))
    }
}

impl fmt::Debug for TlsTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebPki => f.write_str("WebPki"),
            Self::Roots(certs) => write!(f, "Roots({} certificates)", certs.len()),
            Self::AcceptAny => f.write_str("AcceptAny"),
        }
    }
}

/// Build a TLS connector for `trust`.
///
/// The ring provider is passed explicitly so the library never depends
/// on (or installs) a process-wide default.
pub(crate) fn tls_connector(trust: &TlsTrust) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Upgrade(format!("TLS configuration: {e}")))?;

    let config = match trust {
        TlsTrust::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsTrust::Roots(certs) => {
            let mut roots = RootCertStore::empty();
            for cert in certs {
                roots
                    .add(cert.clone())
                    .map_err(|e| Error::Upgrade(format!("Invalid root certificate: {e}")))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsTrust::AcceptAny => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier))
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the name the peer certificate must match.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Upgrade(format!("Invalid server name {host}: {e}")))
}

/// The single active transport of a session.
pub(crate) enum Transport<S> {
    /// Not opened yet.
    Detached,
    Plain(S),
    Tls(Box<TlsStream<S>>),
    Closed,
}

impl<S> Transport<S> {
    pub(crate) const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Move the transport out, leaving [`Transport::Closed`] behind.
    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Closed)
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
            Self::Detached | Self::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Write the whole buffer, then flush so TLS records leave at once.
    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
            Self::Tls(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
            Self::Detached | Self::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
            Self::Detached | Self::Closed => Ok(()),
        }
    }
}

/// Skips chain and name validation altogether; only signature schemes
/// are advertised. Backs [`TlsTrust::AcceptAny`].
#[derive(Debug)]
struct AcceptAnyVerifier;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
