//! TLS for IMAP connections
//!
//! rustls with the ring provider. Roots come from the system store, fall back
//! to the Mozilla bundle, and an extra CA file can be added for private mail
//! servers.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::MailError;

/// How to secure an IMAP connection
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Name checked against the certificate. Through a tunnel this is the
    /// real mail host, not the loopback address that is dialed.
    pub server_name: String,
    pub verify_cert: bool,
    /// PEM file with additional trusted CA certificates
    pub ca_file: Option<PathBuf>,
}

/// Plain or TLS stream to the mail server
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for MailStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accepts any certificate. Only used with `verify_cert: false`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn load_ca_file(root_store: &mut RootCertStore, path: &Path) -> Result<usize, MailError> {
    let pem = std::fs::read(path)
        .map_err(|e| MailError::Tls(format!("Failed to read CA file {:?}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MailError::Tls(format!("Invalid CA file {:?}: {}", path, e)))?;

    let mut added = 0;
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| MailError::Tls(format!("Rejected CA certificate in {:?}: {}", path, e)))?;
        added += 1;
    }
    Ok(added)
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore, MailError> {
    let mut root_store = RootCertStore::empty();

    if let Some(path) = &options.ca_file {
        let added = load_ca_file(&mut root_store, path)?;
        debug!("TLS: {} CA certificate(s) from {:?}", added, path);
    }

    let native = rustls_native_certs::load_native_certs();
    for error in native.errors {
        warn!("TLS: certificate loading error: {}", error);
    }
    let (system, _) = root_store.add_parsable_certificates(native.certs);
    debug!("TLS: {} system certificate(s)", system);

    if root_store.is_empty() {
        debug!("TLS: no system certificates, using the Mozilla bundle");
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(root_store)
}

/// Build a connector for `options`. Loads certificates, so callers keep it.
pub fn connector(options: &TlsOptions) -> Result<TlsConnector, MailError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| MailError::Tls(e.to_string()))?;

    let config = if options.verify_cert {
        builder
            .with_root_certificates(root_store(options)?)
            .with_no_client_auth()
    } else {
        warn!(
            "TLS: certificate verification disabled for {}",
            options.server_name
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake over an established TCP connection
pub async fn handshake(
    connector: &TlsConnector,
    server_name: &str,
    stream: TcpStream,
) -> Result<MailStream, MailError> {
    let domain = ServerName::try_from(server_name.to_string())
        .map_err(|e| MailError::Tls(format!("Invalid server name {:?}: {}", server_name, e)))?;

    debug!("TLS: handshake with {}", server_name);
    let stream = connector
        .connect(domain, stream)
        .await
        .map_err(|e| MailError::Tls(format!("Handshake with {} failed: {}", server_name, e)))?;
    Ok(MailStream::Tls(Box::new(stream)))
}
