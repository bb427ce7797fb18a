//! Byte-stream plumbing underneath the framing layer: plain TCP or TLS.
//!
//! Both ends work on a [`BoxedStream`] so the session and client code never
//! care whether TLS was negotiated. Certificates and keys are loaded from
//! PEM files.
//!
//! Certificate validation on the client is strict unless the caller opts
//! into [`ClientTls::DangerousAcceptAnyCertificate`], which exists for local
//! testing against self-signed servers and logs a warning every time it is
//! used.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Anything the framing layer can run over.
pub trait NetStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> NetStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream: a `TcpStream` or a TLS stream wrapping one.
pub type BoxedStream = Box<dyn NetStream>;

/// Errors raised while preparing TLS.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The certificate file held no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file held no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Strict validation was requested without a CA certificate to validate against.
    #[error("strict certificate validation requires a CA certificate file")]
    MissingCaFile,

    /// The configured server name is not a valid DNS name or IP address.
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    /// rustls rejected the configuration.
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Client-side TLS mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientTls {
    /// Plain TCP.
    #[default]
    Disabled,
    /// TLS with the server certificate validated against `ca_file`.
    Verified {
        /// Name presented for SNI and checked against the certificate.
        server_name: String,
        /// PEM bundle of trusted roots. Required.
        ca_file: Option<PathBuf>,
    },
    /// TLS that accepts whatever certificate the server presents.
    ///
    /// Never use outside of local testing: it offers no protection against
    /// an active attacker.
    DangerousAcceptAnyCertificate {
        /// Name presented for SNI.
        server_name: String,
    },
}

/// Server-side TLS mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServerTls {
    /// Plain TCP.
    #[default]
    Disabled,
    /// TLS with the given certificate chain and private key.
    Enabled {
        /// PEM certificate chain.
        cert_file: PathBuf,
        /// PEM private key (PKCS#1, PKCS#8 or SEC1).
        key_file: PathBuf,
    },
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open_pem(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key found in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Verifier behind [`ClientTls::DangerousAcceptAnyCertificate`]. Handshake
/// signatures are still checked; the certificate chain is not.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Ready-to-use client TLS state: connector plus the name to present.
#[derive(Clone)]
pub struct TlsClientSetup {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClientSetup {
    /// Build the client TLS state for `mode`, or `None` for plain TCP.
    pub fn from_mode(mode: &ClientTls) -> Result<Option<Self>, TlsError> {
        let provider = crypto_provider();

        let (config, server_name) = match mode {
            ClientTls::Disabled => return Ok(None),
            ClientTls::Verified {
                server_name,
                ca_file,
            } => {
                let ca_file = ca_file.as_deref().ok_or(TlsError::MissingCaFile)?;
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_file)? {
                    roots.add(cert)?;
                }
                let config = ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()?
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                (config, server_name)
            }
            ClientTls::DangerousAcceptAnyCertificate { server_name } => {
                tracing::warn!("Accepting any server certificate (testing only)");
                let verifier = Arc::new(AcceptAnyServerCert {
                    algorithms: provider.signature_verification_algorithms,
                });
                let config = ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()?
                    .dangerous()
                    .with_custom_certificate_verifier(verifier)
                    .with_no_client_auth();
                (config, server_name)
            }
        };

        let server_name = ServerName::try_from(server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(server_name.clone()))?;

        Ok(Some(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        }))
    }

    /// Run the client handshake over an established TCP stream.
    pub async fn wrap(&self, tcp: TcpStream) -> std::io::Result<BoxedStream> {
        let tls = self.connector.connect(self.server_name.clone(), tcp).await?;
        Ok(Box::new(tls))
    }
}

/// Build the server-side acceptor for `mode`, or `None` for plain TCP.
pub fn build_acceptor(mode: &ServerTls) -> Result<Option<TlsAcceptor>, TlsError> {
    match mode {
        ServerTls::Disabled => Ok(None),
        ServerTls::Enabled {
            cert_file,
            key_file,
        } => {
            let certs = load_certs(cert_file)?;
            let key = load_private_key(key_file)?;
            let config = ServerConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(certs, key)?;
            Ok(Some(TlsAcceptor::from(Arc::new(config))))
        }
    }
}
