//! Stream setup: SOCKS5 (or direct) TCP, optionally wrapped in TLS.
//!
//! Onion endpoints present self-signed certificates, so the TLS layer runs
//! with certificate verification disabled; the Tor circuit provides the
//! endpoint authentication instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;

use crate::{error::Error, Result};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Tls,
}

impl Protocol {
    /// Parses the single-letter tag used by server lists ("t" / "s").
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "t" => Ok(Protocol::Tcp),
            "s" => Ok(Protocol::Tls),
            other => Err(Error::UnknownProtocol(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
    pub proto: Protocol,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16, proto: Protocol) -> Self {
        ServerAddr {
            host: host.into(),
            port,
            proto,
        }
    }
}

pub(crate) async fn dial(
    server: &ServerAddr,
    proxy: Option<SocketAddr>,
    connect_timeout: Duration,
) -> Result<(BoxedReader, BoxedWriter)> {
    let target = (server.host.as_str(), server.port);
    let connect = async {
        match proxy {
            Some(proxy) => {
                let stream = Socks5Stream::connect(proxy, target).await?;
                wrap(stream, server).await
            }
            None => {
                let stream = TcpStream::connect(target).await?;
                wrap(stream, server).await
            }
        }
    };
    tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| Error::ConnectTimeout)?
}

async fn wrap<S>(stream: S, server: &ServerAddr) -> Result<(BoxedReader, BoxedWriter)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match server.proto {
        Protocol::Tcp => {
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
        Protocol::Tls => {
            let connector = TlsConnector::from(Arc::new(tls_config()?));
            let name = ServerName::try_from(server.host.clone())
                .map_err(|_| Error::InvalidServerName(server.host.clone()))?;
            let tls = connector.connect(name, stream).await?;
            let (reader, writer) = tokio::io::split(tls);
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

fn tls_config() -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts whatever certificate the server presents. Signatures inside the
/// handshake are still verified against the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_tags() {
        assert_eq!(Protocol::from_tag("t").unwrap(), Protocol::Tcp);
        assert_eq!(Protocol::from_tag("s").unwrap(), Protocol::Tls);
        assert!(matches!(Protocol::from_tag("h"), Err(Error::UnknownProtocol(_))));
    }
}
