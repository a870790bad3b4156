//! # Connection Listener
//!
//! QUIC transport endpoint: accepts inbound connections, runs the mutual
//! authentication handshake on each, and hands authenticated channels to
//! the Peer Manager. The same endpoint dials outbound connections to
//! discovered or stored peer addresses.
//!
//! TLS here only provides the encrypted pipe. Certificates are
//! self-signed and the client side skips X.509 verification entirely;
//! peer authenticity comes from the Ed25519 challenge handshake, which a
//! man-in-the-middle cannot complete without the device's private key.

use anyhow::{anyhow, Result};
use quinn::{Connection, Endpoint};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handshake;
use crate::identity::DeviceIdentity;
use crate::peer::{BoxReader, BoxWriter, PeerManager};

const ALPN_PROTOCOL: &[u8] = b"peersync/1";

pub struct ConnectionListener {
    endpoint: Endpoint,
}

impl ConnectionListener {
    /// Bind the QUIC endpoint on the given port (0 picks an ephemeral
    /// port) and prepare both server and client configurations.
    pub fn bind(identity: &DeviceIdentity, port: u16) -> Result<Self> {
        let (cert_der, key_der) = generate_self_signed_cert(identity)?;
        let server_config = configure_server(cert_der, key_der)?;
        let client_config = configure_client()?;

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let mut endpoint = Endpoint::server(server_config, bind_addr)?;
        endpoint.set_default_client_config(client_config);

        info!("Listening for peers on {}", endpoint.local_addr()?);
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until the endpoint is closed. Each connection
    /// gets its own task; a failed handshake only drops that connection.
    pub fn spawn_accept_loop(&self, peer: PeerManager) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(connecting) = endpoint.accept().await {
                let peer = peer.clone();
                tokio::spawn(async move {
                    match connecting.await {
                        Ok(connection) => {
                            let remote = connection.remote_address();
                            debug!("Inbound connection from {}", remote);
                            if let Err(e) = accept_authenticated(connection, &peer).await {
                                warn!("Handshake with {} failed: {}", remote, e);
                            }
                        }
                        Err(e) => debug!("Inbound connection failed: {}", e),
                    }
                });
            }
        })
    }

    /// Dial a peer and authenticate. The resulting channel is handed to
    /// the Peer Manager like any inbound one.
    pub async fn connect(&self, peer: &PeerManager, addr: SocketAddr) -> Result<()> {
        debug!("Dialing {}", addr);
        let connection = self.endpoint.connect(addr, "peersync")?.await?;
        let (send, recv) = connection.open_bi().await?;

        let mut reader: BoxReader = Box::new(recv);
        let mut writer: BoxWriter = Box::new(send);
        let outcome = handshake::authenticate(
            &mut reader,
            &mut writer,
            peer.identity(),
            peer.registry(),
            true,
        )
        .await
        .map_err(|e| anyhow!("handshake failed: {e}"))?;

        peer.add_connection(reader, writer, outcome, connection.remote_address());
        Ok(())
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutting down");
    }
}

async fn accept_authenticated(connection: Connection, peer: &PeerManager) -> Result<()> {
    // The dialer opens the stream and speaks first
    let (send, recv) = connection.accept_bi().await?;
    let mut reader: BoxReader = Box::new(recv);
    let mut writer: BoxWriter = Box::new(send);

    let outcome = handshake::authenticate(
        &mut reader,
        &mut writer,
        peer.identity(),
        peer.registry(),
        false,
    )
    .await
    .map_err(|e| anyhow!("{e}"))?;

    peer.add_connection(reader, writer, outcome, connection.remote_address());
    Ok(())
}

/// Generate the per-run self-signed certificate backing the QUIC TLS
/// layer. The device id lands in the SAN purely for debuggability; it is
/// never used for trust decisions.
fn generate_self_signed_cert(identity: &DeviceIdentity) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate()?;

    let mut params = rcgen::CertificateParams::default();
    params.not_before = rcgen::date_time_ymd(2025, 1, 1);
    params.not_after = rcgen::date_time_ymd(2035, 1, 1);

    let device_id = identity.device_id();
    let dns_name = format!("{}.peersync.local", &device_id[..16]);
    params.subject_alt_names = vec![rcgen::SanType::DnsName(dns_name.try_into()?)];

    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(
        rcgen::DnType::CommonName,
        format!("peersync-{}", &device_id[..8]),
    );
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key_pair)?;
    Ok((cert.der().to_vec(), key_pair.serialize_der()))
}

fn configure_server(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<quinn::ServerConfig> {
    let cert = rustls::Certificate(cert_der);
    let key = rustls::PrivateKey(key_der);
    let server_config = quinn::ServerConfig::with_single_cert(vec![cert], key)
        .map_err(|e| anyhow!("failed to configure server TLS: {e}"))?;
    Ok(server_config)
}

fn configure_client() -> Result<quinn::ClientConfig> {
    // Certificate identity is meaningless here; the Ed25519 handshake is
    // the authentication layer
    let mut crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_on_ephemeral_port() {
        let identity = DeviceIdentity::generate("listener-test".into());
        let listener = ConnectionListener::bind(&identity, 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        listener.close();
    }

    #[test]
    fn test_certificate_generation() {
        let identity = DeviceIdentity::generate("cert-test".into());
        let (cert, key) = generate_self_signed_cert(&identity).unwrap();
        assert!(!cert.is_empty());
        assert!(!key.is_empty());
    }
}
