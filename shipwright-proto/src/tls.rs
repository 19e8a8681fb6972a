//! Ephemeral mutual-TLS material for the bootstrap connection (spec §4.7).
//!
//! The bootstrap server generates an in-memory CA at startup, issues itself
//! a server certificate for its listen address, and issues a client
//! certificate for the guest. The client half of this material is handed to
//! the guest out-of-band through the boot-parameter channel (§6); it never
//! touches the network unencrypted.

use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

/// A certificate and its private key, both DER-encoded.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Leaf certificate, DER-encoded.
    pub cert_der: Vec<u8>,
    /// Private key, DER-encoded (PKCS#8).
    pub key_der: Vec<u8>,
}

/// Everything the bootstrap server needs to run mutual TLS, plus the
/// client half handed to the guest out-of-band.
#[derive(Debug, Clone)]
pub struct EphemeralPki {
    /// CA certificate, DER-encoded. Both peers trust only this CA.
    pub ca_cert_der: Vec<u8>,
    /// CA certificate, PEM-encoded — this is what actually crosses the MMDS
    /// boot channel, since that's flat text (spec §6).
    pub ca_cert_pem: String,
    /// Server's own certificate and key.
    pub server: Credential,
    /// Client certificate and key, shipped to the guest out-of-band.
    pub client: Credential,
    /// `client`'s certificate, PEM-encoded, for the MMDS boot channel.
    pub client_cert_pem: String,
    /// `client`'s private key, PEM-encoded, for the MMDS boot channel.
    pub client_key_pem: String,
}

/// Generates a fresh CA plus a server cert (for `server_name`) and a client
/// cert (for `client_name`) signed by it.
pub fn generate(server_name: &str, client_name: &str) -> Result<EphemeralPki, rcgen::Error> {
    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::new())?;
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "shipwright ephemeral CA");
        dn
    };
    let ca_cert = ca_params.self_signed(&ca_key)?;
    let issuer = Issuer::new(ca_params.clone(), ca_key);

    let server_key = KeyPair::generate()?;
    let server_params = CertificateParams::new(vec![server_name.to_owned()])?;
    let server_cert = server_params.signed_by(&server_key, &issuer)?;

    let client_key = KeyPair::generate()?;
    let client_params = CertificateParams::new(vec![client_name.to_owned()])?;
    let client_cert = client_params.signed_by(&client_key, &issuer)?;

    Ok(EphemeralPki {
        ca_cert_der: ca_cert.der().to_vec(),
        ca_cert_pem: ca_cert.pem(),
        server: Credential {
            cert_der: server_cert.der().to_vec(),
            key_der: server_key.serialize_der(),
        },
        client: Credential {
            cert_der: client_cert.der().to_vec(),
            key_der: client_key.serialize_der(),
        },
        client_cert_pem: client_cert.pem(),
        client_key_pem: client_key.serialize_pem(),
    })
}

/// Builds a [`ServerConfig`] that presents `server` and requires the peer
/// to present a certificate signed by `ca_cert_der`.
pub fn server_config(
    ca_cert_der: &[u8],
    server: &Credential,
) -> Result<ServerConfig, tokio_rustls::rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_cert_der.to_vec()))
        .map_err(|e| tokio_rustls::rustls::Error::General(e.to_string()))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| tokio_rustls::rustls::Error::General(e.to_string()))?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            vec![CertificateDer::from(server.cert_der.clone())],
            PrivatePkcs8KeyDer::from(server.key_der.clone()).into(),
        )
}

/// Builds a [`ClientConfig`] that presents `client` and trusts only
/// `ca_cert_der` for the server's certificate.
pub fn client_config(
    ca_cert_der: &[u8],
    client: &Credential,
) -> Result<ClientConfig, tokio_rustls::rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_cert_der.to_vec()))
        .map_err(|e| tokio_rustls::rustls::Error::General(e.to_string()))?;

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            vec![CertificateDer::from(client.cert_der.clone())],
            PrivatePkcs8KeyDer::from(client.key_der.clone()).into(),
        )
        .map_err(|e| tokio_rustls::rustls::Error::General(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_distinct_server_and_client_certs() {
        let pki = generate("bootstrap.shipwright.internal", "guest").unwrap();
        assert_ne!(pki.server.cert_der, pki.client.cert_der);
        assert!(!pki.ca_cert_der.is_empty());
    }

    #[test]
    fn server_and_client_configs_build_from_generated_material() {
        let pki = generate("bootstrap.shipwright.internal", "guest").unwrap();
        server_config(&pki.ca_cert_der, &pki.server).unwrap();
        client_config(&pki.ca_cert_der, &pki.client).unwrap();
    }
}
