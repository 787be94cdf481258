//! PEM loading and rustls config construction.

use std::path::Path;

use anyhow::Context;
use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
};

/// Parse every `CERTIFICATE` block out of PEM bytes, preserving input order.
pub fn certs_from_pem(
    pem: &[u8],
) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid PEM certificate data")?;
    anyhow::ensure!(!certs.is_empty(), "No CERTIFICATE blocks found");
    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) out of PEM bytes.
pub fn key_from_pem(pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem).context("Invalid PEM private key data")
}

/// Load a full cert chain from a PEM file, file order preserved.
pub fn load_cert_chain(
    path: &Path,
) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    certs_from_pem(&pem)
        .with_context(|| format!("Bad cert file {}", path.display()))
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    key_from_pem(&pem)
        .with_context(|| format!("Bad key file {}", path.display()))
}

/// Server config presenting `chain` verbatim. rustls only checks that the
/// key matches the first cert, so the bundle's CA ordering reaches the wire
/// untouched.
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<ServerConfig> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("Failed to build rustls::ServerConfig")
}

/// One `subject <- issuer` line per certificate in a PEM bundle, in file
/// order. Used to annotate failed cases in the report.
pub fn describe_chain(pem: &[u8]) -> Vec<String> {
    use x509_parser::prelude::*;

    CertificateDer::pem_slice_iter(pem)
        .filter_map(Result::ok)
        .map(|der| match X509Certificate::from_der(der.as_ref()) {
            Ok((_trailing, cert)) =>
                format!("{} <- {}", cert.subject(), cert.issuer()),
            Err(_) => "<unparseable certificate>".to_owned(),
        })
        .collect()
}

/// TLS-specific test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use std::sync::Arc;

    use anyhow::Context;
    use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Client config trusting exactly `roots`, no client auth.
    pub fn client_config(
        roots: Vec<CertificateDer<'static>>,
    ) -> anyhow::Result<ClientConfig> {
        let mut store = RootCertStore::empty();
        for root in roots {
            store.add(root).context("rustls rejected trust anchor")?;
        }
        Ok(ClientConfig::builder()
            .with_root_certificates(store)
            .with_no_client_auth())
    }

    /// Run one TLS handshake over an in-memory stream pair; no sockets, no
    /// child processes. Returns both sides' results (instead of panicking)
    /// so rejection cases can be asserted too.
    pub async fn handshake(
        client_config: Arc<ClientConfig>,
        server_config: Arc<rustls::ServerConfig>,
        server_name: &str,
    ) -> (Result<(), String>, Result<(), String>) {
        let (client_stream, server_stream) = tokio::io::duplex(8 * 1024);

        let client = async move {
            let connector = tokio_rustls::TlsConnector::from(client_config);
            let name = ServerName::try_from(server_name.to_owned())
                .map_err(|err| err.to_string())?;
            let mut stream = connector
                .connect(name, client_stream)
                .await
                .map_err(|err| format!("client handshake: {err}"))?;

            stream
                .write_all(b"\n")
                .await
                .map_err(|err| err.to_string())?;
            stream.shutdown().await.map_err(|err| err.to_string())?;

            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            Ok::<(), String>(())
        };

        let server = async move {
            let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
            let mut stream = acceptor
                .accept(server_stream)
                .await
                .map_err(|err| format!("server handshake: {err}"))?;

            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received).await;
            let _ = stream.shutdown().await;
            Ok::<(), String>(())
        };

        tokio::join!(client, server)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testca::RotationPki;

    #[test]
    fn missing_cert_file_errors() {
        let err = load_cert_chain(Path::new("/no/such/file.pem")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read"));
    }

    #[test]
    fn fixture_chain_parses_and_describes() {
        let pki = RotationPki::generate("localhost").unwrap();

        let bundle = format!("{}{}", pki.leaf_pem, pki.cross_signed_pem);
        let certs = certs_from_pem(bundle.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);

        let chain = describe_chain(bundle.as_bytes());
        assert_eq!(chain.len(), 2);
        assert!(chain[0].contains("chainsweep server"), "{}", chain[0]);
        assert!(chain[1].contains("old root"), "{}", chain[1]);
    }

    #[test]
    fn server_config_accepts_fixture_chain() {
        let pki = RotationPki::generate("localhost").unwrap();
        let chain = certs_from_pem(pki.leaf_pem.as_bytes()).unwrap();
        let key = key_from_pem(pki.leaf_key_pem.as_bytes()).unwrap();
        server_config(chain, key).unwrap();
    }
}
