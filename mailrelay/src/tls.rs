//! TLS profiles: server acceptor and smarthost connector, built from
//! pem files named on the command line.

use std::{fs::File, io::BufReader, sync::Arc};

use anyhow::Context;
use tracing::debug;

use crate::options::UnitSettings;

pub struct TlsProfiles {
    pub acceptor: Option<async_tls::TlsAcceptor>,
    pub connector: Option<async_tls::TlsConnector>,
    /// Name checked against the smarthost certificate, when verifying.
    pub verify_name: Option<String>,
}

impl TlsProfiles {
    pub fn build(settings: &UnitSettings) -> anyhow::Result<TlsProfiles> {
        let acceptor = if settings.server_tls || settings.server_tls_connection {
            let spec = settings
                .server_tls_certificate
                .as_deref()
                .context("server TLS requested but no --server-tls-certificate")?;
            Some(server_acceptor(
                spec,
                settings.server_tls_verify.as_deref(),
            )?)
        } else {
            None
        };
        let connector = if settings.client_tls || settings.client_tls_connection {
            Some(client_connector(
                settings.client_tls_certificate.as_deref(),
                settings.client_tls_verify.as_deref(),
            )?)
        } else {
            None
        };
        Ok(TlsProfiles {
            acceptor,
            connector,
            verify_name: settings.client_tls_verify_name.clone(),
        })
    }
}

fn load_certs(path: &str) -> anyhow::Result<Vec<rustls::Certificate>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(path).with_context(|| format!("Opening the certificate file ‘{}’", path))?,
    ))
    .with_context(|| format!("Parsing the certificate file ‘{}’", path))?
    .into_iter()
    .map(rustls::Certificate)
    .collect::<Vec<_>>();
    anyhow::ensure!(!certs.is_empty(), "No certificates in ‘{}’", path);
    debug!(num_certs = certs.len(), path = path, "Parsed certificates");
    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<rustls::PrivateKey> {
    let open = || -> anyhow::Result<BufReader<File>> {
        Ok(BufReader::new(File::open(path).with_context(|| {
            format!("Opening the key file ‘{}’", path)
        })?))
    };
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open()?)
        .with_context(|| format!("Parsing the key file ‘{}’", path))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open()?)
            .with_context(|| format!("Parsing the key file ‘{}’", path))?;
    }
    anyhow::ensure!(
        keys.len() == 1,
        "Key file ‘{}’ did not have just one key, but had {}",
        path,
        keys.len()
    );
    Ok(rustls::PrivateKey(keys.remove(0)))
}

fn root_store(path: &str) -> anyhow::Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    let path = if path == "<default>" {
        // The usual system bundle location
        "/etc/ssl/certs/ca-certificates.crt"
    } else {
        path
    };
    let (added, _bad) = roots
        .add_pem_file(&mut BufReader::new(File::open(path).with_context(|| {
            format!("Opening the CA file ‘{}’", path)
        })?))
        .map_err(|()| anyhow::anyhow!("Parsing the CA file ‘{}’", path))?;
    anyhow::ensure!(added > 0, "No CA certificates in ‘{}’", path);
    Ok(roots)
}

/// "key,cert" or one combined pem file.
fn split_cert_spec(spec: &str) -> (&str, &str) {
    match spec.split_once(',') {
        Some((key, cert)) => (key, cert),
        None => (spec, spec),
    }
}

fn server_acceptor(
    cert_spec: &str,
    verify: Option<&str>,
) -> anyhow::Result<async_tls::TlsAcceptor> {
    let (key_path, cert_path) = split_cert_spec(cert_spec);
    let client_auth: Arc<dyn rustls::ClientCertVerifier> = match verify {
        Some(ca) => rustls::AllowAnyAuthenticatedClient::new(root_store(ca)?),
        None => rustls::NoClientAuth::new(),
    };
    let mut cfg = rustls::ServerConfig::new(client_auth);
    cfg.set_single_cert(load_certs(cert_path)?, load_key(key_path)?)
        .context("Setting the key and certificates")?;
    Ok(async_tls::TlsAcceptor::from(Arc::new(cfg)))
}

struct NoCertVerifier;

impl rustls::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, rustls::TLSError> {
        Ok(rustls::ServerCertVerified::assertion())
    }
}

fn client_connector(
    cert_spec: Option<&str>,
    verify: Option<&str>,
) -> anyhow::Result<async_tls::TlsConnector> {
    let mut cfg = rustls::ClientConfig::new();
    match verify {
        Some(ca) => {
            cfg.root_store = root_store(ca)?;
        }
        None => {
            // Opportunistic encryption without authentication
            cfg.dangerous()
                .set_certificate_verifier(Arc::new(NoCertVerifier));
        }
    }
    if let Some(spec) = cert_spec {
        let (key_path, cert_path) = split_cert_spec(spec);
        cfg.set_single_client_cert(load_certs(cert_path)?, load_key(key_path)?)
            .context("Setting the client key and certificates")?;
    }
    Ok(async_tls::TlsConnector::from(Arc::new(cfg)))
}
