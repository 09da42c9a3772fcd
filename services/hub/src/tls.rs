//! TLS material: PEM files from disk or a generated self-signed pair.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::version::TLS13;
use rustls::SupportedProtocolVersion;
use thub_mux::ALPN_H2_HTTP11;
use tracing::{debug, info};

use crate::error::{ConfigError, TlsError};

/// Lowest TLS protocol version the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::V1_2 => rustls::ALL_VERSIONS,
            TlsVersion::V1_3 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.2" => Ok(TlsVersion::V1_2),
            "1.3" => Ok(TlsVersion::V1_3),
            other => Err(ConfigError::TlsVersion(other.to_string())),
        }
    }
}

/// A certificate chain with its private key.
#[derive(Debug)]
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_pem: String,
}

impl TlsMaterial {
    /// Load a PEM certificate chain and private key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        debug!(cert = %cert_path.display(), key = %key_path.display(), "Loading TLS material");

        let cert_pem = std::fs::read_to_string(cert_path).map_err(|source| TlsError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Read {
                path: cert_path.to_path_buf(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
        }

        let key_file = File::open(key_path).map_err(|source| TlsError::Read {
            path: key_path.to_path_buf(),
            source,
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|source| TlsError::Read {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

        Ok(Self {
            certs,
            key,
            cert_pem,
        })
    }

    /// Generate a self-signed certificate for `hostname`.
    pub fn self_signed(hostname: &str) -> Result<Self, TlsError> {
        info!(hostname = %hostname, "Generating self-signed certificate");

        let generated = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
        let cert_pem = generated.cert.pem();
        let certs = vec![generated.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            generated.key_pair.serialize_der(),
        ));

        Ok(Self {
            certs,
            key,
            cert_pem,
        })
    }

    /// The certificate chain in PEM form, for clients that need to trust it.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Build a rustls server config advertising `h2` and `http/1.1`.
    pub fn server_config(
        &self,
        min_version: TlsVersion,
    ) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(min_version.versions())?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        config.alpn_protocols = ALPN_H2_HTTP11.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }
}
