//! Certificate loading for the admin listener and TLS-terminating records
//!
//! The admin certificate and data-plane certificates never share a store:
//! the admin listener builds its own `ServerConfig` once at startup, while
//! [`CertificateStore`] resolves the references carried by routing records.

use crate::records::validate_cert_ref;
use dashmap::DashMap;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// Reference that maps to the TLS listener's own cert/key pair
pub const DEFAULT_CERT_REF: &str = "default";

const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e)
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e)
        })?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path.display())
}

/// Generate a throwaway certificate for the given names
pub fn generate_self_signed(
    names: Vec<String>,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}

/// Server config advertising HTTP/2 and HTTP/1.1
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

struct CachedConfig {
    config: Arc<ServerConfig>,
    cert_modified: SystemTime,
    key_modified: SystemTime,
}

/// Resolves certificate references of tls-terminate records.
///
/// Configs are cached per reference and rebuilt when either file's
/// modification time changes, so certificates can be rotated on disk.
pub struct CertificateStore {
    default_pair: Option<(PathBuf, PathBuf)>,
    cert_dir: Option<PathBuf>,
    cache: DashMap<String, CachedConfig>,
}

impl CertificateStore {
    pub fn new(default_pair: Option<(PathBuf, PathBuf)>, cert_dir: Option<PathBuf>) -> Self {
        Self {
            default_pair,
            cert_dir,
            cache: DashMap::new(),
        }
    }

    pub fn from_config(tls: &crate::config::TlsListenerConfig) -> Self {
        let default_pair = match (&tls.cert, &tls.key) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => None,
        };
        Self::new(default_pair, tls.cert_dir.clone())
    }

    /// Certificate and key paths for a reference
    pub fn paths_for(&self, reference: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
        validate_cert_ref(reference).map_err(|e| anyhow::anyhow!("{}", e))?;

        if reference == DEFAULT_CERT_REF {
            if let Some(pair) = &self.default_pair {
                return Ok(pair.clone());
            }
        }

        let dir = self
            .cert_dir
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No certificate directory configured for '{}'", reference))?;
        Ok((
            dir.join(format!("{}.crt", reference)),
            dir.join(format!("{}.key", reference)),
        ))
    }

    /// TLS server config for a reference, loading from disk when needed
    pub fn server_config(&self, reference: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let (cert_path, key_path) = self.paths_for(reference)?;
        let cert_modified = modified(&cert_path)?;
        let key_modified = modified(&key_path)?;

        if let Some(cached) = self.cache.get(reference) {
            if cached.cert_modified == cert_modified && cached.key_modified == key_modified {
                return Ok(Arc::clone(&cached.config));
            }
        }

        let config = server_config(load_certs(&cert_path)?, load_key(&key_path)?)?;
        info!(reference, cert = %cert_path.display(), "Loaded data-plane certificate");

        self.cache.insert(
            reference.to_string(),
            CachedConfig {
                config: Arc::clone(&config),
                cert_modified,
                key_modified,
            },
        );
        Ok(config)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn modified(path: &Path) -> anyhow::Result<SystemTime> {
    let meta = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("Certificate file {} unavailable: {}", path.display(), e))?;
    let modified = meta.modified()?;
    debug!(path = %path.display(), ?modified, "Certificate file stat");
    Ok(modified)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, name: &str, host: &str) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![host.to_string()]).unwrap();
        std::fs::write(dir.join(format!("{}.crt", name)), cert.pem()).unwrap();
        std::fs::write(dir.join(format!("{}.key", name)), key_pair.serialize_pem()).unwrap();
    }

    #[test]
    fn test_load_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "site", "site.example.com");

        let certs = load_certs(&dir.path().join("site.crt")).unwrap();
        assert_eq!(certs.len(), 1);
        load_key(&dir.path().join("site.key")).unwrap();
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        assert!(load_certs(&empty).is_err());
        assert!(load_key(&empty).is_err());
        assert!(load_certs(&dir.path().join("missing.pem")).is_err());
    }

    #[test]
    fn test_self_signed_config() {
        let (certs, key) = generate_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = server_config(certs, key).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_store_resolves_references() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "site", "site.example.com");
        write_pair(dir.path(), "listener", "listener.example.com");

        let store = CertificateStore::new(
            Some((dir.path().join("listener.crt"), dir.path().join("listener.key"))),
            Some(dir.path().to_path_buf()),
        );

        let (cert, _) = store.paths_for(DEFAULT_CERT_REF).unwrap();
        assert_eq!(cert, dir.path().join("listener.crt"));
        let (cert, key) = store.paths_for("site").unwrap();
        assert_eq!(cert, dir.path().join("site.crt"));
        assert_eq!(key, dir.path().join("site.key"));

        let first = store.server_config("site").unwrap();
        let second = store.server_config("site").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        store.server_config(DEFAULT_CERT_REF).unwrap();
        assert_eq!(store.cached(), 2);
    }

    #[test]
    fn test_store_rejects_bad_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(None, Some(dir.path().to_path_buf()));

        assert!(store.paths_for("../secret").is_err());
        assert!(store.server_config("missing").is_err());

        let no_dir = CertificateStore::new(None, None);
        assert!(no_dir.paths_for("site").is_err());
    }
}
