//! # HTTPS Material
//!
//! Resolves which key/certificate pair the listener uses and turns it into a
//! rustls server configuration.
//!
//! With self-signing on, a fresh pair is written to
//! `<key_dir>/<YYYYMMDD_HHMMSS>.key` and `.cert`. Provisioning never
//! overwrites: if both files are already there nothing is written. The key
//! is RSA 2048, the certificate is signed with SHA-256.

use crate::config::TlsConfig;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Datelike, Local};
use rcgen::{
    date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber,
    PKCS_RSA_SHA256,
};
use rustls::ServerConfig;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const VALIDITY_YEARS: i32 = 10;
const SERIAL: [u8; 2] = [0x03, 0xE8]; // 1000

/// Key and certificate the listener should load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
}

impl TlsPaths {
    /// Timestamped pair under `key_dir`.
    pub fn self_signed(key_dir: &Path, now: DateTime<Local>) -> Self {
        let stem = now.format("%Y%m%d_%H%M%S").to_string();
        Self {
            key: key_dir.join(format!("{}.key", stem)),
            cert: key_dir.join(format!("{}.cert", stem)),
        }
    }
}

/// `None` when HTTPS is off; otherwise the files to load, provisioned first
/// when self-signing.
pub fn resolve(config: &TlsConfig) -> AppResult<Option<TlsPaths>> {
    if !config.enabled {
        return Ok(None);
    }

    if !config.self_signed {
        return Ok(Some(TlsPaths {
            key: config.key_path.clone(),
            cert: config.cert_path.clone(),
        }));
    }

    let paths = TlsPaths::self_signed(&config.key_dir, Local::now());
    provision_self_signed(&paths)?;
    Ok(Some(paths))
}

/// Write a self-signed pair to `paths` unless both files exist.
///
/// Returns whether anything was written.
pub fn provision_self_signed(paths: &TlsPaths) -> AppResult<bool> {
    if paths.key.exists() && paths.cert.exists() {
        debug!(
            key = %paths.key.display(),
            cert = %paths.cert.display(),
            "TLS material already present"
        );
        return Ok(false);
    }

    let (key_pem, cert_pem) = generate(Local::now())?;

    for path in [&paths.key, &paths.cert] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    write_private(&paths.key, key_pem.as_bytes())?;
    fs::write(&paths.cert, cert_pem.as_bytes())?;

    info!(
        key = %paths.key.display(),
        cert = %paths.cert.display(),
        "Generated self-signed certificate"
    );
    Ok(true)
}

/// PEM-encoded private key and certificate, valid from `now` for ten years.
fn generate(now: DateTime<Local>) -> AppResult<(String, String)> {
    let tls_err =
        |e: rcgen::Error| AppError::Internal(format!("certificate generation failed: {}", e));

    let mut params = CertificateParams::new(vec!["localhost".to_string()]).map_err(tls_err)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "JP");
    dn.push(DnType::StateOrProvinceName, "Tokyo");
    dn.push(DnType::LocalityName, "Chuo-ku");
    dn.push(DnType::OrganizationName, "F");
    dn.push(DnType::OrganizationalUnitName, "F");
    dn.push(DnType::CommonName, "Example");
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&SERIAL));

    let (year, month, day) = (now.year(), now.month() as u8, now.day() as u8);
    params.not_before = date_time_ymd(year, month, day);
    // Feb 29 does not exist ten years later in most cases
    let end_day = if month == 2 && day == 29 { 28 } else { day };
    params.not_after = date_time_ymd(year + VALIDITY_YEARS, month, end_day);

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    Ok((key_pair.serialize_pem(), cert.pem()))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> AppResult<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> AppResult<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    Ok(())
}

/// rustls server configuration for the listener.
pub fn load_server_config(paths: &TlsPaths) -> AppResult<ServerConfig> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| AppError::Io(format!("{}: {}", path.display(), e)))
    };

    let certs = rustls_pemfile::certs(&mut open(&paths.cert)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Config(format!("{}: {}", paths.cert.display(), e)))?;
    if certs.is_empty() {
        return Err(AppError::Config(format!(
            "{} contains no certificate",
            paths.cert.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut open(&paths.key)?)
        .map_err(|e| AppError::Config(format!("{}: {}", paths.key.display(), e)))?
        .ok_or_else(|| {
            AppError::Config(format!("{} contains no private key", paths.key.display()))
        })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::Config(format!("TLS setup failed: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::Config(format!("TLS key/certificate rejected: {}", e)))
}
