//! Local certificate authority for TLS interception.
//!
//! The CA is created on first use and persisted in the data directory as
//! `ca.pem` and `ca-key.pem` so the user only has to trust it once. The key
//! file is written with mode 0600.
//!
//! Leaf certificates are short-lived: issued ten minutes in the past (to
//! absorb clock skew) and valid for 23.5 hours. They are never written to
//! disk.

use super::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// CA certificate file name.
pub const CA_CERT_FILE: &str = "ca.pem";
/// CA private key file name.
pub const CA_KEY_FILE: &str = "ca-key.pem";

const CA_COMMON_NAME: &str = "Rashomon Local Root CA";
const CA_ORGANIZATION: &str = "Rashomon";
const CA_UNIT: &str = "Local Security Proxy";
const CA_VALIDITY_DAYS: i64 = 3650;

const LEAF_ORGANIZATION: &str = "Rashomon MITM";
const LEAF_BACKDATE: Duration = Duration::minutes(10);
const LEAF_LIFETIME: Duration = Duration::minutes(23 * 60 + 30);

/// A leaf certificate and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertBundle {
    pub domain: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// Names placed in the subjectAltName extension.
    pub subject_alt_names: Vec<String>,
}

impl CertBundle {
    /// Whether the certificate is still valid at `now`.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

/// The persisted signing authority.
pub struct CertificateAuthority {
    cert_path: PathBuf,
    key_path: PathBuf,
    key_pair: KeyPair,
    params: CertificateParams,
    cert_pem: String,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, creating it if either file is missing.
    pub fn load_or_create(dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(dir).map_err(|source| CaError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);
        if cert_path.exists() && key_path.exists() {
            Self::load(cert_path, key_path)
        } else {
            Self::create(cert_path, key_path)
        }
    }

    fn load(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, CaError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|source| CaError::ReadFile {
                path: path.to_path_buf(),
                source,
            })
        };
        let cert_pem = read(&cert_path)?;
        let key_pair =
            KeyPair::from_pem(&read(&key_path)?).map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        debug!(path = %cert_path.display(), "Loaded existing CA");
        Ok(Self {
            cert_path,
            key_path,
            key_pair,
            params: ca_params(),
            cert_pem,
        })
    }

    fn create(cert_path: PathBuf, key_path: PathBuf) -> Result<Self, CaError> {
        info!(path = %cert_path.display(), "Generating local CA certificate");

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = ca_params();
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .clone()
            .self_signed(&key_pair)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;
        let cert_pem = cert.pem();

        fs::write(&cert_path, &cert_pem).map_err(|source| CaError::WriteFile {
            path: cert_path.clone(),
            source,
        })?;
        fs::set_permissions(&cert_path, fs::Permissions::from_mode(0o644)).map_err(|source| {
            CaError::WriteFile {
                path: cert_path.clone(),
                source,
            }
        })?;
        write_restricted_file(&key_path, &key_pair.serialize_pem())?;

        Ok(Self {
            cert_path,
            key_path,
            key_pair,
            params,
            cert_pem,
        })
    }

    /// Path to the CA certificate, for trust store import.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issue a leaf certificate for `domain`.
    pub fn issue_leaf(&self, domain: &str) -> Result<CertBundle, CaError> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return Err(CaError::InvalidName(domain));
        }

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(domain.clone()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(LEAF_ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let names = leaf_names(&domain);
        params.subject_alt_names = names
            .iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => name
                    .as_str()
                    .try_into()
                    .map(SanType::DnsName)
                    .map_err(|_| CaError::InvalidName(name.clone())),
            })
            .collect::<Result<_, _>>()?;

        let now = OffsetDateTime::now_utc();
        let (not_before, not_after) = (now - LEAF_BACKDATE, now + LEAF_LIFETIME);
        params.not_before = not_before;
        params.not_after = not_after;

        let issuer = Issuer::from_params(&self.params, &self.key_pair);
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;

        debug!(domain = %domain, sans = ?names, "Issued leaf certificate");
        Ok(CertBundle {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_before,
            not_after,
            subject_alt_names: names,
            domain,
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

/// CA parameters. The subject must be identical across restarts because
/// leaves name it as their issuer.
fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(CA_COMMON_NAME.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(CA_ORGANIZATION.to_string()),
    );
    dn.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String(CA_UNIT.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

/// Subject alternative names for a leaf: the exact name plus a wildcard for
/// its parent (or for itself when it has only two labels). IP literals get
/// only themselves.
pub fn leaf_names(domain: &str) -> Vec<String> {
    if domain.parse::<IpAddr>().is_ok() {
        return vec![domain.to_string()];
    }
    let labels: Vec<&str> = domain.split('.').collect();
    match labels.len() {
        0 | 1 => vec![domain.to_string()],
        2 => vec![domain.to_string(), format!("*.{domain}")],
        _ => vec![domain.to_string(), format!("*.{}", labels[1..].join("."))],
    }
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let to_err = |source| CaError::WriteFile {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(to_err)?;
    file.write_all(content.as_bytes()).map_err(to_err)?;
    Ok(())
}
