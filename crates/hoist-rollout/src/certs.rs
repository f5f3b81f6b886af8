//! Certificate issuing for allocations.
//!
//! Jobs that set `certificate = true` get a key pair per worker, signed by
//! a local certificate authority that lives under the state directory. A
//! pair is issued once and reused on later runs, so the rendered job tree
//! (and therefore its content hash) stays stable.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use hoist_core::Worker;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tracing::info;

const CA_CERT: &str = "ca.pem";
const CA_KEY: &str = "ca.key";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Certificate failures.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

/// PEM material copied into an allocation's `certs/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

/// Produces a certificate pair for a job on a worker.
pub trait CertificateIssuer: Send + Sync {
    fn issue(&self, job: &str, worker: &Worker) -> Result<IssuedCert, CertError>;

    /// Forget the pair issued for `job` on the worker at `worker_ip`, so a
    /// later `issue` mints a fresh one. Forgetting an unknown pair is a no-op.
    fn revoke(&self, job: &str, worker_ip: &str) -> Result<(), CertError>;
}

/// File-backed CA built with rcgen.
///
/// Nothing touches the disk until the first certificate is needed.
#[derive(Debug)]
pub struct LocalCa {
    dir: PathBuf,
    material: Mutex<Option<CaMaterial>>,
}

#[derive(Debug, Clone)]
struct CaMaterial {
    cert_pem: String,
    key_pem: String,
}

impl LocalCa {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            material: Mutex::new(None),
        }
    }

    /// Open the CA in `dir`, generating it now if it does not exist.
    pub fn open(dir: &Path) -> Result<Self, CertError> {
        let ca = Self::new(dir);
        ca.material()?;
        Ok(ca)
    }

    /// PEM of the CA certificate.
    pub fn ca_pem(&self) -> Result<String, CertError> {
        Ok(self.material()?.cert_pem)
    }

    fn material(&self) -> Result<CaMaterial, CertError> {
        let mut guard = self
            .material
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(material) = guard.as_ref() {
            return Ok(material.clone());
        }
        let material = load_or_generate(&self.dir)?;
        *guard = Some(material.clone());
        Ok(material)
    }

    fn issued_dir(&self, job: &str, worker: &str) -> PathBuf {
        self.dir.join("issued").join(job).join(worker)
    }

    fn generate(&self, job: &str, worker: &Worker) -> Result<IssuedCert, CertError> {
        let ca = self.material()?;
        let ca_key = KeyPair::from_pem(&ca.key_pem)?;
        // Same distinguished name and key as the stored CA certificate, so
        // leaves signed here chain to it.
        let ca_cert = ca_params().self_signed(&ca_key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "hoist");
        dn.push(DnType::CommonName, format!("{job}.{}", worker.ip));
        params.distinguished_name = dn;
        if let Ok(ip) = worker.ip.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        }
        params
            .subject_alt_names
            .push(rcgen::SanType::DnsName(job.to_string().try_into()?));
        params.not_after = rcgen::date_time_ymd(current_year() + 5, 1, 1);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &ca_cert, &ca_key)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_pem: ca.cert_pem,
        })
    }
}

fn load_or_generate(dir: &Path) -> Result<CaMaterial, CertError> {
    let cert_path = dir.join(CA_CERT);
    let key_path = dir.join(CA_KEY);

    if cert_path.is_file() && key_path.is_file() {
        return Ok(CaMaterial {
            cert_pem: read(&cert_path)?,
            key_pem: read(&key_path)?,
        });
    }

    let key = KeyPair::generate()?;
    let cert = ca_params().self_signed(&key)?;
    let material = CaMaterial {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    };
    write(&cert_path, &material.cert_pem)?;
    write_private(&key_path, &material.key_pem)?;
    info!(dir = %dir.display(), "generated local certificate authority");
    Ok(material)
}

impl CertificateIssuer for LocalCa {
    fn issue(&self, job: &str, worker: &Worker) -> Result<IssuedCert, CertError> {
        let dir = self.issued_dir(job, &worker.ip);
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if cert_path.is_file() && key_path.is_file() {
            return Ok(IssuedCert {
                cert_pem: read(&cert_path)?,
                key_pem: read(&key_path)?,
                ca_pem: self.ca_pem()?,
            });
        }

        let issued = self.generate(job, worker)?;
        fs::create_dir_all(&dir).map_err(|source| CertError::Io {
            path: dir.clone(),
            source,
        })?;
        write(&cert_path, &issued.cert_pem)?;
        write_private(&key_path, &issued.key_pem)?;
        info!(%job, worker = %worker.ip, "issued certificate");
        Ok(issued)
    }

    fn revoke(&self, job: &str, worker_ip: &str) -> Result<(), CertError> {
        let dir = self.issued_dir(job, worker_ip);
        if !dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&dir).map_err(|source| CertError::Io {
            path: dir.clone(),
            source,
        })?;
        // Drop the job directory once its last pair is gone.
        if let Some(job_dir) = dir.parent() {
            let empty = fs::read_dir(job_dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                fs::remove_dir(job_dir).map_err(|source| CertError::Io {
                    path: job_dir.to_path_buf(),
                    source,
                })?;
            }
        }
        info!(%job, worker = %worker_ip, "revoked certificate");
        Ok(())
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "hoist");
    dn.push(DnType::CommonName, "hoist local CA");
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(current_year() + 10, 1, 1);
    params
}

fn current_year() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    1970 + (secs / 31_556_952) as i32
}

fn read(path: &Path) -> Result<String, CertError> {
    fs::read_to_string(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), CertError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CertError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, contents).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_private(path: &Path, contents: &str) -> Result<(), CertError> {
    write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
            CertError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}
