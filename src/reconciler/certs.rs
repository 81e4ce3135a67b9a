//! Certificate files referenced by the proxy configuration.
//!
//! # Responsibilities
//! - Turn in-memory TLS material into files the proxy can load
//! - Reuse files for material already written
//! - Never delete files the committed configuration points at

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::snapshot::TlsMaterial;

/// Number of distinct materials whose files are kept on disk.
const RETAINED_MATERIALS: usize = 8;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files backing one TLS material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// Leaf certificate followed by its private key.
    pub certificate: PathBuf,
    /// Concatenated CA bundle.
    pub ca_file: PathBuf,
}

impl CertPaths {
    pub fn certificate_str(&self) -> String {
        self.certificate.to_string_lossy().into_owned()
    }

    pub fn ca_file_str(&self) -> String {
        self.ca_file.to_string_lossy().into_owned()
    }
}

/// Resolves TLS material to proxy-loadable file paths.
pub trait CertStore: Send + Sync {
    fn certs_path(&self, tls: &TlsMaterial) -> Result<CertPaths, CertError>;

    /// Called after each commit with the materials the proxy now uses.
    fn retain_committed(&self, _committed: &[&TlsMaterial]) {}
}

#[derive(Debug, Default)]
struct Written {
    /// Oldest first.
    files: VecDeque<(TlsMaterial, CertPaths)>,
    committed: Vec<TlsMaterial>,
}

impl Written {
    /// Drop the oldest uncommitted files until the cache is back in bounds.
    /// `newest` is never a candidate.
    fn evict(&mut self) -> Vec<CertPaths> {
        let mut evicted = Vec::new();
        while self.files.len() > RETAINED_MATERIALS {
            let candidates = self.files.len() - 1;
            let Some(pos) = self
                .files
                .iter()
                .take(candidates)
                .position(|(m, _)| !self.committed.contains(m))
            else {
                break;
            };
            if let Some((_, paths)) = self.files.remove(pos) {
                evicted.push(paths);
            }
        }
        evicted
    }
}

/// Writes certificate bundles under a directory.
#[derive(Debug)]
pub struct FileCertStore {
    dir: PathBuf,
    written: Mutex<Written>,
}

impl FileCertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CertError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            written: Mutex::new(Written::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, tls: &TlsMaterial) -> Result<CertPaths, CertError> {
        let id = uuid::Uuid::new_v4();
        let paths = CertPaths {
            certificate: self.dir.join(format!("{}.pem", id)),
            ca_file: self.dir.join(format!("{}-ca.pem", id)),
        };

        let mut bundle = tls.cert.clone();
        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(&tls.key);
        fs::write(&paths.certificate, &bundle)?;

        let mut cas = Vec::new();
        for ca in &tls.cas {
            cas.extend_from_slice(ca);
            if !cas.ends_with(b"\n") {
                cas.push(b'\n');
            }
        }
        fs::write(&paths.ca_file, &cas)?;

        tracing::debug!(certificate = ?paths.certificate, ca_file = ?paths.ca_file, "Wrote certificate files");
        Ok(paths)
    }
}

impl CertStore for FileCertStore {
    fn certs_path(&self, tls: &TlsMaterial) -> Result<CertPaths, CertError> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, paths)) = written.files.iter().find(|(m, _)| m == tls) {
            return Ok(paths.clone());
        }

        let paths = self.write(tls)?;
        written.files.push_back((tls.clone(), paths.clone()));
        for old in written.evict() {
            for path in [&old.certificate, &old.ca_file] {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!(path = ?path, error = %e, "Failed to remove stale certificate file");
                }
            }
        }
        Ok(paths)
    }

    fn retain_committed(&self, committed: &[&TlsMaterial]) {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written.committed = committed.iter().map(|m| (*m).clone()).collect();
    }
}
