//! Content digest deciding whether a change is material.
//!
//! Raw bytes are compared rather than parsed values, so a rewrite with
//! identical content (or a touch) never restarts anything while any byte
//! difference in a certificate, key or the effective configuration does.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Produces the configuration bytes that feed the digest.
///
/// Implementations must not fail: an absent or unreadable file is
/// represented by the defaults.
pub trait CanonicalConfig: Send + Sync {
    /// Canonical byte form of the configuration stored at `path`.
    fn canonical_bytes(&self, path: &Path) -> Vec<u8>;
}

impl<F> CanonicalConfig for F
where
    F: Fn(&Path) -> Vec<u8> + Send + Sync,
{
    fn canonical_bytes(&self, path: &Path) -> Vec<u8> {
        self(path)
    }
}

/// SHA-256 over every watched target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// `true` when the two digests differ.
    pub fn changed(previous: &Fingerprint, current: &Fingerprint) -> bool {
        previous != current
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..12])
    }
}

/// Result of one computation.
#[derive(Debug)]
pub struct FingerprintReport {
    pub fingerprint: Fingerprint,
    /// Targets that could not be read and did not contribute.
    pub skipped: Vec<(PathBuf, io::Error)>,
}

/// Computes [`Fingerprint`]s for a configuration file plus other targets.
#[derive(Clone)]
pub struct Fingerprinter {
    config_path: PathBuf,
    config: Arc<dyn CanonicalConfig>,
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl Fingerprinter {
    pub fn new(config_path: impl Into<PathBuf>, config: Arc<dyn CanonicalConfig>) -> Self {
        Self {
            config_path: config_path.into(),
            config,
        }
    }

    /// Digest the canonical configuration, then every entry of `targets`
    /// other than the configuration path, in the order given.
    pub fn compute(&self, targets: &[PathBuf]) -> FingerprintReport {
        let mut hasher = Sha256::new();
        feed(&mut hasher, &self.config.canonical_bytes(&self.config_path));

        let mut skipped = Vec::new();
        for target in targets.iter().filter(|target| **target != self.config_path) {
            match fs::read(target) {
                Ok(bytes) => feed(&mut hasher, &bytes),
                Err(err) => {
                    warn!(
                        path = %target.display(),
                        error = %err,
                        "skipping unreadable watch target"
                    );
                    skipped.push((target.clone(), err));
                }
            }
        }

        FingerprintReport {
            fingerprint: Fingerprint(hasher.finalize().into()),
            skipped,
        }
    }
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Remembers the last fingerprint and reports material changes.
#[derive(Debug)]
pub struct ChangeDetector {
    fingerprinter: Fingerprinter,
    previous: Fingerprint,
}

impl ChangeDetector {
    /// Take the baseline fingerprint of `targets`.
    pub fn new(fingerprinter: Fingerprinter, targets: &[PathBuf]) -> Self {
        let previous = fingerprinter.compute(targets).fingerprint;
        debug!(fingerprint = %previous, "baseline fingerprint");
        Self {
            fingerprinter,
            previous,
        }
    }

    pub fn current(&self) -> Fingerprint {
        self.previous
    }

    /// Recompute and return `true` when the content changed. The new value
    /// becomes the baseline either way.
    pub fn recheck(&mut self, targets: &[PathBuf]) -> bool {
        let current = self.fingerprinter.compute(targets).fingerprint;
        let changed = Fingerprint::changed(&self.previous, &current);
        debug!(previous = %self.previous, %current, changed, "fingerprint recheck");
        self.previous = current;
        changed
    }
}
