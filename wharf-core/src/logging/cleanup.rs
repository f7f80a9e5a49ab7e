//! Retention and compression of backup segments.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

/// Timestamp embedded in backup names: fixed width, sorts lexically.
pub const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Suffix appended to compressed backups.
pub const COMPRESS_SUFFIX: &str = ".zst";

/// What to keep among backup segments. The active segment is never touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many backups; `0` keeps all of them.
    pub max_backups: usize,
    /// Delete backups older than this; `None` keeps them regardless of age.
    pub max_age: Option<Duration>,
    /// zstd-compress backups that survive retention.
    pub compress: bool,
}

impl RetentionPolicy {
    fn is_noop(&self) -> bool {
        self.max_backups == 0 && self.max_age.is_none() && !self.compress
    }
}

/// Failures of one cleanup pass.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("can't read log directory {}", dir.display())]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't remove old log file {}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't compress log file {}", path.display())]
    Compress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A backup file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Backup {
    pub(crate) name: String,
    pub(crate) taken: DateTime<Utc>,
}

impl Backup {
    fn is_compressed(&self) -> bool {
        self.name.ends_with(COMPRESS_SUFFIX)
    }

    /// Name with the compression suffix removed, so a plain/compressed pair
    /// maps to the same key.
    fn logical_name(&self) -> &str {
        self.name.strip_suffix(COMPRESS_SUFFIX).unwrap_or(&self.name)
    }
}

/// Naming of the active segment and its backups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentNames {
    pub(crate) dir: PathBuf,
    /// File name without extension, e.g. `messages`.
    pub(crate) stem: String,
    /// Extension including the dot, e.g. `.log`, or empty.
    pub(crate) ext: String,
}

impl SegmentNames {
    pub(crate) fn new(path: &Path) -> Self {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        Self { dir, stem, ext }
    }

    pub(crate) fn backup_path(&self, taken: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}-{}{}",
            self.stem,
            taken.format(BACKUP_TIME_FORMAT),
            self.ext
        ))
    }

    /// Timestamp of a backup file name, or `None` if `name` is not one of
    /// ours.
    pub(crate) fn parse_backup(&self, name: &str) -> Option<DateTime<Utc>> {
        let rest = name.strip_prefix(&self.stem)?.strip_prefix('-')?;
        let rest = rest.strip_suffix(COMPRESS_SUFFIX).unwrap_or(rest);
        let stamp = rest.strip_suffix(&self.ext)?;
        NaiveDateTime::parse_from_str(stamp, BACKUP_TIME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Backups on disk, newest first.
    pub(crate) fn list_backups(&self) -> Result<Vec<Backup>, CleanupError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CleanupError::ReadDir {
            dir: self.dir.clone(),
            source,
        })?;

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(taken) = self.parse_backup(&name) {
                backups.push(Backup { name, taken });
            }
        }

        backups.sort_by(|a, b| b.taken.cmp(&a.taken).then_with(|| b.name.cmp(&a.name)));
        Ok(backups)
    }
}

/// Work decided for one pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Plan {
    pub(crate) remove: Vec<Backup>,
    pub(crate) compress: Vec<Backup>,
}

/// Decide removals and compressions for `backups` (newest first).
pub(crate) fn plan(backups: Vec<Backup>, policy: &RetentionPolicy, now: DateTime<Utc>) -> Plan {
    let mut plan = Plan::default();
    let mut files = backups;

    if policy.max_backups > 0 {
        let mut seen = HashSet::new();
        let mut remaining = Vec::with_capacity(files.len());
        for backup in files {
            seen.insert(backup.logical_name().to_owned());
            if seen.len() > policy.max_backups {
                plan.remove.push(backup);
            } else {
                remaining.push(backup);
            }
        }
        files = remaining;
    }

    let cutoff = policy
        .max_age
        .and_then(|age| TimeDelta::from_std(age).ok())
        .and_then(|age| now.checked_sub_signed(age));
    if let Some(cutoff) = cutoff {
        let (expired, remaining): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|backup| backup.taken < cutoff);
        plan.remove.extend(expired);
        files = remaining;
    }

    if policy.compress {
        plan.compress = files.into_iter().filter(|backup| !backup.is_compressed()).collect();
    }

    plan
}

/// Errors a pass ran into. Only the first of each kind is kept; the pass
/// carries on after every failure.
#[derive(Debug, Default)]
pub(crate) struct PassOutcome {
    pub(crate) listing: Option<CleanupError>,
    pub(crate) remove: Option<CleanupError>,
    pub(crate) compress: Option<CleanupError>,
}

impl PassOutcome {
    pub(crate) fn into_errors(self) -> impl Iterator<Item = CleanupError> {
        [self.listing, self.remove, self.compress].into_iter().flatten()
    }
}

/// Run one retention + compression pass over the backups of `names`.
pub(crate) fn run_pass(names: &SegmentNames, policy: &RetentionPolicy) -> PassOutcome {
    let mut outcome = PassOutcome::default();
    if policy.is_noop() {
        return outcome;
    }

    let backups = match names.list_backups() {
        Ok(backups) => backups,
        Err(err) => {
            outcome.listing = Some(err);
            return outcome;
        }
    };

    let plan = plan(backups, policy, Utc::now());

    for backup in &plan.remove {
        let path = names.dir.join(&backup.name);
        if let Err(source) = fs::remove_file(&path) {
            outcome
                .remove
                .get_or_insert(CleanupError::Remove { path, source });
        }
    }

    for backup in &plan.compress {
        let path = names.dir.join(&backup.name);
        if let Err(source) = compress_file(&path) {
            outcome
                .compress
                .get_or_insert(CleanupError::Compress { path, source });
        }
    }

    outcome
}

/// Compress `src` into `src.zst` with the same permission mode, removing the
/// partial output on failure and the source on success.
pub(crate) fn compress_file(src: &Path) -> io::Result<()> {
    let mut dst_name = src.as_os_str().to_owned();
    dst_name.push(COMPRESS_SUFFIX);
    let dst = PathBuf::from(dst_name);

    match write_compressed(src, &dst) {
        Ok(()) => fs::remove_file(src),
        Err(err) => {
            let _ = fs::remove_file(&dst);
            Err(err)
        }
    }
}

fn write_compressed(src: &Path, dst: &Path) -> io::Result<()> {
    let mode = fs::metadata(src)?.permissions().mode();
    let mut input = File::open(src)?;
    let output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(dst)?;

    let mut encoder = zstd::stream::write::Encoder::new(output, 0)?;
    io::copy(&mut input, &mut encoder)?;
    let output = encoder.finish()?;
    output.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn names() -> SegmentNames {
        SegmentNames::new(Path::new("/var/log/wharf/messages.log"))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn backup(secs: i64, compressed: bool) -> Backup {
        let mut name = names()
            .backup_path(at(secs))
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        if compressed {
            name.push_str(COMPRESS_SUFFIX);
        }
        Backup { name, taken: at(secs) }
    }

    #[test]
    fn backup_names_round_trip_through_parser() {
        let names = names();
        let taken = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + TimeDelta::milliseconds(42);
        let path = names.backup_path(taken);

        assert_eq!(
            path,
            PathBuf::from("/var/log/wharf/messages-2024-03-09T07-05-01.042.log")
        );
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(names.parse_backup(name), Some(taken));
        assert_eq!(names.parse_backup(&format!("{name}.zst")), Some(taken));
    }

    #[test]
    fn foreign_names_are_ignored() {
        let names = names();
        assert_eq!(names.parse_backup("messages.log"), None);
        assert_eq!(names.parse_backup("other-2024-03-09T07-05-01.042.log"), None);
        assert_eq!(names.parse_backup("messages-yesterday.log"), None);
        assert_eq!(names.parse_backup("messages-2024-03-09T07-05-01.042.txt"), None);
    }

    #[test]
    fn count_retention_drops_the_oldest() {
        let backups = vec![
            backup(40, false),
            backup(30, false),
            backup(20, false),
            backup(10, false),
        ];
        let policy = RetentionPolicy {
            max_backups: 2,
            ..RetentionPolicy::default()
        };

        let plan = plan(backups, &policy, at(50));

        assert_eq!(plan.remove, vec![backup(20, false), backup(10, false)]);
        assert!(plan.compress.is_empty());
    }

    #[test]
    fn compressed_pair_counts_once() {
        let backups = vec![
            backup(30, true),
            backup(30, false),
            backup(20, true),
            backup(10, false),
        ];
        let policy = RetentionPolicy {
            max_backups: 2,
            ..RetentionPolicy::default()
        };

        let plan = plan(backups, &policy, at(50));

        assert_eq!(plan.remove, vec![backup(10, false)]);
    }

    #[test]
    fn age_retention_ignores_count() {
        let backups = vec![backup(3590, false), backup(100, false), backup(0, true)];
        let policy = RetentionPolicy {
            max_age: Some(Duration::from_secs(3600)),
            ..RetentionPolicy::default()
        };

        let plan = plan(backups, &policy, at(3700));

        assert_eq!(plan.remove, vec![backup(0, true)]);
    }

    #[test]
    fn survivors_are_compressed_once() {
        let backups = vec![backup(30, false), backup(20, true), backup(10, false)];
        let policy = RetentionPolicy {
            max_backups: 2,
            compress: true,
            ..RetentionPolicy::default()
        };

        let plan = plan(backups, &policy, at(50));

        assert_eq!(plan.remove, vec![backup(10, false)]);
        assert_eq!(plan.compress, vec![backup(30, false)]);
    }

    #[test]
    fn compress_file_replaces_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("messages-2024-03-09T07-05-01.042.log");
        fs::write(&src, "line one\nline two\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();

        compress_file(&src).unwrap();

        let dst = dir.path().join("messages-2024-03-09T07-05-01.042.log.zst");
        assert!(!src.exists());
        let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        let restored = zstd::decode_all(File::open(&dst).unwrap()).unwrap();
        assert_eq!(restored, b"line one\nline two\n");
    }

    #[test]
    fn failed_compression_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.log");

        assert!(compress_file(&src).is_err());
        assert!(!dir.path().join("missing.log.zst").exists());
    }
}
