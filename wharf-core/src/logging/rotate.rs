//! Size-bounded log writer with timestamped backups.
//!
//! The active segment lives at the configured path. When a write would push
//! it past `max_size` it is renamed to `<stem>-<timestamp><ext>` and a fresh
//! segment is opened with the old permission mode. Each rotation kicks off a
//! single-flight background pass enforcing the [`RetentionPolicy`].

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use super::cleanup::{self, CleanupError, RetentionPolicy, SegmentNames};

/// Default maximum size of the active segment.
pub const DEFAULT_MAX_SIZE: u64 = 8 << 20;

const DEFAULT_MODE: u32 = 0o644;

/// Invoked with the first deletion error and the first compression error of
/// a background cleanup pass.
pub type CleanupCallback = Arc<dyn Fn(&CleanupError) + Send + Sync>;

/// Settings for a [`RotatingWriter`].
#[derive(Clone)]
pub struct RotateOptions {
    /// Path of the active segment.
    pub path: PathBuf,
    /// Maximum size in bytes of the active segment.
    pub max_size: u64,
    pub retention: RetentionPolicy,
    /// Written at the start of every new segment.
    pub header: Option<String>,
    pub on_cleanup_failed: Option<CleanupCallback>,
}

impl RotateOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: DEFAULT_MAX_SIZE,
            retention: RetentionPolicy::default(),
            header: None,
            on_cleanup_failed: None,
        }
    }
}

impl fmt::Debug for RotateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotateOptions")
            .field("path", &self.path)
            .field("max_size", &self.max_size)
            .field("retention", &self.retention)
            .field("header", &self.header)
            .field("on_cleanup_failed", &self.on_cleanup_failed.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    #[error("write length {len} exceeds maximum file size {max}")]
    WriteTooLarge { len: u64, max: u64 },

    #[error("can't make directories for new logfile {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error getting log file info for {}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't rename log file to {}", to.display())]
    Rename {
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't open new logfile {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't write to log file")]
    Write(#[source] io::Error),
}

impl From<RotateError> for io::Error {
    fn from(err: RotateError) -> Self {
        match err {
            RotateError::WriteTooLarge { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            other => io::Error::other(other),
        }
    }
}

#[derive(Debug, Default)]
struct Active {
    file: Option<File>,
    size: u64,
    last_backup: Option<DateTime<Utc>>,
    /// Set by a rotation; the cleanup pass starts once the lock is released.
    cleanup_due: bool,
}

struct Inner {
    path: PathBuf,
    names: SegmentNames,
    max_size: u64,
    retention: RetentionPolicy,
    header: Option<String>,
    on_cleanup_failed: Option<CleanupCallback>,
    active: Mutex<Active>,
    cleanup: Mutex<()>,
}

/// Cloneable handle to one rotating log file.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Inner>,
}

impl fmt::Debug for RotatingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.inner.active.lock();
        f.debug_struct("RotatingWriter")
            .field("path", &self.inner.path)
            .field("max_size", &self.inner.max_size)
            .field("size", &active.size)
            .field("open", &active.file.is_some())
            .finish()
    }
}

impl RotatingWriter {
    /// Create a writer. Nothing touches the disk until the first write.
    ///
    /// A header that leaves no room for data in a fresh segment is dropped.
    pub fn new(options: RotateOptions) -> Self {
        let max_size = if options.max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            options.max_size
        };
        let header = options
            .header
            .filter(|header| !header.is_empty() && (header.len() as u64) < max_size);
        Self {
            inner: Arc::new(Inner {
                names: SegmentNames::new(&options.path),
                path: options.path,
                max_size,
                retention: options.retention,
                header,
                on_cleanup_failed: options.on_cleanup_failed,
                active: Mutex::new(Active::default()),
                cleanup: Mutex::new(()),
            }),
        }
    }

    /// Path of the active segment.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Bytes in the active segment, as far as this writer knows.
    pub fn size(&self) -> u64 {
        self.inner.active.lock().size
    }

    /// Append `buf` to the active segment, rotating first when it would not
    /// fit. A write that would not fit a fresh segment, header included, is
    /// rejected.
    pub fn write_bytes(&self, buf: &[u8]) -> Result<usize, RotateError> {
        let mut active = self.inner.active.lock();
        let result = self.inner.write_locked(&mut active, buf);
        let due = std::mem::take(&mut active.cleanup_due);
        drop(active);
        if due {
            self.inner.spawn_cleanup();
        }
        result
    }

    /// Rotate now, regardless of size.
    pub fn rotate(&self) -> Result<(), RotateError> {
        let mut active = self.inner.active.lock();
        let result = self
            .inner
            .rotate_locked(&mut active)
            .map(|file| active.file = Some(file));
        let due = std::mem::take(&mut active.cleanup_due);
        drop(active);
        if due {
            self.inner.spawn_cleanup();
        }
        result
    }

    /// Flush and close the active segment. A later write reopens it.
    pub fn close(&self) -> io::Result<()> {
        let mut active = self.inner.active.lock();
        match active.file.take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_all()
            }
            None => Ok(()),
        }
    }

    /// Run a retention pass on the calling thread, waiting for an in-flight
    /// background pass to finish first. Returns the first error hit.
    pub fn run_cleanup(&self) -> Result<(), CleanupError> {
        let _guard = self.inner.cleanup.lock();
        match cleanup::run_pass(&self.inner.names, &self.inner.retention)
            .into_errors()
            .next()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Inner {
    fn header_len(&self) -> u64 {
        self.header.as_ref().map_or(0, |header| header.len() as u64)
    }

    fn write_locked(&self, active: &mut Active, buf: &[u8]) -> Result<usize, RotateError> {
        let len = buf.len() as u64;
        if self.header_len() + len > self.max_size {
            return Err(RotateError::WriteTooLarge {
                len,
                max: self.max_size,
            });
        }

        let file = match active.file.take() {
            Some(file) if active.size + len <= self.max_size => file,
            Some(file) => {
                drop(file);
                self.rotate_locked(active)?
            }
            None => self.open_existing_or_new(active, len)?,
        };

        let file = active.file.insert(file);
        let written = file.write(buf).map_err(RotateError::Write)?;
        active.size += written as u64;
        Ok(written)
    }

    fn open_existing_or_new(&self, active: &mut Active, len: u64) -> Result<File, RotateError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.open_new(active),
            Err(source) => {
                return Err(RotateError::Stat {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if meta.len() + len > self.max_size {
            return self.rotate_locked(active);
        }

        match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => {
                active.size = meta.len();
                Ok(file)
            }
            Err(_) => self.open_new(active),
        }
    }

    fn rotate_locked(&self, active: &mut Active) -> Result<File, RotateError> {
        if let Some(mut file) = active.file.take() {
            let _ = file.flush();
        }
        let file = self.open_new(active)?;
        active.cleanup_due = true;
        Ok(file)
    }

    /// Move any existing active segment to a backup name and start an empty
    /// one with the same mode.
    fn open_new(&self, active: &mut Active) -> Result<File, RotateError> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| RotateError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut mode = DEFAULT_MODE;
        if let Ok(meta) = fs::metadata(&self.path) {
            mode = meta.permissions().mode();
            let to = self.next_backup_path(active);
            fs::rename(&self.path, &to).map_err(|source| RotateError::Rename { to, source })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&self.path)
            .map_err(|source| RotateError::Open {
                path: self.path.clone(),
                source,
            })?;
        active.size = 0;

        if let Some(header) = self.header.as_deref() {
            file.write_all(header.as_bytes())
                .map_err(RotateError::Write)?;
            active.size += header.len() as u64;
        }
        Ok(file)
    }

    /// Backup name for "now", bumped by a millisecond while it collides with
    /// an existing file or the previous backup.
    fn next_backup_path(&self, active: &mut Active) -> PathBuf {
        let now = Utc::now();
        let mut taken = now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now);
        if let Some(last) = active.last_backup
            && taken <= last
        {
            taken = last + TimeDelta::milliseconds(1);
        }

        let mut path = self.names.backup_path(taken);
        while path.exists() || compressed_sibling(&path).exists() {
            taken += TimeDelta::milliseconds(1);
            path = self.names.backup_path(taken);
        }
        active.last_backup = Some(taken);
        path
    }

    fn spawn_cleanup(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        if let Err(err) = thread::Builder::new()
            .name("wharf-log-cleanup".into())
            .spawn(move || inner.try_cleanup())
        {
            // Retried on the next rotation.
            tracing::warn!(error = %err, "can't start log cleanup thread");
        }
    }

    /// Single-flight: returns immediately if another pass is running.
    fn try_cleanup(&self) {
        let Some(_guard) = self.cleanup.try_lock() else {
            return;
        };
        let outcome = cleanup::run_pass(&self.names, &self.retention);
        if let Some(callback) = &self.on_cleanup_failed {
            for err in outcome.into_errors() {
                callback(&err);
            }
        }
    }
}

fn compressed_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(cleanup::COMPRESS_SUFFIX);
    PathBuf::from(name)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.active.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn writer(dir: &TempDir, max_size: u64) -> RotatingWriter {
        let mut options = RotateOptions::new(dir.path().join("messages.log"));
        options.max_size = max_size;
        RotatingWriter::new(options)
    }

    fn backups(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "messages.log")
            .collect();
        names.sort();
        names
    }

    #[test]
    fn fills_to_the_limit_without_rotating() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, 100);

        writer.write_bytes(&[b'a'; 60]).unwrap();
        writer.write_bytes(&[b'b'; 40]).unwrap();

        assert_eq!(writer.size(), 100);
        assert!(backups(&dir).is_empty());
    }

    #[test]
    fn rotates_before_overflowing_write() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, 100);

        writer.write_bytes(&[b'a'; 90]).unwrap();
        writer.write_bytes(&[b'b'; 20]).unwrap();

        assert_eq!(writer.size(), 20);
        assert_eq!(fs::read(writer.path()).unwrap(), vec![b'b'; 20]);
        let backups = backups(&dir);
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(dir.path().join(&backups[0])).unwrap(), vec![b'a'; 90]);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, 10);

        let err = writer.write_bytes(&[0; 11]).unwrap_err();
        assert!(matches!(err, RotateError::WriteTooLarge { len: 11, max: 10 }));
        assert!(!writer.path().exists());
    }

    #[test]
    fn reuses_existing_file_with_room() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("messages.log"), "earlier\n").unwrap();
        let writer = writer(&dir, 100);

        writer.write_bytes(b"later\n").unwrap();

        assert_eq!(fs::read_to_string(writer.path()).unwrap(), "earlier\nlater\n");
        assert_eq!(writer.size(), 14);
        assert!(backups(&dir).is_empty());
    }

    #[test]
    fn existing_file_filled_exactly_is_appended() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("messages.log"), [b'x'; 95]).unwrap();
        let writer = writer(&dir, 100);

        writer.write_bytes(&[b'y'; 5]).unwrap();

        assert_eq!(writer.size(), 100);
        assert!(backups(&dir).is_empty());
    }

    #[test]
    fn full_existing_file_is_rotated_on_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("messages.log"), [b'x'; 96]).unwrap();
        let writer = writer(&dir, 100);

        writer.write_bytes(&[b'y'; 5]).unwrap();

        assert_eq!(writer.size(), 5);
        assert_eq!(backups(&dir).len(), 1);
    }

    #[test]
    fn back_to_back_rotations_get_distinct_names() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, 100);
        writer.write_bytes(b"one").unwrap();

        writer.rotate().unwrap();
        writer.rotate().unwrap();
        writer.rotate().unwrap();

        assert_eq!(backups(&dir).len(), 3);
    }

    #[test]
    fn new_segment_keeps_mode_and_header() {
        let dir = TempDir::new().unwrap();
        let mut options = RotateOptions::new(dir.path().join("messages.log"));
        options.header = Some("# wharf\n".into());
        let writer = RotatingWriter::new(options);

        writer.write_bytes(b"first\n").unwrap();
        fs::set_permissions(writer.path(), fs::Permissions::from_mode(0o600)).unwrap();
        writer.rotate().unwrap();

        let mode = fs::metadata(writer.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read_to_string(writer.path()).unwrap(), "# wharf\n");
        assert_eq!(writer.size(), 8);
    }

    #[test]
    fn header_that_fills_the_segment_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut options = RotateOptions::new(dir.path().join("messages.log"));
        options.max_size = 4;
        options.header = Some("HDR\n".into());
        let writer = RotatingWriter::new(options);

        writer.write_bytes(b"abcd").unwrap();

        assert_eq!(fs::read_to_string(writer.path()).unwrap(), "abcd");
    }

    #[test]
    fn cleanup_request_during_a_pass_is_dropped() {
        let dir = TempDir::new().unwrap();
        for stamp in ["00", "01", "02"] {
            let name = format!("messages-2026-01-01T00-00-{stamp}.000.log");
            fs::write(dir.path().join(name), "old").unwrap();
        }
        let mut options = RotateOptions::new(dir.path().join("messages.log"));
        options.retention.max_backups = 1;
        let writer = RotatingWriter::new(options);

        let running = writer.inner.cleanup.lock();
        writer.inner.try_cleanup();
        assert_eq!(backups(&dir).len(), 3);

        drop(running);
        writer.inner.try_cleanup();
        assert_eq!(
            backups(&dir),
            vec!["messages-2026-01-01T00-00-02.000.log".to_string()]
        );
    }

    #[test]
    fn close_then_write_reopens() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, 100);

        writer.write_all(b"before\n").unwrap();
        writer.close().unwrap();
        writer.write_all(b"after\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(writer.path()).unwrap(), "before\nafter\n");
    }
}
