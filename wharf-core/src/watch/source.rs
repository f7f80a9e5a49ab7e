//! inotify-backed event source.
//!
//! Watches are placed on the *parent directory* of every target so that
//! atomic replacement (write to a temp file, rename over the target) and
//! delete-then-recreate are observed. Events for names that are not
//! registered targets are dropped.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::decode::{MAX_RECORD_SIZE, RecordIter};
use super::mask::{Mask, Op};
use super::table::{WatchRequest, WatchTable};
use super::{WatchError, WatchEvent};

const READ_BUFFER_SIZE: usize = MAX_RECORD_SIZE * 64;

/// Bits every directory watch carries so the table notices the directory
/// going away even when no target asked for removal events.
const DIRECTORY_BITS: Mask = Mask::IN_DELETE_SELF
    .union(Mask::IN_MOVE_SELF)
    .union(Mask::IN_ONLYDIR);

/// Registered targets plus the descriptor their events arrive on.
pub struct EventSource {
    fd: AsyncFd<File>,
    table: Mutex<WatchTable>,
    closed: CancellationToken,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("EventSource")
            .field("fd", &self.fd.get_ref().as_raw_fd())
            .field("targets", &table.watched())
            .field("directories", &table.directory_count())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl EventSource {
    /// Create an inotify instance. Must be called inside a tokio runtime.
    pub fn open() -> Result<Self, WatchError> {
        // SAFETY: inotify_init1 takes only flags and has no memory-safety
        // preconditions.
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(WatchError::Init(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        let fd = AsyncFd::new(File::from(owned)).map_err(WatchError::Init)?;

        Ok(Self {
            fd,
            table: Mutex::new(WatchTable::default()),
            closed: CancellationToken::new(),
        })
    }

    /// Register `path` for the operations in `op`.
    ///
    /// The path is made absolute and lexically cleaned first; registering
    /// the same cleaned path twice fails with [`WatchError::AlreadyWatched`].
    /// The file itself may not exist yet, its parent directory must.
    pub fn add_watch(&self, path: impl AsRef<Path>, op: Op) -> Result<(), WatchError> {
        if self.closed.is_cancelled() {
            return Err(WatchError::Closed);
        }
        let fd = self.fd.get_ref().as_raw_fd();
        let path = path.as_ref();

        self.table.lock().register(path, op, |request| {
            let (dir, mask) = match request {
                WatchRequest::Create { dir, mask } => (dir, mask),
                WatchRequest::Widen { dir, mask } => (dir, mask | Mask::IN_MASK_ADD),
            };
            debug!(dir = %dir.display(), %mask, "adding directory watch");
            add_os_watch(fd, dir, mask | DIRECTORY_BITS)
        })?;

        debug!(target_path = %path.display(), %op, "watching");
        Ok(())
    }

    /// Registered targets, in registration order.
    pub fn watched(&self) -> Vec<PathBuf> {
        self.table.lock().watched()
    }

    /// Number of distinct directory watches in use.
    pub fn directory_count(&self) -> usize {
        self.table.lock().directory_count()
    }

    /// Read events until the source is closed or `tx`'s receiver is dropped.
    ///
    /// Returns [`WatchError::Closed`] after [`close`](Self::close) and `Ok`
    /// when the receiver went away.
    pub async fn watch(&self, tx: mpsc::Sender<WatchEvent>) -> Result<(), WatchError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(WatchError::Closed),
                ready = self.fd.readable() => {
                    let mut guard = ready.map_err(WatchError::Read)?;
                    guard.try_io(|inner| {
                        let mut file: &File = inner.get_ref();
                        file.read(&mut buf)
                    })
                }
            };

            let len = match read {
                Ok(Ok(len)) => len,
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(WatchError::Read(err)),
                Err(_would_block) => continue,
            };

            let (events, stale) = {
                let mut table = self.table.lock();
                translate(&mut table, &buf[..len])
            };
            for wd in stale {
                remove_os_watch(self.fd.get_ref().as_raw_fd(), wd);
            }

            for event in events {
                trace!(path = %event.path.display(), op = %event.op, mask = %event.mask, "event");
                if tx.send(event).await.is_err() {
                    debug!("event receiver dropped; stopping watch loop");
                    return Ok(());
                }
            }
        }
    }

    /// Remove every watch, clear the tables, and make [`watch`](Self::watch)
    /// return [`WatchError::Closed`]. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let fd = self.fd.get_ref().as_raw_fd();
        for wd in self.table.lock().drain() {
            remove_os_watch(fd, wd);
        }
        self.closed.cancel();
        debug!("event source closed");
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turn one read buffer into target events, updating the table for
/// directories that went away. Returns the events plus descriptors the kernel
/// may still hold.
pub(crate) fn translate(table: &mut WatchTable, bytes: &[u8]) -> (Vec<WatchEvent>, Vec<i32>) {
    let mut events = Vec::new();
    let mut stale = Vec::new();

    for record in RecordIter::new(bytes) {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "dropping rest of inotify buffer");
                break;
            }
        };

        if record.mask.contains(Mask::IN_Q_OVERFLOW) {
            warn!("inotify queue overflowed; treating every target as changed");
            events.extend(table.watched().into_iter().map(|path| WatchEvent {
                path,
                op: Op::empty(),
                mask: record.mask,
            }));
            continue;
        }

        if record.mask.contains(Mask::IN_IGNORED) {
            continue;
        }

        if record.name.is_empty() && record.mask.is_self_removal() {
            if let Some(dir) = table.dir_for(record.wd) {
                warn!(dir = %dir.display(), mask = %record.mask, "watched directory went away");
            }
            let op = Op::from_mask(record.mask);
            events.extend(table.remove_dir(record.wd).into_iter().map(|path| WatchEvent {
                path,
                op,
                mask: record.mask,
            }));
            if record.mask.contains(Mask::IN_MOVE_SELF) {
                stale.push(record.wd);
            }
            continue;
        }

        if let Some(path) = table.match_target(record.wd, record.name) {
            events.push(WatchEvent {
                path,
                op: Op::from_mask(record.mask),
                mask: record.mask,
            });
        }
    }

    (events, stale)
}

fn add_os_watch(fd: RawFd, dir: &Path, mask: Mask) -> io::Result<i32> {
    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let wd = unsafe { libc::inotify_add_watch(fd, c_path.as_ptr(), mask.bits()) };
    if wd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(wd)
    }
}

fn remove_os_watch(fd: RawFd, wd: i32) {
    // SAFETY: plain syscall on integers; an already removed watch yields EINVAL.
    let rc = unsafe { libc::inotify_rm_watch(fd, wd) };
    if rc < 0 {
        trace!(wd, error = %io::Error::last_os_error(), "inotify_rm_watch failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::decode::encode_record;

    fn table_with(targets: &[(&str, i32)]) -> WatchTable {
        let mut table = WatchTable::default();
        for (path, wd) in targets {
            let wd = *wd;
            table
                .register(Path::new(path), Op::REPLACE, move |_: WatchRequest<'_>| Ok(wd))
                .unwrap();
        }
        table
    }

    #[test]
    fn only_registered_names_produce_events() {
        let mut table = table_with(&[("/cfg/app.toml", 1)]);
        let mut buf = encode_record(1, Mask::IN_CLOSE_WRITE, 0, "app.toml", 16);
        buf.extend(encode_record(1, Mask::IN_CREATE, 0, ".app.toml.swp", 16));

        let (events, stale) = translate(&mut table, &buf);

        assert!(stale.is_empty());
        assert_eq!(
            events,
            vec![WatchEvent {
                path: PathBuf::from("/cfg/app.toml"),
                op: Op::CLOSE_WRITE,
                mask: Mask::IN_CLOSE_WRITE,
            }]
        );
    }

    #[test]
    fn ignored_records_are_dropped() {
        let mut table = table_with(&[("/cfg/app.toml", 1)]);
        let buf = encode_record(1, Mask::IN_IGNORED, 0, "", 0);

        let (events, _) = translate(&mut table, &buf);
        assert!(events.is_empty());
        assert_eq!(table.watched().len(), 1);
    }

    #[test]
    fn directory_removal_deregisters_its_targets() {
        let mut table = table_with(&[
            ("/tls/cert.pem", 2),
            ("/tls/key.pem", 2),
            ("/cfg/app.toml", 3),
        ]);
        let buf = encode_record(2, Mask::IN_DELETE_SELF, 0, "", 0);

        let (events, stale) = translate(&mut table, &buf);

        let paths: Vec<_> = events.iter().map(|event| event.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/tls/cert.pem"), PathBuf::from("/tls/key.pem")]);
        assert!(events.iter().all(|event| event.op == Op::REMOVE));
        assert!(stale.is_empty());
        assert_eq!(table.watched(), vec![PathBuf::from("/cfg/app.toml")]);
    }

    #[test]
    fn moved_directory_is_reported_stale() {
        let mut table = table_with(&[("/tls/cert.pem", 2)]);
        let buf = encode_record(2, Mask::IN_MOVE_SELF, 0, "", 0);

        let (events, stale) = translate(&mut table, &buf);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, Op::RENAME);
        assert_eq!(stale, vec![2]);
    }

    #[test]
    fn overflow_fans_out_to_every_target() {
        let mut table = table_with(&[("/a/one", 1), ("/b/two", 2)]);
        let buf = encode_record(-1, Mask::IN_Q_OVERFLOW, 0, "", 0);

        let (events, _) = translate(&mut table, &buf);

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.op.is_empty()));
    }

    #[test]
    fn truncated_tail_keeps_decoded_prefix() {
        let mut table = table_with(&[("/cfg/app.toml", 1)]);
        let mut buf = encode_record(1, Mask::IN_MOVED_TO, 0, "app.toml", 16);
        buf.extend_from_slice(&[1, 2, 3]);

        let (events, _) = translate(&mut table, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, Op::CREATE);
    }
}
