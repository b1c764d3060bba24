//! Exclusive session slots.
//!
//! Two processes appending to the same session would fork its log, so each
//! `(account, slot)` pair is guarded by a lock file created with
//! `create_new` and holding the owner's pid. A lock whose owner process is
//! gone is reclaimed. A slot remembers its session id, so a restarted
//! process keeps appending to the same session.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use cosync_core::{ActorId, CoId, SessionId};

use crate::error::{NodeError, Result};

/// A held session slot. Released on drop.
#[derive(Debug)]
pub struct SessionLock {
    account: CoId,
    slot: usize,
    session: SessionId,
    path: PathBuf,
    _file: File,
}

impl SessionLock {
    /// Take `slot` of `account`, failing with
    /// [`NodeError::SessionLocked`] if another holder has it.
    pub fn acquire(dir: impl AsRef<Path>, account: CoId, slot: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let base = format!("{}_{}", account, slot);
        let path = dir.join(format!("{}.lock", base));

        let mut file = match open_new(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_holder(&path);
                match holder {
                    Some(pid) if !pid_is_alive(pid) => {
                        warn!(
                            "Reclaiming slot {} of {} from exited process {}",
                            slot, account, pid
                        );
                        match fs::remove_file(&path) {
                            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                            _ => {}
                        }
                        open_new(&path).map_err(|e| match e.kind() {
                            io::ErrorKind::AlreadyExists => NodeError::SessionLocked {
                                account,
                                slot,
                                holder: read_holder(&path),
                            },
                            _ => e.into(),
                        })?
                    }
                    _ => return Err(NodeError::SessionLocked { account, slot, holder }),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let session = writeln!(file, "{}", std::process::id())
            .map_err(NodeError::from)
            .and_then(|_| recorded_session(&dir.join(format!("{}.session", base)), account));
        match session {
            Ok(session) => {
                debug!("Locked slot {} of {}", slot, account);
                Ok(Self {
                    account,
                    slot,
                    session,
                    path,
                    _file: file,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Take the first free slot below `max_slots`.
    pub fn acquire_free(dir: impl AsRef<Path>, account: CoId, max_slots: usize) -> Result<Self> {
        for slot in 0..max_slots {
            match Self::acquire(dir.as_ref(), account, slot) {
                Err(NodeError::SessionLocked { .. }) => continue,
                other => return other,
            }
        }
        Err(NodeError::InvalidOperation(format!(
            "all {} session slots of {} are locked",
            max_slots, account
        )))
    }

    pub fn account(&self) -> CoId {
        self.account
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

fn open_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Pid written to a lock file, if it is readable yet.
fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check if a pid is alive using `kill(pid, 0)`.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

/// The session recorded at `record`, or a new one written there.
fn recorded_session(record: &Path, account: CoId) -> Result<SessionId> {
    let actor = ActorId::Account(account);
    match fs::read_to_string(record) {
        Ok(text) => match text.trim().parse::<SessionId>() {
            Ok(session) if session.actor() == actor => return Ok(session),
            _ => warn!("Ignoring unusable session record {}", record.display()),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let session = SessionId::new_random(&actor);
    fs::write(record, session.as_str())?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let account = CoId([1; 32]);
        let _held = SessionLock::acquire(dir.path(), account, 0).unwrap();
        assert!(matches!(
            SessionLock::acquire(dir.path(), account, 0),
            Err(NodeError::SessionLocked { slot: 0, holder: Some(pid), .. })
                if pid == std::process::id()
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_of_exited_process_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let account = CoId([1; 32]);
        let first = SessionLock::acquire(dir.path(), account, 0).unwrap();
        let session = first.session_id().clone();
        std::mem::forget(first);

        // Pretend the holder was a process that has since exited.
        let path = dir.path().join(format!("{}_0.lock", account));
        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();

        let lock = SessionLock::acquire(dir.path(), account, 0).unwrap();
        assert_eq!(lock.session_id(), &session);
        assert_eq!(read_holder(&path), Some(std::process::id()));
    }

    #[test]
    fn test_unreadable_holder_keeps_slot_locked() {
        let dir = tempfile::tempdir().unwrap();
        let account = CoId([1; 32]);
        fs::write(dir.path().join(format!("{}_0.lock", account)), "").unwrap();
        assert!(matches!(
            SessionLock::acquire(dir.path(), account, 0),
            Err(NodeError::SessionLocked { holder: None, .. })
        ));
    }

    #[test]
    fn test_slot_reuses_session_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let account = CoId([1; 32]);
        let first = SessionLock::acquire(dir.path(), account, 0).unwrap();
        let session = first.session_id().clone();
        drop(first);

        let again = SessionLock::acquire(dir.path(), account, 0).unwrap();
        assert_eq!(again.session_id(), &session);
        assert_eq!(session.actor(), ActorId::Account(account));
    }

    #[test]
    fn test_free_slot_skips_held() {
        let dir = tempfile::tempdir().unwrap();
        let account = CoId([1; 32]);
        let a = SessionLock::acquire_free(dir.path(), account, 2).unwrap();
        let b = SessionLock::acquire_free(dir.path(), account, 2).unwrap();
        assert_eq!((a.slot(), b.slot()), (0, 1));
        assert_ne!(a.session_id(), b.session_id());
        assert!(SessionLock::acquire_free(dir.path(), account, 2).is_err());
    }

    #[test]
    fn test_garbage_record_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let account = CoId([1; 32]);
        fs::write(dir.path().join(format!("{}_0.session", account)), "nonsense").unwrap();
        let lock = SessionLock::acquire(dir.path(), account, 0).unwrap();
        assert_eq!(lock.session_id().actor(), ActorId::Account(account));
    }
}
