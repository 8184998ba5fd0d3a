//! OS helpers: OOM score, subreaper, owned unix listeners and the bundle
//! `address` file.

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, ShimError};

/// BSDs cap `sun_path` at 104 bytes.
pub const SOCKET_PATH_LIMIT: usize = 104;
pub const OOM_SCORE_ADJ_MAX: i32 = 1000;
pub const ADDRESS_FILE: &str = "address";

const LISTENER_MODE: u32 = 0o660;
const LISTENER_DIR_MODE: u32 = 0o770;

/// Reads `/proc/<pid>/oom_score_adj`.
pub fn get_oom_score_adj(pid: u32) -> Result<i32> {
    let path = format!("/proc/{pid}/oom_score_adj");
    let data = fs::read_to_string(&path).map_err(|e| ShimError::socket("read", &path, e))?;
    data.trim()
        .parse()
        .map_err(|e| ShimError::Config(format!("invalid oom score in {path}: {e}")))
}

/// Gives `pid` an OOM score one above our parent's, capped at the maximum,
/// so the engine is killed after its shims.
pub fn adjust_oom_score(pid: u32) -> Result<()> {
    let parent = std::os::unix::process::parent_id();
    let score = get_oom_score_adj(parent)?;
    let shim_score = (score + 1).min(OOM_SCORE_ADJ_MAX);
    let path = format!("/proc/{pid}/oom_score_adj");
    fs::write(&path, shim_score.to_string()).map_err(|e| ShimError::socket("write", &path, e))?;
    debug!(pid, score = shim_score, "Adjusted OOM score");
    Ok(())
}

/// Marks this process as a child subreaper so orphaned descendants are
/// reparented here. Linux only; elsewhere it does nothing.
#[cfg(target_os = "linux")]
pub fn set_subreaper() -> Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER takes a plain integer argument.
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_subreaper() -> Result<()> {
    Ok(())
}

/// Binds a unix socket at `path`, replacing any stale entry.
pub fn create_unix_socket(path: &Path) -> Result<UnixListener> {
    let len = path.as_os_str().len();
    if len > SOCKET_PATH_LIMIT {
        return Err(ShimError::Config(format!(
            "{}: unix socket path too long ({len} > {SOCKET_PATH_LIMIT})",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(LISTENER_MODE)
            .create(parent)
            .map_err(|e| ShimError::socket("mkdir", parent, e))?;
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ShimError::socket("unlink", path, e)),
    }
    UnixListener::bind(path).map_err(|e| ShimError::socket("bind", path, e))
}

/// What to do when chown of a freshly created socket is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChownPolicy {
    /// Any chown failure closes the listener and is returned.
    #[default]
    Strict,
    /// A permission-denied chown is accepted when running as non-root and the
    /// socket is already owned by the requested uid/gid.
    AcceptIfAlreadyOwned,
}

impl ChownPolicy {
    fn accepts(
        self,
        err: &io::Error,
        is_root: bool,
        owner: Option<(u32, u32)>,
        uid: u32,
        gid: u32,
    ) -> bool {
        match self {
            ChownPolicy::Strict => false,
            ChownPolicy::AcceptIfAlreadyOwned => {
                !is_root
                    && err.kind() == io::ErrorKind::PermissionDenied
                    && owner == Some((uid, gid))
            }
        }
    }
}

/// Creates a unix listener at `path` owned by `uid:gid` with mode 0660.
pub fn get_local_listener(
    path: &Path,
    uid: u32,
    gid: u32,
    policy: ChownPolicy,
) -> Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        mkdir_as(parent, uid, gid)?;
    }

    let listener = create_unix_socket(path)?;

    if let Err(e) = fs::set_permissions(path, Permissions::from_mode(LISTENER_MODE)) {
        drop(listener);
        return Err(ShimError::socket("chmod", path, e));
    }

    if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        // SAFETY: getuid cannot fail.
        let is_root = unsafe { libc::getuid() } == 0;
        let owner = fs::metadata(path).ok().map(|m| (m.uid(), m.gid()));
        if policy.accepts(&e, is_root, owner, uid, gid) {
            warn!(
                path = %path.display(),
                "Ignoring EPERM from chown, socket is already owned by {}:{}", uid, gid
            );
            return Ok(listener);
        }
        drop(listener);
        return Err(ShimError::socket("chown", path, e));
    }

    Ok(listener)
}

/// Creates `path` owned by `uid:gid` unless it already exists.
fn mkdir_as(path: &Path, uid: u32, gid: u32) -> Result<()> {
    match fs::metadata(path) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ShimError::socket("stat", path, e)),
    }
    DirBuilder::new()
        .recursive(true)
        .mode(LISTENER_DIR_MODE)
        .create(path)
        .map_err(|e| ShimError::socket("mkdir", path, e))?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .map_err(|e| ShimError::socket("chown", path, e))
}

/// fd a parent passes a pre-bound listener on.
pub const INHERITED_LISTENER_FD: RawFd = 3;

/// Adopts `fd` as a listener if it is a listening socket.
///
/// Returns `None` when `fd` is closed or anything but a listening socket, so
/// callers can fall back to binding their own.
pub fn inherited_listener(fd: RawFd) -> Option<UnixListener> {
    // SAFETY: fstat only writes into `stat`.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return None;
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return None;
    }

    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `accepting` and `len` outlive the call and `len` matches its size.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut accepting as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 || accepting == 0 {
        return None;
    }

    debug!(fd, "Using inherited listener");
    // SAFETY: `fd` is an open listening socket nothing else in this process owns.
    Some(unsafe { UnixListener::from_raw_fd(fd) })
}

/// Reads the socket address recorded in `path`.
pub fn read_address(path: &Path) -> Result<String> {
    let data = fs::read_to_string(path).map_err(|e| ShimError::socket("read address", path, e))?;
    Ok(data.trim().to_string())
}

/// Records `address` in `path`, replacing it atomically.
pub fn write_address(path: &Path, address: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| ShimError::socket("create", &tmp, e))?;
    file.write_all(address.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| ShimError::socket("write", &tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| ShimError::socket("rename", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_ids() -> (u32, u32) {
        unsafe { (libc::getuid(), libc::getgid()) }
    }

    #[test]
    fn test_address_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ADDRESS_FILE);
        write_address(&path, "unix:///run/s/abc").unwrap();
        write_address(&path, "unix:///run/s/def").unwrap();
        assert_eq!(read_address(&path).unwrap(), "unix:///run/s/def");
        assert!(!dir.path().join("address.tmp").exists());
    }

    #[test]
    fn test_read_missing_address_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_address(&dir.path().join(ADDRESS_FILE)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_unix_socket_rejects_long_paths() {
        let path = Path::new("/tmp").join("x".repeat(SOCKET_PATH_LIMIT));
        let err = create_unix_socket(&path).unwrap_err();
        assert!(matches!(err, ShimError::Config(_)));
    }

    #[test]
    fn test_create_unix_socket_replaces_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("s.sock");
        let first = create_unix_socket(&path).unwrap();
        drop(first);
        let _second = create_unix_socket(&path).unwrap();
    }

    #[test]
    fn test_get_local_listener_owned_by_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned").join("l.sock");
        let (uid, gid) = current_ids();

        let _listener = get_local_listener(&path, uid, gid, ChownPolicy::default()).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o660);
        assert_eq!((meta.uid(), meta.gid()), (uid, gid));
    }

    #[test]
    fn test_chown_policy() {
        let eperm = io::Error::from(io::ErrorKind::PermissionDenied);
        let other = io::Error::from(io::ErrorKind::NotFound);

        assert!(!ChownPolicy::Strict.accepts(&eperm, false, Some((501, 20)), 501, 20));

        let policy = ChownPolicy::AcceptIfAlreadyOwned;
        assert!(policy.accepts(&eperm, false, Some((501, 20)), 501, 20));
        assert!(!policy.accepts(&eperm, true, Some((501, 20)), 501, 20));
        assert!(!policy.accepts(&eperm, false, Some((501, 0)), 501, 20));
        assert!(!policy.accepts(&eperm, false, None, 501, 20));
        assert!(!policy.accepts(&other, false, Some((501, 20)), 501, 20));
    }

    #[test]
    fn test_inherited_listener_rejects_non_listeners() {
        use std::os::unix::io::AsRawFd;

        let file = tempfile::tempfile().unwrap();
        assert!(inherited_listener(file.as_raw_fd()).is_none());
        assert!(inherited_listener(-1).is_none());
    }

    #[test]
    fn test_inherited_listener_adopts_listening_socket() {
        use std::os::unix::io::IntoRawFd;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.sock");
        let fd = UnixListener::bind(&path).unwrap().into_raw_fd();
        let listener = inherited_listener(fd).unwrap();
        assert!(listener.local_addr().is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_get_oom_score_adj_of_self() {
        let score = get_oom_score_adj(std::process::id()).unwrap();
        assert!((-1000..=OOM_SCORE_ADJ_MAX).contains(&score));
    }
}
