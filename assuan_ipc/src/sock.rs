//! Socket rendezvous: Unix sockets, the loopback emulation with its nonce
//! file, redirect files and peer credentials.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rand::RngCore;
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hooks::{self, SystemHooks};

/// Size of the socket emulation nonce.
pub const NONCE_LEN: usize = 16;

/// Magic first line of a redirect file.
const REDIRECT_MAGIC: &[u8] = b"%Assuan%\n";

/// Rendezvous files are tiny; anything larger is not one of ours.
const MAX_RENDEZVOUS_FILE: u64 = 1024;

/// Random value that authenticates a peer of an emulated socket.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SockNonce([u8; NONCE_LEN]);

impl SockNonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        SockNonce(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        SockNonce(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Compare without an early exit.
    pub fn matches(&self, received: &[u8]) -> bool {
        received.len() == NONCE_LEN
            && self
                .0
                .iter()
                .zip(received)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl fmt::Debug for SockNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SockNonce(..)")
    }
}

/// Credentials of a Unix socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    /// Not available on every platform
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

/// Get the credentials of the peer connected to the given socket
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_credentials(fd: BorrowedFd<'_>) -> io::Result<PeerCred> {
    let creds = nix::sys::socket::getsockopt(&fd, nix::sys::socket::sockopt::PeerCredentials)
        .map_err(io::Error::from)?;
    Ok(PeerCred {
        pid: Some(creds.pid()),
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

/// Get the credentials of the peer connected to the given socket
#[cfg(target_os = "macos")]
pub fn peer_credentials(fd: BorrowedFd<'_>) -> io::Result<PeerCred> {
    use std::os::fd::AsRawFd;

    // SAFETY: `xucred` is plain old data and the kernel fills at most
    // `xucred_size` bytes of it.
    let creds = unsafe {
        let mut xucred = std::mem::MaybeUninit::<libc::xucred>::uninit();
        let mut xucred_size = std::mem::size_of::<libc::xucred>() as libc::socklen_t;

        let ret = libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_LOCAL,
            libc::LOCAL_PEERCRED,
            xucred.as_mut_ptr() as *mut libc::c_void,
            &mut xucred_size,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        xucred.assume_init()
    };
    Ok(PeerCred {
        pid: None,
        uid: creds.cr_uid,
        gid: if creds.cr_ngroups > 0 {
            creds.cr_groups[0]
        } else {
            0
        },
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
pub fn peer_credentials(_fd: BorrowedFd<'_>) -> io::Result<PeerCred> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Where a socket name points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Unix(PathBuf),
    Emulated { port: u16, nonce: SockNonce },
}

/// Expand `${NAME}` references from the environment. Unset variables
/// expand to nothing; an unterminated reference is kept literally.
pub(crate) fn expand_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                if let Ok(value) = std::env::var(&after[..end]) {
                    out.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_redirect(content: &[u8]) -> Result<PathBuf> {
    let text = String::from_utf8_lossy(&content[REDIRECT_MAGIC.len()..]);
    text.lines()
        .find_map(|line| line.strip_prefix("socket="))
        .map(|value| PathBuf::from(expand_env(value.trim_end())))
        .ok_or_else(|| Error::ConnectFailed("redirect file names no socket".to_string()))
}

fn parse_emulated(content: &[u8]) -> Result<Endpoint> {
    let invalid = || Error::ConnectFailed("malformed socket emulation file".to_string());
    let newline = content.iter().position(|&b| b == b'\n').ok_or_else(invalid)?;
    let port = std::str::from_utf8(&content[..newline])
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|&p| p != 0)
        .ok_or_else(invalid)?;
    let nonce: [u8; NONCE_LEN] = content[newline + 1..].try_into().map_err(|_| invalid())?;
    Ok(Endpoint::Emulated {
        port,
        nonce: SockNonce(nonce),
    })
}

/// Resolve a socket name. A regular file is either a redirect (followed
/// once) or an emulation file; anything else is taken as a Unix socket.
pub(crate) fn resolve_endpoint(path: &Path) -> Result<Endpoint> {
    resolve_inner(path, true)
}

fn resolve_inner(path: &Path, follow_redirect: bool) -> Result<Endpoint> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            return Err(Error::ConnectFailed(format!(
                "{}: {}",
                path.display(),
                err
            )))
        }
    };
    if metadata.file_type().is_socket() || !metadata.is_file() {
        return Ok(Endpoint::Unix(path.to_path_buf()));
    }
    if metadata.len() > MAX_RENDEZVOUS_FILE {
        return Err(Error::ConnectFailed(format!(
            "{}: not a socket file",
            path.display()
        )));
    }
    let content = fs::read(path).map_err(|e| Error::ConnectFailed(e.to_string()))?;
    if content.starts_with(REDIRECT_MAGIC) {
        if !follow_redirect {
            return Err(Error::ConnectFailed("nested socket redirect".to_string()));
        }
        let target = parse_redirect(&content)?;
        debug!(target: "assuan::sysio", from = %path.display(), to = %target.display(), "following socket redirect");
        return resolve_inner(&target, false);
    }
    parse_emulated(&content)
}

/// Loopback address of an emulated socket.
pub(crate) fn loopback(port: u16) -> SockAddr {
    SockAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
}

/// Read the nonce from a fresh connection and compare it.
pub(crate) fn check_nonce(hooks: &dyn SystemHooks, fd: BorrowedFd<'_>, nonce: &SockNonce) -> Result<()> {
    let mut received = [0u8; NONCE_LEN];
    hooks::read_exact(hooks, fd, &mut received)
        .map_err(|e| Error::AcceptFailed(format!("reading nonce: {}", e)))?;
    if !nonce.matches(&received) {
        return Err(Error::AcceptFailed("nonce mismatch".to_string()));
    }
    Ok(())
}

/// A rendezvous point for a socket server.
///
/// The socket (or emulation) file is removed when the listener is dropped.
#[derive(Debug)]
pub struct SocketListener {
    fd: OwnedFd,
    path: PathBuf,
    nonce: Option<SockNonce>,
}

impl SocketListener {
    /// Listen on a Unix socket at `path`, replacing a stale socket file.
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Ok(metadata) = fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                return Err(Error::Parameter(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
            fs::remove_file(path)?;
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(128)?;

        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)?;

        info!(target: "assuan::sysio", path = %path.display(), "listening on unix socket");
        Ok(SocketListener {
            fd: OwnedFd::from(socket),
            path: path.to_path_buf(),
            nonce: None,
        })
    }

    /// Listen on a loopback TCP port and publish the port and a fresh nonce
    /// in the file at `path`.
    pub fn bind_emulated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.bind(&loopback(0))?;
        socket.listen(128)?;
        let port = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .ok_or_else(|| Error::General("listening socket has no port".to_string()))?;

        let nonce = SockNonce::generate();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(format!("{}\n", port).as_bytes())?;
        file.write_all(nonce.as_bytes())?;
        file.sync_all()?;

        info!(target: "assuan::sysio", path = %path.display(), port, "listening on emulated socket");
        Ok(SocketListener {
            fd: OwnedFd::from(socket),
            path: path.to_path_buf(),
            nonce: Some(nonce),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The nonce peers must present; `None` for Unix sockets.
    pub fn nonce(&self) -> Option<SockNonce> {
        self.nonce
    }

    pub fn is_emulated(&self) -> bool {
        self.nonce.is_some()
    }

    /// Duplicate the listening descriptor, e.g. for `init_socket_server`.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }

    /// Accept one connection, verifying the nonce of emulated sockets.
    /// A peer with a wrong nonce is disconnected and reported as
    /// [`Error::AcceptFailed`].
    pub fn accept_authenticated(&self, hooks: &dyn SystemHooks) -> Result<OwnedFd> {
        let (socket, _) = SockRef::from(&self.fd)
            .accept()
            .map_err(|e| Error::AcceptFailed(e.to_string()))?;
        let fd = OwnedFd::from(socket);
        if let Some(nonce) = &self.nonce {
            if let Err(err) = check_nonce(hooks, fd.as_fd(), nonce) {
                warn!(target: "assuan::sysio", "rejected connection: {}", err);
                let _ = hooks.close(fd);
                return Err(err);
            }
        }
        Ok(fd)
    }
}

impl AsFd for SocketListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        // Clean up the rendezvous file when the listener is dropped
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn nonce_comparison() {
        let nonce = SockNonce::from_bytes([7u8; NONCE_LEN]);
        assert!(nonce.matches(&[7u8; NONCE_LEN]));
        assert!(!nonce.matches(&[8u8; NONCE_LEN]));
        assert!(!nonce.matches(&[7u8; NONCE_LEN - 1]));
        assert_ne!(SockNonce::generate(), SockNonce::generate());
        assert_eq!(format!("{:?}", nonce), "SockNonce(..)");
    }

    #[test]
    fn emulation_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("S.emulated");
        let listener = SocketListener::bind_emulated(&path).unwrap();

        match resolve_endpoint(&path).unwrap() {
            Endpoint::Emulated { port, nonce } => {
                assert_ne!(port, 0);
                assert_eq!(Some(nonce), listener.nonce());
            }
            other => panic!("unexpected endpoint {:?}", other),
        }

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn malformed_emulation_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("S.bad");
        fs::write(&path, b"12345\nshort").unwrap();
        assert!(matches!(resolve_endpoint(&path), Err(Error::ConnectFailed(_))));
        fs::write(&path, b"no newline").unwrap();
        assert!(matches!(resolve_endpoint(&path), Err(Error::ConnectFailed(_))));
    }

    #[test]
    fn redirect_is_followed_once() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("S.real");
        let listener = SocketListener::bind_unix(&socket_path).unwrap();

        std::env::set_var("ASSUAN_TEST_SOCKDIR", dir.path());
        let redirect = dir.path().join("S.redirect");
        fs::write(&redirect, b"%Assuan%\nsocket=${ASSUAN_TEST_SOCKDIR}/S.real\n").unwrap();
        assert_eq!(
            resolve_endpoint(&redirect).unwrap(),
            Endpoint::Unix(socket_path.clone())
        );

        let chained = dir.path().join("S.chained");
        fs::write(&chained, b"%Assuan%\nsocket=${ASSUAN_TEST_SOCKDIR}/S.redirect\n").unwrap();
        assert!(matches!(resolve_endpoint(&chained), Err(Error::ConnectFailed(_))));
        drop(listener);
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("ASSUAN_TEST_HOME", "/home/x");
        assert_eq!(expand_env("${ASSUAN_TEST_HOME}/S.agent"), "/home/x/S.agent");
        assert_eq!(expand_env("${ASSUAN_TEST_UNSET_VAR}/a"), "/a");
        assert_eq!(expand_env("${broken"), "${broken");
        assert_eq!(expand_env("plain"), "plain");
    }

    #[test]
    fn unix_listener_replaces_stale_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("S.unix");
        let first = SocketListener::bind_unix(&path).unwrap();
        std::mem::forget(first);
        let second = SocketListener::bind_unix(&path).unwrap();
        assert!(!second.is_emulated());
        assert_eq!(resolve_endpoint(&path).unwrap(), Endpoint::Unix(path.clone()));

        let regular = dir.path().join("regular");
        fs::write(&regular, b"data").unwrap();
        assert!(matches!(SocketListener::bind_unix(&regular), Err(Error::Parameter(_))));
    }

    #[test]
    fn peer_credentials_of_socketpair() {
        let (a, _b) = crate::hooks::NativeHooks.socketpair().unwrap();
        let cred = peer_credentials(a.as_fd()).unwrap();
        // SAFETY: getuid has no preconditions.
        assert_eq!(cred.uid, unsafe { libc::getuid() });
    }
}
