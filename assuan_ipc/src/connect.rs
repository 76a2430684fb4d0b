//! Establishing connections: pipe servers, spawned servers and sockets.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Once;

use bitflags::bitflags;
use nix::sys::signal::{signal, SigHandler, Signal};
use socket2::{Domain, SockAddr};
use tracing::{debug, info, warn};

use crate::context::{Channel, Context, ContextFlag, ContextState, Role};
use crate::error::{Error, Result};
use crate::fdpass;
use crate::hooks::{self, SpawnRequest, SystemHooks};
use crate::sock::{self, Endpoint, SockNonce};

/// Environment variable carrying the socket descriptor handed to a child
/// started with [`PipeConnectFlags::FD_PASSING`].
pub const ENV_CONNECTION_FD: &str = "_assuan_connection_fd";

/// Environment variable carrying the pid of the process that spawned us.
pub const ENV_PIPE_CONNECT_PID: &str = "_assuan_pipe_connect_pid";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PipeConnectFlags: u32 {
        /// Connect over a socketpair that allows descriptor passing
        const FD_PASSING = 1;
        /// Start the server in its own session
        const DETACHED = 128;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketServerFlags: u32 {
        /// Allow descriptor passing
        const FD_PASSING = 1;
        /// The descriptor is an accepted connection, not a listener
        const ACCEPTED = 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketConnectFlags: u32 {
        /// Allow descriptor passing
        const FD_PASSING = 1;
    }
}

/// A server process started by [`Context::pipe_connect`].
///
/// An owning handle reaps the process when the context is released; a
/// non-owning one leaves that to the caller.
#[derive(Debug)]
pub struct ChildProcess {
    pid: i32,
    owned: bool,
    status: Option<i32>,
}

impl ChildProcess {
    pub(crate) fn new(pid: i32, owned: bool) -> Self {
        ChildProcess {
            pid,
            owned,
            status: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Exit status once the process has been reaped.
    pub fn exit_status(&self) -> Option<i32> {
        self.status
    }

    /// Wait for the process. Reaps at most once; non-owning handles never
    /// wait.
    pub(crate) fn reap(&mut self, hooks: &dyn SystemHooks) -> io::Result<Option<i32>> {
        if !self.owned || self.status.is_some() {
            return Ok(self.status);
        }
        self.status = hooks.waitpid(self.pid, false)?;
        debug!(target: "assuan::sysio", pid = self.pid, status = ?self.status, "reaped server process");
        Ok(self.status)
    }
}

static FIX_SIGNALS: Once = Once::new();

/// Ignore SIGPIPE unless the application installed its own handler, so a
/// vanished peer shows up as a write error.
fn fix_signals() {
    FIX_SIGNALS.call_once(|| {
        // SAFETY: no Rust signal handler is installed, only SIG_IGN or the
        // handler that was already in place.
        unsafe {
            match signal(Signal::SIGPIPE, SigHandler::SigIgn) {
                Ok(SigHandler::SigDfl) => {}
                Ok(previous) => {
                    let _ = signal(Signal::SIGPIPE, previous);
                }
                Err(err) => warn!(target: "assuan::sysio", "cannot ignore SIGPIPE: {}", err),
            }
        }
    });
}

fn pid_from_env() -> Option<i32> {
    std::env::var(ENV_PIPE_CONNECT_PID)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|&pid| pid > 0)
}

impl Context {
    /// Make this context the server end of a pipe connection.
    ///
    /// With `None`, a descriptor named by `_assuan_connection_fd` is used
    /// as a descriptor-passing socket if present, else stdin and stdout.
    pub fn init_pipe_server(&mut self, fds: Option<(OwnedFd, OwnedFd)>) -> Result<()> {
        let mut fd_passing = false;
        let channel = match fds {
            Some((inbound, outbound)) => Channel::Pipe { inbound, outbound },
            None => match std::env::var(ENV_CONNECTION_FD) {
                Ok(value) => {
                    let raw: RawFd = value.trim().parse().map_err(|_| {
                        Error::Parameter(format!("invalid {} value '{}'", ENV_CONNECTION_FD, value))
                    })?;
                    fd_passing = true;
                    Channel::Socket {
                        fd: fdpass::adopt_inherited_fd(self, raw)?,
                    }
                }
                Err(_) => Channel::Pipe {
                    inbound: io::stdin().as_fd().try_clone_to_owned()?,
                    outbound: io::stdout().as_fd().try_clone_to_owned()?,
                },
            },
        };
        self.init_server(channel);
        self.server.inherits_fds = true;
        self.fd_passing = fd_passing;
        self.peer_pid = pid_from_env();
        debug!(target: "assuan::engine", fd_passing, peer_pid = ?self.peer_pid, "pipe server initialised");
        Ok(())
    }

    /// Spawn `program` as a server and connect to it.
    ///
    /// Only `keep_fds` (besides the connection) stay open in the child. The
    /// child is reaped on release unless [`ContextFlag::NoWaitpid`] is set.
    pub fn pipe_connect<S: AsRef<std::ffi::OsStr>>(
        &mut self,
        program: &Path,
        args: &[S],
        keep_fds: &[RawFd],
        flags: PipeConnectFlags,
    ) -> Result<()> {
        if !self.flag(ContextFlag::NoFixSignals) {
            fix_signals();
        }
        let hooks = self.hooks_arc();
        let args: Vec<OsString> = args.iter().map(|a| a.as_ref().to_os_string()).collect();
        let mut env = vec![(
            ENV_PIPE_CONNECT_PID.to_string(),
            std::process::id().to_string(),
        )];
        let mut keep: Vec<RawFd> = keep_fds.to_vec();

        let (channel, fd_passing, pid) = if flags.contains(PipeConnectFlags::FD_PASSING) {
            let (ours, theirs) = hooks.socketpair()?;
            env.push((ENV_CONNECTION_FD.to_string(), theirs.as_raw_fd().to_string()));
            keep.push(theirs.as_raw_fd());
            let pid = hooks
                .spawn(SpawnRequest {
                    program,
                    args: &args,
                    stdin: None,
                    stdout: None,
                    keep_fds: &keep,
                    env,
                    detached: flags.contains(PipeConnectFlags::DETACHED),
                })
                .map_err(|e| Error::ConnectFailed(format!("{}: {}", program.display(), e)))?;
            let _ = hooks.close(theirs);
            (Channel::Socket { fd: ours }, true, pid)
        } else {
            let (child_in, to_child) = hooks.pipe()?;
            let (from_child, child_out) = hooks.pipe()?;
            let pid = hooks
                .spawn(SpawnRequest {
                    program,
                    args: &args,
                    stdin: Some(child_in),
                    stdout: Some(child_out),
                    keep_fds: &keep,
                    env,
                    detached: flags.contains(PipeConnectFlags::DETACHED),
                })
                .map_err(|e| Error::ConnectFailed(format!("{}: {}", program.display(), e)))?;
            (
                Channel::Pipe {
                    inbound: from_child,
                    outbound: to_child,
                },
                false,
                pid,
            )
        };

        self.attach(channel, Role::Client);
        self.fd_passing = fd_passing;
        self.peer_pid = Some(pid);
        self.child = Some(ChildProcess::new(pid, !self.flag(ContextFlag::NoWaitpid)));
        info!(target: "assuan::engine", pid, program = %program.display(), "started server");

        if let Err(err) = self.read_greeting() {
            self.release();
            return Err(err);
        }
        Ok(())
    }

    /// Make this context a socket server.
    ///
    /// `fd` is a listening socket, or with [`SocketServerFlags::ACCEPTED`]
    /// an already accepted connection.
    pub fn init_socket_server(&mut self, fd: OwnedFd, flags: SocketServerFlags) -> Result<()> {
        if flags.contains(SocketServerFlags::ACCEPTED) {
            let peer = sock::peer_credentials(fd.as_fd()).ok();
            self.init_server(Channel::Socket { fd });
            self.peer_cred = peer;
        } else {
            self.init_server(Channel::Detached);
            self.listener = Some(fd);
            self.set_state(ContextState::Idle);
        }
        self.fd_passing = flags.contains(SocketServerFlags::FD_PASSING);
        debug!(target: "assuan::engine", ?flags, "socket server initialised");
        Ok(())
    }

    /// Nonce that connecting peers must present (emulated sockets only).
    pub fn set_sock_nonce(&mut self, nonce: Option<SockNonce>) {
        self.nonce = nonce;
    }

    /// Connect to the server listening at `name`.
    ///
    /// `name` may carry a `file://` prefix and may be a Unix socket, a
    /// redirect file or a socket emulation file.
    pub fn socket_connect(
        &mut self,
        name: &str,
        server_pid: Option<i32>,
        flags: SocketConnectFlags,
    ) -> Result<()> {
        let path = Path::new(name.strip_prefix("file://").unwrap_or(name));
        let hooks = self.hooks_arc();
        let connect_failed = |e: io::Error| Error::ConnectFailed(format!("{}: {}", path.display(), e));

        let (fd, unix) = match sock::resolve_endpoint(path)? {
            Endpoint::Unix(target) => {
                let fd = hooks.socket(Domain::UNIX)?;
                let addr = SockAddr::unix(&target).map_err(connect_failed)?;
                hooks.connect(fd.as_fd(), &addr).map_err(connect_failed)?;
                (fd, true)
            }
            Endpoint::Emulated { port, nonce } => {
                let fd = hooks.socket(Domain::IPV4)?;
                hooks
                    .connect(fd.as_fd(), &sock::loopback(port))
                    .map_err(connect_failed)?;
                hooks::write_all(hooks.as_ref(), fd.as_fd(), nonce.as_bytes())
                    .map_err(connect_failed)?;
                (fd, false)
            }
        };

        let fd_passing = flags.contains(SocketConnectFlags::FD_PASSING) && unix;
        if flags.contains(SocketConnectFlags::FD_PASSING) && !unix {
            debug!(target: "assuan::engine", "descriptor passing unavailable on emulated socket");
        }
        self.connect_socket(fd, fd_passing)?;
        if server_pid.is_some() {
            self.peer_pid = server_pid;
        }
        Ok(())
    }

    /// Use an already connected socket as the client end.
    pub fn socket_connect_fd(&mut self, fd: OwnedFd, flags: SocketConnectFlags) -> Result<()> {
        self.connect_socket(fd, flags.contains(SocketConnectFlags::FD_PASSING))
    }

    fn connect_socket(&mut self, fd: OwnedFd, fd_passing: bool) -> Result<()> {
        let peer = sock::peer_credentials(fd.as_fd()).ok();
        self.attach(Channel::Socket { fd }, Role::Client);
        self.fd_passing = fd_passing;
        self.peer_cred = peer;
        if let Err(err) = self.read_greeting() {
            self.detach();
            self.set_state(ContextState::Idle);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NativeHooks;

    #[test]
    fn child_is_reaped_once() {
        let hooks = NativeHooks;
        let args = [OsString::from("-c"), OsString::from("exit 7")];
        let pid = hooks
            .spawn(SpawnRequest {
                program: Path::new("/bin/sh"),
                args: &args,
                stdin: None,
                stdout: None,
                keep_fds: &[],
                env: Vec::new(),
                detached: false,
            })
            .unwrap();
        let mut child = ChildProcess::new(pid, true);
        assert_eq!(child.reap(&hooks).unwrap(), Some(7));
        // A second reap does not call waitpid again.
        assert_eq!(child.reap(&hooks).unwrap(), Some(7));
        assert_eq!(child.exit_status(), Some(7));
    }

    #[test]
    fn non_owning_handle_never_waits() {
        let mut child = ChildProcess::new(1, false);
        assert_eq!(child.reap(&NativeHooks).unwrap(), None);
        assert!(!child.is_owned());
    }

    #[test]
    fn spawn_failure_is_connect_failed() {
        let mut ctx = Context::new();
        let result = ctx.pipe_connect(
            Path::new("/nonexistent/assuan-server"),
            &[] as &[&str],
            &[],
            PipeConnectFlags::empty(),
        );
        assert!(matches!(result, Err(Error::ConnectFailed(_))));
    }

    #[test]
    fn greeting_must_be_ok() {
        let mut ctx = Context::new();
        let result = ctx.pipe_connect(
            Path::new("/bin/sh"),
            &["-c", "echo 'ERR 1 go away'"],
            &[],
            PipeConnectFlags::empty(),
        );
        assert!(matches!(result, Err(Error::ConnectFailed(_))));
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[test]
    fn connect_to_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.none");
        let mut ctx = Context::new();
        let result = ctx.socket_connect(
            &format!("file://{}", path.display()),
            None,
            SocketConnectFlags::empty(),
        );
        assert!(matches!(result, Err(Error::ConnectFailed(_))));
    }

    #[test]
    fn listening_server_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let listener = crate::sock::SocketListener::bind_unix(dir.path().join("S.idle")).unwrap();
        let mut ctx = Context::new();
        ctx.init_socket_server(listener.try_clone_fd().unwrap(), SocketServerFlags::FD_PASSING)
            .unwrap();
        assert_eq!(ctx.state(), ContextState::Idle);
        assert!(ctx.fd_passing());
        assert_eq!(ctx.active_fds().len(), 1);
    }
}
