//! Pluggable low-level I/O and process primitives.
//!
//! Every blocking operation the protocol engine performs goes through a
//! [`SystemHooks`] implementation chosen when the context is built. The
//! engine itself never spawns threads; an embedding that wants a different
//! scheduling model wraps the native hooks (see [`CooperativeHooks`]).

use std::ffi::OsString;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use tracing::{debug, trace};

/// Upper bound of descriptors accepted from a single `recvmsg`.
pub const MAX_PASSED_FDS: usize = 5;

/// Everything needed to start a server process.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    /// Program to execute
    pub program: &'a Path,
    /// Arguments after the program name
    pub args: &'a [OsString],
    /// Descriptor that becomes the child's stdin (`None` = /dev/null)
    pub stdin: Option<OwnedFd>,
    /// Descriptor that becomes the child's stdout (`None` = /dev/null)
    pub stdout: Option<OwnedFd>,
    /// Descriptors that stay open in the child at the same numbers
    pub keep_fds: &'a [RawFd],
    /// Extra environment for the child
    pub env: Vec<(String, String)>,
    /// Start the child in a new session
    pub detached: bool,
}

/// Low-level primitives used by a connection context.
///
/// Implementations must be usable from several threads because one hook
/// table is typically shared by every context in a process.
pub trait SystemHooks: Send + Sync + fmt::Debug {
    fn usleep(&self, usec: u64);

    /// Create a pipe, returning `(read_end, write_end)`. Both ends are
    /// close-on-exec.
    fn pipe(&self) -> io::Result<(OwnedFd, OwnedFd)>;

    fn close(&self, fd: OwnedFd) -> io::Result<()>;

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize>;

    /// Receive bytes together with any descriptors sent alongside them.
    fn recvmsg(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)>;

    /// Send bytes with `fds` attached as ancillary data.
    fn sendmsg(&self, fd: BorrowedFd<'_>, buf: &[u8], fds: &[RawFd]) -> io::Result<usize>;

    /// Start a process and return its pid.
    fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<i32>;

    /// Wait for `pid`. With `nowait` set, returns `Ok(None)` when the child
    /// is still running. The returned value is the exit code, or `128 + n`
    /// when terminated by signal `n`.
    fn waitpid(&self, pid: i32, nowait: bool) -> io::Result<Option<i32>>;

    fn socketpair(&self) -> io::Result<(OwnedFd, OwnedFd)>;

    fn socket(&self, domain: Domain) -> io::Result<OwnedFd>;

    fn connect(&self, fd: BorrowedFd<'_>, addr: &SockAddr) -> io::Result<()>;
}

/// Direct system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHooks;

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

impl SystemHooks for NativeHooks {
    fn usleep(&self, usec: u64) {
        std::thread::sleep(Duration::from_micros(usec));
    }

    fn pipe(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        let (read_end, write_end) = nix::unistd::pipe()?;
        set_cloexec(read_end.as_raw_fd())?;
        set_cloexec(write_end.as_raw_fd())?;
        Ok((read_end, write_end))
    }

    fn close(&self, fd: OwnedFd) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        drop(fd);
        trace!(target: "assuan::sysio", fd = raw, "closed descriptor");
        Ok(())
    }

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is a valid writable region of `buf.len()` bytes
            // and `fd` is a live descriptor for the duration of the call.
            let n = unsafe {
                libc::read(
                    fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is a valid readable region of `buf.len()` bytes
            // and `fd` is a live descriptor for the duration of the call.
            let n = unsafe {
                libc::write(
                    fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recvmsg(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);
        let mut iov = [IoSliceMut::new(buf)];

        let (bytes, raw_fds) = loop {
            match recvmsg::<()>(
                fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            ) {
                Ok(msg) => {
                    let mut raw_fds = Vec::new();
                    for cmsg in msg.cmsgs()? {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            raw_fds.extend(fds);
                        }
                    }
                    break (msg.bytes, raw_fds);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        };

        let mut received = Vec::with_capacity(raw_fds.len());
        for raw in raw_fds {
            if raw < 0 {
                continue;
            }
            // SAFETY: descriptors delivered through SCM_RIGHTS are freshly
            // installed in this process and owned by nobody else yet.
            let owned = unsafe { OwnedFd::from_raw_fd(raw) };
            set_cloexec(owned.as_raw_fd())?;
            received.push(owned);
        }
        if !received.is_empty() {
            debug!(target: "assuan::sysio", count = received.len(), "received descriptors");
        }
        Ok((bytes, received))
    }

    fn sendmsg(&self, fd: BorrowedFd<'_>, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let iov = [IoSlice::new(buf)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &cmsgs };
        loop {
            match sendmsg::<()>(fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<i32> {
        let mut command = Command::new(request.program);
        command.args(request.args);
        command.stdin(match request.stdin {
            Some(fd) => Stdio::from(fd),
            None => Stdio::null(),
        });
        command.stdout(match request.stdout {
            Some(fd) => Stdio::from(fd),
            None => Stdio::null(),
        });
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let keep_fds = request.keep_fds.to_vec();
        let detached = request.detached;
        // SAFETY: the closure only calls async-signal-safe functions
        // (fcntl, setsid) between fork and exec.
        unsafe {
            command.pre_exec(move || {
                for &fd in &keep_fds {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if detached && libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child.id() as i32;
        debug!(target: "assuan::sysio", pid, program = %request.program.display(), "spawned server process");
        // Reaping happens through `waitpid` by pid, not through `Child`.
        drop(child);
        Ok(pid)
    }

    fn waitpid(&self, pid: i32, nowait: bool) -> io::Result<Option<i32>> {
        let flags = if nowait {
            Some(WaitPidFlag::WNOHANG)
        } else {
            None
        };
        loop {
            match waitpid(Pid::from_raw(pid), flags) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(code) = exit_code(status) {
                        return Ok(Some(code));
                    }
                    if nowait {
                        return Ok(None);
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn socketpair(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        let (first, second) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        set_cloexec(first.as_raw_fd())?;
        set_cloexec(second.as_raw_fd())?;
        Ok((first, second))
    }

    fn socket(&self, domain: Domain) -> io::Result<OwnedFd> {
        let socket = Socket::new(domain, Type::STREAM, None)?;
        Ok(OwnedFd::from(socket))
    }

    fn connect(&self, fd: BorrowedFd<'_>, addr: &SockAddr) -> io::Result<()> {
        SockRef::from(&fd).connect(addr)
    }
}

/// Notified around every blocking call made through [`CooperativeHooks`].
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Called right before the calling thread may block.
    fn leave(&self);
    /// Called right after the blocking call returned.
    fn enter(&self);
}

/// Wraps another hook table so that a cooperative scheduler can run other
/// work while a context is blocked.
#[derive(Debug)]
pub struct CooperativeHooks<H, S> {
    inner: H,
    scheduler: S,
}

impl<H: SystemHooks, S: Scheduler> CooperativeHooks<H, S> {
    pub fn new(inner: H, scheduler: S) -> Self {
        CooperativeHooks { inner, scheduler }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn blocking<T>(&self, op: impl FnOnce(&H) -> T) -> T {
        self.scheduler.leave();
        let result = op(&self.inner);
        self.scheduler.enter();
        result
    }
}

impl<H: SystemHooks, S: Scheduler> SystemHooks for CooperativeHooks<H, S> {
    fn usleep(&self, usec: u64) {
        self.blocking(|inner| inner.usleep(usec))
    }

    fn pipe(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        self.inner.pipe()
    }

    fn close(&self, fd: OwnedFd) -> io::Result<()> {
        self.inner.close(fd)
    }

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
        self.blocking(|inner| inner.read(fd, buf))
    }

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
        self.blocking(|inner| inner.write(fd, buf))
    }

    fn recvmsg(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        self.blocking(|inner| inner.recvmsg(fd, buf))
    }

    fn sendmsg(&self, fd: BorrowedFd<'_>, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        self.blocking(|inner| inner.sendmsg(fd, buf, fds))
    }

    fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<i32> {
        self.inner.spawn(request)
    }

    fn waitpid(&self, pid: i32, nowait: bool) -> io::Result<Option<i32>> {
        if nowait {
            return self.inner.waitpid(pid, true);
        }
        self.blocking(|inner| inner.waitpid(pid, false))
    }

    fn socketpair(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        self.inner.socketpair()
    }

    fn socket(&self, domain: Domain) -> io::Result<OwnedFd> {
        self.inner.socket(domain)
    }

    fn connect(&self, fd: BorrowedFd<'_>, addr: &SockAddr) -> io::Result<()> {
        self.blocking(|inner| inner.connect(fd, addr))
    }
}

/// Write all of `buf`, treating a zero-length write as an error.
pub(crate) fn write_all(hooks: &dyn SystemHooks, fd: BorrowedFd<'_>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match hooks.write(fd, buf)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes.
pub(crate) fn read_exact(hooks: &dyn SystemHooks, fd: BorrowedFd<'_>, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match hooks.read(fd, buf)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => buf = &mut buf[n..],
        }
    }
    Ok(())
}

/// Borrow any descriptor-like value for a hook call.
pub(crate) fn borrow<F: AsFd>(fd: &F) -> BorrowedFd<'_> {
    fd.as_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingScheduler {
        left: AtomicUsize,
        entered: AtomicUsize,
    }

    impl Scheduler for CountingScheduler {
        fn leave(&self) {
            self.left.fetch_add(1, Ordering::SeqCst);
        }

        fn enter(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pipe_read_write() {
        let hooks = NativeHooks;
        let (reader, writer) = hooks.pipe().unwrap();
        write_all(&hooks, writer.as_fd(), b"hello").unwrap();
        let mut buf = [0u8; 5];
        read_exact(&hooks, reader.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        hooks.close(writer).unwrap();
        assert_eq!(hooks.read(reader.as_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn socketpair_carries_descriptors() {
        let hooks = NativeHooks;
        let (left, right) = hooks.socketpair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"passed along").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let sent = hooks
            .sendmsg(left.as_fd(), b"x", &[file.as_raw_fd()])
            .unwrap();
        assert_eq!(sent, 1);

        let mut buf = [0u8; 8];
        let (n, fds) = hooks.recvmsg(right.as_fd(), &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds.len(), 1);

        let mut received = File::from(fds.into_iter().next().unwrap());
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "passed along");
    }

    #[test]
    fn cooperative_hooks_bracket_blocking_calls() {
        let hooks = CooperativeHooks::new(NativeHooks, CountingScheduler::default());
        let (reader, writer) = hooks.pipe().unwrap();
        // Creating the pipe does not block.
        assert_eq!(hooks.scheduler().left.load(Ordering::SeqCst), 0);

        hooks.write(writer.as_fd(), b"ab").unwrap();
        let mut buf = [0u8; 2];
        hooks.read(reader.as_fd(), &mut buf).unwrap();
        hooks.usleep(1);

        assert_eq!(hooks.scheduler().left.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.scheduler().entered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn spawn_and_reap() {
        let hooks = NativeHooks;
        let args = [OsString::from("-c"), OsString::from("exit 3")];
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
        assert_eq!(hooks.waitpid(pid, false).unwrap(), Some(3));
    }
}
