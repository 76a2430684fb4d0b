//! Per-connection state.
//!
//! A [`Context`] owns the transport descriptors of one connection together
//! with everything the protocol needs to drive it: the line buffer, pending
//! data, flags, server command table and peer information. It is driven by
//! exactly one thread at a time.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use assuan_utils::config::Config;
use bitflags::bitflags;
use tracing::{debug, warn};

use crate::codec::{DataLineEncoder, LineBuffer, LINELENGTH, MAX_LINE_LEN};
use crate::connect::ChildProcess;
use crate::error::{Error, ErrorSource, Result};
use crate::global;
use crate::hooks::{self, SystemHooks, MAX_PASSED_FDS};
use crate::server::ServerState;
use crate::sock::PeerCred;

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created but not yet connected
    Idle,
    /// Connected and waiting for the next command
    AwaitingCommand,
    /// A command is being executed
    Processing,
    /// A server handler waits for the reply to an `INQUIRE`
    AwaitingInquireResponse,
    /// Terminal; every further operation fails with [`Error::Closed`]
    Closed,
}

/// Per-context boolean switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFlag {
    /// Do not reap a spawned server on release
    NoWaitpid,
    /// Keep protocol text out of the log for the current command
    Confidential,
    /// Do not ignore SIGPIPE when spawning a server
    NoFixSignals,
    /// Forward `#` comment lines to the client status callback
    ConveyComments,
    /// Never log protocol lines
    NoLogging,
    /// Close the connection after the current command completes
    ForceClose,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    no_waitpid: bool,
    confidential: bool,
    no_fixsignals: bool,
    convey_comments: bool,
    no_logging: bool,
    force_close: bool,
}

impl Flags {
    fn slot(&mut self, flag: ContextFlag) -> &mut bool {
        match flag {
            ContextFlag::NoWaitpid => &mut self.no_waitpid,
            ContextFlag::Confidential => &mut self.confidential,
            ContextFlag::NoFixSignals => &mut self.no_fixsignals,
            ContextFlag::ConveyComments => &mut self.convey_comments,
            ContextFlag::NoLogging => &mut self.no_logging,
            ContextFlag::ForceClose => &mut self.force_close,
        }
    }

    fn get(&self, flag: ContextFlag) -> bool {
        let mut copy = *self;
        *copy.slot(flag)
    }
}

/// Direction of a line passed to the I/O monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Inbound,
    Outbound,
}

bitflags! {
    /// What to do with a line after the I/O monitor has seen it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoMonitorAction: u32 {
        /// Do not log this line
        const NOLOG = 1;
        /// Drop the line: outbound lines are not sent, inbound lines are
        /// skipped
        const IGNORE = 2;
    }
}

pub type IoMonitor = Arc<dyn Fn(IoDirection, &[u8]) -> IoMonitorAction + Send + Sync>;

/// Which side of the protocol this context speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Unset,
    Server,
    Client,
}

/// The transport a context talks over.
#[derive(Debug)]
pub(crate) enum Channel {
    Detached,
    /// Two one-way descriptors
    Pipe { inbound: OwnedFd, outbound: OwnedFd },
    /// One bidirectional socket
    Socket { fd: OwnedFd },
}

/// Builder for [`Context`]; the only place hooks can be chosen.
pub struct ContextBuilder {
    hooks: Option<Arc<dyn SystemHooks>>,
    log_prefix: Option<String>,
    error_source: Option<ErrorSource>,
    flags: Flags,
    inquire_limit: usize,
}

impl ContextBuilder {
    fn new() -> Self {
        ContextBuilder {
            hooks: None,
            log_prefix: None,
            error_source: None,
            flags: Flags::default(),
            inquire_limit: 0,
        }
    }

    pub fn hooks(mut self, hooks: Arc<dyn SystemHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = Some(prefix.into());
        self
    }

    pub fn error_source(mut self, source: ErrorSource) -> Self {
        self.error_source = Some(source);
        self
    }

    pub fn flag(mut self, flag: ContextFlag, value: bool) -> Self {
        *self.flags.slot(flag) = value;
        self
    }

    /// Default reply bound for server inquires that pass a zero limit
    /// (0 = unlimited).
    pub fn inquire_limit(mut self, limit: usize) -> Self {
        self.inquire_limit = limit;
        self
    }

    pub fn build(self) -> Context {
        let defaults = global::current();
        Context {
            hooks: self.hooks.unwrap_or_else(|| Arc::clone(&defaults.hooks)),
            log_prefix: self
                .log_prefix
                .unwrap_or_else(|| defaults.log_prefix.clone()),
            error_source: self.error_source.unwrap_or(defaults.error_source),
            flags: self.flags,
            inquire_limit: self.inquire_limit,
            state: ContextState::Idle,
            role: Role::Unset,
            channel: Channel::Detached,
            listener: None,
            fd_passing: false,
            inbound: LineBuffer::new(),
            outbound: DataLineEncoder::new(),
            passed_fds: VecDeque::new(),
            io_monitor: None,
            pointer: None,
            peer_pid: None,
            peer_cred: None,
            child: None,
            nonce: None,
            in_transact: false,
            released: false,
            server: ServerState::default(),
        }
    }
}

/// State of one protocol connection.
pub struct Context {
    hooks: Arc<dyn SystemHooks>,
    log_prefix: String,
    error_source: ErrorSource,
    flags: Flags,
    inquire_limit: usize,
    state: ContextState,
    pub(crate) role: Role,
    pub(crate) channel: Channel,
    /// Listening socket of a socket server, kept across connections
    pub(crate) listener: Option<OwnedFd>,
    pub(crate) fd_passing: bool,
    inbound: LineBuffer,
    outbound: DataLineEncoder,
    passed_fds: VecDeque<OwnedFd>,
    io_monitor: Option<IoMonitor>,
    pointer: Option<Box<dyn Any + Send>>,
    pub(crate) peer_pid: Option<i32>,
    pub(crate) peer_cred: Option<PeerCred>,
    pub(crate) child: Option<ChildProcess>,
    pub(crate) nonce: Option<crate::sock::SockNonce>,
    pub(crate) in_transact: bool,
    released: bool,
    pub(crate) server: ServerState,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("log_prefix", &self.log_prefix)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("channel", &self.channel)
            .field("peer_pid", &self.peer_pid)
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Context {
    /// A detached context using the process-wide defaults.
    pub fn new() -> Self {
        ContextBuilder::new().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// A context configured from the `[protocol]` section of `config`.
    pub fn from_config(config: &Config) -> Self {
        let protocol = &config.protocol;
        ContextBuilder::new()
            .log_prefix(protocol.log_prefix.clone())
            .error_source(ErrorSource::new(protocol.error_source))
            .flag(ContextFlag::ConveyComments, protocol.convey_comments)
            .flag(ContextFlag::NoLogging, protocol.no_logging)
            .flag(ContextFlag::NoWaitpid, protocol.no_waitpid)
            .flag(ContextFlag::NoFixSignals, protocol.no_fixsignals)
            .inquire_limit(protocol.max_inquire_len)
            .build()
    }

    pub fn hooks(&self) -> &dyn SystemHooks {
        self.hooks.as_ref()
    }

    pub(crate) fn hooks_arc(&self) -> Arc<dyn SystemHooks> {
        Arc::clone(&self.hooks)
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ContextState) {
        if self.state != ContextState::Closed {
            self.state = state;
        }
    }

    pub fn set_flag(&mut self, flag: ContextFlag, value: bool) {
        *self.flags.slot(flag) = value;
    }

    pub fn flag(&self, flag: ContextFlag) -> bool {
        self.flags.get(flag)
    }

    pub fn error_source(&self) -> ErrorSource {
        self.error_source
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub(crate) fn inquire_limit(&self) -> usize {
        self.inquire_limit
    }

    pub fn set_io_monitor<F>(&mut self, monitor: F)
    where
        F: Fn(IoDirection, &[u8]) -> IoMonitorAction + Send + Sync + 'static,
    {
        self.io_monitor = Some(Arc::new(monitor));
    }

    pub fn clear_io_monitor(&mut self) {
        self.io_monitor = None;
    }

    /// Attach application data to the connection.
    pub fn set_pointer<T: Any + Send>(&mut self, value: T) {
        self.pointer = Some(Box::new(value));
    }

    pub fn pointer<T: Any + Send>(&self) -> Option<&T> {
        self.pointer.as_ref().and_then(|p| p.downcast_ref())
    }

    pub fn pointer_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.pointer.as_mut().and_then(|p| p.downcast_mut())
    }

    pub fn take_pointer(&mut self) -> Option<Box<dyn Any + Send>> {
        self.pointer.take()
    }

    /// Process id of the peer, when known.
    pub fn peer_pid(&self) -> Option<i32> {
        self.peer_pid.or_else(|| self.peer_cred.and_then(|c| c.pid))
    }

    /// Credentials of a socket peer, when the platform provides them.
    pub fn peer_cred(&self) -> Option<PeerCred> {
        self.peer_cred
    }

    /// The spawned server, for client contexts created by `pipe_connect`.
    pub fn child(&self) -> Option<&ChildProcess> {
        self.child.as_ref()
    }

    /// Whether descriptors can be exchanged over this connection.
    pub fn fd_passing(&self) -> bool {
        self.fd_passing
    }

    pub(crate) fn attach(&mut self, channel: Channel, role: Role) {
        self.detach();
        self.channel = channel;
        self.role = role;
        self.inbound.clear();
        self.outbound.reset();
        self.state = ContextState::AwaitingCommand;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state == ContextState::Closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn inbound_fd(&self) -> Result<BorrowedFd<'_>> {
        match &self.channel {
            Channel::Pipe { inbound, .. } => Ok(inbound.as_fd()),
            Channel::Socket { fd } => Ok(fd.as_fd()),
            Channel::Detached => Err(Error::General("context is not connected".to_string())),
        }
    }

    pub(crate) fn outbound_fd(&self) -> Result<BorrowedFd<'_>> {
        match &self.channel {
            Channel::Pipe { outbound, .. } => Ok(outbound.as_fd()),
            Channel::Socket { fd } => Ok(fd.as_fd()),
            Channel::Detached => Err(Error::General("context is not connected".to_string())),
        }
    }

    /// Raw numbers of the descriptors the transport uses; the server adds
    /// any pending INPUT/OUTPUT descriptors in `active_fds`.
    pub(crate) fn transport_fds(&self) -> Vec<RawFd> {
        let mut fds = match &self.channel {
            Channel::Detached => Vec::new(),
            Channel::Pipe { inbound, outbound } => {
                vec![inbound.as_raw_fd(), outbound.as_raw_fd()]
            }
            Channel::Socket { fd } => vec![fd.as_raw_fd()],
        };
        fds.extend(self.listener.as_ref().map(|fd| fd.as_raw_fd()));
        fds
    }

    fn monitor(&self, direction: IoDirection, line: &[u8]) -> IoMonitorAction {
        match &self.io_monitor {
            Some(monitor) => monitor(direction, line),
            None => IoMonitorAction::empty(),
        }
    }

    fn log_line(&self, arrow: &str, line: &[u8]) {
        if self.flags.no_logging {
            return;
        }
        if self.flags.confidential {
            debug!(target: "assuan::ctx", "{} {} [Confidential data not shown]", self.log_prefix, arrow);
        } else {
            debug!(target: "assuan::ctx", "{} {} {}", self.log_prefix, arrow, String::from_utf8_lossy(line));
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut buf = [0u8; LINELENGTH];
        let sys = Arc::clone(&self.hooks);
        let fd = self.inbound_fd()?;
        let (n, fds) = if self.fd_passing {
            sys.recvmsg(fd, &mut buf).map_err(Error::Read)?
        } else {
            (sys.read(fd, &mut buf).map_err(Error::Read)?, Vec::new())
        };
        self.queue_fds(fds);
        if n == 0 {
            return Err(self.inbound.finish());
        }
        self.inbound.extend(&buf[..n]);
        Ok(())
    }

    fn queue_fds(&mut self, fds: Vec<OwnedFd>) {
        for fd in fds {
            if self.passed_fds.len() >= MAX_PASSED_FDS {
                warn!(target: "assuan::ctx", fd = fd.as_raw_fd(), "too many passed descriptors, closing");
                let _ = self.hooks.close(fd);
                continue;
            }
            self.passed_fds.push_back(fd);
        }
    }

    pub(crate) fn pop_passed_fd(&mut self) -> Option<OwnedFd> {
        self.passed_fds.pop_front()
    }

    pub(crate) fn close_passed_fds(&mut self) {
        while let Some(fd) = self.passed_fds.pop_front() {
            let _ = self.hooks.close(fd);
        }
    }

    /// Read the next line, without its terminator.
    ///
    /// Lines the I/O monitor marks as ignored are skipped.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        loop {
            let line = match self.inbound.take_line() {
                Some(line) => line,
                None => {
                    self.fill()?;
                    continue;
                }
            };
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(target: "assuan::ctx", prefix = %self.log_prefix, "{}", err);
                    return Err(err);
                }
            };
            let action = self.monitor(IoDirection::Inbound, &line);
            if !action.contains(IoMonitorAction::NOLOG) {
                self.log_line("<-", &line);
            }
            if action.contains(IoMonitorAction::IGNORE) {
                continue;
            }
            return Ok(line);
        }
    }

    /// Whether a complete line is already buffered, so that `read_line`
    /// will not block.
    pub fn pending_line(&self) -> bool {
        self.state != ContextState::Closed && self.inbound.has_line()
    }

    pub(crate) fn write_raw_line(&mut self, line: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if line.len() > MAX_LINE_LEN {
            return Err(Error::LineTooLong);
        }
        let action = self.monitor(IoDirection::Outbound, line);
        if !action.contains(IoMonitorAction::NOLOG) {
            self.log_line("->", line);
        }
        if action.contains(IoMonitorAction::IGNORE) {
            return Ok(());
        }
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line);
        framed.push(b'\n');
        let sys = Arc::clone(&self.hooks);
        hooks::write_all(sys.as_ref(), self.outbound_fd()?, &framed).map_err(Error::Write)
    }

    /// Send one protocol line. The terminator is appended here; `text`
    /// itself must not contain CR or LF.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        if text.contains(['\r', '\n']) {
            return Err(Error::Parameter(
                "line must not contain CR or LF".to_string(),
            ));
        }
        if text.len() > MAX_LINE_LEN {
            return Err(Error::LineTooLong);
        }
        self.flush_data()?;
        self.write_raw_line(text.as_bytes())
    }

    /// Queue payload bytes as `D` lines. Full lines are sent right away,
    /// the remainder on [`flush_data`](Self::flush_data) or with the next
    /// protocol line.
    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut encoder = std::mem::take(&mut self.outbound);
        let result = encoder.push(data, |line| self.write_raw_line(line));
        self.outbound = encoder;
        result
    }

    /// Send a partially filled `D` line.
    pub fn flush_data(&mut self) -> Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let mut encoder = std::mem::take(&mut self.outbound);
        let result = encoder.flush(|line| self.write_raw_line(line));
        self.outbound = encoder;
        result
    }

    /// The data stream of the current command as an `io::Write`.
    pub fn data_writer(&mut self) -> DataWriter<'_> {
        DataWriter { ctx: self }
    }

    /// Release the connection: close every descriptor and reap an owned
    /// child. Calling it again does nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.state = ContextState::Closed;
        self.outbound.reset();
        self.inbound.clear();

        self.server.close_fds(self.hooks.as_ref());
        self.close_passed_fds();

        self.detach();
        if let Some(listener) = self.listener.take() {
            let _ = self.hooks.close(listener);
        }

        // The handle stays around so the exit status can be inspected.
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.reap(self.hooks.as_ref()) {
                warn!(target: "assuan::ctx", pid = child.pid(), "failed to reap server process: {}", err);
            }
        }
        debug!(target: "assuan::ctx", prefix = %self.log_prefix, "context released");
    }

    /// Close the transport of the current connection. A listening socket
    /// stays open for the next `accept`.
    pub(crate) fn detach(&mut self) {
        match std::mem::replace(&mut self.channel, Channel::Detached) {
            Channel::Detached => {}
            Channel::Pipe { inbound, outbound } => {
                let _ = self.hooks.close(inbound);
                let _ = self.hooks.close(outbound);
            }
            Channel::Socket { fd } => {
                let _ = self.hooks.close(fd);
            }
        }
        self.close_passed_fds();
    }

    /// Mark the connection closed without releasing resources yet.
    pub(crate) fn close(&mut self) {
        self.state = ContextState::Closed;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

/// `io::Write` adapter over [`Context::send_data`].
pub struct DataWriter<'a> {
    ctx: &'a mut Context,
}

fn to_io(err: Error) -> io::Error {
    match err {
        Error::Io(err) | Error::Write(err) | Error::Read(err) => err,
        other => io::Error::other(other),
    }
}

impl io::Write for DataWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.send_data(buf).map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ctx.flush_data().map_err(to_io)
    }
}
