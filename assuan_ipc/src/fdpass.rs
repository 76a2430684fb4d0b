//! Descriptor passing over Unix sockets.
//!
//! A descriptor travels as `SCM_RIGHTS` ancillary data attached to a
//! comment line. The receiving side queues whatever arrives while reading
//! lines; [`Context::receivefd`] only ever takes from that queue.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};
use tracing::debug;

use crate::context::{Channel, Context};
use crate::error::{Error, Result};
use crate::server::CommandLine;

impl Context {
    /// Send `fd` to the peer together with a `# descriptor <n> is in
    /// flight` comment.
    pub fn sendfd<F: AsFd>(&mut self, fd: F) -> Result<()> {
        self.ensure_open()?;
        if !self.fd_passing || !matches!(self.channel, Channel::Socket { .. }) {
            return Err(Error::NotSupported(
                "descriptor passing is not enabled for this connection".to_string(),
            ));
        }
        self.flush_data()?;

        let raw = fd.as_fd().as_raw_fd();
        let line = format!("# descriptor {} is in flight\n", raw);
        let hooks = self.hooks_arc();
        let socket = self.outbound_fd()?;
        let sent = hooks
            .sendmsg(socket, line.as_bytes(), &[raw])
            .map_err(Error::Write)?;
        if sent != line.len() {
            // Only the first chunk carried the descriptor; finish the line.
            crate::hooks::write_all(hooks.as_ref(), socket, &line.as_bytes()[sent..])
                .map_err(Error::Write)?;
        }
        debug!(target: "assuan::ctx", fd = raw, "sent descriptor");
        Ok(())
    }

    /// Take the next descriptor received from the peer.
    ///
    /// Descriptors arrive while lines are read, so this must follow the
    /// line that announced the transfer. An empty queue is an error.
    pub fn receivefd(&mut self) -> Result<OwnedFd> {
        self.ensure_open()?;
        if !self.fd_passing {
            return Err(Error::NotSupported(
                "descriptor passing is not enabled for this connection".to_string(),
            ));
        }
        self.pop_passed_fd()
            .ok_or_else(|| Error::General("no descriptor has been passed".to_string()))
    }
}

/// Adopt an inherited descriptor by number after checking that it is open
/// and not owned by the context already.
pub(crate) fn adopt_inherited_fd(ctx: &Context, raw: RawFd) -> Result<OwnedFd> {
    if raw <= 2 {
        return Err(Error::Parameter(format!(
            "standard descriptor {} cannot be used",
            raw
        )));
    }
    if ctx.active_fds().contains(&raw) {
        return Err(Error::Parameter(format!(
            "descriptor {} is used by the connection",
            raw
        )));
    }
    fcntl(raw, FcntlArg::F_GETFD)
        .map_err(|e| Error::Parameter(format!("descriptor {}: {}", raw, e)))?;
    // SAFETY: the descriptor is open, is none of the standard streams and is
    // not held by this context. Callers only get here for descriptors the
    // process inherited from its spawner, so the context becomes its owner.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Parse `FD` or `FD=<n>` at the start of a command line.
///
/// A bare `FD` takes a passed descriptor; `FD=<n>` adopts descriptor `n`
/// inherited from the peer. Only a pipe server shares a descriptor table
/// with its peer, so socket servers reject `FD=<n>`. The token is consumed
/// from `line`.
pub fn command_parse_fd(ctx: &mut Context, line: &mut CommandLine) -> Result<OwnedFd> {
    let token = line
        .next_token()
        .map(str::to_string)
        .ok_or_else(|| Error::Syntax("FD[=<n>] expected".to_string()))?;
    let Some(suffix) = token.strip_prefix("FD") else {
        return Err(Error::Syntax("FD[=<n>] expected".to_string()));
    };
    if suffix.is_empty() {
        return ctx.receivefd();
    }
    let number = suffix
        .strip_prefix('=')
        .ok_or_else(|| Error::Syntax("FD[=<n>] expected".to_string()))?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Syntax("number required".to_string()));
    }
    let raw: RawFd = number
        .parse()
        .map_err(|_| Error::Parameter(format!("descriptor {} out of range", number)))?;
    if !ctx.server.inherits_fds {
        return Err(Error::NotSupported(
            "FD=<n> is only valid on pipe servers".to_string(),
        ));
    }
    adopt_inherited_fd(ctx, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    use crate::connect::{SocketConnectFlags, SocketServerFlags};
    use crate::hooks::{NativeHooks, SystemHooks};

    fn socket_pair() -> (Context, Context) {
        let (a, b) = NativeHooks.socketpair().unwrap();
        let mut server = Context::new();
        server
            .init_socket_server(a, SocketServerFlags::ACCEPTED | SocketServerFlags::FD_PASSING)
            .unwrap();
        server.accept().unwrap();
        let mut client = Context::new();
        client
            .socket_connect_fd(b, SocketConnectFlags::FD_PASSING)
            .unwrap();
        (server, client)
    }

    #[test]
    fn parse_fd_syntax_errors() {
        let (mut server, _client) = socket_pair();
        for text in ["", "FOO", "FD:3", "FD=", "FD=x"] {
            let mut line = CommandLine::new(text);
            assert!(
                matches!(command_parse_fd(&mut server, &mut line), Err(Error::Syntax(_))),
                "{:?} should be a syntax error",
                text
            );
        }
    }

    fn pipe_server() -> Context {
        let mut ctx = Context::new();
        let (r, w) = NativeHooks.pipe().unwrap();
        ctx.init_pipe_server(Some((r, w))).unwrap();
        ctx
    }

    #[test]
    fn parse_fd_rejects_transport_and_std_fds() {
        let mut server = pipe_server();
        let transport = server.active_fds()[0];
        let mut line = CommandLine::new(format!("FD={}", transport));
        assert!(matches!(
            command_parse_fd(&mut server, &mut line),
            Err(Error::Parameter(_))
        ));
        let mut line = CommandLine::new("FD=1");
        assert!(matches!(
            command_parse_fd(&mut server, &mut line),
            Err(Error::Parameter(_))
        ));
    }

    #[test]
    fn pipe_server_adopts_numbered_fd() {
        let mut server = pipe_server();
        let file = tempfile::tempfile().unwrap();
        let raw = OwnedFd::from(file).into_raw_fd();
        let mut line = CommandLine::new(format!("FD={} rest", raw));
        let fd = command_parse_fd(&mut server, &mut line).unwrap();
        assert_eq!(fd.as_raw_fd(), raw);
        assert_eq!(line.rest(), "rest");
    }

    #[test]
    fn socket_server_refuses_numbered_fd() {
        let (mut server, _client) = socket_pair();
        let file = tempfile::tempfile().unwrap();
        let mut line = CommandLine::new(format!("FD={}", file.as_raw_fd()));
        assert!(matches!(
            command_parse_fd(&mut server, &mut line),
            Err(Error::NotSupported(_))
        ));
        // The descriptor still belongs to its owner.
        assert!(fcntl(file.as_raw_fd(), FcntlArg::F_GETFD).is_ok());
        drop(server);
        assert!(fcntl(file.as_raw_fd(), FcntlArg::F_GETFD).is_ok());
    }

    #[test]
    fn bare_fd_without_passed_descriptor() {
        let (mut server, _client) = socket_pair();
        let mut line = CommandLine::new("FD");
        assert!(matches!(
            command_parse_fd(&mut server, &mut line),
            Err(Error::General(_))
        ));
    }

    #[test]
    fn pipes_do_not_pass_descriptors() {
        let mut ctx = pipe_server();
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(ctx.sendfd(&file), Err(Error::NotSupported(_))));
        assert!(matches!(ctx.receivefd(), Err(Error::NotSupported(_))));
    }
}
