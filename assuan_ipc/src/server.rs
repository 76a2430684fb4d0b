//! Server side: command table, dispatch loop and the built-in commands.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use socket2::SockRef;
use tracing::{debug, info, warn};

use crate::codec::{split_word, starts_with_token, unescape_data, MAX_LINE_LEN};
use crate::context::{Channel, Context, ContextFlag, ContextState, Role};
use crate::error::{Error, Result};
use crate::fdpass;
use crate::hooks::SystemHooks;
use crate::sock;

/// A command handler. It receives the text after the command name and may
/// consume it token by token.
pub type CommandHandler = Arc<dyn Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync>;

/// Hook for `BYE`, `RESET`, `CANCEL`, `INPUT` and `OUTPUT`.
pub type NotifyHook = Arc<dyn Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync>;

/// Runs before every command with the command name.
pub type PreCommandHook = Arc<dyn Fn(&mut Context, &str) -> Result<()> + Send + Sync>;

/// Runs after every command with its error, if any.
pub type PostCommandHook = Arc<dyn Fn(&mut Context, Option<&Error>) + Send + Sync>;

/// Receives every `OPTION name value` pair.
pub type OptionHandler = Arc<dyn Fn(&mut Context, &str, &str) -> Result<()> + Send + Sync>;

/// The argument text of a command, with a cursor for destructive parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    text: String,
    pos: usize,
}

impl CommandLine {
    pub fn new(text: impl Into<String>) -> Self {
        CommandLine {
            text: text.into(),
            pos: 0,
        }
    }

    /// The whole argument text, including consumed tokens.
    pub fn full(&self) -> &str {
        &self.text
    }

    /// The unconsumed remainder, without leading blanks.
    pub fn rest(&self) -> &str {
        self.text[self.pos..].trim_start_matches([' ', '\t'])
    }

    pub fn as_str(&self) -> &str {
        self.rest()
    }

    pub fn is_empty(&self) -> bool {
        self.rest().is_empty()
    }

    /// Consume and return the next blank-separated token.
    pub fn next_token(&mut self) -> Option<&str> {
        let start = self.text.len() - self.rest().len();
        if start == self.text.len() {
            self.pos = start;
            return None;
        }
        let end = self.text[start..]
            .find([' ', '\t'])
            .map_or(self.text.len(), |i| start + i);
        self.pos = end;
        Some(&self.text[start..end])
    }

    fn leading_options(&self) -> impl Iterator<Item = &str> {
        self.rest()
            .split([' ', '\t'])
            .filter(|t| !t.is_empty())
            .take_while(|t| t.starts_with("--"))
            .take_while(|t| *t != "--")
    }

    /// Whether a leading `--name` option is present.
    pub fn has_option(&self, name: &str) -> bool {
        self.leading_options()
            .any(|t| t[2..] == *name || t[2..].split_once('=').is_some_and(|(k, _)| k == name))
    }

    /// Value of a leading `--name=value` option.
    pub fn option_value(&self, name: &str) -> Option<&str> {
        self.leading_options()
            .filter_map(|t| t[2..].split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Consume every leading `--option` and a terminating `--`.
    pub fn skip_options(&mut self) {
        loop {
            let rest = self.rest();
            if !rest.starts_with("--") {
                return;
            }
            let is_terminator = rest == "--" || rest.starts_with("-- ") || rest.starts_with("--\t");
            self.next_token();
            if is_terminator {
                return;
            }
        }
    }
}

struct Command {
    name: String,
    handler: CommandHandler,
    help: Option<String>,
}

/// Server-only part of a context.
#[derive(Default)]
pub(crate) struct ServerState {
    commands: Vec<Command>,
    pre_cmd: Option<PreCommandHook>,
    post_cmd: Option<PostCommandHook>,
    bye: Option<NotifyHook>,
    reset: Option<NotifyHook>,
    cancel: Option<NotifyHook>,
    input: Option<NotifyHook>,
    output: Option<NotifyHook>,
    option: Option<OptionHandler>,
    hello_line: Option<String>,
    okay_line: Option<String>,
    input_fd: Option<OwnedFd>,
    output_fd: Option<OwnedFd>,
    command_name: Option<String>,
    in_command: bool,
    in_inquire: bool,
    closing: bool,
    pub(crate) greeted: bool,
    /// Set for pipe servers, whose peer may name inherited descriptors.
    pub(crate) inherits_fds: bool,
}

impl ServerState {
    fn lookup(&self, name: &str) -> Option<CommandHandler> {
        self.commands
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| Arc::clone(&c.handler))
    }

    fn insert(&mut self, name: &str, handler: CommandHandler, help: Option<String>, replace: bool) {
        let name = name.to_ascii_uppercase();
        match self.commands.iter_mut().find(|c| c.name == name) {
            Some(existing) if replace => {
                existing.handler = handler;
                existing.help = help;
            }
            Some(_) => {}
            None => self.commands.push(Command {
                name,
                handler,
                help,
            }),
        }
    }

    pub(crate) fn close_fds(&mut self, hooks: &dyn SystemHooks) {
        if let Some(fd) = self.input_fd.take() {
            let _ = hooks.close(fd);
        }
        if let Some(fd) = self.output_fd.take() {
            let _ = hooks.close(fd);
        }
    }
}

fn std_nop(_ctx: &mut Context, _line: &mut CommandLine) -> Result<()> {
    Ok(())
}

fn std_cancel(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    if let Some(hook) = ctx.server.cancel.clone() {
        hook(ctx, line)?;
    }
    Ok(())
}

fn std_option(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    let (key, value) = parse_option(line.rest())?;
    line.pos = line.text.len();
    match ctx.server.option.clone() {
        Some(handler) => handler(ctx, &key, &value),
        None => Ok(()),
    }
}

fn std_bye(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    if let Some(hook) = ctx.server.bye.clone() {
        // The connection closes regardless of what the hook reports.
        if let Err(err) = hook(ctx, line) {
            debug!(target: "assuan::engine", "bye notification failed: {}", err);
        }
    }
    ctx.close_input_fd();
    ctx.close_output_fd();
    ctx.server.closing = true;
    Ok(())
}

fn std_reset(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    if let Some(hook) = ctx.server.reset.clone() {
        hook(ctx, line)?;
    }
    ctx.close_input_fd();
    ctx.close_output_fd();
    ctx.close_passed_fds();
    Ok(())
}

fn std_end(_ctx: &mut Context, _line: &mut CommandLine) -> Result<()> {
    Err(Error::UnexpectedCommand)
}

fn std_help(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    match line.next_token().map(str::to_string) {
        None => {
            let names: Vec<String> = ctx.server.commands.iter().map(|c| c.name.clone()).collect();
            for name in names {
                ctx.write_line(&format!("# {}", name))?;
            }
            Ok(())
        }
        Some(name) => {
            let help = ctx
                .server
                .commands
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&name))
                .map(|c| c.help.clone().unwrap_or_else(|| c.name.clone()))
                .ok_or(Error::UnknownCommand)?;
            for text in help.lines() {
                ctx.write_line(&format!("# {}", text))?;
            }
            Ok(())
        }
    }
}

fn std_input(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    let fd = fdpass::command_parse_fd(ctx, line)?;
    if let Some(hook) = ctx.server.input.clone() {
        if let Err(err) = hook(ctx, line) {
            let _ = ctx.hooks().close(fd);
            return Err(err);
        }
    }
    ctx.close_input_fd();
    ctx.server.input_fd = Some(fd);
    Ok(())
}

fn std_output(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    let fd = fdpass::command_parse_fd(ctx, line)?;
    if let Some(hook) = ctx.server.output.clone() {
        if let Err(err) = hook(ctx, line) {
            let _ = ctx.hooks().close(fd);
            return Err(err);
        }
    }
    ctx.close_output_fd();
    ctx.server.output_fd = Some(fd);
    Ok(())
}

type StdHandler = fn(&mut Context, &mut CommandLine) -> Result<()>;

const STD_COMMANDS: &[(&str, StdHandler, &str)] = &[
    ("NOP", std_nop, "NOP\n\nNo operation. Returns OK without any action."),
    ("CANCEL", std_cancel, "CANCEL\n\nRun the server's cancel handler if one has been registered."),
    ("OPTION", std_option, "OPTION <NAME> [ [=] <VALUE> ]\n\nSet option <NAME> to configure server operation."),
    ("BYE", std_bye, "BYE\n\nClose the connection."),
    ("RESET", std_reset, "RESET\n\nReset the connection but not any existing authentication."),
    ("END", std_end, "END\n\nUsed by a client to mark the end of raw data."),
    ("HELP", std_help, "HELP [<COMMAND>]\n\nLists all commands or the help text of <COMMAND>."),
    ("INPUT", std_input, "INPUT FD[=<N>]\n\nUse descriptor <N> or a passed descriptor as input."),
    ("OUTPUT", std_output, "OUTPUT FD[=<N>]\n\nUse descriptor <N> or a passed descriptor as output."),
];

/// Split `name[=value]`, `name value` or `--name=value`.
fn parse_option(text: &str) -> Result<(String, String)> {
    let text = text.trim_matches([' ', '\t']);
    if text.is_empty() {
        return Err(Error::Syntax("argument required".to_string()));
    }
    if text.starts_with('=') {
        return Err(Error::Syntax("no option name given".to_string()));
    }
    let key_end = text.find([' ', '\t', '=']).unwrap_or(text.len());
    let mut key = &text[..key_end];
    let mut value = text[key_end..].trim_start_matches([' ', '\t']);
    if let Some(stripped) = value.strip_prefix('=') {
        value = stripped.trim_start_matches([' ', '\t']);
        if value.is_empty() {
            return Err(Error::Syntax("option argument expected".to_string()));
        }
    }
    if let Some(stripped) = key.strip_prefix("--") {
        key = stripped;
    }
    if key.is_empty() {
        return Err(Error::Syntax("option name expected".to_string()));
    }
    Ok((key.to_string(), value.to_string()))
}

fn validate_keyword(keyword: &str) -> Result<()> {
    if keyword.is_empty() || keyword.contains([' ', '\t', '\r', '\n']) {
        return Err(Error::Parameter(format!("invalid keyword '{}'", keyword)));
    }
    Ok(())
}

/// ERR text is limited so the line never exceeds the maximum length.
fn err_line(value: u32, text: &str) -> String {
    let mut line = format!("ERR {}", value);
    let clean: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if !clean.is_empty() {
        line.push(' ');
        for c in clean.chars() {
            if line.len() + c.len_utf8() > MAX_LINE_LEN {
                break;
            }
            line.push(c);
        }
    }
    line
}

impl Context {
    pub(crate) fn init_server(&mut self, channel: Channel) {
        self.attach(channel, Role::Server);
        // Nothing of a previous connection carries over.
        let hooks = self.hooks_arc();
        self.server.close_fds(hooks.as_ref());
        self.server.okay_line = None;
        self.server.command_name = None;
        self.server.greeted = false;
        self.server.in_command = false;
        self.server.in_inquire = false;
        self.server.closing = false;
        self.server.inherits_fds = false;
        self.peer_pid = None;
        self.peer_cred = None;
        for (name, handler, help) in STD_COMMANDS {
            self.server
                .insert(name, Arc::new(*handler), Some(help.to_string()), false);
        }
    }

    fn require_server(&self) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::NotAServer);
        }
        Ok(())
    }

    /// Register a command. Names are case-insensitive; registering a name
    /// again replaces the previous handler, built-ins included.
    pub fn register_command<F>(&mut self, name: &str, handler: F, help: Option<&str>) -> Result<()>
    where
        F: Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync + 'static,
    {
        validate_keyword(name)?;
        self.server
            .insert(name, Arc::new(handler), help.map(str::to_string), true);
        debug!(target: "assuan::engine", command = name, "registered command");
        Ok(())
    }

    pub fn register_pre_cmd_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, &str) -> Result<()> + Send + Sync + 'static,
    {
        self.server.pre_cmd = Some(Arc::new(hook));
    }

    pub fn register_post_cmd_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, Option<&Error>) + Send + Sync + 'static,
    {
        self.server.post_cmd = Some(Arc::new(hook));
    }

    pub fn register_bye_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync + 'static,
    {
        self.server.bye = Some(Arc::new(hook));
    }

    pub fn register_reset_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync + 'static,
    {
        self.server.reset = Some(Arc::new(hook));
    }

    pub fn register_cancel_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync + 'static,
    {
        self.server.cancel = Some(Arc::new(hook));
    }

    pub fn register_input_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync + 'static,
    {
        self.server.input = Some(Arc::new(hook));
    }

    pub fn register_output_notify<F>(&mut self, hook: F)
    where
        F: Fn(&mut Context, &mut CommandLine) -> Result<()> + Send + Sync + 'static,
    {
        self.server.output = Some(Arc::new(hook));
    }

    /// The single handler for every `OPTION` command.
    pub fn register_option_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut Context, &str, &str) -> Result<()> + Send + Sync + 'static,
    {
        self.server.option = Some(Arc::new(handler));
    }

    /// Replace the greeting sent by `accept`. Every line but the last is
    /// sent as a comment.
    pub fn set_hello_line(&mut self, hello: Option<&str>) -> Result<()> {
        if let Some(text) = hello {
            if text.contains('\r') || text.lines().any(|l| l.len() + 3 > MAX_LINE_LEN) {
                return Err(Error::Parameter("invalid hello line".to_string()));
            }
        }
        self.server.hello_line = hello.map(str::to_string);
        Ok(())
    }

    /// Text appended to the `OK` of the current command.
    pub fn set_okay_line(&mut self, text: Option<&str>) -> Result<()> {
        if let Some(text) = text {
            if text.contains(['\r', '\n']) || text.len() + 3 > MAX_LINE_LEN {
                return Err(Error::Parameter("invalid okay line".to_string()));
            }
        }
        self.server.okay_line = text.map(str::to_string);
        Ok(())
    }

    /// Name of the command being executed.
    pub fn command_name(&self) -> Option<&str> {
        self.server.command_name.as_deref()
    }

    pub fn input_fd(&self) -> Option<BorrowedFd<'_>> {
        self.server.input_fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn output_fd(&self) -> Option<BorrowedFd<'_>> {
        self.server.output_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Take ownership of the descriptor set by `INPUT`.
    pub fn take_input_fd(&mut self) -> Result<OwnedFd> {
        self.server.input_fd.take().ok_or(Error::NoInput)
    }

    /// Take ownership of the descriptor set by `OUTPUT`.
    pub fn take_output_fd(&mut self) -> Result<OwnedFd> {
        self.server.output_fd.take().ok_or(Error::NoOutput)
    }

    pub fn close_input_fd(&mut self) {
        if let Some(fd) = self.server.input_fd.take() {
            let _ = self.hooks().close(fd);
        }
    }

    pub fn close_output_fd(&mut self) {
        if let Some(fd) = self.server.output_fd.take() {
            let _ = self.hooks().close(fd);
        }
    }

    /// Every descriptor the server uses, for a caller about to fork.
    pub fn active_fds(&self) -> Vec<RawFd> {
        let mut fds = self.transport_fds();
        fds.extend(self.server.input_fd.as_ref().map(|fd| fd.as_raw_fd()));
        fds.extend(self.server.output_fd.as_ref().map(|fd| fd.as_raw_fd()));
        fds
    }

    /// Send the greeting, accepting a connection first when the server
    /// listens on a socket. A pipe server greets once; a second call
    /// reports end of file.
    pub fn accept(&mut self) -> Result<()> {
        self.require_server()?;
        if self.listener.is_some() {
            self.accept_connection()?;
        } else {
            if self.server.greeted {
                return Err(Error::Eof);
            }
            self.ensure_open()?;
        }
        self.server.greeted = true;
        self.send_hello()
    }

    fn accept_connection(&mut self) -> Result<()> {
        let accepted = {
            let listener = self
                .listener
                .as_ref()
                .ok_or_else(|| Error::AcceptFailed("no listening socket".to_string()))?;
            SockRef::from(listener)
                .accept()
                .map_err(|e| Error::AcceptFailed(e.to_string()))?
        };
        let fd = OwnedFd::from(accepted.0);

        if let Some(nonce) = self.nonce {
            if let Err(err) = sock::check_nonce(self.hooks(), fd.as_fd(), &nonce) {
                warn!(target: "assuan::engine", "rejected connection: {}", err);
                let _ = self.hooks().close(fd);
                return Err(err);
            }
        }

        let peer = sock::peer_credentials(fd.as_fd()).ok();
        self.init_server(Channel::Socket { fd });
        self.peer_cred = peer;
        info!(target: "assuan::engine", peer_pid = ?self.peer_pid(), "accepted connection");
        Ok(())
    }

    fn send_hello(&mut self) -> Result<()> {
        let hello = self
            .server
            .hello_line
            .clone()
            .unwrap_or_else(|| format!("Pleased to meet you, process {}", std::process::id()));
        let lines: Vec<&str> = hello.lines().collect();
        match lines.split_last() {
            Some((last, comments)) => {
                for comment in comments {
                    self.write_line(&format!("# {}", comment))?;
                }
                self.write_line(&format!("OK {}", last))
            }
            None => self.write_line("OK"),
        }
    }

    /// Read and execute one command. Returns `true` once the connection
    /// is finished.
    pub fn process_next(&mut self) -> Result<bool> {
        self.require_server()?;
        if self.state() == ContextState::Closed {
            return Ok(true);
        }
        if self.server.in_command {
            return Err(Error::NestedCommands);
        }

        let line = match self.read_line() {
            Ok(line) => line,
            Err(Error::Eof) => {
                debug!(target: "assuan::engine", "peer closed the connection");
                self.close_input_fd();
                self.close_output_fd();
                self.close();
                return Ok(true);
            }
            Err(Error::LineTooLong) => {
                // Nothing of the line is dispatched.
                self.server.in_command = true;
                self.process_done(Err(Error::LineTooLong))?;
                return Err(Error::LineTooLong);
            }
            Err(err) => return Err(err),
        };

        if line.is_empty() || line[0] == b'#' {
            return Ok(false);
        }

        self.server.in_command = true;
        self.set_state(ContextState::Processing);

        if starts_with_token(&line, b"D") {
            self.process_done(Err(Error::UnexpectedCommand))?;
            return Ok(self.state() == ContextState::Closed);
        }

        let (name, rest) = split_word(&line);
        let name = String::from_utf8_lossy(name).into_owned();
        let mut args = CommandLine::new(String::from_utf8_lossy(rest).into_owned());
        self.server.command_name = Some(name.to_ascii_uppercase());

        let result = self.dispatch(&name, &mut args);
        self.process_done(result)?;
        Ok(self.state() == ContextState::Closed)
    }

    fn dispatch(&mut self, name: &str, args: &mut CommandLine) -> Result<()> {
        if let Some(pre) = self.server.pre_cmd.clone() {
            pre(self, name)?;
        }
        let handler = self.server.lookup(name).ok_or(Error::UnknownCommand)?;
        handler(self, args)
    }

    /// Process commands until the peer disconnects or says `BYE`.
    pub fn process(&mut self) -> Result<()> {
        while !self.process_next()? {}
        Ok(())
    }

    /// Finish the current command with `OK` or `ERR`.
    pub fn process_done(&mut self, result: Result<()>) -> Result<()> {
        if !self.server.in_command {
            return Err(Error::General("no command in progress".to_string()));
        }
        self.server.in_command = false;

        let written = match &result {
            Ok(()) => match self.server.okay_line.take() {
                Some(text) => self.write_line(&format!("OK {}", text)),
                None => self.write_line("OK"),
            },
            Err(err) => {
                let value = err.value(self.error_source());
                debug!(target: "assuan::engine", command = ?self.server.command_name, %value, "command failed: {}", err);
                self.write_line(&err_line(value.to_wire(), &err.describe()))
            }
        };

        if let Some(post) = self.server.post_cmd.clone() {
            post(self, result.as_ref().err());
        }

        self.server.command_name = None;
        self.server.okay_line = None;
        self.set_flag(ContextFlag::Confidential, false);

        if self.server.closing || self.flag(ContextFlag::ForceClose) {
            self.server.closing = false;
            self.close();
        } else {
            self.set_state(ContextState::AwaitingCommand);
        }
        written
    }

    /// Send a status line `S <keyword> <text>`.
    pub fn write_status(&mut self, keyword: &str, text: &str) -> Result<()> {
        validate_keyword(keyword)?;
        if text.is_empty() {
            self.write_line(&format!("S {}", keyword))
        } else {
            self.write_line(&format!("S {} {}", keyword, text))
        }
    }

    /// Ask the client for data and collect its reply.
    ///
    /// `maxlen` bounds the reply (0 falls back to the context limit, which
    /// is unlimited unless configured). An over-long reply is read to its
    /// end and then reported as [`Error::TooMuchData`].
    pub fn inquire(&mut self, keyword: &str, maxlen: usize) -> Result<Vec<u8>> {
        let limit = self.begin_inquire(keyword, maxlen)?;
        let result = self.collect_inquire(keyword, limit);
        self.end_inquire();
        result
    }

    fn begin_inquire(&mut self, keyword: &str, maxlen: usize) -> Result<usize> {
        self.require_server()?;
        let name = keyword.split([' ', '\t']).next().unwrap_or_default();
        validate_keyword(name)?;
        if !self.server.in_command {
            return Err(Error::General("inquire outside of a command".to_string()));
        }
        if self.server.in_inquire {
            return Err(Error::NestedCommands);
        }
        self.server.in_inquire = true;
        self.set_state(ContextState::AwaitingInquireResponse);
        Ok(if maxlen == 0 { self.inquire_limit() } else { maxlen })
    }

    fn end_inquire(&mut self) {
        self.server.in_inquire = false;
        self.set_state(ContextState::Processing);
    }

    /// Read the reply to an INQUIRE up to its `END` or `CAN`.
    ///
    /// A reply that breaks the rules is still read to its end so that the
    /// connection stays in sync; the first problem is reported afterwards.
    fn collect_inquire(&mut self, keyword: &str, limit: usize) -> Result<Vec<u8>> {
        self.write_line(&format!("INQUIRE {}", keyword))?;
        let mut collected = Vec::new();
        let mut failure: Option<Error> = None;
        loop {
            let line = self.read_line()?;
            if line == b"END" {
                break;
            }
            if line == b"CAN" {
                debug!(target: "assuan::engine", keyword, "inquire cancelled by peer");
                return Err(failure.unwrap_or(Error::Canceled));
            }
            if line.is_empty() || line[0] == b'#' || failure.is_some() {
                continue;
            }
            if !starts_with_token(&line, b"D") {
                failure = Some(Error::UnexpectedCommand);
                continue;
            }
            let chunk = match unescape_data(line.get(2..).unwrap_or_default()) {
                Ok(chunk) => chunk,
                Err(err) => {
                    failure = Some(err);
                    continue;
                }
            };
            if limit != 0 && collected.len() + chunk.len() > limit {
                failure = Some(Error::TooMuchData);
                continue;
            }
            collected.extend_from_slice(&chunk);
        }
        match failure {
            Some(err) => {
                debug!(target: "assuan::engine", keyword, "rejected inquire reply: {}", err);
                Err(err)
            }
            None => Ok(collected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    use crate::connect::SocketServerFlags;
    use crate::hooks::NativeHooks;

    #[test]
    fn command_line_tokens() {
        let mut line = CommandLine::new("  FD=3 --binary rest of line");
        assert_eq!(line.next_token(), Some("FD=3"));
        assert_eq!(line.rest(), "--binary rest of line");
        assert_eq!(line.next_token(), Some("--binary"));
        assert_eq!(line.next_token(), Some("rest"));
        assert_eq!(line.full(), "  FD=3 --binary rest of line");
        line.next_token();
        line.next_token();
        assert_eq!(line.next_token(), None);
        assert!(line.is_empty());
    }

    #[test]
    fn command_line_options() {
        let mut line = CommandLine::new("--armor --mode=fast -- --not-an-option file");
        assert!(line.has_option("armor"));
        assert!(line.has_option("mode"));
        assert_eq!(line.option_value("mode"), Some("fast"));
        assert!(!line.has_option("not-an-option"));
        line.skip_options();
        assert_eq!(line.rest(), "--not-an-option file");
    }

    #[test]
    fn option_forms() {
        assert_eq!(
            parse_option("name=value").unwrap(),
            ("name".to_string(), "value".to_string())
        );
        assert_eq!(
            parse_option("name value").unwrap(),
            ("name".to_string(), "value".to_string())
        );
        assert_eq!(
            parse_option("--name = value ").unwrap(),
            ("name".to_string(), "value".to_string())
        );
        assert_eq!(
            parse_option("flag").unwrap(),
            ("flag".to_string(), String::new())
        );
        assert!(matches!(parse_option(""), Err(Error::Syntax(_))));
        assert!(matches!(parse_option("=x"), Err(Error::Syntax(_))));
        assert!(matches!(parse_option("name="), Err(Error::Syntax(_))));
    }

    #[test]
    fn err_line_is_bounded() {
        let line = err_line(67109139, &"x".repeat(2000));
        assert!(line.starts_with("ERR 67109139 "));
        assert!(line.len() <= MAX_LINE_LEN);
        assert_eq!(err_line(1, "a\nb"), "ERR 1 a b");
    }

    #[test]
    fn registration_is_case_insensitive_and_last_wins() {
        let mut state = ServerState::default();
        state.insert("foo", Arc::new(std_nop), None, true);
        state.insert("FOO", Arc::new(std_end), Some("second".into()), true);
        assert_eq!(state.commands.len(), 1);
        assert_eq!(state.commands[0].help.as_deref(), Some("second"));
        assert!(state.lookup("Foo").is_some());

        // Built-ins never replace an existing registration.
        state.insert("FOO", Arc::new(std_nop), None, false);
        assert_eq!(state.commands[0].help.as_deref(), Some("second"));
    }

    #[test]
    fn inquire_waits_for_the_reply_then_resumes_processing() {
        let (ours, theirs) = NativeHooks.socketpair().unwrap();
        let mut ctx = Context::new();
        ctx.init_socket_server(ours, SocketServerFlags::ACCEPTED)
            .unwrap();
        let mut peer = UnixStream::from(theirs);
        peer.write_all(b"D abc\nEND\n").unwrap();

        ctx.server.in_command = true;
        ctx.set_state(ContextState::Processing);
        let limit = ctx.begin_inquire("PIN please", 0).unwrap();
        assert_eq!(ctx.state(), ContextState::AwaitingInquireResponse);
        assert!(matches!(
            ctx.begin_inquire("PIN", 0),
            Err(Error::NestedCommands)
        ));

        let reply = ctx.collect_inquire("PIN please", limit);
        ctx.end_inquire();
        assert_eq!(reply.unwrap(), b"abc");
        assert_eq!(ctx.state(), ContextState::Processing);

        let mut line = String::new();
        BufReader::new(&peer).read_line(&mut line).unwrap();
        assert_eq!(line, "INQUIRE PIN please\n");
    }

    #[test]
    fn server_operations_need_a_server() {
        let mut ctx = Context::new();
        assert!(matches!(ctx.process_next(), Err(Error::NotAServer)));
        assert!(matches!(ctx.inquire("PASSWD", 0), Err(Error::NotAServer)));
        assert!(matches!(ctx.accept(), Err(Error::NotAServer)));
    }
}
