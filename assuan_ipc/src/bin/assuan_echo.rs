//! Demo server
//!
//! Speaks the protocol on stdin/stdout (or on the connection socket handed
//! over by a spawning client), or listens on a socket with `--socket`.
//! Provides a handful of commands that exercise data, status, inquire and
//! descriptor handling.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::thread;

use anyhow::Context as _;
use assuan_ipc::{
    CommandLine, Context, Error, ErrorCode, GlobalConfig, NativeHooks, Result, SocketListener,
    SocketServerFlags,
};
use assuan_utils::config::Config;
use assuan_utils::logging::{init_logging, options_from_config, parse_level};
use clap::Parser;
use tracing::{debug, error, info};

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Listen on this socket instead of using stdin/stdout
    #[clap(short, long)]
    socket: Option<PathBuf>,

    /// Use the loopback socket emulation for --socket
    #[clap(long)]
    emulate: bool,

    /// Log level (logs go to stderr)
    #[clap(short, long, default_value = "warn")]
    log_level: String,

    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

fn cmd_echo(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    let text = line.rest().to_string();
    ctx.send_data(text.as_bytes())
}

fn cmd_getpass(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    let prompt = line.rest().to_string();
    let keyword = if prompt.is_empty() {
        "PASSWD".to_string()
    } else {
        format!("PASSWD {}", prompt)
    };
    let secret = ctx.inquire(&keyword, 0)?;
    ctx.write_status("LENGTH", &secret.len().to_string())?;
    ctx.send_data(&secret)
}

fn cmd_status(ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    let keyword = line
        .next_token()
        .map(str::to_string)
        .ok_or_else(|| Error::Parameter("keyword required".to_string()))?;
    let text = line.rest().to_string();
    ctx.write_status(&keyword, &text)
}

fn cmd_cat(ctx: &mut Context, _line: &mut CommandLine) -> Result<()> {
    let fd = ctx.take_input_fd()?;
    let mut content = Vec::new();
    File::from(fd).read_to_end(&mut content)?;
    ctx.send_data(&content)
}

fn cmd_fail(_ctx: &mut Context, line: &mut CommandLine) -> Result<()> {
    Err(Error::with_code(
        ErrorCode::NOT_IMPLEMENTED,
        format!("failing on request: {}", line.rest()),
    ))
}

fn register_commands(ctx: &mut Context) -> Result<()> {
    ctx.register_command("ECHO", cmd_echo, Some("ECHO <text>\n\nSend <text> back as data."))?;
    ctx.register_command("GETPASS", cmd_getpass, Some("GETPASS [<prompt>]\n\nInquire a passphrase and send it back."))?;
    ctx.register_command("STATUS", cmd_status, Some("STATUS <keyword> [<text>]\n\nEmit a status line."))?;
    ctx.register_command("CAT", cmd_cat, Some("CAT\n\nSend the content of the INPUT descriptor as data."))?;
    ctx.register_command("FAIL", cmd_fail, Some("FAIL [<text>]\n\nFail with NOT_IMPLEMENTED."))?;
    ctx.register_option_handler(|_ctx, name, value| {
        debug!(option = name, value, "option set");
        Ok(())
    });
    Ok(())
}

fn serve(mut ctx: Context) -> Result<()> {
    register_commands(&mut ctx)?;
    ctx.accept()?;
    ctx.process()
}

fn serve_socket(listener: SocketListener, config: &Config) -> anyhow::Result<()> {
    let fd_passing = config.socket.fd_passing && !listener.is_emulated();
    loop {
        let fd = match listener.accept_authenticated(&NativeHooks) {
            Ok(fd) => fd,
            Err(Error::AcceptFailed(reason)) => {
                info!("rejected connection: {}", reason);
                continue;
            }
            Err(err) => return Err(err).context("accept failed"),
        };

        let mut flags = SocketServerFlags::ACCEPTED;
        if fd_passing {
            flags |= SocketServerFlags::FD_PASSING;
        }
        let mut ctx = Context::from_config(config);
        ctx.init_socket_server(fd, flags)?;
        thread::spawn(move || {
            if let Err(e) = serve(ctx) {
                error!("connection ended with error: {}", e);
            }
        });
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.validate()?;

    // stdout may be the protocol channel, so logs always go to stderr
    let mut options = options_from_config(&config);
    if args.config.is_none() {
        options.level = parse_level(&args.log_level);
    }
    let _guard = init_logging(options);

    assuan_ipc::global::install(GlobalConfig::from_config(&config))?;

    let socket = args.socket.clone().or_else(|| config.socket.path.clone());
    match socket {
        Some(path) => {
            let listener = if args.emulate || config.socket.emulate {
                SocketListener::bind_emulated(&path)?
            } else {
                SocketListener::bind_unix(&path)?
            };
            info!("listening on {}", path.display());
            serve_socket(listener, &config)
        }
        None => {
            let mut ctx = Context::from_config(&config);
            ctx.init_pipe_server(None)?;
            serve(ctx)?;
            Ok(())
        }
    }
}
