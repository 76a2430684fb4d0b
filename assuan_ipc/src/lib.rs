//! Line-based IPC protocol engine
//!
//! This crate implements a small text protocol spoken between a client and
//! a server process over a pipe pair or a local socket. The server registers
//! command handlers and runs a dispatch loop; the client sends one command
//! at a time with [`Context::transact`] and receives data, status lines and
//! inquiries until the final `OK` or `ERR`. Open descriptors can be handed
//! across Unix sockets alongside the protocol.
//!
//! All I/O is blocking and goes through the [`SystemHooks`] chosen when a
//! [`Context`] is built.

pub mod client;
pub mod codec;
pub mod connect;
pub mod context;
pub mod error;
pub mod fdpass;
pub mod global;
pub mod hooks;
pub mod server;
pub mod sock;

/// Re-export common types for convenience
pub use client::{parse_response, Response};
pub use codec::{escape_data, unescape_data, LINELENGTH, MAX_LINE_LEN};
pub use connect::{ChildProcess, PipeConnectFlags, SocketConnectFlags, SocketServerFlags};
pub use context::{
    Context, ContextBuilder, ContextFlag, ContextState, DataWriter, IoDirection, IoMonitorAction,
};
pub use error::{make_error, Error, ErrorCode, ErrorSource, ErrorValue, Result};
pub use fdpass::command_parse_fd;
pub use global::GlobalConfig;
pub use hooks::{CooperativeHooks, NativeHooks, Scheduler, SpawnRequest, SystemHooks};
pub use server::CommandLine;
pub use sock::{PeerCred, SockNonce, SocketListener};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn version_parts(version: &str) -> Option<Vec<u64>> {
    version
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Return the crate version if it is at least `required`.
///
/// Components are compared numerically; missing components count as zero.
/// `None` for `required` only asks for the version.
pub fn check_version(required: Option<&str>) -> Option<&'static str> {
    let Some(required) = required else {
        return Some(VERSION);
    };
    let want = version_parts(required)?;
    let have = version_parts(VERSION)?;
    let len = want.len().max(have.len());
    for i in 0..len {
        let w = want.get(i).copied().unwrap_or(0);
        let h = have.get(i).copied().unwrap_or(0);
        if h != w {
            return (h > w).then_some(VERSION);
        }
    }
    Some(VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_checks() {
        assert_eq!(check_version(None), Some(VERSION));
        assert_eq!(check_version(Some("0.0.1")), Some(VERSION));
        assert_eq!(check_version(Some(VERSION)), Some(VERSION));
        assert_eq!(check_version(Some("999.0")), None);
        assert_eq!(check_version(Some("not a version")), None);
    }
}
