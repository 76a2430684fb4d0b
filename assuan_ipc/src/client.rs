//! Client side: response classification and the transact loop.

use tracing::{debug, trace};

use crate::codec::{split_word, starts_with_token, unescape_data};
use crate::context::{Context, ContextFlag, ContextState, Role};
use crate::error::{Error, ErrorValue, Result};

/// One classified line received by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(String),
    Err { value: ErrorValue, text: String },
    Data(Vec<u8>),
    Status { keyword: String, text: String },
    Comment(String),
    Inquire { keyword: String, args: String },
    End,
    Cancel,
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Classify a response line.
pub fn parse_response(line: &[u8]) -> Result<Response> {
    if starts_with_token(line, b"OK") {
        let (_, rest) = split_word(line);
        return Ok(Response::Ok(text(rest)));
    }
    if starts_with_token(line, b"ERR") {
        let (_, rest) = split_word(line);
        let (number, message) = split_word(rest);
        let value = std::str::from_utf8(number)
            .ok()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or(Error::InvalidResponse)?;
        return Ok(Response::Err {
            value: ErrorValue::from_wire(value),
            text: text(message),
        });
    }
    if starts_with_token(line, b"D") {
        let payload = line.get(2..).unwrap_or_default();
        return Ok(Response::Data(unescape_data(payload)?));
    }
    if starts_with_token(line, b"S") {
        let (_, rest) = split_word(line);
        let (keyword, status) = split_word(rest);
        if keyword.is_empty() {
            return Err(Error::InvalidResponse);
        }
        return Ok(Response::Status {
            keyword: text(keyword),
            text: text(status),
        });
    }
    if let Some(comment) = line.strip_prefix(b"#") {
        let comment = comment.strip_prefix(b" ").unwrap_or(comment);
        return Ok(Response::Comment(text(comment)));
    }
    if starts_with_token(line, b"INQUIRE") {
        let (_, rest) = split_word(line);
        let (keyword, args) = split_word(rest);
        if keyword.is_empty() {
            return Err(Error::InvalidResponse);
        }
        return Ok(Response::Inquire {
            keyword: text(keyword),
            args: text(args),
        });
    }
    if line == b"END" {
        return Ok(Response::End);
    }
    if line == b"CAN" {
        return Ok(Response::Cancel);
    }
    Err(Error::InvalidResponse)
}

/// Receives the payload of `D` lines.
pub type DataCallback<'a> = &'a mut dyn FnMut(&[u8]) -> Result<()>;

/// Answers an `INQUIRE keyword args` with the data to send back.
pub type InquireCallback<'a> = &'a mut dyn FnMut(&str, &str) -> Result<Vec<u8>>;

/// Receives `S keyword text` lines (and comments as keyword `#`).
pub type StatusCallback<'a> = &'a mut dyn FnMut(&str, &str) -> Result<()>;

impl Context {
    fn require_client(&self) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::NotAClient);
        }
        Ok(())
    }

    /// Read and classify the next line from the server.
    pub fn read_response(&mut self) -> Result<Response> {
        let line = self.read_line()?;
        parse_response(&line)
    }

    /// Wait for the server greeting after connecting.
    pub(crate) fn read_greeting(&mut self) -> Result<()> {
        loop {
            match self.read_response() {
                Ok(Response::Ok(text)) => {
                    debug!(target: "assuan::engine", greeting = %text, "connected to server");
                    return Ok(());
                }
                Ok(Response::Comment(_)) => continue,
                Ok(Response::Err { value, text }) => {
                    return Err(Error::ConnectFailed(format!(
                        "server refused connection: {} ({})",
                        text, value
                    )))
                }
                Ok(other) => {
                    return Err(Error::ConnectFailed(format!(
                        "unexpected greeting {:?}",
                        other
                    )))
                }
                Err(err) => {
                    return Err(Error::ConnectFailed(format!(
                        "reading greeting: {}",
                        err
                    )))
                }
            }
        }
    }

    /// Send `command` and run the exchange until the server's `OK` or
    /// `ERR`.
    ///
    /// Without `data_cb` data is discarded. Without `inquire_cb` an
    /// `INQUIRE` is cancelled and the call fails with
    /// [`Error::NoInquireCallback`] once the server has finished. An error
    /// from any callback stops further callbacks; the exchange is still
    /// drained and that error is returned in place of the server's result.
    pub fn transact(
        &mut self,
        command: &str,
        data_cb: Option<DataCallback<'_>>,
        inquire_cb: Option<InquireCallback<'_>>,
        status_cb: Option<StatusCallback<'_>>,
    ) -> Result<()> {
        self.require_client()?;
        self.ensure_open()?;
        if self.in_transact {
            return Err(Error::NestedCommands);
        }
        self.in_transact = true;
        self.set_state(ContextState::Processing);
        let result = self.run_transact(command, data_cb, inquire_cb, status_cb);
        self.in_transact = false;
        self.set_state(ContextState::AwaitingCommand);
        result
    }

    fn run_transact(
        &mut self,
        command: &str,
        mut data_cb: Option<DataCallback<'_>>,
        mut inquire_cb: Option<InquireCallback<'_>>,
        mut status_cb: Option<StatusCallback<'_>>,
    ) -> Result<()> {
        self.write_line(command)?;

        let mut local_err: Option<Error> = None;
        loop {
            match self.read_response()? {
                Response::Ok(_) => {
                    return match local_err {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                Response::Err { value, text } => {
                    return Err(local_err.unwrap_or_else(|| Error::from_value(value, text)));
                }
                Response::Data(bytes) => {
                    if local_err.is_some() {
                        continue;
                    }
                    match data_cb.as_mut() {
                        Some(cb) => {
                            if let Err(err) = cb(&bytes) {
                                local_err = Some(err);
                            }
                        }
                        None => trace!(target: "assuan::engine", len = bytes.len(), "discarding data"),
                    }
                }
                Response::Status { keyword, text } => {
                    if local_err.is_some() {
                        continue;
                    }
                    if let Some(cb) = status_cb.as_mut() {
                        if let Err(err) = cb(&keyword, &text) {
                            local_err = Some(err);
                        }
                    }
                }
                Response::Comment(comment) => {
                    if local_err.is_some() || !self.flag(ContextFlag::ConveyComments) {
                        continue;
                    }
                    if let Some(cb) = status_cb.as_mut() {
                        if let Err(err) = cb("#", &comment) {
                            local_err = Some(err);
                        }
                    }
                }
                Response::Inquire { keyword, args } => {
                    if local_err.is_some() {
                        self.write_line("CAN")?;
                        continue;
                    }
                    let Some(cb) = inquire_cb.as_mut() else {
                        debug!(target: "assuan::engine", %keyword, "no inquire callback, cancelling");
                        self.write_line("CAN")?;
                        local_err = Some(Error::NoInquireCallback);
                        continue;
                    };
                    match cb(&keyword, &args) {
                        Ok(reply) => {
                            self.send_data(&reply)?;
                            self.write_line("END")?;
                        }
                        Err(err) => {
                            self.write_line("CAN")?;
                            local_err = Some(err);
                        }
                    }
                }
                Response::End | Response::Cancel => return Err(Error::InvalidResponse),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{make_error, ErrorCode, ErrorSource};

    #[test]
    fn classify_lines() {
        assert_eq!(parse_response(b"OK").unwrap(), Response::Ok(String::new()));
        assert_eq!(
            parse_response(b"OK Pleased to meet you").unwrap(),
            Response::Ok("Pleased to meet you".to_string())
        );
        assert_eq!(
            parse_response(b"D 50%25 off%0A").unwrap(),
            Response::Data(b"50% off\n".to_vec())
        );
        assert_eq!(parse_response(b"D").unwrap(), Response::Data(Vec::new()));
        assert_eq!(
            parse_response(b"S PROGRESS 1 2").unwrap(),
            Response::Status {
                keyword: "PROGRESS".to_string(),
                text: "1 2".to_string()
            }
        );
        assert_eq!(
            parse_response(b"# hello").unwrap(),
            Response::Comment("hello".to_string())
        );
        assert_eq!(
            parse_response(b"INQUIRE PASSWD prompt text").unwrap(),
            Response::Inquire {
                keyword: "PASSWD".to_string(),
                args: "prompt text".to_string()
            }
        );
        assert_eq!(parse_response(b"END").unwrap(), Response::End);
        assert_eq!(parse_response(b"CAN").unwrap(), Response::Cancel);
    }

    #[test]
    fn err_lines_decode_the_value() {
        let value = make_error(ErrorSource::ASSUAN, ErrorCode::ASS_UNKNOWN_CMD);
        let line = format!("ERR {} Unknown IPC command", value.to_wire());
        match parse_response(line.as_bytes()).unwrap() {
            Response::Err { value: got, text } => {
                assert_eq!(got.code(), ErrorCode::ASS_UNKNOWN_CMD);
                assert_eq!(got.source(), ErrorSource::ASSUAN);
                assert_eq!(text, "Unknown IPC command");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalid_lines() {
        assert!(matches!(parse_response(b"ERR abc"), Err(Error::InvalidResponse)));
        assert!(matches!(parse_response(b"OKAY"), Err(Error::InvalidResponse)));
        assert!(matches!(parse_response(b"S"), Err(Error::InvalidResponse)));
        assert!(matches!(parse_response(b"INQUIRE"), Err(Error::InvalidResponse)));
        assert!(matches!(parse_response(b"D 100%"), Err(Error::Syntax(_))));
    }

    #[test]
    fn transact_needs_a_client() {
        let mut ctx = Context::new();
        assert!(matches!(
            ctx.transact("NOP", None, None, None),
            Err(Error::NotAClient)
        ));
    }
}
