//-
// Copyright (c) 2024, Mailgather contributors
//
// This file is part of Mailgather.
//
// Mailgather is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgather is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailgather. If not, see <http://www.gnu.org/licenses/>.

//! A small synchronous IMAP4rev1 client.
//!
//! Only the handful of commands needed to locate attachments are supported.
//! Responses are not parsed beyond separating untagged data from the tagged
//! completion; callers interpret the data lines themselves.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str;
use std::time::Duration;

use chrono::prelude::*;
use lazy_static::lazy_static;
use openssl::ssl::{HandshakeError, SslConnector, SslMethod};
use regex::bytes::Regex;
use thiserror::Error;

use super::lex::{CommandBuffer, LexWriter};
use super::structure::SectionPath;
use crate::pipeline::task::Account;
use crate::support::cancel::{CancelToken, Registration};
use crate::support::config::MessageType;
use crate::support::log_prefix::LogPrefix;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"~?\{([0-9]+)\+?\}\r\n$"#).unwrap();
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] openssl::ssl::Error),
    #[error("Server closed the connection: {0}")]
    Bye(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// The outcome of one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    /// Untagged response lines, without the trailing CRLF. Literals are
    /// included inline.
    pub data: Vec<Vec<u8>>,
    /// The human-readable text of the tagged completion.
    pub text: String,
}

impl Response {
    /// The whole response in roughly its wire form, for diagnostics.
    pub fn to_wire_string(&self) -> String {
        let mut s = String::new();
        for line in &self.data {
            s.push_str(&String::from_utf8_lossy(line));
            s.push('\n');
        }
        s.push_str(match self.status {
            Status::Ok => "OK ",
            Status::No => "NO ",
            Status::Bad => "BAD ",
        });
        s.push_str(&self.text);
        s
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchItem {
    Envelope,
    BodyStructure,
    BodyPeek(SectionPath),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Login {
        username: &'a str,
        password: &'a str,
    },
    Id {
        name: &'a str,
        version: &'a str,
    },
    Select(&'a str),
    Search {
        since: Option<NaiveDate>,
        before: Option<NaiveDate>,
        message_type: MessageType,
    },
    Fetch {
        msg_num: u32,
        item: FetchItem,
    },
    Logout,
}

impl Command<'_> {
    pub fn name(&self) -> &'static str {
        match *self {
            Command::Login { .. } => "LOGIN",
            Command::Id { .. } => "ID",
            Command::Select(_) => "SELECT",
            Command::Search { .. } => "SEARCH",
            Command::Fetch { .. } => "FETCH",
            Command::Logout => "LOGOUT",
        }
    }

    pub fn write_to<W: super::lex::LexOutput>(
        &self,
        w: &mut LexWriter<W>,
    ) -> io::Result<()> {
        w.verbatim(self.name())?;
        match *self {
            Command::Login { username, password } => {
                w.verbatim(" ")?;
                w.astring(username)?;
                w.verbatim(" ")?;
                w.astring(password)?;
            }
            Command::Id { name, version } => {
                w.verbatim(" (\"name\" ")?;
                w.string(name)?;
                w.verbatim(" \"version\" ")?;
                w.string(version)?;
                w.verbatim(")")?;
            }
            Command::Select(mailbox) => {
                w.verbatim(" ")?;
                w.mailbox(mailbox)?;
            }
            Command::Search {
                since,
                before,
                message_type,
            } => {
                if let Some(since) = since {
                    w.verbatim(" SINCE ")?;
                    w.date(&since)?;
                }
                if let Some(before) = before {
                    w.verbatim(" BEFORE ")?;
                    w.date(&before)?;
                }
                w.verbatim(" ")?;
                w.verbatim(message_type.search_key())?;
            }
            Command::Fetch { msg_num, ref item } => {
                w.verbatim(" ")?;
                w.num_u32(msg_num)?;
                match *item {
                    FetchItem::Envelope => w.verbatim(" (ENVELOPE)")?,
                    FetchItem::BodyStructure => {
                        w.verbatim(" (BODYSTRUCTURE)")?
                    }
                    FetchItem::BodyPeek(ref section) => {
                        w.verbatim(&format!(" (BODY.PEEK[{}])", section))?
                    }
                }
            }
            Command::Logout => (),
        }

        Ok(())
    }
}

/// An authenticated-or-not connection to one server.
pub trait Session: Send {
    fn command(&mut self, command: &Command<'_>) -> Result<Response, Error>;
}

/// Opens sessions.
///
/// The session returned has consumed the server greeting but has not logged
/// in.
pub trait Connector: Sync {
    fn connect(
        &self,
        account: &Account,
        log_prefix: &LogPrefix,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Session>, Error>;
}

/// Connects with implicit TLS.
pub struct TlsConnector {
    pub timeout: Duration,
}

impl Connector for TlsConnector {
    fn connect(
        &self,
        account: &Account,
        log_prefix: &LogPrefix,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Session>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut last_error = io::Error::new(
            io::ErrorKind::NotFound,
            format!("Host not found: {}", account.host),
        );
        let mut socket = None;
        let addresses =
            (&account.host as &str, account.port).to_socket_addrs()?;
        for address in addresses {
            log::trace!("{} Connecting to {}", log_prefix, address);
            match TcpStream::connect_timeout(&address, self.timeout) {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(e) => last_error = e,
            }
        }
        let socket = socket.ok_or(last_error)?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;
        let registration = cancel.register(&socket)?;

        log::trace!("{} Starting TLS handshake", log_prefix);
        let ssl_stream = SslConnector::builder(SslMethod::tls())?
            .build()
            .connect(&account.host, socket)
            .map_err(|e| match e {
                HandshakeError::SetupFailure(es) => Error::Ssl(es),
                HandshakeError::Failure(f) => Error::Handshake(f.into_error()),
                // Only possible when the socket times out
                HandshakeError::WouldBlock(_) => Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                )),
            })?;

        let mut client = Client::new(ssl_stream, log_prefix.clone());
        client._registration = Some(registration);
        client.read_greeting()?;
        Ok(Box::new(client))
    }
}

pub struct Client<S> {
    io: BufReader<S>,
    log_prefix: LogPrefix,
    next_tag: u64,
    _registration: Option<Registration>,
}

impl<S: Read + Write + Send> Session for Client<S> {
    fn command(&mut self, command: &Command<'_>) -> Result<Response, Error> {
        Client::command(self, command)
    }
}

impl<S: Read + Write> Client<S> {
    pub fn new(io: S, log_prefix: LogPrefix) -> Self {
        Client {
            io: BufReader::new(io),
            log_prefix,
            next_tag: 1,
            _registration: None,
        }
    }

    pub fn read_greeting(&mut self) -> Result<(), Error> {
        let mut line = Vec::new();
        self.read_logical_line(&mut line)?;
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end();

        if starts_with_ci(line, "* OK") || starts_with_ci(line, "* PREAUTH") {
            Ok(())
        } else if starts_with_ci(line, "* BYE") {
            Err(Error::Bye(line[5..].trim().to_owned()))
        } else {
            Err(Error::Protocol(format!("Unexpected greeting: {}", line)))
        }
    }

    pub fn command(
        &mut self,
        command: &Command<'_>,
    ) -> Result<Response, Error> {
        let tag = format!("M{}", self.next_tag);
        self.next_tag += 1;

        let mut w = LexWriter::new(CommandBuffer::default());
        w.verbatim(&tag)?;
        w.verbatim(" ")?;
        command.write_to(&mut w)?;
        w.verbatim("\r\n")?;
        let segments = w.into_inner().segments;

        let mut data = Vec::new();
        for (ix, segment) in segments.iter().enumerate() {
            if ix > 0 {
                // Synchronising literal; wait for permission
                let rejected = self.await_continuation(&tag, &mut data)?;
                if let Some(response) = rejected {
                    return Ok(response);
                }
            }

            // Don't put passwords in the log
            if let Command::Login { .. } = *command {
                let censored = format!("{} LOGIN <censored>", tag);
                self.trace(">>", censored.as_bytes());
            } else {
                self.trace(">>", segment);
            }
            self.io.get_mut().write_all(segment)?;
        }
        self.io.get_mut().flush()?;

        loop {
            let mut line = Vec::new();
            match self.read_logical_line(&mut line) {
                Ok(()) => (),
                // Servers may hang up right after BYE without completing
                // LOGOUT
                Err(Error::Io(ref e))
                    if io::ErrorKind::UnexpectedEof == e.kind()
                        && Command::Logout == *command =>
                {
                    return Ok(Response {
                        status: Status::Ok,
                        data,
                        text: String::new(),
                    });
                }
                Err(e) => return Err(e),
            }

            if let Some(response) = completion(&tag, &line, &mut data) {
                return Ok(response);
            }
        }
    }

    /// Read until a continuation request arrives.
    ///
    /// If the server instead completes the command (i.e., rejects the
    /// literal), returns that completion.
    fn await_continuation(
        &mut self,
        tag: &str,
        data: &mut Vec<Vec<u8>>,
    ) -> Result<Option<Response>, Error> {
        loop {
            let mut line = Vec::new();
            self.read_logical_line(&mut line)?;
            if line.starts_with(b"+") {
                return Ok(None);
            }
            if let Some(response) = completion(tag, &line, data) {
                return Ok(Some(response));
            }
        }
    }

    fn read_line_raw(&mut self, dst: &mut Vec<u8>) -> Result<usize, Error> {
        let start = dst.len();
        let nread = self.io.read_until(b'\n', dst)?;
        self.trace("<<", &dst[start..]);
        Ok(nread)
    }

    fn read_data_raw(
        &mut self,
        dst: &mut Vec<u8>,
        n: u64,
    ) -> Result<(), Error> {
        let start = dst.len();
        let nread = self.io.by_ref().take(n).read_to_end(dst)?;
        self.trace("<<[lit]", &dst[start..]);
        if n > nread as u64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Hit EOF before end of literal",
            )));
        }

        Ok(())
    }

    /// Read one line, along with any literals it contains and the lines
    /// following those literals.
    fn read_logical_line(&mut self, dst: &mut Vec<u8>) -> Result<(), Error> {
        loop {
            let nread = self.read_line_raw(dst)?;
            if 0 == nread {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed by server",
                )));
            }
            if !dst.ends_with(b"\r\n") {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Line didn't end with CRLF",
                )));
            }

            let literal_len = LITERAL_AT_EOL
                .captures(&dst[dst.len() - nread..])
                .and_then(|cap| cap.get(1))
                .and_then(|len| str::from_utf8(len.as_bytes()).ok())
                .and_then(|len| len.parse::<u64>().ok());

            match literal_len {
                Some(len) => self.read_data_raw(dst, len)?,
                None => break,
            }
        }

        Ok(())
    }

    fn trace(&self, what: &str, data: &[u8]) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        let (data, truncated) = data.split_at(data.len().min(256));
        let mut start = 0;
        for split in memchr::memchr_iter(b'\n', data)
            .chain(std::iter::once(data.len().saturating_sub(1)))
        {
            if split < start || data.is_empty() {
                continue;
            }

            let line = &data[start..=split];
            start = split + 1;

            let mut vis = String::new();
            for &byte in line {
                match byte {
                    b' '..=b'~' => vis.push(byte as char),
                    b'\n' | b'\r' => (),
                    b => vis.push_str(&format!("\\x{:02X}", b)),
                }
            }
            log::trace!("{} WIRE {} {}", self.log_prefix, what, vis);
        }

        if !truncated.is_empty() {
            log::trace!(
                "{} WIRE {} <{} more bytes>",
                self.log_prefix,
                what,
                truncated.len()
            );
        }
    }
}

fn starts_with_ci(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// If `line` is the tagged completion for `tag`, build the response.
/// Otherwise, record it as untagged data.
fn completion(
    tag: &str,
    line: &[u8],
    data: &mut Vec<Vec<u8>>,
) -> Option<Response> {
    let body = line.strip_suffix(b"\r\n").unwrap_or(line);
    let tagged = body
        .strip_prefix(tag.as_bytes())
        .filter(|rest| rest.starts_with(b" "));

    let rest = match tagged {
        Some(rest) => String::from_utf8_lossy(&rest[1..]).into_owned(),
        None => {
            if body.starts_with(b"*") {
                data.push(body.to_vec());
            }
            return None;
        }
    };

    let (status, text) = match rest.find(' ') {
        Some(ix) => (&rest[..ix], rest[ix + 1..].to_owned()),
        None => (&rest[..], String::new()),
    };
    let status = if status.eq_ignore_ascii_case("OK") {
        Status::Ok
    } else if status.eq_ignore_ascii_case("NO") {
        Status::No
    } else {
        Status::Bad
    };

    Some(Response {
        status,
        data: std::mem::take(data),
        text,
    })
}
