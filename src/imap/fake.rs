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

//! An in-memory IMAP server for tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::client::{
    Command, Connector, Error, FetchItem, Response, Session, Status,
};
use super::lex::LexWriter;
use crate::pipeline::task::Account;
use crate::support::cancel::CancelToken;
use crate::support::log_prefix::LogPrefix;

/// One message, described by the wire form of its FETCH items.
#[derive(Clone, Debug, Default)]
pub struct FakeMessage {
    pub envelope: String,
    pub bodystructure: String,
    /// Raw content by section specifier.
    pub sections: Vec<(String, Vec<u8>)>,
}

impl FakeMessage {
    /// A message with the given Message-ID and body structure.
    pub fn new(message_id: &str, bodystructure: &str) -> Self {
        FakeMessage {
            envelope: format!(
                "(\"Mon, 1 Jan 2024 10:00:00 +0800\" \"Report\" \
                 ((\"Alice\" NIL \"alice\" \"example.com\")) NIL NIL \
                 ((NIL NIL \"bob\" \"example.com\")) NIL NIL NIL {})",
                if message_id.is_empty() {
                    "NIL".to_owned()
                } else {
                    format!("\"{}\"", message_id)
                }
            ),
            bodystructure: bodystructure.to_owned(),
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: &str, data: &[u8]) -> Self {
        self.sections.push((section.to_owned(), data.to_vec()));
        self
    }
}

#[derive(Clone, Default)]
pub struct FakeServer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Messages by (login, mailbox)
    mailboxes: Mutex<HashMap<(String, String), Vec<FakeMessage>>>,
    connect_failures: Mutex<u32>,
    select_failures: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mailbox(
        &self,
        login: &str,
        mailbox: &str,
        messages: Vec<FakeMessage>,
    ) {
        self.inner
            .mailboxes
            .lock()
            .unwrap()
            .insert((login.to_owned(), mailbox.to_owned()), messages);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) {
        *self.inner.connect_failures.lock().unwrap() = n;
    }

    /// Make the next `n` attempts to select `mailbox` drop the connection.
    pub fn fail_selects(&self, mailbox: &str, n: u32) {
        self.inner
            .select_failures
            .lock()
            .unwrap()
            .insert(mailbox.to_owned(), n);
    }

    /// Every command received, in wire form without the tag.
    pub fn log(&self) -> Vec<String> {
        self.inner.log.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }
}

impl Connector for FakeServer {
    fn connect(
        &self,
        _account: &Account,
        _log_prefix: &LogPrefix,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Session>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        {
            let mut failures = self.inner.connect_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
        }

        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            inner: Arc::clone(&self.inner),
            login: None,
            selected: None,
        }))
    }
}

struct FakeSession {
    inner: Arc<Inner>,
    login: Option<String>,
    selected: Option<Vec<FakeMessage>>,
}

fn ok(data: Vec<Vec<u8>>) -> Result<Response, Error> {
    Ok(Response {
        status: Status::Ok,
        data,
        text: "done".to_owned(),
    })
}

fn no(text: &str) -> Result<Response, Error> {
    Ok(Response {
        status: Status::No,
        data: Vec::new(),
        text: text.to_owned(),
    })
}

impl Session for FakeSession {
    fn command(&mut self, command: &Command<'_>) -> Result<Response, Error> {
        let mut wire = LexWriter::new(Vec::<u8>::new());
        command.write_to(&mut wire)?;
        self.inner
            .log
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&wire.into_inner()).into_owned());

        match *command {
            Command::Login { username, password } => {
                if "wrong" == password {
                    no("[AUTHENTICATIONFAILED] Invalid credentials")
                } else {
                    self.login = Some(username.to_owned());
                    ok(Vec::new())
                }
            }
            Command::Id { .. } => ok(vec![b"* ID NIL".to_vec()]),
            Command::Select(mailbox) => {
                {
                    let mut failures =
                        self.inner.select_failures.lock().unwrap();
                    if let Some(n) = failures.get_mut(mailbox) {
                        if *n > 0 {
                            *n -= 1;
                            return Err(Error::Io(io::Error::new(
                                io::ErrorKind::ConnectionReset,
                                "connection reset",
                            )));
                        }
                    }
                }

                let key = (
                    self.login.clone().unwrap_or_default(),
                    mailbox.to_owned(),
                );
                match self.inner.mailboxes.lock().unwrap().get(&key) {
                    Some(messages) => {
                        self.selected = Some(messages.clone());
                        ok(vec![format!("* {} EXISTS", messages.len())
                            .into_bytes()])
                    }
                    None => no("[NONEXISTENT] No such mailbox"),
                }
            }
            Command::Search { .. } => {
                let count = self.selected.as_ref().map_or(0, Vec::len);
                let mut line = "* SEARCH".to_owned();
                for n in 1..=count {
                    line.push_str(&format!(" {}", n));
                }
                ok(vec![line.into_bytes()])
            }
            Command::Fetch { msg_num, ref item } => {
                let message = self
                    .selected
                    .as_ref()
                    .and_then(|m| m.get(msg_num as usize - 1));
                let message = match message {
                    Some(message) => message,
                    None => return ok(Vec::new()),
                };

                let line = match *item {
                    FetchItem::Envelope => format!(
                        "* {} FETCH (ENVELOPE {})",
                        msg_num, message.envelope
                    )
                    .into_bytes(),
                    FetchItem::BodyStructure => format!(
                        "* {} FETCH (BODYSTRUCTURE {})",
                        msg_num, message.bodystructure
                    )
                    .into_bytes(),
                    FetchItem::BodyPeek(ref section) => {
                        let section = section.to_string();
                        let data = message
                            .sections
                            .iter()
                            .find(|s| s.0 == section)
                            .map(|s| s.1.clone())
                            .unwrap_or_default();
                        let mut line = format!(
                            "* {} FETCH (BODY[{}] {{{}}}\r\n",
                            msg_num,
                            section,
                            data.len()
                        )
                        .into_bytes();
                        line.extend_from_slice(&data);
                        line.push(b')');
                        line
                    }
                };
                ok(vec![line])
            }
            Command::Logout => ok(vec![b"* BYE".to_vec()]),
        }
    }
}
