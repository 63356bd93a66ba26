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

//! Tasks, and the results and failures they produce.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::crawler::Method;
use crate::imap::structure::{Envelope, NonMultiPart};

/// An IMAP account.
///
/// Accounts are compared by value. Tasks for equal accounts can share an IMAP
/// session.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub domain: String,
    pub password: String,
}

impl Account {
    /// The `username@domain` form, which is also the login name.
    pub fn address(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Account({} at {}:{})", self.address(), self.host, self.port)
    }
}

/// One unit of work for a dispatcher.
///
/// `payload` distinguishes the pipeline phases; see the aliases below.
#[derive(Clone, Debug)]
pub struct Task<P> {
    pub account: Arc<Account>,
    pub mailbox: String,
    /// The number of attempts made so far, including the one in progress.
    pub retries: u32,
    pub payload: P,
}

impl<P> Task<P> {
    pub fn new(account: Arc<Account>, mailbox: String, payload: P) -> Self {
        Task {
            account,
            mailbox,
            retries: 0,
            payload,
        }
    }
}

/// Search a mailbox for messages.
pub type MessageTask = Task<()>;
/// Find the attachments and HTML parts of the message with this sequence
/// number.
pub type NormalAttachmentTask = Task<u32>;
/// Find large-attachment links in one HTML part.
pub type UrlTask = Task<HtmlPartTarget>;
/// Resolve one large-attachment link.
pub type LargeAttachmentTask = Task<LinkTarget>;

#[derive(Clone, Debug)]
pub struct HtmlPartTarget {
    pub msg_num: u32,
    pub envelope: Arc<Envelope>,
    pub html_part: NonMultiPart,
}

#[derive(Clone, Debug)]
pub struct LinkTarget {
    pub msg_num: u32,
    pub envelope: Arc<Envelope>,
    pub url: String,
}

/// Everything found for one message.
#[derive(Clone, Debug)]
pub struct Attachments {
    pub envelope: Arc<Envelope>,
    pub normal_attachments: Vec<NonMultiPart>,
    pub html_parts: Vec<NonMultiPart>,
    /// Candidate large-attachment links found in the HTML parts.
    pub urls: BTreeSet<String>,
    /// Resolved large-attachment downloads.
    pub large_attachments: Vec<(Method, String)>,
    /// Set when resolving links for this message hit an error-level issue.
    pub error_occurred: bool,
}

impl Attachments {
    pub fn new(
        envelope: Arc<Envelope>,
        normal_attachments: Vec<NonMultiPart>,
        html_parts: Vec<NonMultiPart>,
    ) -> Self {
        Attachments {
            envelope,
            normal_attachments,
            html_parts,
            urls: BTreeSet::new(),
            large_attachments: Vec::new(),
            error_occurred: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Not counted as an issue at all.
    Ignore,
    ConnectionFailed,
    DecodeError,
    HandleError,
    HtmlParsingError,
    LinkSearchingError,
    MissingMsgId,
    RequestError,
    Unknown,
    UnmatchedMsgId,
}

impl ErrorKind {
    /// Whether a task failing this way may succeed if simply tried again.
    pub fn is_retryable(self) -> bool {
        ErrorKind::ConnectionFailed == self
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ErrorKind::Ignore => "IGNORE",
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::DecodeError => "DECODE_ERROR",
            ErrorKind::HandleError => "HANDLE_ERROR",
            ErrorKind::HtmlParsingError => "HTML_PARSING_ERROR",
            ErrorKind::LinkSearchingError => "LINK_SEARCHING_ERROR",
            ErrorKind::MissingMsgId => "MISSING_MSG_ID",
            ErrorKind::RequestError => "REQUEST_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
            ErrorKind::UnmatchedMsgId => "UNMATCHED_MSG_ID",
        };
        f.write_str(s)
    }
}

/// Issue severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Info => "info",
        })
    }
}

/// Ordered key/value pairs describing the context of an issue.
pub type Details = Vec<(String, Option<String>)>;

/// Why one attempt at a task failed.
#[derive(Clone, Debug)]
pub struct Failure {
    pub kind: ErrorKind,
    pub level: Level,
    pub details: Details,
    /// The raw protocol response which triggered the failure, if any.
    pub response: Option<String>,
}

impl Failure {
    pub fn new(kind: ErrorKind, level: Level) -> Self {
        Failure {
            kind,
            level,
            details: Details::new(),
            response: None,
        }
    }

    pub fn detail(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.details.push((key.into(), Some(value.into())));
        self
    }

    pub fn details(
        mut self,
        details: impl IntoIterator<Item = (String, Option<String>)>,
    ) -> Self {
        self.details.extend(details);
        self
    }

    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }
}

/// A task's terminal success.
#[derive(Clone, Debug)]
pub struct Found<P, R> {
    pub task: Task<P>,
    pub value: R,
}

/// A task's terminal failure.
#[derive(Clone, Debug)]
pub struct TaskError<P> {
    pub task: Task<P>,
    pub failure: Failure,
}

pub type Outcome<P, R> = Result<Found<P, R>, TaskError<P>>;
