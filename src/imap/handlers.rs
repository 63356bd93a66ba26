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

//! The per-phase IMAP handlers.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::client::{Command, FetchItem, Response};
use super::dispatch::Imap;
use super::structure::{
    self, BodyStructure, Envelope, NonMultiPart, ParseError,
};
use crate::crawler::providers;
use crate::mime::content_encoding::{decode_charset, decode_transfer};
use crate::mime::html::extract_links;
use crate::pipeline::details::{envelope_details, error_details};
use crate::pipeline::task::{
    Attachments, ErrorKind, Failure, Level, NormalAttachmentTask, UrlTask,
};
use crate::support::config::SearchSettings;

/// Find the sequence numbers of the messages in the selected mailbox
/// matching `search`.
pub fn search_messages(
    imap: &mut Imap<'_>,
    search: &SearchSettings,
) -> Result<Vec<u32>, Failure> {
    let response = imap.request(
        &Command::Search {
            since: search.since,
            before: search.before,
            message_type: search.message_type,
        },
        None,
        0,
    )?;

    let mut msg_nums = Vec::new();
    for line in &response.data {
        let line = String::from_utf8_lossy(line);
        let mut words = line.split_ascii_whitespace();
        let is_search = Some("*") == words.next()
            && words
                .next()
                .map_or(false, |w| "SEARCH".eq_ignore_ascii_case(w));
        if !is_search {
            continue;
        }

        for word in words {
            let msg_num = word.parse::<u32>().map_err(|_| {
                Failure::new(ErrorKind::Unknown, Level::Error)
                    .detail(
                        "Error",
                        format!("Bad message number in SEARCH: {:?}", word),
                    )
                    .response(response.to_wire_string())
            })?;
            msg_nums.push(msg_num);
        }
    }

    log::debug!("{} {} messages found", imap.log_prefix(), msg_nums.len());
    Ok(msg_nums)
}

/// Find the attachments and HTML parts of one message.
pub fn search_normal_attachments(
    imap: &mut Imap<'_>,
    task: &NormalAttachmentTask,
) -> Result<Attachments, Failure> {
    let msg_num = task.payload;
    let (envelope, response) = fetch_envelope(imap, msg_num)?;
    if envelope.message_id.is_none() {
        return Err(Failure::new(ErrorKind::MissingMsgId, Level::Error)
            .details(envelope_details(&envelope))
            .response(response.to_wire_string()));
    }

    let response = imap.request(
        &Command::Fetch {
            msg_num,
            item: FetchItem::BodyStructure,
        },
        Some(1),
        0,
    )?;
    let body = parse_first(&response, structure::parse_bodystructure)
        .map_err(|f| f.details(envelope_details(&envelope)))?;

    Ok(Attachments::new(
        Arc::new(envelope),
        normal_attachments(&body),
        html_parts(&body),
    ))
}

/// Leaves marked as attachments with a file name.
///
/// An embedded message whose own structure was described is not itself
/// collected; its attachments are found by walking into it instead.
fn normal_attachments(body: &BodyStructure) -> Vec<NonMultiPart> {
    leaves(body)
        .filter(|part| {
            !part.message.as_ref().map_or(false, |m| m.body.is_described())
        })
        .filter(|part| part.is_attachment() && part.filename().is_some())
        .cloned()
        .collect()
}

fn html_parts(body: &BodyStructure) -> Vec<NonMultiPart> {
    leaves(body)
        .filter(|part| part.is_type("text", "html") && !part.is_attachment())
        .cloned()
        .collect()
}

fn leaves(body: &BodyStructure) -> impl Iterator<Item = &NonMultiPart> {
    body.walk().filter_map(|part| match *part {
        BodyStructure::NonMultiPart(ref p) => Some(p),
        BodyStructure::MultiPart(_) => None,
    })
}

/// Find the large-attachment links in one HTML part.
///
/// Only links some provider knows how to resolve are returned.
pub fn search_urls(
    imap: &mut Imap<'_>,
    task: &UrlTask,
) -> Result<BTreeSet<String>, Failure> {
    let target = &task.payload;
    let (envelope, response) = fetch_envelope(imap, target.msg_num)?;
    if envelope.message_id.is_none()
        || envelope.message_id != target.envelope.message_id
    {
        return Err(Failure::new(ErrorKind::UnmatchedMsgId, Level::Error)
            .details(envelope_details(&envelope))
            .response(response.to_wire_string()));
    }

    let part = &target.html_part;
    let response = imap.request(
        &Command::Fetch {
            msg_num: target.msg_num,
            item: FetchItem::BodyPeek(part.section.clone()),
        },
        Some(1),
        part.size.unwrap_or(0),
    )?;
    let raw = parse_first(&response, structure::parse_body_section)
        .map_err(|f| f.details(envelope_details(&envelope)))?;

    let decode_failure = |e: &(dyn std::error::Error + 'static)| {
        Failure::new(ErrorKind::DecodeError, Level::Error)
            .details(envelope_details(&envelope))
            .details(error_details(e))
    };
    let decoded = decode_transfer(part.encoding.as_deref(), &raw)
        .map_err(|e| decode_failure(&e))?;
    let html = decode_charset(part.charset(), &decoded)
        .map_err(|e| decode_failure(&e))?;

    let urls = extract_links(&html)
        .into_iter()
        .filter(|url| providers::handler_for(url).is_some())
        .collect::<BTreeSet<_>>();
    log::debug!(
        "{} #{} section {}: {} links",
        imap.log_prefix(),
        target.msg_num,
        part.section,
        urls.len()
    );
    Ok(urls)
}

fn fetch_envelope(
    imap: &mut Imap<'_>,
    msg_num: u32,
) -> Result<(Envelope, Response), Failure> {
    let response = imap.request(
        &Command::Fetch {
            msg_num,
            item: FetchItem::Envelope,
        },
        Some(1),
        0,
    )?;
    let envelope = parse_first(&response, structure::parse_envelope)?;
    Ok((envelope, response))
}

/// Parse the first untagged line `parse` accepts.
///
/// Malformed responses are `UNKNOWN`; they indicate a server this program
/// does not understand rather than a transient problem.
fn parse_first<T>(
    response: &Response,
    parse: fn(&[u8]) -> Result<T, ParseError>,
) -> Result<T, Failure> {
    let mut last_error = ParseError::MissingItem("FETCH");
    for line in &response.data {
        match parse(line) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e,
        }
    }

    Err(Failure::new(ErrorKind::Unknown, Level::Error)
        .details(error_details(&last_error))
        .response(response.to_wire_string()))
}
