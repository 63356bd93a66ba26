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

//! Human-readable details attached to issues.

use std::error::Error;

use chrono::DateTime;

use super::task::Details;
use crate::imap::structure::{Address, Envelope};
use crate::mime::encoded_word::decode_header;

/// Summarise `envelope` as issue details.
///
/// Absent fields are omitted. The date is only included if it can be
/// understood.
pub fn envelope_details(envelope: &Envelope) -> Details {
    let mut details = Details::new();

    if let Some(ref subject) = envelope.subject {
        details.push((
            "Subject".to_owned(),
            Some(decode_header(subject).into_owned()),
        ));
    }

    if let Some(date) = envelope.date.as_deref().and_then(parse_date) {
        details.push(("Date".to_owned(), Some(date)));
    }

    for &(key, ref addresses) in
        &[("Sender", &envelope.sender), ("To", &envelope.to)]
    {
        if let Some(ref addresses) = **addresses {
            let joined = addresses
                .iter()
                .map(format_address)
                .collect::<Vec<_>>()
                .join(", ");
            details.push((key.to_owned(), Some(joined)));
        }
    }

    details
}

/// Describe `err` and its chain of causes.
pub fn error_details(err: &(dyn Error + 'static)) -> Details {
    let mut details = vec![("Error".to_owned(), Some(err.to_string()))];
    let mut source = err.source();
    while let Some(cause) = source {
        details.push(("Caused by".to_owned(), Some(cause.to_string())));
        source = cause.source();
    }
    details
}

/// Format an address as `<"Display Name" user@domain>`.
pub fn format_address(address: &Address) -> String {
    match address.display_name {
        Some(ref name) => format!(
            "<\"{}\" {}>",
            decode_header(name).trim_matches(|c| '"' == c || ' ' == c),
            address.address()
        ),
        None => format!("<{}>", address.address()),
    }
}

fn parse_date(raw: &str) -> Option<String> {
    // Trailing comments such as "(PDT)" are common but not understood by
    // the parser
    let raw = match raw.find('(') {
        Some(ix) => &raw[..ix],
        None => raw,
    };

    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|date| date.format("%Y-%m-%d %H:%M:%S%:z").to_string())
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            date: Some("Wed, 17 Jul 1996 02:23:25 -0700 (PDT)".to_owned()),
            subject: Some("=?UTF-8?B?5pyI5oql?=".to_owned()),
            sender: Some(vec![Address {
                display_name: Some("=?utf-8?Q?Terry_Gray?=".to_owned()),
                username: "gray".to_owned(),
                domain: "cac.washington.edu".to_owned(),
            }]),
            to: Some(vec![
                Address {
                    display_name: None,
                    username: "a".to_owned(),
                    domain: "x.com".to_owned(),
                },
                Address {
                    display_name: Some("\"B\"".to_owned()),
                    username: "b".to_owned(),
                    domain: "x.com".to_owned(),
                },
            ]),
            message_id: Some("<1@x>".to_owned()),
            ..Envelope::default()
        }
    }

    fn detail<'a>(details: &'a Details, key: &str) -> Option<&'a str> {
        details
            .iter()
            .find(|&&(ref k, _)| k == key)
            .and_then(|&(_, ref v)| v.as_deref())
    }

    #[test]
    fn full_envelope() {
        let details = envelope_details(&envelope());
        let keys = details.iter().map(|d| &d.0 as &str).collect::<Vec<_>>();
        assert_eq!(vec!["Subject", "Date", "Sender", "To"], keys);
        assert_eq!(Some("月报"), detail(&details, "Subject"));
        assert_eq!(
            Some("1996-07-17 02:23:25-07:00"),
            detail(&details, "Date")
        );
        assert_eq!(
            Some("<\"Terry Gray\" gray@cac.washington.edu>"),
            detail(&details, "Sender")
        );
        assert_eq!(
            Some("<a@x.com>, <\"B\" b@x.com>"),
            detail(&details, "To")
        );
    }

    #[test]
    fn unparseable_date_and_absent_fields() {
        let details = envelope_details(&Envelope {
            date: Some("yesterday".to_owned()),
            ..Envelope::default()
        });
        assert!(details.is_empty());
    }

    #[test]
    fn error_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("fetch failed")]
        struct Outer(#[source] io::Error);

        let err = Outer(io::Error::new(io::ErrorKind::Other, "reset"));
        assert_eq!(
            vec![
                ("Error".to_owned(), Some("fetch failed".to_owned())),
                ("Caused by".to_owned(), Some("reset".to_owned())),
            ],
            error_details(&err)
        );
    }
}
