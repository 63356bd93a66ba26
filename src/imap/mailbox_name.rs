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

//! Mailbox names on the wire.
//!
//! IMAP4rev1 servers expect mailbox names outside of printable ASCII to be
//! sent in "modified UTF-7" (RFC 3501, Section 5.1.3). Printable ASCII
//! characters stand for themselves, except `&` which is written `&-`. Runs of
//! other characters are converted to UTF-16BE and written as `&`, the modified
//! base64 of those bytes (with `,` in place of `/` and no padding), then `-`.
//!
//! Only encoding is needed; mailbox names come from configuration, never from
//! the server.

use std::borrow::Cow;

/// Convert a UTF-8 mailbox name to its modified UTF-7 wire form.
pub fn to_wire(name: &str) -> Cow<'_, str> {
    if name.bytes().all(|b| is_direct(b) && b'&' != b) {
        return Cow::Borrowed(name);
    }

    let mut out = String::with_capacity(name.len() + 8);
    let mut run = Vec::<u16>::new();
    for ch in name.chars() {
        if ch.is_ascii() && is_direct(ch as u8) {
            flush_run(&mut out, &mut run);
            if '&' == ch {
                out.push_str("&-");
            } else {
                out.push(ch);
            }
        } else {
            let mut units = [0u16; 2];
            run.extend_from_slice(ch.encode_utf16(&mut units));
        }
    }
    flush_run(&mut out, &mut run);

    Cow::Owned(out)
}

fn is_direct(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

fn flush_run(out: &mut String, run: &mut Vec<u16>) {
    if run.is_empty() {
        return;
    }

    let bytes = run
        .iter()
        .flat_map(|unit| unit.to_be_bytes().to_vec())
        .collect::<Vec<u8>>();
    out.push('&');
    out.push_str(&base64::encode_config(&bytes, base64::IMAP_MUTF7));
    out.push('-');
    run.clear();
}
