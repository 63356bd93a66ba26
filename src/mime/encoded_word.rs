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

//! RFC 2047 "encoded words" in header values.

use std::borrow::Cow;

use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::content_encoding::qp_decode;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?([^?\s]+)\?([bBqQ])\?([^?\s]*)\?=").unwrap();
}

/// Decode all encoded words in the header value `raw`.
///
/// Whitespace between two adjacent encoded words is removed. Encoded words
/// which cannot be decoded, for example due to an unknown charset, are left
/// as they are.
pub fn decode_header(raw: &str) -> Cow<'_, str> {
    let mut out = String::new();
    let mut last_end = 0;
    let mut after_word = false;

    for captures in ENCODED_WORD.captures_iter(raw) {
        let whole = match captures.get(0) {
            Some(whole) => whole,
            None => continue,
        };
        let gap = &raw[last_end..whole.start()];
        last_end = whole.end();

        match ew_decode(&captures) {
            Some(decoded) => {
                if !after_word || !gap.trim().is_empty() {
                    out.push_str(gap);
                }
                out.push_str(&decoded);
                after_word = true;
            }
            None => {
                out.push_str(gap);
                out.push_str(whole.as_str());
                after_word = false;
            }
        }
    }

    if 0 == last_end {
        return Cow::Borrowed(raw);
    }

    out.push_str(&raw[last_end..]);
    Cow::Owned(out)
}

fn ew_decode(captures: &Captures<'_>) -> Option<String> {
    // RFC 2231 permits a language suffix: =?utf-8*en?Q?...?=
    let charset = captures.get(1)?.as_str().split('*').next()?;
    let content = captures.get(3)?.as_str().as_bytes();

    let bytes = match captures.get(2)?.as_str() {
        "q" | "Q" => {
            let spaced = content
                .iter()
                .map(|&b| if b'_' == b { b' ' } else { b })
                .collect::<Vec<u8>>();
            qp_decode(&spaced).into_owned()
        }
        _ => {
            // Some agents omit the padding
            let mut padded = content.to_vec();
            while 0 != padded.len() % 4 {
                padded.push(b'=');
            }
            base64::decode(&padded).ok()?
        }
    };

    let encoding = Encoding::for_label_no_replacement(charset.as_bytes())?;
    Some(encoding.decode_without_bom_handling(&bytes).0.into_owned())
}
