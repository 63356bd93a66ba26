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

//! Decoding of MIME content transfer encodings and charsets.

use std::borrow::Cow;

use encoding_rs::Encoding;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unsupported content transfer encoding: {0}")]
    UnknownEncoding(String),
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Unknown charset: {0}")]
    UnknownCharset(String),
    #[error("Content is not valid {0}")]
    Malformed(&'static str),
}

/// Undo the content transfer encoding `encoding` on `data`.
///
/// A missing encoding means 7bit. The identity encodings return `data`
/// unchanged.
pub fn decode_transfer<'a>(
    encoding: Option<&str>,
    data: &'a [u8],
) -> Result<Cow<'a, [u8]>, DecodeError> {
    let encoding = encoding.map(str::trim).unwrap_or("7bit");

    if "7bit".eq_ignore_ascii_case(encoding)
        || "8bit".eq_ignore_ascii_case(encoding)
        || "binary".eq_ignore_ascii_case(encoding)
    {
        Ok(Cow::Borrowed(data))
    } else if "base64".eq_ignore_ascii_case(encoding) {
        let stripped = data
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect::<Vec<u8>>();
        Ok(Cow::Owned(base64::decode(&stripped)?))
    } else if "quoted-printable".eq_ignore_ascii_case(encoding) {
        Ok(qp_decode(data))
    } else {
        Err(DecodeError::UnknownEncoding(encoding.to_owned()))
    }
}

/// Decode `data` from `charset` into a string.
///
/// A missing charset means US-ASCII. Unlike header decoding, this is strict:
/// byte sequences invalid in the charset are an error rather than being
/// replaced.
pub fn decode_charset(
    charset: Option<&str>,
    data: &[u8],
) -> Result<String, DecodeError> {
    let label = charset.map(str::trim).unwrap_or("us-ascii");
    let encoding = Encoding::for_label_no_replacement(label.as_bytes())
        .ok_or_else(|| DecodeError::UnknownCharset(label.to_owned()))?;

    encoding
        .decode_without_bom_handling_and_without_replacement(data)
        .map(Cow::into_owned)
        .ok_or(DecodeError::Malformed(encoding.name()))
}

/// Decode quoted-printable, as described by RFC 2045.
///
/// Soft line breaks are discarded, with either DOS or UNIX line endings.
/// Malformed escapes are passed through verbatim, so this never fails.
pub fn qp_decode(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&b'=') {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut ix = 0;
    while ix < data.len() {
        if b'=' != data[ix] {
            out.push(data[ix]);
            ix += 1;
            continue;
        }

        let rest = &data[ix + 1..];
        if rest.starts_with(b"\r\n") {
            ix += 3;
        } else if rest.starts_with(b"\n") {
            ix += 2;
        } else if let Some(byte) = rest.get(..2).and_then(hex_byte) {
            out.push(byte);
            ix += 3;
        } else {
            out.push(b'=');
            ix += 1;
        }
    }

    Cow::Owned(out)
}

fn hex_byte(digits: &[u8]) -> Option<u8> {
    let hi = (digits[0] as char).to_digit(16)?;
    let lo = (digits[1] as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn identity_encodings() {
        for encoding in &[None, Some("7bit"), Some("8BIT"), Some("binary")] {
            assert!(matches!(
                decode_transfer(*encoding, b"hello\xFF"),
                Ok(Cow::Borrowed(b"hello\xFF"))
            ));
        }
    }

    #[test]
    fn base64_ignores_line_breaks() {
        assert_eq!(
            b"<p>hello world</p>".to_vec(),
            decode_transfer(
                Some("base64"),
                b"PHA+aGVsbG8g\r\nd29ybGQ8L3A+\r\n"
            )
            .unwrap()
            .into_owned()
        );
        assert!(matches!(
            decode_transfer(Some("base64"), b"not base64!"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn quoted_printable() {
        assert_eq!(
            b"caf\xE9 <a href=\"x\">".to_vec(),
            decode_transfer(
                Some("Quoted-Printable"),
                b"caf=E9 <a href=3D\"x\"=\r\n>"
            )
            .unwrap()
            .into_owned()
        );
        assert_eq!(b"foobar".to_vec(), qp_decode(b"foo=\nbar").into_owned());
        assert_eq!(b"a=zz=".to_vec(), qp_decode(b"a=zz=").into_owned());
        assert_eq!(b"=\xAB".to_vec(), qp_decode(b"==AB").into_owned());
    }

    #[test]
    fn unknown_encoding() {
        assert_eq!(
            Err(DecodeError::UnknownEncoding("x-uuencode".to_owned())),
            decode_transfer(Some("x-uuencode"), b"")
        );
    }

    #[test]
    fn charsets() {
        assert_eq!("plain", decode_charset(None, b"plain").unwrap());
        assert_eq!(
            "附件",
            decode_charset(Some("gb2312"), b"\xB8\xBD\xBC\xFE").unwrap()
        );
        assert_eq!(
            "附件",
            decode_charset(Some("UTF-8"), "附件".as_bytes()).unwrap()
        );
        assert_eq!(
            Err(DecodeError::Malformed("UTF-8")),
            decode_charset(Some("utf-8"), b"\xFF\xFE")
        );
        assert_eq!(
            Err(DecodeError::UnknownCharset("x-martian".to_owned())),
            decode_charset(Some("x-martian"), b"")
        );
    }

    proptest! {
        #[test]
        fn qp_decode_never_panics(
            s in prop::collection::vec(prop::num::u8::ANY, 0..40)
        ) {
            qp_decode(&s);
        }

        #[test]
        fn qp_decode_without_escapes_is_identity(s in "[^=]*") {
            prop_assert_eq!(s.as_bytes(), &qp_decode(s.as_bytes())[..]);
        }
    }
}
