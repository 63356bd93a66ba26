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

//! Utilities for reading and writing values under IMAP's "lexical rules".
//!
//! # Reading
//!
//! Server responses are split into atoms, strings, and parenthesised lists
//! without any knowledge of the grammar of the particular response. Quoted
//! strings and literals both become strings, so the two stay distinguishable
//! from atoms. This matters because the atom `NIL` denotes absence while the
//! string `"NIL"` is just three letters.
//!
//! Atoms may contain bracketed sections, such as `BODY[1.2]` or
//! `BODY[HEADER.FIELDS (SUBJECT)]`; whitespace and parentheses inside the
//! brackets do not end the atom.
//!
//! # Writing
//!
//! We're conservative about which form is used for command arguments. A
//! string is only sent as an atom if all characters are in the set
//! `a-zA-Z0-9?=+/_.-` and it is not "NIL". It is only sent as a quoted string
//! if it contains no controls, backslashes, double-quotes, or non-ASCII
//! characters and is less than 100 bytes long. Everything else becomes a
//! synchronising literal.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::str;

use chrono::prelude::*;
use thiserror::Error;

use super::mailbox_name;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("Unterminated quoted string at offset {0}")]
    UnterminatedQuoted(usize),
    #[error("Malformed literal at offset {0}")]
    BadLiteral(usize),
    #[error("Literal at offset {0} runs past end of input")]
    TruncatedLiteral(usize),
    #[error("Unbalanced parenthesis at offset {0}")]
    Unbalanced(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token<'a> {
    Open,
    Close,
    Atom(&'a str),
    /// A quoted string or literal, with escapes removed.
    String(Cow<'a, [u8]>),
}

/// Splits raw response bytes into `Token`s.
///
/// Each item is the token along with its starting offset.
pub struct Lexer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Lexer { data, pos: 0 }
    }

    fn quoted(&mut self, start: usize) -> Result<Token<'a>, LexError> {
        let data = self.data;
        let body_start = start + 1;
        let mut unescaped: Option<Vec<u8>> = None;
        let mut ix = body_start;
        loop {
            match data.get(ix).copied() {
                None => return Err(LexError::UnterminatedQuoted(start)),
                Some(b'"') => break,
                Some(b'\\') => {
                    let escaped = data
                        .get(ix + 1)
                        .copied()
                        .ok_or(LexError::UnterminatedQuoted(start))?;
                    unescaped
                        .get_or_insert_with(|| data[body_start..ix].to_vec())
                        .push(escaped);
                    ix += 2;
                }
                Some(b) => {
                    if let Some(ref mut unescaped) = unescaped {
                        unescaped.push(b);
                    }
                    ix += 1;
                }
            }
        }

        self.pos = ix + 1;
        Ok(Token::String(match unescaped {
            Some(unescaped) => Cow::Owned(unescaped),
            None => Cow::Borrowed(&data[body_start..ix]),
        }))
    }

    fn literal(&mut self, start: usize) -> Result<Token<'a>, LexError> {
        let open = if b'~' == self.data[start] {
            start + 1
        } else {
            start
        };
        if Some(&b'{') != self.data.get(open) {
            return Err(LexError::BadLiteral(start));
        }

        let close = memchr::memchr(b'}', &self.data[open..])
            .map(|off| open + off)
            .ok_or(LexError::BadLiteral(start))?;
        let len = str::from_utf8(&self.data[open + 1..close])
            .ok()
            .map(|s| s.trim_end_matches('+'))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(LexError::BadLiteral(start))?;

        if !self.data[close + 1..].starts_with(b"\r\n") {
            return Err(LexError::BadLiteral(start));
        }

        let data_start = close + 3;
        let data_end = data_start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(LexError::TruncatedLiteral(start))?;

        self.pos = data_end;
        Ok(Token::String(Cow::Borrowed(&self.data[data_start..data_end])))
    }

    fn atom(&mut self, start: usize) -> Token<'a> {
        let mut depth = 0u32;
        let mut ix = start;
        while let Some(&b) = self.data.get(ix) {
            match b {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b' ' | b'(' | b')' if depth > 0 => (),
                b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b'"' => break,
                _ => (),
            }
            ix += 1;
        }

        self.pos = ix;
        // Atoms are ASCII on any sane server. Anything else is preserved
        // lossily since atoms are only ever compared against keywords.
        match str::from_utf8(&self.data[start..ix]) {
            Ok(s) => Token::Atom(s),
            Err(_) => Token::String(Cow::Borrowed(&self.data[start..ix])),
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<(usize, Token<'a>), LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&b) = self.data.get(self.pos) {
            if !matches!(b, b' ' | b'\t' | b'\r' | b'\n') {
                break;
            }
            self.pos += 1;
        }

        let start = self.pos;
        let result = match *self.data.get(start)? {
            b'(' => {
                self.pos += 1;
                Ok(Token::Open)
            }
            b')' => {
                self.pos += 1;
                Ok(Token::Close)
            }
            b'"' => self.quoted(start),
            b'{' => self.literal(start),
            b'~' if Some(&b'{') == self.data.get(start + 1) => {
                self.literal(start)
            }
            _ => Ok(self.atom(start)),
        };

        if result.is_err() {
            // Don't keep producing garbage after an error
            self.pos = self.data.len();
        }

        Some(result.map(|token| (start, token)))
    }
}

/// A lexed value with its list structure restored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Atom(String),
    String(Vec<u8>),
    List(Vec<Node>),
}

impl Node {
    pub fn is_nil(&self) -> bool {
        matches!(*self, Node::Atom(ref a) if "NIL".eq_ignore_ascii_case(a))
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match *self {
            Node::List(ref l) => Some(l),
            _ => None,
        }
    }

    /// The textual content of an atom or string.
    ///
    /// Strings which are not valid UTF-8 are converted lossily.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match *self {
            Node::Atom(ref a) => Some(Cow::Borrowed(a)),
            Node::String(ref s) => Some(String::from_utf8_lossy(s)),
            Node::List(_) => None,
        }
    }
}

/// Lex `data` and nest the tokens into `Node`s.
pub fn parse_nodes(data: &[u8]) -> Result<Vec<Node>, LexError> {
    let mut stack: Vec<Vec<Node>> = vec![Vec::new()];
    let mut last_offset = 0;

    for token in Lexer::new(data) {
        let (offset, token) = token?;
        last_offset = offset;
        match token {
            Token::Open => stack.push(Vec::new()),
            Token::Close => {
                if stack.len() < 2 {
                    return Err(LexError::Unbalanced(offset));
                }
                let list = stack.pop().unwrap_or_default();
                if let Some(parent) = stack.last_mut() {
                    parent.push(Node::List(list));
                }
            }
            Token::Atom(a) => push(&mut stack, Node::Atom(a.to_owned())),
            Token::String(s) => push(&mut stack, Node::String(s.into_owned())),
        }
    }

    if 1 != stack.len() {
        return Err(LexError::Unbalanced(last_offset));
    }

    Ok(stack.pop().unwrap_or_default())
}

fn push(stack: &mut Vec<Vec<Node>>, node: Node) {
    if let Some(top) = stack.last_mut() {
        top.push(node);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LexWriter<W> {
    writer: W,
}

impl<W: LexOutput> LexWriter<W> {
    pub fn new(writer: W) -> Self {
        LexWriter { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn verbatim(&mut self, s: &str) -> io::Result<()> {
        self.writer.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn nil(&mut self) -> io::Result<()> {
        self.verbatim("NIL")
    }

    pub fn mailbox(&mut self, name: &str) -> io::Result<()> {
        self.astring(&mailbox_name::to_wire(name))
    }

    pub fn literal(&mut self, data: &[u8]) -> io::Result<()> {
        write!(self.writer, "{{{}}}\r\n", data.len())?;
        self.writer.splice(data)?;
        Ok(())
    }

    pub fn date(&mut self, date: &NaiveDate) -> io::Result<()> {
        write!(self.writer, "{}", date.format("%-d-%b-%Y"))
    }

    pub fn num_u32(&mut self, value: u32) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    pub fn num_u64(&mut self, value: u64) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    pub fn astring(&mut self, s: &str) -> io::Result<()> {
        if is_conservative_atom(s) {
            write!(self.writer, "{}", s)?;
        } else {
            self.string(s)?;
        }

        Ok(())
    }

    pub fn string(&mut self, s: &str) -> io::Result<()> {
        if is_quotable(s) {
            write!(self.writer, "\"{}\"", s)?;
        } else {
            self.literal(s.as_bytes())?;
        }

        Ok(())
    }

    pub fn nstring(&mut self, s: &Option<impl AsRef<str>>) -> io::Result<()> {
        match s.as_ref() {
            None => self.nil(),
            Some(s) => self.string(s.as_ref()),
        }
    }
}

fn is_conservative_atom(s: &str) -> bool {
    !"nil".eq_ignore_ascii_case(s)
        && !s.is_empty()
        && s.as_bytes().iter().copied().all(|b| {
            matches!(
                b,
                b'a'..=b'z'
                | b'A'..=b'Z'
                | b'0'..=b'9'
                | b'='
                | b'?'
                | b'/'
                | b'+'
                | b'_'
                | b'.'
                | b'-'
            )
        })
}

fn is_quotable(s: &str) -> bool {
    s.len() < 100
        && s.as_bytes().iter().copied().all(|b| match b {
            0..=31 | 127..=255 | b'\\' | b'"' => false,
            _ => true,
        })
}

pub trait LexOutput: Write {
    /// Splice `data` into the stream at the current position.
    ///
    /// This is where literal data goes. Implementations which must wait for
    /// the server's permission to send literal data record the position
    /// here.
    fn splice<R: Read>(&mut self, data: R) -> io::Result<()>;
}

impl LexOutput for Vec<u8> {
    fn splice<R: Read>(&mut self, mut data: R) -> io::Result<()> {
        io::copy(&mut data, self)?;
        Ok(())
    }
}

/// A command split at each synchronising literal.
///
/// Every segment but the first begins with literal data. The client must
/// wait for a continuation response from the server before sending each
/// segment after the first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    pub segments: Vec<Vec<u8>>,
}

impl Write for CommandBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.segments.is_empty() {
            self.segments.push(Vec::new());
        }
        if let Some(last) = self.segments.last_mut() {
            last.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LexOutput for CommandBuffer {
    fn splice<R: Read>(&mut self, mut data: R) -> io::Result<()> {
        let mut segment = Vec::new();
        data.read_to_end(&mut segment)?;
        self.segments.push(segment);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn to_str(l: LexWriter<Vec<u8>>) -> String {
        String::from_utf8(l.into_inner()).unwrap()
    }

    fn lex(data: &[u8]) -> Vec<Token<'_>> {
        Lexer::new(data).map(|t| t.unwrap().1).collect()
    }

    fn s(data: &[u8]) -> Token<'_> {
        Token::String(Cow::Borrowed(data))
    }

    #[test]
    fn lex_basic() {
        assert_eq!(
            vec![
                Token::Atom("*"),
                Token::Atom("12"),
                Token::Atom("FETCH"),
                Token::Open,
                Token::Atom("UID"),
                Token::Atom("5"),
                Token::Atom("BODY[1.2]"),
                s(b"foo"),
                Token::Close,
            ],
            lex(b"* 12 FETCH (UID 5 BODY[1.2] \"foo\")\r\n")
        );
    }

    #[test]
    fn lex_bracketed_atom_with_spaces() {
        assert_eq!(
            vec![
                Token::Atom("BODY[HEADER.FIELDS (SUBJECT DATE)]"),
                s(b"x"),
            ],
            lex(b"BODY[HEADER.FIELDS (SUBJECT DATE)] \"x\"")
        );
    }

    #[test]
    fn lex_quoted_escapes() {
        assert_eq!(
            vec![
                Token::String(Cow::Owned(b"say \"hi\" \\o/".to_vec())),
                s(b"NIL"),
                Token::Atom("NIL"),
                s(b""),
            ],
            lex(br#""say \"hi\" \\o/" "NIL" NIL """#)
        );
    }

    #[test]
    fn lex_literals() {
        assert_eq!(
            vec![
                Token::Open,
                s(b"a (b) \"c\"\r\nd"),
                s(b""),
                s(b"xy"),
                Token::Close,
            ],
            lex(b"({12}\r\na (b) \"c\"\r\nd {0}\r\n ~{2}\r\nxy)")
        );
    }

    #[test]
    fn lex_errors() {
        assert_eq!(
            Some(Err(LexError::UnterminatedQuoted(4))),
            Lexer::new(b"foo \"bar").nth(1)
        );
        assert_eq!(
            Some(Err(LexError::UnterminatedQuoted(0))),
            Lexer::new(b"\"bar\\").next()
        );
        assert_eq!(
            Some(Err(LexError::TruncatedLiteral(0))),
            Lexer::new(b"{10}\r\nshort").next()
        );
        assert_eq!(
            Some(Err(LexError::BadLiteral(0))),
            Lexer::new(b"{x}\r\nshort").next()
        );
        assert_eq!(
            Some(Err(LexError::BadLiteral(0))),
            Lexer::new(b"{3}abc").next()
        );
    }

    #[test]
    fn nest_nodes() {
        assert_eq!(
            vec![
                Node::Atom("*".to_owned()),
                Node::List(vec![
                    Node::Atom("A".to_owned()),
                    Node::List(vec![]),
                    Node::List(vec![Node::String(b"b".to_vec())]),
                ]),
            ],
            parse_nodes(b"* (A () (\"b\"))").unwrap()
        );

        assert_eq!(Err(LexError::Unbalanced(3)), parse_nodes(b"(a))"));
        assert_eq!(Err(LexError::Unbalanced(3)), parse_nodes(b"((a)"));
    }

    #[test]
    fn node_helpers() {
        assert!(Node::Atom("nil".to_owned()).is_nil());
        assert!(!Node::String(b"NIL".to_vec()).is_nil());
        assert_eq!(
            "f\u{FFFD}o",
            Node::String(b"f\xFFo".to_vec()).text().unwrap()
        );
        assert_eq!(None, Node::List(vec![]).text());
    }

    #[test]
    fn write_strings() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.astring("foo").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("nil").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("foo bar").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("foo\\ bar").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("föö").unwrap();
        l.verbatim(" ").unwrap();
        l.nstring(&None::<&str>).unwrap();

        assert_eq!(
            "foo \"nil\" \"foo bar\" {8}\r\nfoo\\ bar {5}\r\nföö NIL",
            to_str(l),
        );
    }

    #[test]
    fn write_mailbox_and_date() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.mailbox("INBOX").unwrap();
        l.verbatim(" ").unwrap();
        l.mailbox("Lost & Found").unwrap();
        l.verbatim(" ").unwrap();
        l.mailbox("已发送").unwrap();
        l.verbatim(" ").unwrap();
        l.date(&NaiveDate::from_ymd(2024, 3, 5)).unwrap();

        assert_eq!(
            "INBOX \"Lost &- Found\" \"&XfJT0ZAB-\" 5-Mar-2024",
            to_str(l)
        );
    }

    #[test]
    fn command_buffer_splits_at_literals() {
        let mut l = LexWriter::new(CommandBuffer::default());
        l.verbatim("1 LOGIN ").unwrap();
        l.astring("alice").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("p\"w").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("ok").unwrap();
        l.verbatim("\r\n").unwrap();

        assert_eq!(
            vec![
                b"1 LOGIN alice {3}\r\n".to_vec(),
                b"p\"w ok\r\n".to_vec(),
            ],
            l.into_inner().segments
        );
    }
}
