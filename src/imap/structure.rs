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

//! Parsing of the `ENVELOPE` and `BODYSTRUCTURE` FETCH items.
//!
//! The response is first lexed into `Node`s and then interpreted
//! positionally according to RFC 3501. Interpretation is lenient about
//! missing trailing fields (extension data is optional) but strict about
//! fields having the wrong shape.
//!
//! The atom `NIL` is always absence. Atoms are case-folded. Strings are
//! case-folded only where they name a type: media types and subtypes,
//! transfer encodings, parameter keys, disposition types and languages. In
//! those positions, the string `unknown` is also treated as absence.

use std::fmt;

use thiserror::Error;

use super::lex::{self, LexError, Node};

/// Multipart subtypes recognised when a multipart has no children.
pub const MULTIPART_SUBTYPES: &[&str] = &[
    "alternative",
    "byterange",
    "digest",
    "encrypted",
    "form-data",
    "mixed",
    "related",
    "report",
    "signed",
    "x-mixed-replace",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("No {0} item in response")]
    MissingItem(&'static str),
    #[error("Malformed {0}")]
    Malformed(&'static str),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    pub display_name: Option<String>,
    pub username: String,
    pub domain: String,
}

impl Address {
    pub fn address(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Option<Vec<Address>>,
    pub sender: Option<Vec<Address>>,
    pub reply_to: Option<Vec<Address>>,
    pub to: Option<Vec<Address>>,
    pub cc: Option<Vec<Address>>,
    pub bcc: Option<Vec<Address>>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

/// Body parameters, in server order.
///
/// Keys are lower-case.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(pub Vec<(String, Option<String>)>);

impl Params {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|&&(ref k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|&(_, ref v)| v.as_deref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Disposition {
    pub kind: Option<String>,
    pub params: Option<Params>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionPart {
    Index(u32),
    Text,
}

/// The section specifier addressing a part in `BODY[section]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionPath(pub Vec<SectionPart>);

impl SectionPath {
    pub fn child(&self, part: SectionPart) -> Self {
        let mut path = self.0.clone();
        path.push(part);
        SectionPath(path)
    }
}

impl fmt::Display for SectionPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, part) in self.0.iter().enumerate() {
            if ix > 0 {
                f.write_str(".")?;
            }
            match *part {
                SectionPart::Index(n) => write!(f, "{}", n)?,
                SectionPart::Text => f.write_str("TEXT")?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyStructure {
    MultiPart(MultiPart),
    NonMultiPart(NonMultiPart),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiPart {
    pub section: SectionPath,
    pub sub_type: Option<String>,
    pub children: Vec<BodyStructure>,
    pub params: Option<Params>,
    pub disposition: Option<Disposition>,
    pub language: Option<Vec<String>>,
    pub location: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NonMultiPart {
    pub section: SectionPath,
    pub main_type: Option<String>,
    pub sub_type: Option<String>,
    pub params: Option<Params>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
    pub size: Option<u64>,
    /// Set for `message/rfc822` and `message/global` parts.
    pub message: Option<Box<EmbeddedMessage>>,
    /// Line count, for `text/*` and embedded messages.
    pub lines: Option<u64>,
    pub md5: Option<String>,
    pub disposition: Option<Disposition>,
    pub language: Option<Vec<String>>,
    pub location: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbeddedMessage {
    pub envelope: Envelope,
    pub body: BodyStructure,
}

impl BodyStructure {
    pub fn section(&self) -> &SectionPath {
        match *self {
            BodyStructure::MultiPart(ref m) => &m.section,
            BodyStructure::NonMultiPart(ref p) => &p.section,
        }
    }

    /// Whether the server actually described this part.
    pub fn is_described(&self) -> bool {
        match *self {
            BodyStructure::MultiPart(_) => true,
            BodyStructure::NonMultiPart(ref p) => p.main_type.is_some(),
        }
    }

    /// Iterate over this part and all its descendants in document order,
    /// including the bodies of embedded messages.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }
}

impl NonMultiPart {
    pub fn is_attachment(&self) -> bool {
        self.disposition
            .as_ref()
            .and_then(|d| d.kind.as_deref())
            .map_or(false, |k| "attachment" == k)
    }

    pub fn filename(&self) -> Option<&str> {
        self.disposition
            .as_ref()
            .and_then(|d| d.params.as_ref())
            .and_then(|p| p.get("filename"))
    }

    pub fn charset(&self) -> Option<&str> {
        self.params.as_ref().and_then(|p| p.get("charset"))
    }

    pub fn is_type(&self, main_type: &str, sub_type: &str) -> bool {
        Some(main_type) == self.main_type.as_deref()
            && Some(sub_type) == self.sub_type.as_deref()
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a BodyStructure>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a BodyStructure;

    fn next(&mut self) -> Option<&'a BodyStructure> {
        let next = self.stack.pop()?;
        match *next {
            BodyStructure::MultiPart(ref m) => {
                self.stack.extend(m.children.iter().rev())
            }
            BodyStructure::NonMultiPart(ref p) => {
                if let Some(ref message) = p.message {
                    self.stack.push(&message.body);
                }
            }
        }
        Some(next)
    }
}

/// Parse the `ENVELOPE` item out of a FETCH response.
pub fn parse_envelope(response: &[u8]) -> Result<Envelope, ParseError> {
    let nodes = lex::parse_nodes(response)?;
    let item = find_item(&nodes, "ENVELOPE")
        .ok_or(ParseError::MissingItem("ENVELOPE"))?;
    envelope(item.as_list().ok_or(ParseError::Malformed("envelope"))?)
}

/// Parse the `BODYSTRUCTURE` item out of a FETCH response.
pub fn parse_bodystructure(
    response: &[u8],
) -> Result<BodyStructure, ParseError> {
    let nodes = lex::parse_nodes(response)?;
    let item = find_item(&nodes, "BODYSTRUCTURE")
        .ok_or(ParseError::MissingItem("BODYSTRUCTURE"))?;
    body(
        item.as_list().ok_or(ParseError::Malformed("body structure"))?,
        &SectionPath::default(),
        Parent::Message,
    )
}

/// Extract the content of the `BODY[section]` item of a FETCH response.
///
/// `NIL` content is treated as empty.
pub fn parse_body_section(response: &[u8]) -> Result<Vec<u8>, ParseError> {
    let nodes = lex::parse_nodes(response)?;
    let item = nodes
        .iter()
        .filter_map(Node::as_list)
        .find_map(|items| {
            items
                .iter()
                .position(|n| match *n {
                    Node::Atom(ref a) => a
                        .get(..5)
                        .map_or(false, |p| p.eq_ignore_ascii_case("BODY[")),
                    _ => false,
                })
                .and_then(|ix| items.get(ix + 1))
        })
        .ok_or(ParseError::MissingItem("BODY[]"))?;

    match *item {
        Node::String(ref data) => Ok(data.clone()),
        Node::Atom(_) if item.is_nil() => Ok(Vec::new()),
        _ => Err(ParseError::Malformed("body section")),
    }
}

/// Find the value following the attribute `name` in the first
/// message-attribute list that has it.
fn find_item<'a>(nodes: &'a [Node], name: &str) -> Option<&'a Node> {
    nodes.iter().filter_map(Node::as_list).find_map(|items| {
        items
            .iter()
            .position(|n| match *n {
                Node::Atom(ref a) => a.eq_ignore_ascii_case(name),
                _ => false,
            })
            .and_then(|ix| items.get(ix + 1))
    })
}

struct Fields<'a> {
    nodes: &'a [Node],
    ix: usize,
}

impl<'a> Fields<'a> {
    fn new(nodes: &'a [Node]) -> Self {
        Fields { nodes, ix: 0 }
    }

    fn peek(&self) -> Option<&'a Node> {
        self.nodes.get(self.ix)
    }

    fn next(&mut self) -> Option<&'a Node> {
        let node = self.peek();
        self.ix += 1;
        node
    }
}

fn is_absent(node: Option<&Node>) -> bool {
    node.map_or(true, Node::is_nil)
}

/// A case-preserving string, except that atoms are folded.
fn nstring(
    node: Option<&Node>,
    what: &'static str,
) -> Result<Option<String>, ParseError> {
    match node {
        _ if is_absent(node) => Ok(None),
        Some(&Node::Atom(ref a)) => Ok(Some(a.to_lowercase())),
        Some(&Node::String(ref s)) => {
            Ok(Some(String::from_utf8_lossy(s).into_owned()))
        }
        _ => Err(ParseError::Malformed(what)),
    }
}

/// A case-folded type name.
fn folded(
    node: Option<&Node>,
    what: &'static str,
) -> Result<Option<String>, ParseError> {
    match nstring(node, what)? {
        Some(s) => {
            let s = s.to_lowercase();
            if "unknown" == s {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
        None => Ok(None),
    }
}

fn number(
    node: Option<&Node>,
    what: &'static str,
) -> Result<Option<u64>, ParseError> {
    if is_absent(node) {
        return Ok(None);
    }

    node.and_then(Node::text)
        .and_then(|t| t.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or(ParseError::Malformed(what))
}

fn params(node: Option<&Node>) -> Result<Option<Params>, ParseError> {
    if is_absent(node) {
        return Ok(None);
    }

    let list = node
        .and_then(Node::as_list)
        .ok_or(ParseError::Malformed("body parameters"))?;
    let mut params = Vec::with_capacity(list.len() / 2);
    for pair in list.chunks(2) {
        let key = folded(pair.first(), "parameter key")?
            .ok_or(ParseError::Malformed("parameter key"))?;
        // Nested lists in values are non-standard; treat them as absent
        let value = match pair.get(1) {
            Some(&Node::List(_)) => None,
            value => nstring(value, "parameter value")?,
        };
        params.push((key, value));
    }

    Ok(Some(Params(params)))
}

fn disposition(node: Option<&Node>) -> Result<Option<Disposition>, ParseError> {
    if is_absent(node) {
        return Ok(None);
    }

    match node {
        Some(&Node::List(ref list)) => Ok(Some(Disposition {
            kind: folded(list.first(), "disposition")?,
            params: params(list.get(1))?,
        })),
        // Some servers send a bare disposition type
        _ => Ok(Some(Disposition {
            kind: folded(node, "disposition")?,
            params: None,
        })),
    }
}

fn language(node: Option<&Node>) -> Result<Option<Vec<String>>, ParseError> {
    if is_absent(node) {
        return Ok(None);
    }

    match node {
        Some(&Node::List(ref list)) => {
            let mut languages = Vec::with_capacity(list.len());
            for lang in list {
                languages.extend(folded(Some(lang), "language")?);
            }
            Ok(Some(languages))
        }
        _ => Ok(folded(node, "language")?.map(|lang| vec![lang])),
    }
}

fn address_list(
    node: Option<&Node>,
) -> Result<Option<Vec<Address>>, ParseError> {
    if is_absent(node) {
        return Ok(None);
    }

    let list = node
        .and_then(Node::as_list)
        .ok_or(ParseError::Malformed("address list"))?;
    let mut addresses = Vec::with_capacity(list.len());
    for entry in list {
        let fields =
            entry.as_list().ok_or(ParseError::Malformed("address"))?;
        let display_name = nstring(fields.get(0), "address")?;
        let username = nstring(fields.get(2), "address")?;
        let domain = nstring(fields.get(3), "address")?;

        // Entries without a mailbox or host are RFC 3501 group markers
        if let (Some(username), Some(domain)) = (username, domain) {
            addresses.push(Address {
                display_name,
                username,
                domain,
            });
        }
    }

    Ok(Some(addresses))
}

fn envelope(nodes: &[Node]) -> Result<Envelope, ParseError> {
    let mut f = Fields::new(nodes);
    Ok(Envelope {
        date: nstring(f.next(), "envelope date")?,
        subject: nstring(f.next(), "envelope subject")?,
        from: address_list(f.next())?,
        sender: address_list(f.next())?,
        reply_to: address_list(f.next())?,
        to: address_list(f.next())?,
        cc: address_list(f.next())?,
        bcc: address_list(f.next())?,
        in_reply_to: nstring(f.next(), "envelope in-reply-to")?,
        message_id: nstring(f.next(), "envelope message-id")?,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Parent {
    /// The top level, or the body of an embedded message.
    Message,
    Multipart,
}

fn is_multipart(nodes: &[Node]) -> bool {
    match nodes.first() {
        Some(&Node::List(_)) => true,
        Some(node) if !node.is_nil() => node.text().map_or(false, |t| {
            MULTIPART_SUBTYPES.iter().any(|s| s.eq_ignore_ascii_case(&t))
        }),
        _ => false,
    }
}

fn body(
    nodes: &[Node],
    section: &SectionPath,
    parent: Parent,
) -> Result<BodyStructure, ParseError> {
    if is_multipart(nodes) {
        multipart(nodes, section, parent).map(BodyStructure::MultiPart)
    } else {
        leaf(nodes, section, parent).map(BodyStructure::NonMultiPart)
    }
}

fn multipart(
    nodes: &[Node],
    section: &SectionPath,
    parent: Parent,
) -> Result<MultiPart, ParseError> {
    let own_section = match parent {
        Parent::Message => section.child(SectionPart::Text),
        Parent::Multipart => section.clone(),
    };

    let mut f = Fields::new(nodes);
    let mut children = Vec::new();
    while let Some(&Node::List(ref child)) = f.peek() {
        f.next();
        let index = children.len() as u32 + 1;
        children.push(body(
            child,
            &section.child(SectionPart::Index(index)),
            Parent::Multipart,
        )?);
    }

    Ok(MultiPart {
        section: own_section,
        children,
        sub_type: folded(f.next(), "subtype")?,
        params: params(f.next())?,
        disposition: disposition(f.next())?,
        language: language(f.next())?,
        location: nstring(f.next(), "location")?,
    })
}

fn leaf(
    nodes: &[Node],
    section: &SectionPath,
    parent: Parent,
) -> Result<NonMultiPart, ParseError> {
    let section = match parent {
        Parent::Message => section.child(SectionPart::Index(1)),
        Parent::Multipart => section.clone(),
    };

    let mut f = Fields::new(nodes);
    let main_type = folded(f.next(), "media type")?;
    let sub_type = folded(f.next(), "media subtype")?;
    let params = params(f.next())?;
    let id = nstring(f.next(), "body id")?;
    let description = nstring(f.next(), "body description")?;
    let encoding = folded(f.next(), "body encoding")?;
    let size = number(f.next(), "body size")?;

    let mut message = None;
    let mut lines = None;
    match (main_type.as_deref(), sub_type.as_deref()) {
        (Some("text"), _) => lines = number(f.next(), "line count")?,
        (Some("message"), Some("rfc822"))
        | (Some("message"), Some("global")) => {
            if let Some(&Node::List(ref env)) = f.peek() {
                f.next();
                let envelope = envelope(env)?;
                let body = match f.next() {
                    Some(&Node::List(ref b)) => {
                        body(b, &section, Parent::Message)?
                    }
                    _ => return Err(ParseError::Malformed("embedded body")),
                };
                message = Some(Box::new(EmbeddedMessage { envelope, body }));
                lines = number(f.next(), "line count")?;
            }
        }
        _ => (),
    }

    Ok(NonMultiPart {
        section,
        main_type,
        sub_type,
        params,
        id,
        description,
        encoding,
        size,
        message,
        lines,
        md5: nstring(f.next(), "body md5")?,
        disposition: disposition(f.next())?,
        language: language(f.next())?,
        location: nstring(f.next(), "location")?,
    })
}
