//! XML stanza tree with a byte-exact round-trip guarantee.
//!
//! The parser accepts a canonical form of XML: single-quoted attributes
//! separated by single spaces, the named entities the serializer itself
//! produces, and namespace declarations only where the serializer would
//! re-emit them. In exchange, `serialize(parse(x)) == x` holds for every
//! input the parser accepts, which is the contract stanza-based
//! protocols build on. Divergence is checked by tests, not by a runtime
//! trap.
//!
//! Namespace rules on output: an `xmlns` attribute is omitted on a
//! child whose namespace equals its parent's, and `jabber:client` is
//! always suppressed below the root.

use winnow::combinator::alt;
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

use super::PResult;
use crate::error::Error;

/// The stream namespace that is never re-declared below the root.
const NS_JABBER_CLIENT: &str = "jabber:client";

/// Nesting depth cap; deeper documents are rejected.
const MAX_DEPTH: usize = 128;

/// One child slot of an element: a nested element, character data, or a
/// CDATA section. Order is document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlChild {
    /// A nested element.
    Element(XmlNode),
    /// Decoded character data.
    Text(String),
    /// A CDATA section, stored raw.
    Cdata(String),
}

/// An XML element.
///
/// Attributes keep first-occurrence order. `namespace` holds the
/// declared `xmlns` value, if any; children without a declaration
/// inherit their parent's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    /// Tag name.
    pub name: String,
    /// Declared namespace (`xmlns` attribute), if any.
    pub namespace: Option<String>,
    /// Attributes in insertion order, `xmlns` excluded.
    pub attributes: Vec<(String, String)>,
    /// Child elements and character data in document order.
    pub children: Vec<XmlChild>,
    /// Whether an empty element serializes as `<name/>` rather than
    /// `<name></name>`. Parsed nodes remember which form they came
    /// from; constructed nodes use the compact form.
    pub compact_empty: bool,
    /// Verbatim `<?xml ...?>` declaration, kept only on parsed roots.
    pub declaration: Option<String>,
}

impl XmlNode {
    /// Create an element with no attributes or children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
            compact_empty: true,
            declaration: None,
        }
    }

    /// Builder-style namespace declaration.
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name, value));
        }
        self
    }

    /// Get an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Append a child element and return `self` for chaining.
    pub fn add_child(&mut self, child: XmlNode) -> &mut Self {
        self.children.push(XmlChild::Element(child));
        self
    }

    /// Append character data.
    pub fn add_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.children.push(XmlChild::Text(text.into()));
        self
    }

    /// First child element with this name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find_map(|c| match c {
            XmlChild::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// First child element with this name and declared namespace.
    pub fn child_ns(&self, name: &str, ns: &str) -> Option<&XmlNode> {
        self.children.iter().find_map(|c| match c {
            XmlChild::Element(e) if e.name == name && e.namespace.as_deref() == Some(ns) => Some(e),
            _ => None,
        })
    }

    /// Concatenated character data of this element (text and CDATA).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                XmlChild::Text(t) | XmlChild::Cdata(t) => out.push_str(t),
                XmlChild::Element(_) => {}
            }
        }
        out
    }

    /// Parse a document. An optional leading `<?xml ...?>` declaration
    /// is kept and re-emitted verbatim by [`XmlNode::to_string`].
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut rest = input;
        let declaration = strip_declaration(&mut rest);
        let mut node = document
            .parse(rest)
            .map_err(|e| Error::Protocol(format!("malformed XML: {e}")))?;
        node.declaration = declaration.map(str::to_owned);
        validate_namespaces(&node, None, 0)?;
        Ok(node)
    }
}

/// Serialization; the inverse of [`XmlNode::parse`] for every document
/// `parse` accepts.
impl std::fmt::Display for XmlNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        if let Some(decl) = &self.declaration {
            out.push_str(decl);
        }
        write_node(&mut out, self, None, 0);
        f.write_str(&out)
    }
}

// ============================================================================
// Serializer
// ============================================================================

fn escape_text(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

fn escape_attr(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

fn write_node(out: &mut String, node: &XmlNode, parent_ns: Option<&str>, depth: usize) {
    out.push('<');
    out.push_str(&node.name);

    if let Some(ns) = node.namespace.as_deref() {
        let suppressed =
            Some(ns) == parent_ns || (depth > 0 && ns == NS_JABBER_CLIENT);
        if !suppressed {
            out.push_str(" xmlns='");
            escape_attr(out, ns);
            out.push('\'');
        }
    }

    for (name, value) in &node.attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("='");
        escape_attr(out, value);
        out.push('\'');
    }

    if node.children.is_empty() && node.compact_empty {
        out.push_str("/>");
        return;
    }
    out.push('>');

    let own_ns = node.namespace.as_deref().or(parent_ns);
    for child in &node.children {
        match child {
            XmlChild::Element(e) => write_node(out, e, own_ns, depth + 1),
            XmlChild::Text(t) => escape_text(out, t),
            XmlChild::Cdata(t) => {
                out.push_str("<![CDATA[");
                out.push_str(t);
                out.push_str("]]>");
            }
        }
    }

    out.push_str("</");
    out.push_str(&node.name);
    out.push('>');
}

// ============================================================================
// Parser
// ============================================================================

/// Split off a leading `<?xml ...?>` declaration, including any
/// whitespace after it. Both are kept verbatim so re-emitting the
/// declaration reproduces the input byte-for-byte.
fn strip_declaration<'s>(input: &mut &'s str) -> Option<&'s str> {
    let original = *input;
    if !original.starts_with("<?xml") {
        return None;
    }
    let end = original.find("?>")? + 2;
    let padding = original[end..].len() - original[end..].trim_start().len();
    let (decl, rest) = original.split_at(end + padding);
    *input = rest;
    Some(decl)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn name(input: &mut &str) -> PResult<String> {
    take_while(1.., is_name_char).map(str::to_owned).parse_next(input)
}

/// Decode one entity reference in character data. Only the references
/// the serializer produces there are accepted; anything else fails the
/// parse.
fn text_entity(input: &mut &str) -> PResult<char> {
    alt(("&amp;".value('&'), "&lt;".value('<'), "&gt;".value('>'))).parse_next(input)
}

/// Decode one entity reference in an attribute value; the serializer
/// additionally escapes both quote characters there.
fn attr_entity(input: &mut &str) -> PResult<char> {
    alt((text_entity, "&apos;".value('\''), "&quot;".value('"'))).parse_next(input)
}

/// Text run between markup. Raw `&`, `<`, and `>` must arrive escaped.
fn text_run(input: &mut &str) -> PResult<String> {
    let mut out = String::new();
    loop {
        let chunk = take_till(0.., |c| matches!(c, '&' | '<' | '>')).parse_next(input)?;
        out.push_str(chunk);
        match input.chars().next() {
            Some('&') => out.push(text_entity.parse_next(input)?),
            Some('>') => return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new())),
            _ => break,
        }
    }
    Ok(out)
}

fn attr_value(input: &mut &str) -> PResult<String> {
    '\''.parse_next(input)?;
    let mut out = String::new();
    loop {
        let chunk =
            take_till(0.., |c| matches!(c, '\'' | '"' | '&' | '<' | '>')).parse_next(input)?;
        out.push_str(chunk);
        match input.chars().next() {
            Some('&') => out.push(attr_entity.parse_next(input)?),
            Some('\'') => break,
            _ => return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new())),
        }
    }
    '\''.parse_next(input)?;
    Ok(out)
}

fn cdata(input: &mut &str) -> PResult<String> {
    "<![CDATA[".parse_next(input)?;
    let Some(end) = input.find("]]>") else {
        return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new()));
    };
    let content = &input[..end];
    *input = &input[end + 3..];
    Ok(content.to_owned())
}

fn element(input: &mut &str, depth: usize) -> PResult<XmlNode> {
    if depth > MAX_DEPTH {
        return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new()));
    }

    '<'.parse_next(input)?;
    let tag = name.parse_next(input)?;
    let mut node = XmlNode::new(tag);

    // Attributes: single-space separated, single-quoted. An `xmlns`
    // declaration must come first so the serializer can reproduce it.
    let mut first = true;
    while input.starts_with(' ') {
        ' '.parse_next(input)?;
        let attr_name = name.parse_next(input)?;
        '='.parse_next(input)?;
        let value = attr_value.parse_next(input)?;
        if attr_name == "xmlns" {
            if !first {
                return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new()));
            }
            node.namespace = Some(value);
        } else {
            node.attributes.push((attr_name, value));
        }
        first = false;
    }

    if input.starts_with("/>") {
        "/>".parse_next(input)?;
        node.compact_empty = true;
        return Ok(node);
    }
    '>'.parse_next(input)?;
    node.compact_empty = false;

    loop {
        if input.starts_with("</") {
            break;
        }
        if input.starts_with("<![CDATA[") {
            node.children.push(XmlChild::Cdata(cdata.parse_next(input)?));
        } else if input.starts_with('<') {
            node.children
                .push(XmlChild::Element(element(input, depth + 1)?));
        } else {
            let text = text_run.parse_next(input)?;
            if text.is_empty() {
                // Neither markup nor text can make progress.
                return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new()));
            }
            node.children.push(XmlChild::Text(text));
        }
    }

    "</".parse_next(input)?;
    let closing = name.parse_next(input)?;
    if closing != node.name {
        return Err(winnow::error::ErrMode::Cut(winnow::error::ContextError::new()));
    }
    '>'.parse_next(input)?;
    Ok(node)
}

fn document(input: &mut &str) -> PResult<XmlNode> {
    element(input, 0)
}

/// Reject namespace declarations the serializer would not re-emit, so
/// the round-trip law stays byte-exact.
fn validate_namespaces(node: &XmlNode, parent_ns: Option<&str>, depth: usize) -> Result<(), Error> {
    if let Some(ns) = node.namespace.as_deref() {
        if depth > 0 && Some(ns) == parent_ns {
            return Err(Error::Protocol(format!(
                "redundant xmlns declaration '{ns}' on <{}>",
                node.name
            )));
        }
        if depth > 0 && ns == NS_JABBER_CLIENT {
            return Err(Error::Protocol(format!(
                "'{NS_JABBER_CLIENT}' re-declared on descendant <{}>",
                node.name
            )));
        }
    }
    let own_ns = node.namespace.as_deref().or(parent_ns);
    for child in &node.children {
        if let XmlChild::Element(e) = child {
            validate_namespaces(e, own_ns, depth + 1)?;
        }
    }
    Ok(())
}
