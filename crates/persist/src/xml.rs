//! XML form of an attribute tree.
//!
//! ```xml
//! <record>
//!   <scalar name="title" kind="text">hello</scalar>
//!   <one name="summary"/>
//!   <many name="comments"><record>...</record></many>
//!   <members name="tags"><id kind="int">3</id><composite><key kind="int">1</key><key kind="int">2</key></composite></members>
//! </record>
//! ```
//! A `<one>` without a child element is an absent target. Bytes are base64,
//! timestamps RFC 3339.

use crate::codec::CodecError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use revisionable_common::{Attribute, AttributeTree, Identity, KeyPart, Value};
use std::fmt;
use uuid::Uuid;

fn xml_error(err: impl fmt::Display) -> CodecError {
    CodecError::Xml(err.to_string())
}

fn malformed(message: impl Into<String>) -> CodecError {
    CodecError::Xml(message.into())
}

pub(crate) fn to_writer(body: &mut Vec<u8>, tree: &AttributeTree) -> Result<(), CodecError> {
    let mut writer = Writer::new(body);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    write_record(&mut writer, tree)
}

fn write_record(writer: &mut Writer<&mut Vec<u8>>, tree: &AttributeTree) -> Result<(), CodecError> {
    writer
        .write_event(Event::Start(BytesStart::new("record")))
        .map_err(xml_error)?;
    for (name, attribute) in tree.iter() {
        match attribute {
            Attribute::Scalar(value) => {
                let (kind, text) = scalar_text(value);
                write_leaf(writer, "scalar", &[("name", name), ("kind", kind)], &text)?;
            }
            Attribute::One(None) => {
                let mut start = BytesStart::new("one");
                start.push_attribute(("name", name));
                writer.write_event(Event::Empty(start)).map_err(xml_error)?;
            }
            Attribute::One(Some(child)) => {
                open(writer, "one", name)?;
                write_record(writer, child)?;
                close(writer, "one")?;
            }
            Attribute::Many(children) => {
                open(writer, "many", name)?;
                for child in children {
                    write_record(writer, child)?;
                }
                close(writer, "many")?;
            }
            Attribute::Members(ids) => {
                open(writer, "members", name)?;
                for id in ids {
                    write_identity(writer, id)?;
                }
                close(writer, "members")?;
            }
        }
    }
    close(writer, "record")
}

fn write_identity(writer: &mut Writer<&mut Vec<u8>>, id: &Identity) -> Result<(), CodecError> {
    match id {
        Identity::Single(part) => {
            let (kind, text) = key_text(part);
            write_leaf(writer, "id", &[("kind", kind)], &text)
        }
        Identity::Composite(parts) => {
            writer
                .write_event(Event::Start(BytesStart::new("composite")))
                .map_err(xml_error)?;
            for part in parts {
                let (kind, text) = key_text(part);
                write_leaf(writer, "key", &[("kind", kind)], &text)?;
            }
            close(writer, "composite")
        }
    }
}

fn open(writer: &mut Writer<&mut Vec<u8>>, tag: &str, name: &str) -> Result<(), CodecError> {
    let mut start = BytesStart::new(tag);
    start.push_attribute(("name", name));
    writer.write_event(Event::Start(start)).map_err(xml_error)
}

fn close(writer: &mut Writer<&mut Vec<u8>>, tag: &str) -> Result<(), CodecError> {
    writer.write_event(Event::End(BytesEnd::new(tag))).map_err(xml_error)
}

fn write_leaf(
    writer: &mut Writer<&mut Vec<u8>>,
    tag: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> Result<(), CodecError> {
    let mut start = BytesStart::new(tag);
    for &pair in attributes {
        start.push_attribute(pair);
    }
    if text.is_empty() {
        return writer.write_event(Event::Empty(start)).map_err(xml_error);
    }
    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    close(writer, tag)
}

fn scalar_text(value: &Value) -> (&'static str, String) {
    let text = match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Text(s) => s.clone(),
        Value::Bytes(bytes) => BASE64.encode(bytes),
        Value::Uuid(u) => u.to_string(),
        Value::Timestamp(t) => t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    };
    (value.kind_name(), text)
}

fn parse_scalar(kind: &str, text: &str) -> Result<Value, CodecError> {
    Ok(match kind {
        "null" => Value::Null,
        "bool" => Value::Bool(text.parse().map_err(xml_error)?),
        "int" => Value::Int(text.parse().map_err(xml_error)?),
        "float" => Value::Float(text.parse().map_err(xml_error)?),
        "text" => Value::Text(text.to_owned()),
        "bytes" => Value::Bytes(BASE64.decode(text).map_err(xml_error)?),
        "uuid" => Value::Uuid(Uuid::parse_str(text).map_err(xml_error)?),
        "timestamp" => Value::Timestamp(
            DateTime::parse_from_rfc3339(text)
                .map_err(xml_error)?
                .with_timezone(&Utc),
        ),
        other => return Err(malformed(format!("unknown scalar kind `{other}`"))),
    })
}

fn key_text(part: &KeyPart) -> (&'static str, String) {
    match part {
        KeyPart::Int(i) => ("int", i.to_string()),
        KeyPart::Text(s) => ("text", s.clone()),
        KeyPart::Uuid(u) => ("uuid", u.to_string()),
    }
}

fn parse_key(kind: &str, text: &str) -> Result<KeyPart, CodecError> {
    match parse_scalar(kind, text)? {
        Value::Int(i) => Ok(KeyPart::Int(i)),
        Value::Text(s) => Ok(KeyPart::Text(s)),
        Value::Uuid(u) => Ok(KeyPart::Uuid(u)),
        other => Err(malformed(format!("`{}` is not a key kind", other.kind_name()))),
    }
}

pub(crate) fn from_slice(body: &[u8]) -> Result<AttributeTree, CodecError> {
    let text = std::str::from_utf8(body).map_err(xml_error)?;
    let mut parser = Parser {
        reader: Reader::from_str(text),
    };
    match parser.next_node()? {
        Node::Open(start) if start.name().as_ref() == b"record" => parser.record(),
        Node::Empty(start) if start.name().as_ref() == b"record" => Ok(AttributeTree::new()),
        _ => Err(malformed("document does not start with <record>")),
    }
}

enum Node<'a> {
    Open(BytesStart<'a>),
    Empty(BytesStart<'a>),
    Close,
    Eof,
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    /// Next structural event; declarations, comments and indentation are
    /// skipped.
    fn next_node(&mut self) -> Result<Node<'a>, CodecError> {
        loop {
            match self.reader.read_event().map_err(xml_error)? {
                Event::Start(start) => return Ok(Node::Open(start)),
                Event::Empty(start) => return Ok(Node::Empty(start)),
                Event::End(_) => return Ok(Node::Close),
                Event::Eof => return Ok(Node::Eof),
                Event::Text(text) if text.iter().all(u8::is_ascii_whitespace) => {}
                Event::Text(_) | Event::CData(_) => return Err(malformed("unexpected text between elements")),
                _ => {}
            }
        }
    }

    /// Text content up to the closing tag of the current element.
    fn text(&mut self) -> Result<String, CodecError> {
        let mut content = String::new();
        loop {
            match self.reader.read_event().map_err(xml_error)? {
                Event::Text(text) => content.push_str(&text.unescape().map_err(xml_error)?),
                Event::CData(data) => content.push_str(std::str::from_utf8(&data).map_err(xml_error)?),
                Event::End(_) => return Ok(content),
                Event::Eof => return Err(malformed("unexpected end of document")),
                Event::Start(_) | Event::Empty(_) => return Err(malformed("element inside a scalar")),
                _ => {}
            }
        }
    }

    /// Body of an opened `<record>`.
    fn record(&mut self) -> Result<AttributeTree, CodecError> {
        let mut tree = AttributeTree::new();
        loop {
            let (start, empty) = match self.next_node()? {
                Node::Close => return Ok(tree),
                Node::Eof => return Err(malformed("unclosed <record>")),
                Node::Open(start) => (start, false),
                Node::Empty(start) => (start, true),
            };
            let name = attribute(&start, "name")?;
            let entry = match start.name().as_ref() {
                b"scalar" => {
                    let text = if empty { String::new() } else { self.text()? };
                    Attribute::Scalar(parse_scalar(&attribute(&start, "kind")?, &text)?)
                }
                b"one" if empty => Attribute::One(None),
                b"one" => {
                    let child = match self.next_node()? {
                        Node::Close => None,
                        Node::Open(inner) if inner.name().as_ref() == b"record" => {
                            let child = self.record()?;
                            self.expect_close("one")?;
                            Some(Box::new(child))
                        }
                        Node::Empty(inner) if inner.name().as_ref() == b"record" => {
                            self.expect_close("one")?;
                            Some(Box::default())
                        }
                        _ => return Err(malformed("<one> holds at most one <record>")),
                    };
                    Attribute::One(child)
                }
                b"many" => Attribute::Many(if empty { Vec::new() } else { self.records()? }),
                b"members" => Attribute::Members(if empty { Vec::new() } else { self.identities()? }),
                other => {
                    return Err(malformed(format!(
                        "unexpected <{}> in <record>",
                        String::from_utf8_lossy(other)
                    )));
                }
            };
            tree.insert(name, entry);
        }
    }

    fn records(&mut self) -> Result<Vec<AttributeTree>, CodecError> {
        let mut records = Vec::new();
        loop {
            match self.next_node()? {
                Node::Close => return Ok(records),
                Node::Open(start) if start.name().as_ref() == b"record" => records.push(self.record()?),
                Node::Empty(start) if start.name().as_ref() == b"record" => records.push(AttributeTree::new()),
                _ => return Err(malformed("<many> holds only <record> elements")),
            }
        }
    }

    fn identities(&mut self) -> Result<Vec<Identity>, CodecError> {
        let mut ids = Vec::new();
        loop {
            match self.next_node()? {
                Node::Close => return Ok(ids),
                Node::Open(start) if start.name().as_ref() == b"id" => {
                    let part = parse_key(&attribute(&start, "kind")?, &self.text()?)?;
                    ids.push(Identity::Single(part));
                }
                Node::Open(start) if start.name().as_ref() == b"composite" => {
                    let mut parts = Vec::new();
                    loop {
                        match self.next_node()? {
                            Node::Close => break,
                            Node::Open(key) if key.name().as_ref() == b"key" => {
                                parts.push(parse_key(&attribute(&key, "kind")?, &self.text()?)?);
                            }
                            Node::Empty(key) if key.name().as_ref() == b"key" => {
                                parts.push(parse_key(&attribute(&key, "kind")?, "")?);
                            }
                            _ => return Err(malformed("<composite> holds only <key> elements")),
                        }
                    }
                    ids.push(Identity::Composite(parts));
                }
                Node::Empty(start) if start.name().as_ref() == b"id" => {
                    ids.push(Identity::Single(parse_key(&attribute(&start, "kind")?, "")?));
                }
                _ => return Err(malformed("<members> holds only <id> and <composite> elements")),
            }
        }
    }

    fn expect_close(&mut self, tag: &str) -> Result<(), CodecError> {
        match self.next_node()? {
            Node::Close => Ok(()),
            _ => Err(malformed(format!("expected </{tag}>"))),
        }
    }
}

fn attribute(start: &BytesStart<'_>, key: &str) -> Result<String, CodecError> {
    let attr = start
        .try_get_attribute(key)
        .map_err(xml_error)?
        .ok_or_else(|| {
            malformed(format!(
                "<{}> without `{key}`",
                String::from_utf8_lossy(start.name().as_ref())
            ))
        })?;
    Ok(attr.unescape_value().map_err(xml_error)?.into_owned())
}
