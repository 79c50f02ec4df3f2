//! Payload encoding for snapshots.
//!
//! A payload is zstd-compressed; inside, one tag byte names the format and
//! the encoded attribute tree follows:
//! ```text
//! C <cbor>   structured binary (default)
//! Y <yaml>   textual
//! J <json>   textual
//! X <xml>    markup
//! ```
//! Decoding reads the tag, so snapshots written with different encodings can
//! live side by side.

use crate::xml;
use revisionable_common::{AttributeTree, Snapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

const COMPRESSION_LEVEL: i32 = 3;

/// Errors from encoding, decoding and compression of payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("payload is empty")]
    Empty,
    #[error("unknown payload format tag {0:#04x}")]
    UnknownTag(u8),
}

/// Serialization format of the attribute tree inside a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Cbor,
    Json,
    Yaml,
    Xml,
}

impl Encoding {
    pub const ALL: [Encoding; 4] = [Encoding::Cbor, Encoding::Json, Encoding::Yaml, Encoding::Xml];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cbor => "cbor",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Xml => "xml",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Cbor => b'C',
            Self::Json => b'J',
            Self::Yaml => b'Y',
            Self::Xml => b'X',
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            b'C' => Ok(Self::Cbor),
            b'J' => Ok(Self::Json),
            b'Y' => Ok(Self::Yaml),
            b'X' => Ok(Self::Xml),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown encoding `{s}` (expected cbor, json, yaml or xml)"))
    }
}

/// Encode and compress an attribute tree.
pub fn encode(tree: &AttributeTree, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    let mut body = vec![encoding.tag()];
    match encoding {
        Encoding::Cbor => {
            ciborium::into_writer(tree, &mut body).map_err(|e| CodecError::CborEncode(e.to_string()))?;
        }
        Encoding::Json => serde_json::to_writer(&mut body, tree)?,
        Encoding::Yaml => {
            // serde_yaml cannot emit nested enum variants directly; go through a JSON value.
            let bridge = serde_json::to_value(tree)?;
            serde_yaml::to_writer(&mut body, &bridge)?;
        }
        Encoding::Xml => xml::to_writer(&mut body, tree)?,
    }
    zstd_compress(&body)
}

/// Decompress and decode a payload produced by [`encode`].
pub fn decode(payload: &[u8]) -> Result<AttributeTree, CodecError> {
    let body = zstd_decompress(payload)?;
    let (&tag, rest) = body.split_first().ok_or(CodecError::Empty)?;
    match Encoding::from_tag(tag)? {
        Encoding::Cbor => ciborium::from_reader(rest).map_err(|e| CodecError::CborDecode(e.to_string())),
        Encoding::Json => Ok(serde_json::from_slice(rest)?),
        Encoding::Yaml => {
            let bridge: serde_json::Value = serde_yaml::from_slice(rest)?;
            Ok(serde_json::from_value(bridge)?)
        }
        Encoding::Xml => xml::from_slice(rest),
    }
}

/// Format a payload was written with.
pub fn encoding_of(payload: &[u8]) -> Result<Encoding, CodecError> {
    let body = zstd_decompress(payload)?;
    body.first().copied().ok_or(CodecError::Empty).and_then(Encoding::from_tag)
}

/// Access to the attribute tree stored in a snapshot.
pub trait SnapshotPayload {
    fn attributes(&self) -> Result<AttributeTree, CodecError>;
}

impl SnapshotPayload for Snapshot {
    fn attributes(&self) -> Result<AttributeTree, CodecError> {
        decode(&self.payload)
    }
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), COMPRESSION_LEVEL)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}
