/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Framing and parsing of the block-exchange wire protocol.
//!
//! ## Frame layout
//!
//! Every message starts with a 7-byte ASCII tag, followed by the 3-byte separator `[*]` and
//! the payload. Some payloads are themselves partitioned into fields by the same separator
//! (e.g. the bounds of a range request). Tag values and the separator are bit-exact protocol
//! constants and must round-trip unchanged.
//!
//! Block payloads are serialized with borsh and length-prefixed with a little-endian `u32`,
//! so a serialized block can never be confused with a separator at a field boundary. Lists
//! of blocks are the plain concatenation of length-prefixed blocks.
//!
//! ## Reassembly
//!
//! The overlay transport delivers messages in variable-size chunks. A chunk of exactly
//! [`CONTINUATION_CHUNK_LEN`] bytes marks a message as unfinished; the first chunk of any
//! other length terminates it. [`Reassembler`] implements this per-connection buffering.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    block::CompositeBlock,
    data_types::{BlockHeight, PeerId},
};

/// The field separator appearing between the tag and the payload, and between payload
/// fields.
pub const SEPARATOR: &[u8; 3] = b"[*]";

/// Length of the leading ASCII tag of every frame.
pub const TAG_LEN: usize = 7;

/// Chunks of exactly this many bytes are continuation fragments: the reassembler keeps the
/// message open and concatenates until a chunk of any other length arrives. Derived from the
/// observed MTU of the overlay transport.
pub const CONTINUATION_CHUNK_LEN: usize = 1382;

/// The seven-byte ASCII tags of the wire protocol, enumerated exhaustively. An unrecognized
/// tag is a [`CodecError::UnknownTag`], never a silent drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// `0000R01` — peer introduction: `host`, `port`, `peer_id`.
    Intro,
    /// `0005R01` — list the services this node speaks.
    ListServices,
    /// `0006R01` — read a block range for a full sync: `low`, `high`.
    GetBlockList,
    /// `0007W01` — write a list of serialized blocks (full sync reply).
    BlockList,
    /// `0008R01` — read the highest block.
    GetHighestBlock,
    /// `0008W01` — write the highest block / announce a new block.
    HighestBlock,
    /// `0009R01` — read a block range for a selective sync: `low`, `high`.
    GetMultiverse,
    /// `0010W01` — write a list of serialized blocks (selective sync reply).
    Multiverse,
}

impl Tag {
    /// The wire bytes of this tag.
    pub const fn bytes(&self) -> &'static [u8; TAG_LEN] {
        match self {
            Tag::Intro => b"0000R01",
            Tag::ListServices => b"0005R01",
            Tag::GetBlockList => b"0006R01",
            Tag::BlockList => b"0007W01",
            Tag::GetHighestBlock => b"0008R01",
            Tag::HighestBlock => b"0008W01",
            Tag::GetMultiverse => b"0009R01",
            Tag::Multiverse => b"0010W01",
        }
    }

    /// The tag as a `str`, for logging.
    pub fn as_str(&self) -> &'static str {
        std::str::from_utf8(self.bytes()).unwrap()
    }

    /// Parse the first [`TAG_LEN`] bytes of a frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Tag, CodecError> {
        if bytes.len() < TAG_LEN {
            return Err(CodecError::Truncated);
        }
        match &bytes[..TAG_LEN] {
            b"0000R01" => Ok(Tag::Intro),
            b"0005R01" => Ok(Tag::ListServices),
            b"0006R01" => Ok(Tag::GetBlockList),
            b"0007W01" => Ok(Tag::BlockList),
            b"0008R01" => Ok(Tag::GetHighestBlock),
            b"0008W01" => Ok(Tag::HighestBlock),
            b"0009R01" => Ok(Tag::GetMultiverse),
            b"0010W01" => Ok(Tag::Multiverse),
            other => {
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(other);
                Err(CodecError::UnknownTag(tag))
            }
        }
    }

    /// Every tag this node speaks, in wire order.
    pub const ALL: [Tag; 8] = [
        Tag::Intro,
        Tag::ListServices,
        Tag::GetBlockList,
        Tag::BlockList,
        Tag::GetHighestBlock,
        Tag::HighestBlock,
        Tag::GetMultiverse,
        Tag::Multiverse,
    ];
}

/// A parsed wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Intro {
        host: String,
        port: u16,
        peer_id: PeerId,
    },
    /// With an empty `services` list this is a request; a reply carries the responder's
    /// supported tags.
    ListServices {
        services: Vec<String>,
    },
    GetBlockList {
        low: BlockHeight,
        high: BlockHeight,
    },
    BlockList(Vec<CompositeBlock>),
    GetHighestBlock,
    HighestBlock(CompositeBlock),
    GetMultiverse {
        low: BlockHeight,
        high: BlockHeight,
    },
    Multiverse(Vec<CompositeBlock>),
}

impl Frame {
    /// The tag this frame is carried under.
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Intro { .. } => Tag::Intro,
            Frame::ListServices { .. } => Tag::ListServices,
            Frame::GetBlockList { .. } => Tag::GetBlockList,
            Frame::BlockList(_) => Tag::BlockList,
            Frame::GetHighestBlock => Tag::GetHighestBlock,
            Frame::HighestBlock(_) => Tag::HighestBlock,
            Frame::GetMultiverse { .. } => Tag::GetMultiverse,
            Frame::Multiverse(_) => Tag::Multiverse,
        }
    }

    /// Serialize this frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.tag().bytes());
        match self {
            Frame::Intro {
                host,
                port,
                peer_id,
            } => {
                push_field(&mut out, host.as_bytes());
                push_field(&mut out, port.to_string().as_bytes());
                push_field(&mut out, peer_id.as_str().as_bytes());
            }
            Frame::ListServices { services } => {
                for service in services {
                    push_field(&mut out, service.as_bytes());
                }
            }
            Frame::GetBlockList { low, high } | Frame::GetMultiverse { low, high } => {
                push_field(&mut out, low.to_string().as_bytes());
                push_field(&mut out, high.to_string().as_bytes());
            }
            Frame::BlockList(blocks) | Frame::Multiverse(blocks) => {
                out.extend_from_slice(SEPARATOR);
                out.extend_from_slice(&encode_block_list(blocks));
            }
            Frame::GetHighestBlock => {}
            Frame::HighestBlock(block) => {
                out.extend_from_slice(SEPARATOR);
                out.extend_from_slice(&encode_block(block));
            }
        }
        out
    }

    /// Parse a complete, reassembled message.
    pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
        let tag = Tag::from_bytes(bytes)?;
        let payload = strip_separator(&bytes[TAG_LEN..])?;
        match tag {
            Tag::Intro => {
                let fields = split_fields(payload);
                if fields.len() != 3 {
                    return Err(CodecError::MalformedPayload(tag, "expected 3 intro fields"));
                }
                let host = ascii_field(fields[0], tag)?.to_string();
                let port = ascii_field(fields[1], tag)?
                    .parse()
                    .map_err(|_| CodecError::MalformedPayload(tag, "port is not an integer"))?;
                let peer_id = PeerId::parse(ascii_field(fields[2], tag)?)
                    .ok_or(CodecError::MalformedPayload(tag, "peer id is not base58"))?;
                Ok(Frame::Intro {
                    host,
                    port,
                    peer_id,
                })
            }
            Tag::ListServices => {
                let services = if payload.is_empty() {
                    Vec::new()
                } else {
                    split_fields(payload)
                        .into_iter()
                        .map(|field| ascii_field(field, tag).map(str::to_string))
                        .collect::<Result<_, _>>()?
                };
                Ok(Frame::ListServices { services })
            }
            Tag::GetBlockList | Tag::GetMultiverse => {
                let fields = split_fields(payload);
                if fields.len() != 2 {
                    return Err(CodecError::MalformedPayload(tag, "expected 2 range bounds"));
                }
                let low = parse_height(fields[0], tag)?;
                let high = parse_height(fields[1], tag)?;
                if tag == Tag::GetBlockList {
                    Ok(Frame::GetBlockList { low, high })
                } else {
                    Ok(Frame::GetMultiverse { low, high })
                }
            }
            Tag::BlockList => Ok(Frame::BlockList(decode_block_list(payload)?)),
            Tag::Multiverse => Ok(Frame::Multiverse(decode_block_list(payload)?)),
            Tag::GetHighestBlock => {
                if !payload.is_empty() {
                    return Err(CodecError::MalformedPayload(tag, "unexpected payload"));
                }
                Ok(Frame::GetHighestBlock)
            }
            Tag::HighestBlock => {
                let mut blocks = decode_block_list(payload)?;
                if blocks.len() != 1 {
                    return Err(CodecError::MalformedPayload(tag, "expected exactly 1 block"));
                }
                Ok(Frame::HighestBlock(blocks.remove(0)))
            }
        }
    }
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(SEPARATOR);
    out.extend_from_slice(field);
}

// A frame with no payload may end right after the tag; otherwise the tag must be followed
// by one separator.
fn strip_separator(rest: &[u8]) -> Result<&[u8], CodecError> {
    if rest.is_empty() {
        Ok(rest)
    } else if rest.len() >= SEPARATOR.len() && &rest[..SEPARATOR.len()] == SEPARATOR {
        Ok(&rest[SEPARATOR.len()..])
    } else {
        Err(CodecError::Truncated)
    }
}

fn split_fields(payload: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut rest = payload;
    loop {
        match rest
            .windows(SEPARATOR.len())
            .position(|window| window == SEPARATOR)
        {
            Some(at) => {
                fields.push(&rest[..at]);
                rest = &rest[at + SEPARATOR.len()..];
            }
            None => {
                fields.push(rest);
                return fields;
            }
        }
    }
}

fn ascii_field(field: &[u8], tag: Tag) -> Result<&str, CodecError> {
    std::str::from_utf8(field).map_err(|_| CodecError::MalformedPayload(tag, "field is not ASCII"))
}

fn parse_height(field: &[u8], tag: Tag) -> Result<BlockHeight, CodecError> {
    ascii_field(field, tag)?
        .parse()
        .map(BlockHeight::new)
        .map_err(|_| CodecError::MalformedPayload(tag, "height is not an integer"))
}

/// Length-prefix and serialize one block.
pub fn encode_block(block: &CompositeBlock) -> Vec<u8> {
    let bytes = block.try_to_vec().unwrap();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&bytes);
    out
}

/// Concatenate the length-prefixed serializations of `blocks`.
pub fn encode_block_list(blocks: &[CompositeBlock]) -> Vec<u8> {
    blocks.iter().flat_map(|block| encode_block(block)).collect()
}

/// Split a concatenation of length-prefixed blocks back into blocks.
pub fn decode_block_list(mut payload: &[u8]) -> Result<Vec<CompositeBlock>, CodecError> {
    let mut blocks = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        payload = &payload[4..];
        if payload.len() < len {
            return Err(CodecError::Truncated);
        }
        let block = CompositeBlock::deserialize(&mut &payload[..len])
            .map_err(CodecError::InvalidBlock)?;
        blocks.push(block);
        payload = &payload[len..];
    }
    Ok(blocks)
}

/// Per-connection buffer applying the continuation-chunk rule.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    /// Create an empty `Reassembler`.
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Feed one transport chunk. Returns the complete message once a terminating chunk
    /// arrives, `None` while the message is still open.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        if chunk.len() == CONTINUATION_CHUNK_LEN {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Error while framing or parsing wire messages.
#[derive(Debug)]
pub enum CodecError {
    /// The leading seven bytes are not a known tag.
    UnknownTag([u8; TAG_LEN]),
    /// The message ended before the structure it promised.
    Truncated,
    /// The payload does not have the field structure its tag requires.
    MalformedPayload(Tag, &'static str),
    /// A length-prefixed block failed to deserialize.
    InvalidBlock(std::io::Error),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownTag(tag) => {
                write!(f, "unknown tag {}", String::from_utf8_lossy(tag))
            }
            CodecError::Truncated => write!(f, "truncated frame"),
            CodecError::MalformedPayload(tag, what) => {
                write!(f, "malformed {} payload: {}", tag.as_str(), what)
            }
            CodecError::InvalidBlock(source) => write!(f, "undecodable block: {}", source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_seven_ascii_bytes() {
        for tag in Tag::ALL {
            assert_eq!(tag.bytes().len(), TAG_LEN);
            assert!(tag.bytes().iter().all(u8::is_ascii));
            assert_eq!(Tag::from_bytes(tag.bytes()).unwrap(), tag);
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        match Frame::decode(b"9999X99") {
            Err(CodecError::UnknownTag(tag)) => assert_eq!(&tag, b"9999X99"),
            other => panic!("expected UnknownTag, got {:?}", other),
        }
    }

    #[test]
    fn range_request_round_trip() {
        let frame = Frame::GetBlockList {
            low: BlockHeight::new(5),
            high: BlockHeight::new(8),
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[..TAG_LEN], b"0006R01");
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn intro_round_trip() {
        let frame = Frame::Intro {
            host: "10.0.0.7".to_string(),
            port: 16061,
            peer_id: PeerId::parse("3vQB7B6MrGQZaxCuFg4oh").unwrap(),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn highest_block_round_trip() {
        let frame = Frame::HighestBlock(crate::types::block::CompositeBlock::genesis());
        let bytes = frame.encode();
        assert_eq!(&bytes[..TAG_LEN], b"0008W01");
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn reassembler_concatenates_continuation_chunks() {
        // Bulky enough to span several continuation chunks.
        let frame = Frame::BlockList(vec![crate::types::block::CompositeBlock::genesis(); 40]);
        let bytes = frame.encode();
        assert!(bytes.len() > 2 * CONTINUATION_CHUNK_LEN);

        let mut reassembler = Reassembler::new();
        let mut message = Vec::new();
        for chunk in bytes.chunks(CONTINUATION_CHUNK_LEN) {
            if chunk.len() == CONTINUATION_CHUNK_LEN {
                assert!(reassembler.push_chunk(chunk).is_none());
            } else {
                message = reassembler.push_chunk(chunk).unwrap();
            }
        }
        if message.is_empty() {
            // The encoding happened to be an exact multiple of the chunk length; close it
            // with an empty terminator like the transport would.
            message = reassembler.push_chunk(&[]).unwrap();
        }
        assert_eq!(message, bytes);
        assert_eq!(Frame::decode(&message).unwrap(), frame);
    }
}
