//! MongoDB wire protocol scaffolding.
//! - Message header parsing and encoding
//! - OP_MSG encode/decode (section 0 only)
//! - OP_COMPRESSED envelope decode/encode

use crate::error::{Error, Result};
use bson::Document;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 16 {
            return None;
        }
        // Little-endian 32-bit fields
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            16,
        ))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }

    pub fn is_request(&self) -> bool {
        self.response_to == 0
    }
}

// Current op codes
pub const OP_MSG: i32 = 2013;
pub const OP_COMPRESSED: i32 = 2012;
// Legacy ops, removed from current servers but still present in old captures
pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;

/// True for opcodes that current servers no longer accept on the wire.
pub fn is_legacy_opcode(op: i32) -> bool {
    matches!(
        op,
        OP_REPLY | OP_UPDATE | OP_INSERT | OP_QUERY | OP_GET_MORE | OP_DELETE | OP_KILL_CURSORS
    )
}

pub fn opcode_name(op: i32) -> &'static str {
    match op {
        OP_REPLY => "OP_REPLY",
        OP_UPDATE => "OP_UPDATE",
        OP_INSERT => "OP_INSERT",
        OP_QUERY => "OP_QUERY",
        OP_GET_MORE => "OP_GET_MORE",
        OP_DELETE => "OP_DELETE",
        OP_KILL_CURSORS => "OP_KILL_CURSORS",
        OP_COMPRESSED => "OP_COMPRESSED",
        OP_MSG => "OP_MSG",
        _ => "UNKNOWN",
    }
}

/// Decode OP_MSG section-0 document from the provided body bytes.
/// Returns the flag bits and the parsed Document.
pub fn decode_op_msg_section0(body: &[u8]) -> Option<(u32, Document)> {
    if body.len() < 5 {
        return None;
    }
    // flags
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    // section kind
    if body[4] != 0u8 {
        return None; // only support section 0
    }
    // the rest should be a BSON document
    let doc_bytes = &body[5..];
    match bson::Document::from_reader(&mut std::io::Cursor::new(doc_bytes)) {
        Ok(doc) => Some((flags, doc)),
        Err(_) => None,
    }
}

/// Encode an OP_MSG with section 0 containing a single BSON document.
/// Returns a Vec with the full wire message including the message header.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let doc_bytes = bson::to_vec(doc).map_err(|e| Error::Msg(format!("bson encode: {e}")))?;
    let flags: u32 = 0;
    let body_len = 4 /*flags*/ + 1 /*kind*/ + doc_bytes.len();
    let message_length = 16 + body_len as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    let header = MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_MSG,
    };
    header.encode(&mut out);
    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0u8); // section 0
    out.extend_from_slice(&doc_bytes);
    Ok(out)
}

/// Compressor ids used inside OP_COMPRESSED envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Noop,
    Snappy,
    Zlib,
    Zstd,
}

impl Compressor {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Noop),
            1 => Some(Self::Snappy),
            2 => Some(Self::Zlib),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Noop => 0,
            Self::Snappy => 1,
            Self::Zlib => 2,
            Self::Zstd => 3,
        }
    }
}

/// Unwrap an OP_COMPRESSED wire message into the inner message it carries.
///
/// The envelope body is: original opcode (i32), uncompressed size (i32),
/// compressor id (u8), compressed bytes. The result is a full wire message
/// whose header carries the original opcode and the envelope's request ids.
pub fn decompress_message(msg: &[u8]) -> Result<Vec<u8>> {
    let (header, _) = MessageHeader::parse(msg)
        .ok_or_else(|| Error::MalformedWireMessage("short header".into()))?;
    if header.op_code != OP_COMPRESSED {
        return Err(Error::UnsupportedOpcode(header.op_code));
    }
    if msg.len() < 25 {
        return Err(Error::MalformedWireMessage(
            "OP_COMPRESSED body too short".into(),
        ));
    }
    let original_op = i32::from_le_bytes([msg[16], msg[17], msg[18], msg[19]]);
    let uncompressed_size = i32::from_le_bytes([msg[20], msg[21], msg[22], msg[23]]);
    if uncompressed_size < 0 {
        return Err(Error::MalformedWireMessage(
            "negative uncompressed size".into(),
        ));
    }
    let compressor = Compressor::from_id(msg[24]).ok_or_else(|| {
        Error::MalformedWireMessage(format!("unknown compressor id {}", msg[24]))
    })?;
    let payload = &msg[25..];

    let body = match compressor {
        Compressor::Noop => payload.to_vec(),
        Compressor::Snappy => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| Error::MalformedWireMessage(format!("snappy: {e}")))?,
        Compressor::Zlib => {
            let mut out = Vec::with_capacity(uncompressed_size as usize);
            flate2::read::ZlibDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| Error::MalformedWireMessage(format!("zlib: {e}")))?;
            out
        }
        Compressor::Zstd => zstd::stream::decode_all(payload)
            .map_err(|e| Error::MalformedWireMessage(format!("zstd: {e}")))?,
    };
    if body.len() != uncompressed_size as usize {
        return Err(Error::MalformedWireMessage(format!(
            "uncompressed size mismatch: declared {} got {}",
            uncompressed_size,
            body.len()
        )));
    }

    let mut out = Vec::with_capacity(16 + body.len());
    let inner = MessageHeader {
        message_length: (16 + body.len()) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_op,
    };
    inner.encode(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Wrap a full wire message into an OP_COMPRESSED envelope.
pub fn compress_message(msg: &[u8], compressor: Compressor) -> Result<Vec<u8>> {
    let (header, _) = MessageHeader::parse(msg)
        .ok_or_else(|| Error::MalformedWireMessage("short header".into()))?;
    let body = &msg[16..];

    let compressed = match compressor {
        Compressor::Noop => body.to_vec(),
        Compressor::Snappy => snap::raw::Encoder::new()
            .compress_vec(body)
            .map_err(|e| Error::Msg(format!("snappy: {e}")))?,
        Compressor::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(body)?;
            enc.finish()?
        }
        Compressor::Zstd => {
            zstd::stream::encode_all(body, 0).map_err(|e| Error::Msg(format!("zstd: {e}")))?
        }
    };

    let mut out = Vec::with_capacity(16 + 9 + compressed.len());
    let envelope = MessageHeader {
        message_length: (16 + 9 + compressed.len()) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: OP_COMPRESSED,
    };
    envelope.encode(&mut out);
    out.extend_from_slice(&header.op_code.to_le_bytes());
    out.extend_from_slice(&(body.len() as i32).to_le_bytes());
    out.push(compressor.id());
    out.extend_from_slice(&compressed);
    Ok(out)
}
