//! Traffic recording decode/encode.
//!
//! A recording is one or more `*.bin` files, each a concatenation of framed
//! packets (all integers little-endian):
//!
//! ```text
//! u32  size               total bytes of this frame, including these 4
//! u64  session_id
//! u8*  session_metadata   bytes up to and including a 0x00 terminator
//! u64  offset_us          microseconds since recording start
//! u64  order              monotonic sequence number
//! u8*  message            full wire message; may be empty
//! ```
//!
//! There is no framing magic and no per-frame event tag; a packet with an
//! empty message is a session lifecycle marker whose start/end nature can
//! only be inferred by consumers tracking per-session order numbers.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Smallest legal frame: empty metadata (just its terminator), empty message.
pub const MIN_FRAME_SIZE: u32 = 29;

/// Safety cap on session metadata; corrupt input must not trigger runaway reads.
pub const MAX_METADATA_LEN: usize = 16 * 1024;

/// One decoded frame of a traffic recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub session_id: u64,
    /// Connection endpoint descriptor, preserved verbatim (not necessarily UTF-8).
    pub session_metadata: Bytes,
    pub offset_us: u64,
    pub order: u64,
    /// Full wire message starting with its 16-byte header; empty for session markers.
    pub message: Bytes,
}

impl Packet {
    /// Total encoded frame length, including the 4-byte size field itself.
    pub fn frame_size(&self) -> u32 {
        (4 + 8 + (self.session_metadata.len() + 1) + 8 + 8 + self.message.len()) as u32
    }

    /// Empty-message packets mark a session boundary (start or end; the
    /// format does not say which).
    pub fn is_session_marker(&self) -> bool {
        self.message.is_empty()
    }

    pub fn metadata_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.session_metadata)
    }
}

/// Streaming decoder over a byte source. Forward-only, non-restartable.
///
/// EOF at a frame boundary ends the stream cleanly; EOF inside a frame is a
/// [`Error::Truncated`] parse error. Callers should hand in a buffered
/// reader; the decoder reads in small pieces.
pub struct PacketReader<R: Read> {
    inner: R,
    finished: bool,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut size_buf = [0u8; 4];
        if !read_or_clean_eof(&mut self.inner, &mut size_buf)? {
            return Ok(None);
        }
        let size = u32::from_le_bytes(size_buf);
        if size < MIN_FRAME_SIZE {
            return Err(Error::BadFrame(format!(
                "frame size {size} below minimum {MIN_FRAME_SIZE}"
            )));
        }

        let mut u64_buf = [0u8; 8];
        read_full(&mut self.inner, &mut u64_buf)?;
        let session_id = u64::from_le_bytes(u64_buf);

        let mut session_metadata = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            read_full(&mut self.inner, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            if session_metadata.len() >= MAX_METADATA_LEN {
                return Err(Error::MetadataOverflow {
                    limit: MAX_METADATA_LEN,
                });
            }
            session_metadata.push(byte[0]);
        }

        read_full(&mut self.inner, &mut u64_buf)?;
        let offset_us = u64::from_le_bytes(u64_buf);
        read_full(&mut self.inner, &mut u64_buf)?;
        let order = u64::from_le_bytes(u64_buf);

        let header_len = 4 + 8 + (session_metadata.len() + 1) + 8 + 8;
        let Some(message_len) = (size as usize).checked_sub(header_len) else {
            return Err(Error::BadFrame(format!(
                "frame size {size} smaller than its {header_len}-byte header"
            )));
        };
        let mut message = vec![0u8; message_len];
        read_full(&mut self.inner, &mut message)?;

        Ok(Some(Packet {
            session_id,
            session_metadata: Bytes::from(session_metadata),
            offset_us,
            order,
            message: Bytes::from(message),
        }))
    }
}

impl<R: Read> Iterator for PacketReader<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_packet() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Read exactly `buf.len()` bytes, or report a clean EOF if not a single
/// byte is available. A partial read is a truncated frame.
fn read_or_clean_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Truncated);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(true)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Truncated),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Encode one packet in the recording frame format. Metadata and message
/// bytes are written verbatim; `size` is recomputed.
pub fn write_packet<W: Write>(out: &mut W, packet: &Packet) -> Result<()> {
    out.write_all(&packet.frame_size().to_le_bytes())?;
    out.write_all(&packet.session_id.to_le_bytes())?;
    out.write_all(&packet.session_metadata)?;
    out.write_all(&[0u8])?;
    out.write_all(&packet.offset_us.to_le_bytes())?;
    out.write_all(&packet.order.to_le_bytes())?;
    out.write_all(&packet.message)?;
    Ok(())
}

/// All `*.bin` files of a recording directory, concatenated in lexicographic
/// order (files are named by creation-time milliseconds, so this is
/// chronological).
///
/// A truncated tail frame terminates only the current file; any other decode
/// error aborts the whole stream.
pub struct RecordingSet {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<PacketReader<BufReader<File>>>,
    failed: bool,
}

impl RecordingSet {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "bin"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(Error::Msg(format!(
                "no .bin recording files in {}",
                dir.display()
            )));
        }
        tracing::debug!(dir = %dir.display(), files = files.len(), "opened recording set");
        Ok(Self {
            pending: files.into_iter(),
            current: None,
            failed: false,
        })
    }
}

impl Iterator for RecordingSet {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.current.is_none() {
                let path = self.pending.next()?;
                tracing::debug!(file = %path.display(), "reading recording file");
                match File::open(&path) {
                    Ok(file) => {
                        self.current = Some(PacketReader::new(BufReader::new(file)));
                    }
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(Error::Io(e)));
                    }
                }
            }
            let Some(reader) = self.current.as_mut() else {
                return None;
            };
            match reader.next() {
                Some(Ok(packet)) => return Some(Ok(packet)),
                Some(Err(Error::Truncated)) => {
                    // Tail of this file was cut off mid-frame; move on.
                    self.current = None;
                    return Some(Err(Error::Truncated));
                }
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                None => {
                    self.current = None;
                }
            }
        }
    }
}
