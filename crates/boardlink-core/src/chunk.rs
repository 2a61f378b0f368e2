//! Offset-addressed chunked transfer.
//!
//! The serving side answers a read at `offset` with at most `frame_cap`
//! bytes; the reading side walks offsets forward until it gets an empty
//! read. A short read is not the end: the host may serve less than the link
//! allows. The served buffer must not change during a transfer, which is why
//! the host freezes its payload before it starts advertising.

use crate::SessionError;

/// Slice served for a read at `offset`. Past the end this is empty, which
/// tells the reader it has everything.
pub fn serve_slice(bytes: &[u8], offset: usize, frame_cap: usize) -> &[u8] {
    if offset >= bytes.len() {
        return &[];
    }
    let end = offset.saturating_add(frame_cap.max(1)).min(bytes.len());
    &bytes[offset..end]
}

/// Whether a read at `offset` hands out the final byte of `len`.
pub fn completes(len: usize, offset: usize, served: usize) -> bool {
    served > 0 && offset + served == len
}

/// What the reader should do after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Issue another read at this offset.
    ReadAt(usize),
    Complete,
}

/// Reading-side reassembly buffer.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    frame_cap: usize,
    limit: usize,
    complete: bool,
}

impl Reassembler {
    /// `frame_cap` is the link's per-read capacity; `limit` bounds the
    /// total so a misbehaving host cannot stream forever.
    pub fn new(frame_cap: usize, limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            frame_cap: frame_cap.max(1),
            limit,
            complete: false,
        }
    }

    /// Offset of the next read.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Append the result of a read issued at [`Self::offset`].
    pub fn accept(&mut self, chunk: &[u8]) -> Result<Progress, SessionError> {
        if self.complete {
            return Ok(Progress::Complete);
        }
        if chunk.len() > self.frame_cap {
            return Err(SessionError::Permanent(format!(
                "peer sent {} bytes in one read, frame cap is {}",
                chunk.len(),
                self.frame_cap
            )));
        }
        if self.buf.len() + chunk.len() > self.limit {
            return Err(SessionError::Permanent(format!(
                "board data exceeds {} bytes",
                self.limit
            )));
        }
        if chunk.is_empty() {
            self.complete = true;
            return Ok(Progress::Complete);
        }
        self.buf.extend_from_slice(chunk);
        Ok(Progress::ReadAt(self.buf.len()))
    }

    /// The reassembled bytes, in read order.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
