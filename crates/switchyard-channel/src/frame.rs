//! Wire framing.
//!
//! Every frame is laid out as:
//!
//! ```text
//! [u32 BE body length][u32 BE header length][JSON header][payload bytes]
//! ```
//!
//! The body length counts everything after the first four bytes.
//! Descriptors referenced by attachments travel as `SCM_RIGHTS` ancillary
//! data on the frame's first bytes.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, ChannelResult};

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_BYTES: usize = 16_777_216;

/// Maximum descriptors carried by one frame.
pub const MAX_FDS_PER_FRAME: usize = 64;

const LEN_PREFIX: usize = 4;

/// Addresses one multiplexed pipe on a channel.
///
/// Keys are written from the sender's point of view; the receiver flips
/// them, so a pipe the sender calls `Local(n)` is `Remote(n)` on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "side", content = "id", rename_all = "snake_case")]
pub enum EndpointKey {
    /// The pipe created together with the channel.
    Primary,
    /// A pipe attached by this side.
    Local(u64),
    /// A pipe attached by the remote side.
    Remote(u64),
}

impl EndpointKey {
    /// The same key seen from the other side of the channel.
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::Primary => Self::Primary,
            Self::Local(n) => Self::Remote(n),
            Self::Remote(n) => Self::Local(n),
        }
    }
}

/// A dispatcher carried by a message frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// A message pipe endpoint, proxied under a new key.
    Pipe {
        /// Key allocated by the sender.
        key: EndpointKey,
    },
    /// A shared buffer; consumes one descriptor.
    SharedBuffer {
        /// Region size.
        num_bytes: u64,
    },
    /// A wrapped platform handle; consumes one descriptor.
    PlatformHandle,
}

impl Attachment {
    fn uses_fd(&self) -> bool {
        !matches!(self, Self::Pipe { .. })
    }
}

/// Frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameHeader {
    /// First frame from a bootstrapped child, proving its connection id.
    Hello {
        /// The id the child was launched with.
        connection_id: String,
    },
    /// A message for one multiplexed pipe.
    Message {
        /// Destination pipe.
        target: EndpointKey,
        /// Transferred dispatchers, in order.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    /// The sender's end of a pipe closed.
    ClosePipe {
        /// The pipe whose peer closed.
        target: EndpointKey,
    },
}

/// A decoded or to-be-encoded frame.
#[derive(Debug)]
pub struct Frame {
    /// Header.
    pub header: FrameHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Descriptors for the header's attachments.
    pub fds: Vec<OwnedFd>,
}

impl Frame {
    /// Encode the frame bytes. Descriptors are sent separately.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::FrameTooLarge`] if the body exceeds
    /// [`MAX_FRAME_BYTES`], or [`ChannelError::Protocol`] if the header
    /// cannot be serialized.
    pub fn encode(&self) -> ChannelResult<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| ChannelError::Protocol(format!("failed to encode header: {e}")))?;
        let body_len = LEN_PREFIX
            .checked_add(header.len())
            .and_then(|n| n.checked_add(self.payload.len()))
            .filter(|n| *n <= MAX_FRAME_BYTES)
            .ok_or(ChannelError::FrameTooLarge {
                size: header.len().saturating_add(self.payload.len()),
                max: MAX_FRAME_BYTES,
            })?;
        let body_prefix = u32::try_from(body_len).map_err(|_| too_large(body_len))?;
        let header_prefix = u32::try_from(header.len()).map_err(|_| too_large(body_len))?;

        let mut out = Vec::with_capacity(body_len.saturating_add(LEN_PREFIX));
        out.extend_from_slice(&body_prefix.to_be_bytes());
        out.extend_from_slice(&header_prefix.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

fn too_large(size: usize) -> ChannelError {
    ChannelError::FrameTooLarge {
        size,
        max: MAX_FRAME_BYTES,
    }
}

/// Incremental decoder fed with raw socket reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl FrameDecoder {
    /// Append bytes (and any descriptors received with them).
    pub fn push(&mut self, bytes: &[u8], fds: Vec<OwnedFd>) {
        self.buf.extend_from_slice(bytes);
        self.fds.extend(fds);
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns an error for oversize frames, malformed headers or missing
    /// descriptors. The stream cannot be resynchronized after an error.
    pub fn next_frame(&mut self) -> ChannelResult<Option<Frame>> {
        let Some(body_len) = read_u32(&self.buf, 0) else {
            return Ok(None);
        };
        if body_len > MAX_FRAME_BYTES {
            return Err(too_large(body_len));
        }
        if body_len < LEN_PREFIX {
            return Err(ChannelError::Protocol(format!(
                "frame body of {body_len} bytes is truncated"
            )));
        }
        let Some(frame_end) = body_len.checked_add(LEN_PREFIX) else {
            return Err(too_large(body_len));
        };
        if self.buf.len() < frame_end {
            return Ok(None);
        }

        let body: Vec<u8> = self.buf.drain(..frame_end).skip(LEN_PREFIX).collect();
        let header_len = read_u32(&body, 0).unwrap_or(usize::MAX);
        let header_end = LEN_PREFIX
            .checked_add(header_len)
            .filter(|end| *end <= body.len())
            .ok_or_else(|| ChannelError::Protocol("header length exceeds frame".to_owned()))?;
        let header: FrameHeader = serde_json::from_slice(&body[LEN_PREFIX..header_end])
            .map_err(|e| ChannelError::Protocol(format!("malformed header: {e}")))?;

        let wanted = match &header {
            FrameHeader::Message { attachments, .. } => {
                attachments.iter().filter(|a| a.uses_fd()).count()
            },
            _ => 0,
        };
        if wanted > MAX_FDS_PER_FRAME || wanted > self.fds.len() {
            return Err(ChannelError::Protocol(format!(
                "frame needs {wanted} descriptors, {} received",
                self.fds.len()
            )));
        }
        let fds = self.fds.drain(..wanted).collect();

        Ok(Some(Frame {
            header,
            payload: body[header_end..].to_vec(),
            fds,
        }))
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<usize> {
    let end = at.checked_add(4)?;
    let bytes: [u8; 4] = buf.get(at..end)?.try_into().ok()?;
    usize::try_from(u32::from_be_bytes(bytes)).ok()
}
