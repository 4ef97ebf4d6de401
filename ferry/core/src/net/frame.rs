// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Wire format of channel chunks.
//!
//! Every frame starts with a fixed header, all integers little-endian:
//!
//! ```text
//! [u8: kind][u64: channel][u32: sender][u64: seq][u64: payload_len][u64: num_items]
//! ```
//!
//! followed by `payload_len` bytes of block data. `Data` frames carry one
//! block, `Close` frames end the sender's stream on a channel, and `Ack`
//! frames echo the `seq` of the data or close frame they acknowledge.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::data::ChannelId;
use crate::error::{FerryError, Result};

/// Size of an encoded [`FrameHeader`].
pub const FRAME_HEADER_LEN: usize = 1 + 8 + 4 + 8 + 8 + 8;

/// Largest payload a frame may carry.
pub const MAX_FRAME_PAYLOAD: u64 = 1 << 30;

// payload buffers grow with the bytes actually received beyond this
const PAYLOAD_READ_CHUNK: u64 = 64 * 1024;

fn check_payload_len(len: u64) -> Result<()> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(FerryError::General(format!(
            "Frame payload of {len} bytes exceeds the limit of {MAX_FRAME_PAYLOAD} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Close,
    Ack,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            FrameKind::Data => 1,
            FrameKind::Close => 2,
            FrameKind::Ack => 3,
        }
    }

    fn try_from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Close),
            3 => Ok(FrameKind::Ack),
            other => Err(FerryError::General(format!("Invalid frame kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub channel: ChannelId,
    pub sender: u32,
    pub seq: u64,
    pub payload_len: u64,
    pub num_items: u64,
}

impl FrameHeader {
    pub fn data(
        channel: ChannelId,
        sender: u32,
        seq: u64,
        payload_len: usize,
        num_items: usize,
    ) -> Self {
        Self {
            kind: FrameKind::Data,
            channel,
            sender,
            seq,
            payload_len: payload_len as u64,
            num_items: num_items as u64,
        }
    }

    pub fn close(channel: ChannelId, sender: u32, seq: u64) -> Self {
        Self {
            kind: FrameKind::Close,
            channel,
            sender,
            seq,
            payload_len: 0,
            num_items: 0,
        }
    }

    /// Acknowledgement of `frame`, sent back by `sender`, the frame's receiver.
    pub fn ack(frame: &FrameHeader, sender: u32) -> Self {
        Self {
            kind: FrameKind::Ack,
            channel: frame.channel,
            sender,
            seq: frame.seq,
            payload_len: 0,
            num_items: 0,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.to_u8());
        buf.put_u64_le(self.channel);
        buf.put_u32_le(self.sender);
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.payload_len);
        buf.put_u64_le(self.num_items);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FerryError::General(format!(
                "Frame header too short: {} bytes (need {FRAME_HEADER_LEN})",
                buf.len()
            )));
        }
        Ok(Self {
            kind: FrameKind::try_from_u8(buf.get_u8())?,
            channel: buf.get_u64_le(),
            sender: buf.get_u32_le(),
            seq: buf.get_u64_le(),
            payload_len: buf.get_u64_le(),
            num_items: buf.get_u64_le(),
        })
    }
}

/// Writes one frame and flushes the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &FrameHeader,
    payload: &[u8],
) -> Result<()> {
    check_payload_len(payload.len() as u64)?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` if the stream ended at a frame boundary.
///
/// Fails without reading further if the header announces more than
/// [`MAX_FRAME_PAYLOAD`] bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(FrameHeader, Bytes)>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::decode(&header)?;
    check_payload_len(header.payload_len)?;
    let mut payload = Vec::with_capacity(header.payload_len.min(PAYLOAD_READ_CHUNK) as usize);
    reader
        .take(header.payload_len)
        .read_to_end(&mut payload)
        .await?;
    if (payload.len() as u64) < header.payload_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "Frame payload ended after {} of {} bytes",
                payload.len(),
                header.payload_len
            ),
        )
        .into());
    }
    Ok(Some((header, Bytes::from(payload))))
}
