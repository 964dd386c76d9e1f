//! Reading and writing block groups on byte streams and datagrams.
//!
//! Stream I/O tolerates short reads and writes: progress is tracked as
//! a byte offset across the header and payload segments, so a group
//! resumes exactly where the previous call stopped.

use std::io::IoSlice;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::block::group::BlockGroup;
use crate::block::header::{GROUP_HEADER_SIZE, GroupHeader};
use crate::error::WallError;

/// Slices of `segments` left to send after `offset` bytes went out.
fn remaining<'a>(segments: &[&'a [u8]], mut offset: usize) -> Vec<IoSlice<'a>> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        if offset >= seg.len() {
            offset -= seg.len();
            continue;
        }
        out.push(IoSlice::new(&seg[offset..]));
        offset = 0;
    }
    out
}

/// Write the header and active payloads of `group`. Returns the bytes
/// written.
pub async fn write_group<W>(writer: &mut W, group: &BlockGroup) -> Result<usize, WallError>
where
    W: AsyncWrite + Unpin,
{
    let header = group.header().to_bytes();
    let mut segments: Vec<&[u8]> = Vec::with_capacity(1 + group.len());
    segments.push(&header);
    segments.extend(group.blocks().iter().map(|b| b.data()));

    let total = group.wire_size();
    let mut written = 0;
    while written < total {
        let slices = remaining(&segments, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(WallError::PeerClosed);
        }
        written += n;
    }
    writer.flush().await?;
    Ok(total)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WallError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(WallError::PeerClosed);
        }
        filled += n;
    }
    Ok(())
}

/// Read one header from `reader`.
pub async fn read_header<R>(reader: &mut R) -> Result<GroupHeader, WallError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; GROUP_HEADER_SIZE];
    read_full(reader, &mut raw).await?;
    GroupHeader::from_bytes(&raw)
}

/// Complete a header of which `partial` already arrived, then clear
/// `partial`.
pub async fn finish_header<R>(reader: &mut R, partial: &mut Vec<u8>) -> Result<GroupHeader, WallError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; GROUP_HEADER_SIZE];
    let have = partial.len().min(GROUP_HEADER_SIZE);
    raw[..have].copy_from_slice(&partial[..have]);
    read_full(reader, &mut raw[have..]).await?;
    partial.clear();
    GroupHeader::from_bytes(&raw)
}

/// Read the payloads announced by `header` into `group`.
pub async fn read_payloads<R>(
    reader: &mut R,
    header: GroupHeader,
    group: &mut BlockGroup,
) -> Result<usize, WallError>
where
    R: AsyncRead + Unpin,
{
    group.apply_header(header)?;
    let mut total = GROUP_HEADER_SIZE;
    for payload in group.payloads_mut() {
        read_full(reader, payload).await?;
        total += payload.len();
    }
    Ok(total)
}

/// Read a whole group. Returns the bytes consumed.
pub async fn read_group<R>(reader: &mut R, group: &mut BlockGroup) -> Result<usize, WallError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    read_payloads(reader, header, group).await
}

// ── Datagrams ────────────────────────────────────────────────────

/// Serialize `group` into one contiguous buffer.
pub fn encode_group(group: &BlockGroup, dst: &mut BytesMut) {
    dst.reserve(group.wire_size());
    dst.put_slice(&group.header().to_bytes());
    for block in group.blocks() {
        dst.put_slice(block.data());
    }
}

/// Fill `group` from one datagram produced by [`encode_group`].
pub fn decode_group(src: &[u8], group: &mut BlockGroup) -> Result<usize, WallError> {
    let header = GroupHeader::from_bytes(src)?;
    let expected = GROUP_HEADER_SIZE + header.block_count as usize * group.block_size();
    if src.len() < expected {
        return Err(WallError::MalformedHeader(format!(
            "datagram holds {} bytes, header announces {expected}",
            src.len()
        )));
    }
    group.apply_header(header)?;
    let mut offset = GROUP_HEADER_SIZE;
    for payload in group.payloads_mut() {
        let len = payload.len();
        payload.copy_from_slice(&src[offset..offset + len]);
        offset += len;
    }
    Ok(expected)
}

// ── Tests ────────────────────────────────────────────────────────
