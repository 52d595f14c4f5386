//! Splitting of payloads that do not fit one datagram, and their reassembly.
//!
//! A fragment body is a fixed header (message id, fragment index, fragment
//! count; all big-endian) followed by one chunk of the payload. The receiver
//! keeps one partial message per sender: a fragment of a newer message
//! discards whatever was pending, so an incomplete set is never delivered.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::ChannelError;
use crate::{ChannelResult, FRAGMENT_CHUNK_SIZE, MAX_MESSAGE_SIZE};

/// Bytes of header in front of every chunk.
const FRAGMENT_HEADER_SIZE: usize = 8;

const MAX_FRAGMENTS: usize = MAX_MESSAGE_SIZE.div_ceil(FRAGMENT_CHUNK_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentHeader {
    message: u32,
    index: u16,
    count: u16,
}

impl FragmentHeader {
    fn read(body: &[u8]) -> Option<(Self, &[u8])> {
        if body.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        let (mut header, chunk) = body.split_at(FRAGMENT_HEADER_SIZE);
        let parsed = Self {
            message: header.get_u32(),
            index: header.get_u16(),
            count: header.get_u16(),
        };
        let count = usize::from(parsed.count);
        if count == 0 || count > MAX_FRAGMENTS || parsed.index >= parsed.count {
            return None;
        }
        Some((parsed, chunk))
    }
}

/// Split `payload` into fragment bodies tagged with `message`.
pub(crate) fn split(message: u32, payload: &[u8]) -> ChannelResult<Vec<Bytes>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ChannelError::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }

    let chunks: Vec<&[u8]> = payload.chunks(FRAGMENT_CHUNK_SIZE).collect();
    let count = chunks.len() as u16;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut body = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            body.put_u32(message);
            body.put_u16(index as u16);
            body.put_u16(count);
            body.put_slice(chunk);
            body.freeze()
        })
        .collect())
}

struct Partial {
    message: u32,
    chunks: Vec<Option<Bytes>>,
    received: usize,
}

/// Reassembles fragment bodies, one pending message per sender.
#[derive(Default)]
pub(crate) struct FragmentReceiver {
    pending: HashMap<SocketAddr, Partial>,
}

impl FragmentReceiver {
    /// Feed one fragment body; returns the payload once every chunk arrived.
    pub(crate) fn receive(&mut self, from: SocketAddr, body: &[u8]) -> Option<Bytes> {
        let Some((header, chunk)) = FragmentHeader::read(body) else {
            trace!(%from, "Malformed fragment");
            return None;
        };

        let partial = self.pending.entry(from).or_insert_with(|| Partial {
            message: header.message,
            chunks: vec![None; usize::from(header.count)],
            received: 0,
        });
        if partial.message != header.message {
            if is_older(header.message, partial.message) {
                trace!(%from, message = header.message, "Late fragment of a superseded message");
                return None;
            }
            trace!(%from, dropped = partial.message, "Incomplete message superseded");
            *partial = Partial {
                message: header.message,
                chunks: vec![None; usize::from(header.count)],
                received: 0,
            };
        } else if partial.chunks.len() != usize::from(header.count) {
            trace!(%from, message = header.message, "Fragment count mismatch");
            return None;
        }

        let slot = &mut partial.chunks[usize::from(header.index)];
        if slot.is_none() {
            *slot = Some(Bytes::copy_from_slice(chunk));
            partial.received += 1;
        }
        if partial.received < partial.chunks.len() {
            return None;
        }

        let partial = self.pending.remove(&from)?;
        let mut payload = BytesMut::new();
        for chunk in partial.chunks.into_iter().flatten() {
            payload.put(chunk);
        }
        Some(payload.freeze())
    }

    /// Forget anything pending from `from`.
    pub(crate) fn forget(&mut self, from: SocketAddr) {
        self.pending.remove(&from);
    }
}

// Message ids wrap; an id within half the space behind `current` is older.
fn is_older(candidate: u32, current: u32) -> bool {
    (current.wrapping_sub(candidate) as i32) > 0
}
