//! The active message delivery contract between the transport and the
//! engines sitting on top of it.

use std::fmt;
use std::mem;

use crate::Handle;

/// Size in bytes of [`AmHeader`] on the wire.
pub const AM_HDR_SIZE: usize = mem::size_of::<AmHeader>();

/// Header of a stream active message. The sender writes the id of the
/// destination endpoint; the payload follows immediately after.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmHeader {
    pub ep_id: u64,
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(mem::size_of::<AmHeader>(), 8);
}

impl AmHeader {
    #[inline]
    pub fn new(ep: Handle) -> Self {
        AmHeader { ep_id: ep.0 }
    }

    /// Serializes the header into the first [`AM_HDR_SIZE`] bytes of `buf`.
    #[inline]
    pub fn pack(&self, buf: &mut [u8]) {
        buf[..AM_HDR_SIZE].copy_from_slice(&self.ep_id.to_le_bytes());
    }

    /// Reads a header back from the front of a delivery. Returns [`None`]
    /// if the delivery is shorter than a header.
    #[inline]
    pub fn unpack(buf: &[u8]) -> Option<Self> {
        let bytes = buf.get(..AM_HDR_SIZE)?;
        Some(AmHeader {
            ep_id: u64::from_le_bytes(bytes.try_into().unwrap()),
        })
    }
}

/// Outcome of an active message callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmStatus {
    /// The delivery was consumed inline; the transport may reuse the buffer.
    Consumed,
    /// The callee took ownership of the delivery descriptor.
    Retained,
}

/// A transport-owned delivery buffer holding one full active message,
/// header included. The transport lends it to the AM callback; if the
/// callback reports [`AmStatus::Retained`], ownership transfers and dropping
/// the descriptor later returns the memory to the transport.
pub struct TransportDesc {
    data: Box<[u8]>,
}

impl TransportDesc {
    pub fn new(data: Vec<u8>) -> Self {
        TransportDesc {
            data: data.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for TransportDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let print_count = self.data.len().min(64);
        f.debug_struct("TransportDesc")
            .field("len", &self.data.len())
            .field("data", &&self.data[..print_count])
            .finish()
    }
}
