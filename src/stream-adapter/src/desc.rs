//! Receive descriptors: the owning handle to one contiguous run of
//! unconsumed stream bytes plus metadata.

use std::fmt;
use std::ops::Deref;

use bitflags::bitflags;

use interface::TransportDesc;

bitflags! {
    pub(crate) struct DescFlags: u16 {
        /// Storage is a transport-owned delivery, not a pooled copy.
        const FROM_TRANSPORT = 0b0000_0001;
    }
}

/// Backing memory of a descriptor. Release routes it back to its origin:
/// pooled buffers return to the descriptor pool, transport descriptors
/// return to the transport.
pub(crate) enum DescStorage {
    Pooled(Box<[u8]>),
    Transport(TransportDesc),
}

/// One arrived stream fragment. Held by exactly one owner at a time: the
/// endpoint match queue, the user (zero-copy lend), or nobody.
pub(crate) struct RecvDesc {
    storage: DescStorage,
    /// Unconsumed payload bytes.
    length: u32,
    /// Offset of the first unconsumed byte within the storage.
    payload_offset: u32,
    flags: DescFlags,
}

impl RecvDesc {
    /// Copies `payload` into a pooled buffer.
    pub(crate) fn from_pool(mut buf: Box<[u8]>, payload: &[u8]) -> Self {
        debug_assert!(buf.len() >= payload.len());
        buf[..payload.len()].copy_from_slice(payload);
        RecvDesc {
            storage: DescStorage::Pooled(buf),
            length: payload.len() as u32,
            payload_offset: 0,
            flags: DescFlags::empty(),
        }
    }

    /// Takes ownership of a transport delivery in place. `payload_offset`
    /// skips the wire header and any bytes already consumed inline.
    pub(crate) fn from_transport(desc: TransportDesc, payload_offset: usize, length: usize) -> Self {
        debug_assert!(payload_offset + length <= desc.len());
        RecvDesc {
            storage: DescStorage::Transport(desc),
            length: length as u32,
            payload_offset: payload_offset as u32,
            flags: DescFlags::FROM_TRANSPORT,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.length as usize
    }

    #[inline]
    pub(crate) fn payload(&self) -> &[u8] {
        let base = self.payload_offset as usize;
        match &self.storage {
            DescStorage::Pooled(buf) => &buf[base..base + self.length as usize],
            DescStorage::Transport(desc) => &desc.bytes()[base..base + self.length as usize],
        }
    }

    /// Marks the first `count` payload bytes consumed. Full consumption goes
    /// through dequeue-and-release instead.
    pub(crate) fn advance(&mut self, count: usize) {
        assert!(count < self.length as usize);
        self.payload_offset += count as u32;
        self.length -= count as u32;
    }

    #[inline]
    pub(crate) fn is_from_transport(&self) -> bool {
        self.flags.contains(DescFlags::FROM_TRANSPORT)
    }

    #[inline]
    pub(crate) fn into_storage(self) -> DescStorage {
        self.storage
    }
}

impl fmt::Debug for RecvDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let print_count = self.len().min(64);
        f.debug_struct("RecvDesc")
            .field("length", &self.length)
            .field("payload_offset", &self.payload_offset)
            .field("flags", &self.flags)
            .field("payload", &&self.payload()[..print_count])
            .finish()
    }
}

/// Received bytes lent to the user without copying. The handle owns the
/// underlying descriptor until `data_release` returns it to its origin.
pub struct StreamData {
    desc: RecvDesc,
}

impl StreamData {
    pub(crate) fn new(desc: RecvDesc) -> Self {
        StreamData { desc }
    }

    pub(crate) fn into_desc(self) -> RecvDesc {
        self.desc
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.desc.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.desc.len() == 0
    }
}

impl Deref for StreamData {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.desc.payload()
    }
}

impl fmt::Debug for StreamData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let print_count = self.len().min(64);
        f.debug_struct("StreamData")
            .field("len", &self.len())
            .field("data", &&self.desc.payload()[..print_count])
            .finish()
    }
}
