//! Receive datatypes and the unpack cursor into a user buffer.

use std::fmt;

use crate::Error;

/// How received bytes are laid out in the user buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    /// Fixed-size elements packed back to back. Completion granularity is
    /// `elem_size` unless the request waits for all data.
    Contig { elem_size: usize },
    /// Scatter list of byte ranges; 1-byte granularity.
    Iov,
    /// Opaque user-provided unpack state; 1-byte granularity.
    Generic,
}

/// User-provided unpack state for [`Datatype::Generic`]. The engine feeds
/// it consecutive byte ranges of the packed representation.
pub trait GenericUnpack {
    /// Total number of packed bytes the state expects.
    fn packed_size(&self) -> usize;

    /// Consume `data` starting at byte `offset` of the packed stream.
    fn unpack(&mut self, offset: usize, data: &[u8]) -> Result<(), Error>;

    /// No more data will be delivered to this state.
    fn finish(&mut self) {}
}

/// Destination of a stream receive. The variant must agree with the
/// datatype passed alongside it.
pub enum RecvBuffer {
    Contig(Vec<u8>),
    Iov(Vec<Vec<u8>>),
    Generic(Box<dyn GenericUnpack>),
}

impl fmt::Debug for RecvBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvBuffer::Contig(buf) => f.debug_tuple("Contig").field(&buf.len()).finish(),
            RecvBuffer::Iov(iov) => f.debug_tuple("Iov").field(&iov.len()).finish(),
            RecvBuffer::Generic(state) => {
                f.debug_tuple("Generic").field(&state.packed_size()).finish()
            }
        }
    }
}

/// Checks that buffer, element count and datatype agree. Runs before any
/// engine state changes.
pub(crate) fn validate(buffer: &RecvBuffer, count: usize, datatype: Datatype) -> Result<(), Error> {
    match (datatype, buffer) {
        (Datatype::Contig { elem_size }, RecvBuffer::Contig(buf)) => {
            let length = count.checked_mul(elem_size).ok_or(Error::InvalidParam)?;
            if elem_size == 0 || length > buf.len() {
                return Err(Error::InvalidParam);
            }
            Ok(())
        }
        (Datatype::Iov, RecvBuffer::Iov(iov)) => {
            if count != iov.len() {
                return Err(Error::InvalidParam);
            }
            Ok(())
        }
        (Datatype::Generic, RecvBuffer::Generic(_)) => Ok(()),
        _ => Err(Error::InvalidParam),
    }
}

/// Total receive length of a validated (buffer, count, datatype) triple.
pub(crate) fn recv_length(buffer: &RecvBuffer, count: usize, datatype: Datatype) -> usize {
    match (datatype, buffer) {
        (Datatype::Contig { elem_size }, RecvBuffer::Contig(_)) => count * elem_size,
        (Datatype::Iov, RecvBuffer::Iov(iov)) => iov.iter().map(|seg| seg.len()).sum(),
        (Datatype::Generic, RecvBuffer::Generic(state)) => state.packed_size(),
        _ => unreachable!("buffer and datatype were validated together"),
    }
}

fn copy_into_iov(iov: &mut [Vec<u8>], mut offset: usize, src: &[u8]) {
    let mut copied = 0;
    for seg in iov.iter_mut() {
        if offset >= seg.len() {
            offset -= seg.len();
            continue;
        }
        let n = (seg.len() - offset).min(src.len() - copied);
        seg[offset..offset + n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
        offset = 0;
        if copied == src.len() {
            return;
        }
    }
    assert_eq!(copied, src.len(), "scatter list shorter than unpacked data");
}

/// Unpack cursor of one receive request.
pub(crate) struct DatatypeIter {
    buffer: RecvBuffer,
    datatype: Datatype,
    offset: usize,
    length: usize,
}

impl DatatypeIter {
    /// Builds the cursor over a validated buffer.
    pub(crate) fn init_unpack(
        buffer: RecvBuffer,
        count: usize,
        datatype: Datatype,
    ) -> Result<Self, Error> {
        validate(&buffer, count, datatype)?;
        let length = recv_length(&buffer, count, datatype);
        Ok(DatatypeIter {
            buffer,
            datatype,
            offset: 0,
            length,
        })
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.length - self.offset
    }

    #[inline]
    pub(crate) fn datatype(&self) -> Datatype {
        self.datatype
    }

    #[inline]
    pub(crate) fn elem_size(&self) -> usize {
        match self.datatype {
            Datatype::Contig { elem_size } => elem_size,
            _ => 1,
        }
    }

    /// Copies `src` into the buffer at the cursor and advances it. The
    /// caller clamps `src` to the remaining room; truncation is not a
    /// condition this layer reports. `last` tells the unpack state no more
    /// bytes will follow.
    pub(crate) fn unpack(&mut self, src: &[u8], last: bool) -> Result<(), Error> {
        debug_assert!(self.offset + src.len() <= self.length);
        match &mut self.buffer {
            RecvBuffer::Contig(buf) => {
                buf[self.offset..self.offset + src.len()].copy_from_slice(src);
            }
            RecvBuffer::Iov(iov) => copy_into_iov(iov, self.offset, src),
            RecvBuffer::Generic(state) => {
                state.unpack(self.offset, src)?;
                if last {
                    state.finish();
                }
            }
        }
        self.offset += src.len();
        Ok(())
    }

    pub(crate) fn into_buffer(self) -> RecvBuffer {
        self.buffer
    }
}

/// One-shot unpack at offset zero for the inplace fast path, which never
/// builds a full cursor. Generic datatypes have no inplace path.
pub(crate) fn unpack_single(buffer: &mut RecvBuffer, src: &[u8]) -> Result<(), Error> {
    match buffer {
        RecvBuffer::Contig(buf) => {
            buf[..src.len()].copy_from_slice(src);
            Ok(())
        }
        RecvBuffer::Iov(iov) => {
            copy_into_iov(iov, 0, src);
            Ok(())
        }
        RecvBuffer::Generic(_) => unreachable!("generic datatype has no inplace path"),
    }
}
