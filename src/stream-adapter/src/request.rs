//! Posted receive requests and their completion plumbing.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use log::trace;

use crate::datatype::{Datatype, DatatypeIter, RecvBuffer};
use crate::Error;

bitflags! {
    /// Caller-visible receive flags.
    #[derive(Default)]
    pub struct RecvFlags: u32 {
        /// Do not complete until the buffer is fully filled.
        const WAITALL = 0b001;
        /// Never complete inside the call; deliver through the posted
        /// request instead.
        const NO_IMM_CMPL = 0b010;
        /// Complete inside the call or fail with `NoResource`.
        const FORCE_IMM_CMPL = 0b100;
    }
}

bitflags! {
    pub(crate) struct ReqFlags: u32 {
        const WAITALL = 0b001;
        const CALLBACK = 0b010;
        const COMPLETED = 0b100;
    }
}

/// Delivered through the callback, or through [`StreamRecvHandle::check`],
/// when a posted receive finishes.
pub struct StreamCompletion {
    pub status: Result<(), Error>,
    /// Bytes placed into the buffer.
    pub length: usize,
    pub buffer: RecvBuffer,
}

impl fmt::Debug for StreamCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCompletion")
            .field("status", &self.status)
            .field("length", &self.length)
            .finish()
    }
}

pub type RecvCallback = Box<dyn FnOnce(StreamCompletion)>;

/// Parameters of a stream receive call.
pub struct RecvParams {
    pub datatype: Datatype,
    pub flags: RecvFlags,
    pub callback: Option<RecvCallback>,
}

impl RecvParams {
    pub fn new(datatype: Datatype) -> Self {
        RecvParams {
            datatype,
            flags: RecvFlags::empty(),
            callback: None,
        }
    }

    pub fn flags(mut self, flags: RecvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn callback(mut self, cb: impl FnOnce(StreamCompletion) + 'static) -> Self {
        self.callback = Some(Box::new(cb));
        self
    }
}

/// One posted stream receive. Shared between the endpoint match queue and
/// the handle returned to the caller.
pub(crate) struct RecvRequest {
    flags: Cell<ReqFlags>,
    /// Taken at completion so the buffer can travel back to the user.
    dt_iter: RefCell<Option<DatatypeIter>>,
    cb: RefCell<Option<RecvCallback>>,
    result: RefCell<Option<StreamCompletion>>,
}

impl RecvRequest {
    pub(crate) fn new(iter: DatatypeIter, waitall: bool, cb: Option<RecvCallback>) -> Rc<Self> {
        let mut flags = ReqFlags::empty();
        if waitall {
            flags |= ReqFlags::WAITALL;
        }
        if cb.is_some() {
            flags |= ReqFlags::CALLBACK;
        }
        Rc::new(RecvRequest {
            flags: Cell::new(flags),
            dt_iter: RefCell::new(Some(iter)),
            cb: RefCell::new(cb),
            result: RefCell::new(None),
        })
    }

    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.flags.get().contains(ReqFlags::COMPLETED)
    }

    #[inline]
    pub(crate) fn is_waitall(&self) -> bool {
        self.flags.get().contains(ReqFlags::WAITALL)
    }

    pub(crate) fn datatype(&self) -> Datatype {
        self.dt_iter
            .borrow()
            .as_ref()
            .expect("request already completed")
            .datatype()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.dt_iter
            .borrow()
            .as_ref()
            .expect("request already completed")
            .remaining()
    }

    /// Unpacks as much of `src` as the request has room for and advances the
    /// cursor. Returns the number of bytes consumed; the stream path never
    /// reports truncation, so residue is the caller's to keep.
    pub(crate) fn unpack_clamped(&self, src: &[u8]) -> Result<usize, Error> {
        let mut slot = self.dt_iter.borrow_mut();
        let iter = slot.as_mut().expect("request already completed");

        let remaining = iter.remaining();
        let (valid_len, last) = if remaining <= src.len() {
            (remaining, remaining == src.len())
        } else {
            (src.len(), !self.is_waitall())
        };
        iter.unpack(&src[..valid_len], last)?;
        Ok(valid_len)
    }

    /// Whether the request may complete now. Monotonic once bytes arrive:
    /// the cursor only grows and WAITALL/element size are fixed at init.
    pub(crate) fn can_complete(&self) -> bool {
        let slot = self.dt_iter.borrow();
        let iter = slot.as_ref().expect("request already completed");

        if iter.offset() == iter.length() {
            return true;
        }
        // Zero-length completion is meaningless, and waitall demands a full
        // buffer.
        if self.is_waitall() || iter.offset() == 0 {
            return false;
        }
        if !matches!(iter.datatype(), Datatype::Contig { .. }) {
            return true;
        }
        iter.offset() % iter.elem_size() == 0
    }

    /// Finishes the request: records the received length, hands the buffer
    /// to the callback or stashes it for the handle.
    pub(crate) fn complete(&self, status: Result<(), Error>) {
        let iter = self
            .dt_iter
            .borrow_mut()
            .take()
            .expect("request completed twice");
        let length = iter.offset();
        debug_assert!(length > 0 || status.is_err() || iter.length() == 0);
        trace!("completing stream receive, length {} ({:?})", length, status);

        self.flags.set(self.flags.get() | ReqFlags::COMPLETED);
        let completion = StreamCompletion {
            status,
            length,
            buffer: iter.into_buffer(),
        };
        let cb = self.cb.borrow_mut().take();
        match cb {
            Some(cb) => cb(completion),
            None => *self.result.borrow_mut() = Some(completion),
        }
    }

    /// Finishes a request that was never posted, returning the buffer to
    /// the caller directly instead of through the callback.
    pub(crate) fn complete_inline(&self) -> (usize, RecvBuffer) {
        let iter = self
            .dt_iter
            .borrow_mut()
            .take()
            .expect("request completed twice");
        self.flags.set(self.flags.get() | ReqFlags::COMPLETED);
        (iter.offset(), iter.into_buffer())
    }
}

/// Handle to a posted stream receive.
pub struct StreamRecvHandle {
    req: Rc<RecvRequest>,
}

impl StreamRecvHandle {
    pub(crate) fn new(req: Rc<RecvRequest>) -> Self {
        StreamRecvHandle { req }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.req.is_completed()
    }

    /// Takes the completion of a callback-less request. Returns [`None`]
    /// while the request is still in flight, and after the completion has
    /// been taken or delivered through a callback.
    pub fn check(&self) -> Option<StreamCompletion> {
        self.req.result.borrow_mut().take()
    }
}

impl fmt::Debug for StreamRecvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRecvHandle")
            .field("completed", &self.is_completed())
            .finish()
    }
}
