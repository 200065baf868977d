//! Per-endpoint receive state.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;

use interface::Handle;

use crate::desc::RecvDesc;
use crate::request::RecvRequest;

bitflags! {
    pub(crate) struct EpFlags: u32 {
        /// Unmatched descriptors are queued on the endpoint.
        const HAS_DATA = 0b001;
        /// The endpoint sits on the worker ready list.
        const QUEUED = 0b010;
        /// The endpoint was activated and may join the ready list.
        const USED = 0b100;
    }
}

/// The endpoint match queue holds either unmatched inbound descriptors or
/// posted requests, never both. A receive never completes while leaving
/// both kinds behind, so transitions happen only at the empty point.
pub(crate) enum MatchQueue {
    Empty,
    Data(VecDeque<RecvDesc>),
    Requests(VecDeque<Rc<RecvRequest>>),
}

impl MatchQueue {
    pub(crate) fn push_desc(&mut self, desc: RecvDesc) {
        match self {
            MatchQueue::Empty => {
                let mut q = VecDeque::new();
                q.push_back(desc);
                *self = MatchQueue::Data(q);
            }
            MatchQueue::Data(q) => q.push_back(desc),
            MatchQueue::Requests(_) => {
                panic!("descriptor pushed onto an endpoint with posted requests")
            }
        }
    }

    pub(crate) fn push_request(&mut self, req: Rc<RecvRequest>) {
        match self {
            MatchQueue::Empty => {
                let mut q = VecDeque::new();
                q.push_back(req);
                *self = MatchQueue::Requests(q);
            }
            MatchQueue::Requests(q) => q.push_back(req),
            MatchQueue::Data(_) => {
                panic!("request posted onto an endpoint with unmatched data")
            }
        }
    }

    pub(crate) fn front_desc(&self) -> Option<&RecvDesc> {
        match self {
            MatchQueue::Data(q) => q.front(),
            _ => None,
        }
    }

    pub(crate) fn front_desc_mut(&mut self) -> Option<&mut RecvDesc> {
        match self {
            MatchQueue::Data(q) => q.front_mut(),
            _ => None,
        }
    }

    pub(crate) fn pop_desc(&mut self) -> Option<RecvDesc> {
        match self {
            MatchQueue::Data(q) => {
                let desc = q.pop_front();
                if q.is_empty() {
                    *self = MatchQueue::Empty;
                }
                desc
            }
            _ => None,
        }
    }

    pub(crate) fn front_request(&self) -> Option<Rc<RecvRequest>> {
        match self {
            MatchQueue::Requests(q) => q.front().cloned(),
            _ => None,
        }
    }

    pub(crate) fn pop_request(&mut self) -> Option<Rc<RecvRequest>> {
        match self {
            MatchQueue::Requests(q) => {
                let req = q.pop_front();
                if q.is_empty() {
                    *self = MatchQueue::Empty;
                }
                req
            }
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn has_descs(&self) -> bool {
        matches!(self, MatchQueue::Data(_))
    }

    #[inline]
    pub(crate) fn has_requests(&self) -> bool {
        matches!(self, MatchQueue::Requests(_))
    }
}

pub(crate) struct Endpoint {
    pub(crate) handle: Handle,
    flags: Cell<EpFlags>,
    pub(crate) match_q: RefCell<MatchQueue>,
}

impl Endpoint {
    pub(crate) fn new(handle: Handle) -> Self {
        Endpoint {
            handle,
            flags: Cell::new(EpFlags::empty()),
            match_q: RefCell::new(MatchQueue::Empty),
        }
    }

    #[inline]
    pub(crate) fn test(&self, flag: EpFlags) -> bool {
        self.flags.get().contains(flag)
    }

    #[inline]
    pub(crate) fn set(&self, flag: EpFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    #[inline]
    pub(crate) fn clear(&self, flag: EpFlags) {
        self.flags.set(self.flags.get() - flag);
    }

    #[inline]
    pub(crate) fn has_data(&self) -> bool {
        self.test(EpFlags::HAS_DATA)
    }

    #[inline]
    pub(crate) fn is_queued(&self) -> bool {
        self.test(EpFlags::QUEUED)
    }

    #[inline]
    pub(crate) fn is_used(&self) -> bool {
        self.test(EpFlags::USED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{Datatype, DatatypeIter, RecvBuffer};
    use interface::TransportDesc;

    fn some_desc() -> RecvDesc {
        RecvDesc::from_transport(TransportDesc::new(vec![0u8; 16]), 8, 8)
    }

    fn some_request() -> Rc<RecvRequest> {
        let iter = DatatypeIter::init_unpack(
            RecvBuffer::Contig(vec![0u8; 4]),
            4,
            Datatype::Contig { elem_size: 1 },
        )
        .unwrap();
        RecvRequest::new(iter, false, None)
    }

    #[test]
    fn queue_drains_back_to_empty() {
        let mut q = MatchQueue::Empty;
        q.push_desc(some_desc());
        q.push_desc(some_desc());
        assert!(q.has_descs());
        assert!(q.pop_desc().is_some());
        assert!(q.pop_desc().is_some());
        assert!(!q.has_descs());

        // polarity may flip once the queue is empty
        q.push_request(some_request());
        assert!(q.has_requests());
        assert!(q.pop_request().is_some());
        assert!(!q.has_requests());
    }

    #[test]
    #[should_panic(expected = "unmatched data")]
    fn request_on_data_queue_is_fatal() {
        let mut q = MatchQueue::Empty;
        q.push_desc(some_desc());
        q.push_request(some_request());
    }

    #[test]
    #[should_panic(expected = "posted requests")]
    fn desc_on_request_queue_is_fatal() {
        let mut q = MatchQueue::Empty;
        q.push_request(some_request());
        q.push_desc(some_desc());
    }
}
