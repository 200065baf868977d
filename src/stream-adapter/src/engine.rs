//! The stream receive engine: routes inbound fragments to endpoints,
//! satisfies posted requests, and schedules endpoints with unmatched data
//! for the progress loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use fnv::FnvHashMap;
use log::{debug, trace};

use interface::{AmHeader, AmStatus, AsHandle, Features, Handle, TransportDesc, AM_HDR_SIZE};

use crate::config::StreamAdapterConfig;
use crate::datatype::{self, Datatype, DatatypeIter, RecvBuffer};
use crate::desc::{DescStorage, RecvDesc, StreamData};
use crate::pool::DescPool;
use crate::request::{RecvCallback, RecvFlags, RecvParams, RecvRequest, StreamRecvHandle};
use crate::state::{Endpoint, EpFlags};
use crate::Error;

/// One inbound active message delivery, wire header included.
pub enum AmData<'a> {
    /// Buffer valid only for the duration of the callback; residue is
    /// copied into a pooled descriptor.
    Borrowed(&'a [u8]),
    /// Transport descriptor the engine may take ownership of in place.
    Desc(TransportDesc),
}

impl AmData<'_> {
    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            AmData::Borrowed(bytes) => bytes,
            AmData::Desc(desc) => desc.bytes(),
        }
    }
}

/// Outcome of a stream receive call.
#[derive(Debug)]
pub enum RecvOp {
    /// The receive completed inside the call and the buffer comes straight
    /// back.
    Complete { length: usize, buffer: RecvBuffer },
    /// The receive was posted; completion arrives through the callback or
    /// the handle.
    Pending(StreamRecvHandle),
}

/// The conditional worker critical section. Multi-threaded workers take a
/// real lock on every entry point; single-threaded workers pay nothing.
enum WorkerCs {
    SingleThread,
    MultiThread(spin::Mutex<()>),
}

impl WorkerCs {
    #[inline]
    fn enter(&self) -> Option<spin::MutexGuard<'_, ()>> {
        match self {
            WorkerCs::SingleThread => None,
            WorkerCs::MultiThread(lock) => Some(lock.lock()),
        }
    }
}

#[inline]
fn align_down(value: usize, align: usize) -> usize {
    value - (value % align)
}

pub struct StreamAdapterEngine {
    features: Features,
    conn_table: RefCell<FnvHashMap<Handle, Rc<Endpoint>>>,
    /// Endpoints with unmatched data, in the order they became ready.
    ready: RefCell<VecDeque<Rc<Endpoint>>>,
    pool: RefCell<DescPool>,
    cs: WorkerCs,
    ep_cnt: Cell<u64>,
    outstanding_reqs: Cell<usize>,
    max_outstanding_reqs: usize,
}

impl StreamAdapterEngine {
    pub fn new(config: StreamAdapterConfig) -> Self {
        let features = if config.enable_stream {
            Features::STREAM
        } else {
            Features::empty()
        };
        let cs = if config.thread_safe {
            WorkerCs::MultiThread(spin::Mutex::new(()))
        } else {
            WorkerCs::SingleThread
        };
        debug!("stream adapter engine created, features {:?}", features);
        StreamAdapterEngine {
            features,
            conn_table: RefCell::new(FnvHashMap::default()),
            ready: RefCell::new(VecDeque::new()),
            pool: RefCell::new(DescPool::new(
                config.desc_buffer_size,
                config.desc_pool_bootstrap,
            )),
            cs,
            ep_cnt: Cell::new(0),
            outstanding_reqs: Cell::new(0),
            max_outstanding_reqs: config.max_outstanding_requests,
        }
    }

    #[inline]
    pub fn features(&self) -> Features {
        self.features
    }

    #[inline]
    fn check_feature(&self) -> Result<(), Error> {
        if self.features.contains(Features::STREAM) {
            Ok(())
        } else {
            Err(Error::InvalidParam)
        }
    }

    fn get_ep(&self, handle: Handle) -> Result<Rc<Endpoint>, Error> {
        self.conn_table
            .borrow()
            .get(&handle)
            .cloned()
            .ok_or(Error::InvalidParam)
    }

    // ------------------------------------------------------------------
    // Endpoint lifecycle
    // ------------------------------------------------------------------

    /// Registers a new endpoint with an empty match queue, off the ready
    /// list.
    pub fn create_ep(&self) -> Handle {
        let _cs = self.cs.enter();
        let handle = Handle(self.ep_cnt.get());
        self.ep_cnt.set(handle.0 + 1);
        self.conn_table
            .borrow_mut()
            .insert(handle, Rc::new(Endpoint::new(handle)));
        debug!("ep {:?} created", handle);
        handle
    }

    /// Marks the endpoint usable. Data that arrived before activation sits
    /// on the match queue without ready-list membership; this is where it
    /// becomes progress-eligible.
    pub fn ep_activate(&self, handle: Handle) {
        let _cs = self.cs.enter();
        let ep = match self.conn_table.borrow().get(&handle).cloned() {
            Some(ep) => ep,
            None => return,
        };
        ep.set(EpFlags::USED);
        if self.features.contains(Features::STREAM) && ep.has_data() && !ep.is_queued() {
            self.ep_enqueue(&ep);
        }
        debug!("ep {:?} activated", handle);
    }

    /// Tears down the endpoint's stream state: drops unmatched data, leaves
    /// the ready list, and completes every still-posted request with
    /// `status`, in post order.
    pub fn ep_cleanup(&self, handle: Handle, status: Error) {
        let _cs = self.cs.enter();
        if !self.features.contains(Features::STREAM) {
            return;
        }
        let ep = match self.conn_table.borrow().get(&handle).cloned() {
            Some(ep) => ep,
            None => return,
        };

        while let Some(desc) = self.recv_data_nolock(&ep) {
            self.release_desc(desc);
        }
        if ep.is_queued() {
            self.ep_dequeue(&ep);
        }
        assert!(!ep.has_data());

        loop {
            let req = ep.match_q.borrow().front_request();
            match req {
                Some(req) => self.complete_posted(&ep, &req, Err(status.clone())),
                None => break,
            }
        }
        debug!("ep {:?} stream state cleaned up: {}", handle, status);
    }

    // ------------------------------------------------------------------
    // Ready endpoint scheduling
    // ------------------------------------------------------------------

    fn ep_enqueue(&self, ep: &Rc<Endpoint>) {
        if ep.is_queued() {
            return;
        }
        ep.set(EpFlags::QUEUED);
        self.ready.borrow_mut().push_back(Rc::clone(ep));
    }

    fn ep_dequeue(&self, ep: &Endpoint) {
        if !ep.is_queued() {
            return;
        }
        ep.clear(EpFlags::QUEUED);
        self.ready.borrow_mut().retain(|e| e.handle != ep.handle);
    }

    /// Pops up to `max_eps` endpoints that have unmatched data, in the
    /// order they became ready. A popped endpoint rejoins the list when new
    /// data arrives for it.
    pub fn poll_ready(&self, max_eps: usize) -> Result<Vec<Handle>, Error> {
        self.check_feature()?;
        let _cs = self.cs.enter();
        let mut out = Vec::new();
        let mut ready = self.ready.borrow_mut();
        while out.len() < max_eps {
            match ready.pop_front() {
                Some(ep) => {
                    ep.clear(EpFlags::QUEUED);
                    out.push(ep.handle);
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// Whether unmatched descriptors are queued on the endpoint.
    pub fn has_data(&self, handle: Handle) -> bool {
        let _cs = self.cs.enter();
        self.conn_table
            .borrow()
            .get(&handle)
            .map_or(false, |ep| ep.has_data())
    }

    /// Whether the endpoint sits on the ready list.
    pub fn is_queued(&self, handle: Handle) -> bool {
        let _cs = self.cs.enter();
        self.conn_table
            .borrow()
            .get(&handle)
            .map_or(false, |ep| ep.is_queued())
    }

    /// Pooled receive buffers currently held by queued descriptors or the
    /// user.
    pub fn pool_outstanding(&self) -> usize {
        let _cs = self.cs.enter();
        self.pool.borrow().outstanding()
    }

    /// Free buffers sitting in the receive pool.
    pub fn pool_available(&self) -> usize {
        let _cs = self.cs.enter();
        self.pool.borrow().available()
    }

    // ------------------------------------------------------------------
    // Descriptor plumbing
    // ------------------------------------------------------------------

    /// Pops the head descriptor. Clears `HAS_DATA` and leaves the ready
    /// list in the same critical section when the last one goes.
    fn rdesc_dequeue(&self, ep: &Endpoint) -> RecvDesc {
        let desc = {
            let mut q = ep.match_q.borrow_mut();
            let desc = q.pop_desc().expect("dequeue on an endpoint without data");
            if !q.has_descs() {
                ep.clear(EpFlags::HAS_DATA);
            }
            desc
        };
        if !ep.has_data() && ep.is_queued() {
            self.ep_dequeue(ep);
        }
        desc
    }

    /// Returns the descriptor's storage to its origin.
    fn release_desc(&self, desc: RecvDesc) {
        match desc.into_storage() {
            DescStorage::Pooled(buf) => self.pool.borrow_mut().release(buf),
            // dropping hands the delivery back to the transport
            DescStorage::Transport(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    fn get_request(
        &self,
        buffer: RecvBuffer,
        count: usize,
        datatype: Datatype,
        flags: RecvFlags,
        callback: Option<RecvCallback>,
    ) -> Result<Rc<RecvRequest>, Error> {
        if self.outstanding_reqs.get() >= self.max_outstanding_reqs {
            return Err(Error::NoMemory);
        }
        let iter = DatatypeIter::init_unpack(buffer, count, datatype)?;
        self.outstanding_reqs.set(self.outstanding_reqs.get() + 1);
        Ok(RecvRequest::new(
            iter,
            flags.contains(RecvFlags::WAITALL),
            callback,
        ))
    }

    #[inline]
    fn put_request(&self) {
        self.outstanding_reqs.set(self.outstanding_reqs.get() - 1);
    }

    /// Dequeues and completes the head posted request. The callback runs
    /// inside the worker critical section and must not re-enter the engine.
    fn complete_posted(&self, ep: &Endpoint, req: &Rc<RecvRequest>, status: Result<(), Error>) {
        {
            let head = ep
                .match_q
                .borrow_mut()
                .pop_request()
                .expect("completing a request on an endpoint without posted requests");
            assert!(Rc::ptr_eq(&head, req), "completed request is not the queue head");
        }
        self.put_request();
        req.complete(status);
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// The transport's AM callback for stream fragments. Returns
    /// [`AmStatus::Retained`] iff a transport-owned delivery was kept as a
    /// descriptor; on [`AmStatus::Consumed`] the transport may reuse the
    /// buffer.
    pub fn am_handler(&self, data: AmData<'_>) -> AmStatus {
        let _cs = self.cs.enter();
        if !self.features.contains(Features::STREAM) {
            return AmStatus::Consumed;
        }

        let (ep_id, total_len) = {
            let bytes = data.bytes();
            let hdr = AmHeader::unpack(bytes).expect("stream message shorter than its header");
            (hdr.ep_id.as_handle(), bytes.len() - AM_HDR_SIZE)
        };

        // Drop the data if the endpoint is unknown.
        let ep = match self.conn_table.borrow().get(&ep_id).cloned() {
            Some(ep) => ep,
            None => {
                trace!("dropping {} stream bytes for unknown ep {:?}", total_len, ep_id);
                return AmStatus::Consumed;
            }
        };

        // First feed the fragment to whatever is already posted. A
        // zero-length fragment is absorbed here as a no-op.
        let has_posted = !ep.has_data() && ep.match_q.borrow().has_requests();
        let consumed = if has_posted {
            self.match_posted(&ep, &data.bytes()[AM_HDR_SIZE..])
        } else {
            0
        };
        if has_posted && consumed == total_len {
            return AmStatus::Consumed;
        }
        let remaining = total_len - consumed;
        assert!(remaining > 0, "empty stream fragment");

        // Residue becomes a descriptor on the match queue.
        let desc = match data {
            AmData::Borrowed(bytes) => {
                let residue = &bytes[AM_HDR_SIZE + consumed..];
                let buf = self.pool.borrow_mut().obtain(residue.len());
                RecvDesc::from_pool(buf, residue)
            }
            AmData::Desc(tdesc) => {
                RecvDesc::from_transport(tdesc, AM_HDR_SIZE + consumed, remaining)
            }
        };
        let retained = desc.is_from_transport();
        trace!("ep {:?} queues {} unmatched stream bytes", ep_id, remaining);

        ep.match_q.borrow_mut().push_desc(desc);
        ep.set(EpFlags::HAS_DATA);
        if !ep.is_queued() && ep.is_used() {
            self.ep_enqueue(&ep);
        }

        if retained {
            AmStatus::Retained
        } else {
            AmStatus::Consumed
        }
    }

    /// Feeds `payload` to the posted requests in FIFO order, completing the
    /// ones that fill up. Returns the number of bytes consumed.
    fn match_posted(&self, ep: &Rc<Endpoint>, payload: &[u8]) -> usize {
        let mut consumed = 0;
        loop {
            let req = match ep.match_q.borrow().front_request() {
                Some(req) => req,
                None => break,
            };
            match req.unpack_clamped(&payload[consumed..]) {
                Err(err) => {
                    // A failing unpack takes down this request only; the
                    // residue flows to the next one.
                    self.complete_posted(ep, &req, Err(err));
                }
                Ok(unpacked) => {
                    consumed += unpacked;
                    if consumed == payload.len() {
                        if req.can_complete() {
                            self.complete_posted(ep, &req, Ok(()));
                        }
                        break;
                    }
                    // The request is full; bytes only ever append, so it
                    // must be completable.
                    assert!(req.can_complete(), "full receive request cannot complete");
                    self.complete_posted(ep, &req, Ok(()));
                }
            }
        }
        consumed
    }

    // ------------------------------------------------------------------
    // Receive paths
    // ------------------------------------------------------------------

    /// Non-blocking stream receive. Tries to satisfy the call from already
    /// queued data without allocating a request; otherwise posts a request
    /// and returns a handle.
    pub fn recv_nbx(
        &self,
        handle: Handle,
        mut buffer: RecvBuffer,
        count: usize,
        params: RecvParams,
    ) -> Result<RecvOp, Error> {
        self.check_feature()?;
        let _cs = self.cs.enter();
        let RecvParams {
            datatype,
            flags,
            callback,
        } = params;
        let ep = self.get_ep(handle)?;
        datatype::validate(&buffer, count, datatype)?;

        match self.try_recv_inplace(&ep, &mut buffer, count, datatype, flags) {
            Ok(length) => return Ok(RecvOp::Complete { length, buffer }),
            Err(Error::NoProgress) => {}
            Err(err) => return Err(err),
        }

        if flags.contains(RecvFlags::FORCE_IMM_CMPL) {
            return Err(Error::NoResource);
        }

        let req = self.get_request(buffer, count, datatype, flags, callback)?;
        self.recv_request(&ep, req, flags)
    }

    /// Consumes directly from the head descriptor, element-granular, with
    /// no request allocation. `Error::NoProgress` sends the caller to the
    /// request path.
    fn try_recv_inplace(
        &self,
        ep: &Endpoint,
        buffer: &mut RecvBuffer,
        count: usize,
        dt: Datatype,
        flags: RecvFlags,
    ) -> Result<usize, Error> {
        if !ep.has_data() || flags.contains(RecvFlags::NO_IMM_CMPL) {
            return Err(Error::NoProgress);
        }
        let (elem_size, mut recv_length) = match dt {
            Datatype::Contig { elem_size } => (elem_size, elem_size * count),
            Datatype::Iov => (1, datatype::recv_length(buffer, count, dt)),
            Datatype::Generic => return Err(Error::NoProgress),
        };
        if recv_length == 0 {
            // zero-length receives complete through the request path
            return Err(Error::NoProgress);
        }

        let consumed_all = {
            let mut q = ep.match_q.borrow_mut();
            let desc = q
                .front_desc_mut()
                .expect("endpoint advertises data with an empty queue");
            let desc_len = desc.len();
            if desc_len < recv_length {
                if flags.contains(RecvFlags::WAITALL) || desc_len < elem_size {
                    return Err(Error::NoProgress);
                }
                // take what is there, keeping element granularity
                recv_length = align_down(desc_len, elem_size);
            }
            datatype::unpack_single(buffer, &desc.payload()[..recv_length])?;
            if recv_length == desc_len {
                true
            } else {
                desc.advance(recv_length);
                false
            }
        };
        if consumed_all {
            let desc = self.rdesc_dequeue(ep);
            self.release_desc(desc);
        }
        Ok(recv_length)
    }

    /// Drains queued data into a fresh request, then completes it or posts
    /// it on the match queue.
    fn recv_request(
        &self,
        ep: &Rc<Endpoint>,
        req: Rc<RecvRequest>,
        flags: RecvFlags,
    ) -> Result<RecvOp, Error> {
        while req.remaining() > 0 && ep.has_data() {
            let (unpacked, desc_len) = {
                let q = ep.match_q.borrow();
                let desc = q
                    .front_desc()
                    .expect("endpoint advertises data with an empty queue");
                (req.unpack_clamped(desc.payload()), desc.len())
            };
            let unpacked = match unpacked {
                Ok(n) => n,
                Err(err) => {
                    self.put_request();
                    return Err(err);
                }
            };
            if unpacked == desc_len {
                let desc = self.rdesc_dequeue(ep);
                self.release_desc(desc);
            } else {
                ep.match_q
                    .borrow_mut()
                    .front_desc_mut()
                    .unwrap()
                    .advance(unpacked);
            }
            // A generic datatype completes on any quantity; stop after one
            // descriptor so nothing extra gets buffered. WAITALL keeps
            // draining.
            if matches!(req.datatype(), Datatype::Generic) && !req.is_waitall() {
                break;
            }
        }

        if req.can_complete() {
            self.put_request();
            if flags.contains(RecvFlags::NO_IMM_CMPL) {
                // completion inside the call is prohibited: deliver through
                // the callback and hand back an already-completed handle
                req.complete(Ok(()));
                return Ok(RecvOp::Pending(StreamRecvHandle::new(req)));
            }
            let (length, buffer) = req.complete_inline();
            return Ok(RecvOp::Complete { length, buffer });
        }

        assert!(!ep.has_data());
        ep.match_q.borrow_mut().push_request(Rc::clone(&req));
        Ok(RecvOp::Pending(StreamRecvHandle::new(req)))
    }

    // ------------------------------------------------------------------
    // Zero-copy data path
    // ------------------------------------------------------------------

    fn recv_data_nolock(&self, ep: &Endpoint) -> Option<RecvDesc> {
        if !ep.has_data() {
            return None;
        }
        Some(self.rdesc_dequeue(ep))
    }

    /// Lends the head descriptor to the user without copying. Returns
    /// `None` when no unmatched data is queued. The user gives the bytes
    /// back through [`data_release`](Self::data_release); release order
    /// across lends is not significant.
    pub fn recv_data_nb(&self, handle: Handle) -> Result<Option<StreamData>, Error> {
        self.check_feature()?;
        let _cs = self.cs.enter();
        let ep = self.get_ep(handle)?;
        let desc = self.recv_data_nolock(&ep);
        if let Some(desc) = &desc {
            trace!("ep {:?} lends {} stream bytes", handle, desc.len());
        }
        Ok(desc.map(StreamData::new))
    }

    /// Returns lent bytes to their origin.
    pub fn data_release(&self, handle: Handle, data: StreamData) {
        let _cs = self.cs.enter();
        trace!("ep {:?} releases {} stream bytes", handle, data.len());
        self.release_desc(data.into_desc());
    }
}
