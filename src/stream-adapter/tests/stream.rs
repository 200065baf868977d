use std::cell::RefCell;
use std::rc::Rc;

use rand::prelude::*;
use rand::rngs::StdRng;

use interface::{AmHeader, AmStatus, Handle, TransportDesc, AM_HDR_SIZE};
use stream_adapter::{
    AmData, Datatype, Error, RecvBuffer, RecvFlags, RecvOp, RecvParams, StreamAdapterConfig,
    StreamAdapterEngine,
};

const SEED: u64 = 999;

fn engine() -> StreamAdapterEngine {
    StreamAdapterEngine::new(StreamAdapterConfig::default())
}

fn am_msg(ep: Handle, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![0u8; AM_HDR_SIZE + payload.len()];
    AmHeader::new(ep).pack(&mut msg);
    msg[AM_HDR_SIZE..].copy_from_slice(payload);
    msg
}

fn deliver(engine: &StreamAdapterEngine, ep: Handle, payload: &[u8]) -> AmStatus {
    let msg = am_msg(ep, payload);
    engine.am_handler(AmData::Borrowed(&msg))
}

fn contig_params() -> RecvParams {
    RecvParams::new(Datatype::Contig { elem_size: 1 })
}

#[test]
fn single_fragment_exact_match() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let handle = match engine
        .recv_nbx(ep, RecvBuffer::Contig(vec![0u8; 4]), 4, contig_params())
        .unwrap()
    {
        RecvOp::Pending(handle) => handle,
        _ => unreachable!("no data arrived yet"),
    };

    deliver(&engine, ep, b"ABCD");

    let done = handle.check().unwrap();
    assert_eq!(done.status, Ok(()));
    assert_eq!(done.length, 4);
    match done.buffer {
        RecvBuffer::Contig(buf) => assert_eq!(buf, b"ABCD".to_vec()),
        _ => unreachable!(),
    }
}

#[test]
fn fragmented_assembly_with_waitall() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let completions = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&completions);
    let op = engine
        .recv_nbx(
            ep,
            RecvBuffer::Contig(vec![0u8; 8]),
            8,
            contig_params()
                .flags(RecvFlags::WAITALL)
                .callback(move |c| sink.borrow_mut().push(c)),
        )
        .unwrap();
    assert!(matches!(op, RecvOp::Pending(_)));

    deliver(&engine, ep, &[1, 2, 3]);
    assert!(completions.borrow().is_empty());
    deliver(&engine, ep, &[4, 5]);
    assert!(completions.borrow().is_empty());
    deliver(&engine, ep, &[6, 7, 8]);

    let mut seen = completions.borrow_mut();
    assert_eq!(seen.len(), 1);
    let done = seen.pop().unwrap();
    assert_eq!(done.status, Ok(()));
    assert_eq!(done.length, 8);
    match done.buffer {
        RecvBuffer::Contig(buf) => assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7, 8]),
        _ => unreachable!(),
    }
}

#[test]
fn granularity_truncation_aligns_down() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    deliver(&engine, ep, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    // 3 elements of 4 bytes wanted, 10 bytes queued: align down to 8
    let op = engine
        .recv_nbx(
            ep,
            RecvBuffer::Contig(vec![0u8; 12]),
            3,
            RecvParams::new(Datatype::Contig { elem_size: 4 }),
        )
        .unwrap();
    match op {
        RecvOp::Complete { length, buffer } => {
            assert_eq!(length, 8);
            match buffer {
                RecvBuffer::Contig(buf) => assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]),
                _ => unreachable!(),
            }
        }
        _ => unreachable!("inplace path must fire"),
    }

    // the 2-byte tail stays queued and satisfies the next receive
    assert!(engine.has_data(ep));
    let op = engine
        .recv_nbx(ep, RecvBuffer::Contig(vec![0u8; 2]), 2, contig_params())
        .unwrap();
    match op {
        RecvOp::Complete { length, buffer } => {
            assert_eq!(length, 2);
            match buffer {
                RecvBuffer::Contig(buf) => assert_eq!(buf, vec![9, 10]),
                _ => unreachable!(),
            }
        }
        _ => unreachable!(),
    }
    assert!(!engine.has_data(ep));
}

#[test]
fn inplace_fast_path_consumes_descriptor() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let payload: Vec<u8> = (0..16).collect();
    deliver(&engine, ep, &payload);
    assert_eq!(engine.pool_outstanding(), 1);

    let op = engine
        .recv_nbx(ep, RecvBuffer::Contig(vec![0u8; 16]), 16, contig_params())
        .unwrap();
    match op {
        RecvOp::Complete { length, buffer } => {
            assert_eq!(length, 16);
            match buffer {
                RecvBuffer::Contig(buf) => assert_eq!(buf, payload),
                _ => unreachable!(),
            }
        }
        _ => unreachable!("inplace path must fire"),
    }

    // descriptor fully consumed and returned to the pool
    assert!(!engine.has_data(ep));
    assert_eq!(engine.pool_outstanding(), 0);
}

#[test]
fn zero_copy_lend_and_release() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let payload = vec![7u8; 64];
    let baseline = engine.pool_available();
    deliver(&engine, ep, &payload);
    assert!(engine.has_data(ep));
    assert_eq!(engine.pool_outstanding(), 1);
    assert_eq!(engine.pool_available(), baseline - 1);

    let data = engine.recv_data_nb(ep).unwrap().unwrap();
    assert_eq!(data.len(), 64);
    assert_eq!(&data[..], &payload[..]);
    assert!(!engine.has_data(ep));
    assert!(!engine.is_queued(ep));

    // nothing else is queued
    assert!(engine.recv_data_nb(ep).unwrap().is_none());

    engine.data_release(ep, data);
    assert_eq!(engine.pool_outstanding(), 0);
    assert_eq!(engine.pool_available(), baseline);
}

#[test]
fn cleanup_cancels_pending_in_post_order() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let order = Rc::new(RefCell::new(Vec::new()));
    for idx in 0..2usize {
        let sink = Rc::clone(&order);
        let op = engine
            .recv_nbx(
                ep,
                RecvBuffer::Contig(vec![0u8; 50]),
                50,
                contig_params().callback(move |c| sink.borrow_mut().push((idx, c.status, c.length))),
            )
            .unwrap();
        assert!(matches!(op, RecvOp::Pending(_)));
    }

    engine.ep_cleanup(ep, Error::Canceled);

    let seen = order.borrow();
    assert_eq!(
        *seen,
        vec![(0, Err(Error::Canceled), 0), (1, Err(Error::Canceled), 0)]
    );
    assert!(!engine.has_data(ep));
    assert!(!engine.is_queued(ep));
}

#[test]
fn cleanup_drops_unmatched_data() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    deliver(&engine, ep, &[1, 2, 3]);
    deliver(&engine, ep, &[4, 5]);
    assert_eq!(engine.pool_outstanding(), 2);
    assert!(engine.is_queued(ep));

    engine.ep_cleanup(ep, Error::Canceled);
    assert!(!engine.has_data(ep));
    assert!(!engine.is_queued(ep));
    assert_eq!(engine.pool_outstanding(), 0);
}

#[test]
fn force_imm_cmpl_without_data() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let err = engine
        .recv_nbx(
            ep,
            RecvBuffer::Contig(vec![0u8; 4]),
            4,
            contig_params().flags(RecvFlags::FORCE_IMM_CMPL),
        )
        .unwrap_err();
    assert_eq!(err, Error::NoResource);

    // a short descriptor does not satisfy a waitall inplace receive either
    deliver(&engine, ep, &[1, 2]);
    let err = engine
        .recv_nbx(
            ep,
            RecvBuffer::Contig(vec![0u8; 4]),
            4,
            contig_params().flags(RecvFlags::WAITALL | RecvFlags::FORCE_IMM_CMPL),
        )
        .unwrap_err();
    assert_eq!(err, Error::NoResource);
}

#[test]
fn ready_list_membership_is_idempotent() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    deliver(&engine, ep, &[1]);
    deliver(&engine, ep, &[2]);
    assert!(engine.is_queued(ep));

    // two deliveries, one membership
    let ready = engine.poll_ready(8).unwrap();
    assert_eq!(ready, vec![ep]);
    assert!(engine.poll_ready(8).unwrap().is_empty());
    assert!(!engine.is_queued(ep));

    // new data after the poll queues the endpoint again
    deliver(&engine, ep, &[3]);
    assert_eq!(engine.poll_ready(8).unwrap(), vec![ep]);
}

#[test]
fn ready_list_is_fifo_across_endpoints() {
    let engine = engine();
    let a = engine.create_ep();
    let b = engine.create_ep();
    let c = engine.create_ep();
    for ep in [a, b, c] {
        engine.ep_activate(ep);
    }

    deliver(&engine, b, &[1]);
    deliver(&engine, a, &[2]);
    deliver(&engine, c, &[3]);

    assert_eq!(engine.poll_ready(2).unwrap(), vec![b, a]);
    assert_eq!(engine.poll_ready(2).unwrap(), vec![c]);
}

#[test]
fn data_before_activation_is_not_progress_eligible() {
    let engine = engine();
    let ep = engine.create_ep();

    deliver(&engine, ep, &[1, 2, 3]);
    assert!(engine.has_data(ep));
    assert!(!engine.is_queued(ep));
    assert!(engine.poll_ready(8).unwrap().is_empty());

    // activation performs the catch-up enqueue
    engine.ep_activate(ep);
    assert!(engine.is_queued(ep));
    assert_eq!(engine.poll_ready(8).unwrap(), vec![ep]);
}

#[test]
fn transport_descriptor_is_retained_in_place() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let payload: Vec<u8> = (10..26).collect();
    let status = engine.am_handler(AmData::Desc(TransportDesc::new(am_msg(ep, &payload))));
    assert_eq!(status, AmStatus::Retained);
    // no pooled copy was made
    assert_eq!(engine.pool_outstanding(), 0);

    let data = engine.recv_data_nb(ep).unwrap().unwrap();
    assert_eq!(&data[..], &payload[..]);
    engine.data_release(ep, data);
    assert_eq!(engine.pool_outstanding(), 0);
}

#[test]
fn transport_descriptor_consumed_by_posted_request() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    let handle = match engine
        .recv_nbx(ep, RecvBuffer::Contig(vec![0u8; 8]), 8, contig_params())
        .unwrap()
    {
        RecvOp::Pending(handle) => handle,
        _ => unreachable!(),
    };

    // fully matched inline: the delivery is not retained
    let status = engine.am_handler(AmData::Desc(TransportDesc::new(am_msg(
        ep,
        &[1, 2, 3, 4, 5, 6, 7, 8],
    ))));
    assert_eq!(status, AmStatus::Consumed);
    assert_eq!(handle.check().unwrap().length, 8);
}

#[test]
fn iov_receive_scatters_in_order() {
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    deliver(&engine, ep, &[1, 2, 3, 4, 5, 6, 7]);

    let buffer = RecvBuffer::Iov(vec![vec![0u8; 2], vec![0u8; 3], vec![0u8; 2]]);
    let op = engine
        .recv_nbx(ep, buffer, 3, RecvParams::new(Datatype::Iov))
        .unwrap();
    match op {
        RecvOp::Complete { length, buffer } => {
            assert_eq!(length, 7);
            match buffer {
                RecvBuffer::Iov(iov) => {
                    assert_eq!(iov[0], vec![1, 2]);
                    assert_eq!(iov[1], vec![3, 4, 5]);
                    assert_eq!(iov[2], vec![6, 7]);
                }
                _ => unreachable!(),
            }
        }
        _ => unreachable!("inplace path must fire"),
    }
}

/// Byte conservation and order preservation over a random schedule of
/// fragment deliveries and receives.
#[test]
fn random_schedule_conserves_bytes_and_order() {
    let mut rng = StdRng::seed_from_u64(SEED);

    for round in 0..8 {
        let engine = engine();
        let ep = engine.create_ep();
        engine.ep_activate(ep);

        let total: usize = 2048 + round * 512;
        let stream: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        enum Outcome {
            Inline(Vec<u8>),
            Posted(stream_adapter::StreamRecvHandle),
        }

        let mut outcomes = Vec::new();
        let mut delivered = 0;
        let mut requested = 0;

        while delivered < total || requested < total {
            let deliver_next = requested >= total
                || (delivered < total && rng.gen_bool(0.5));
            if deliver_next {
                let len = rng.gen_range(1..=97).min(total - delivered);
                deliver(&engine, ep, &stream[delivered..delivered + len]);
                delivered += len;
            } else {
                let len = rng.gen_range(1..=64).min(total - requested);
                let waitall = rng.gen_bool(0.2);
                let flags = if waitall {
                    RecvFlags::WAITALL
                } else {
                    RecvFlags::empty()
                };
                let op = engine
                    .recv_nbx(
                        ep,
                        RecvBuffer::Contig(vec![0u8; len]),
                        len,
                        contig_params().flags(flags),
                    )
                    .unwrap();
                requested += len;
                match op {
                    RecvOp::Complete { length, buffer } => match buffer {
                        RecvBuffer::Contig(mut buf) => {
                            buf.truncate(length);
                            outcomes.push(Outcome::Inline(buf));
                        }
                        _ => unreachable!(),
                    },
                    RecvOp::Pending(handle) => outcomes.push(Outcome::Posted(handle)),
                }
            }
        }

        // whatever is still queued is the tail of the stream
        let mut collected = Vec::new();
        let mut tail = Vec::new();
        while let Some(data) = engine.recv_data_nb(ep).unwrap() {
            tail.extend_from_slice(&data);
            engine.data_release(ep, data);
        }

        // unfinished posted requests keep their partial bytes; cancel them
        // so the buffers come back
        engine.ep_cleanup(ep, Error::Canceled);

        for outcome in outcomes {
            match outcome {
                Outcome::Inline(bytes) => collected.extend_from_slice(&bytes),
                Outcome::Posted(handle) => {
                    let done = handle.check().expect("cleanup completes every request");
                    match done.buffer {
                        RecvBuffer::Contig(buf) => collected.extend_from_slice(&buf[..done.length]),
                        _ => unreachable!(),
                    }
                }
            }
        }
        collected.extend_from_slice(&tail);

        assert_eq!(collected.len(), total, "round {}: byte count", round);
        assert_eq!(collected, stream, "round {}: byte order", round);
        assert_eq!(engine.pool_outstanding(), 0, "round {}: pool baseline", round);
    }
}

/// Contig completions without WAITALL are always element-granular unless
/// they fill the whole request.
#[test]
fn random_schedule_respects_element_granularity() {
    let mut rng = StdRng::seed_from_u64(SEED ^ 0xa5a5);
    let engine = engine();
    let ep = engine.create_ep();
    engine.ep_activate(ep);

    const ELEM: usize = 4;
    let completions = Rc::new(RefCell::new(Vec::new()));
    let mut delivered = 0usize;

    for _ in 0..200 {
        if rng.gen_bool(0.5) {
            let len = rng.gen_range(1..=23);
            let chunk: Vec<u8> = (0..len).map(|i| (delivered + i) as u8).collect();
            deliver(&engine, ep, &chunk);
            delivered += len;
        } else {
            let count = rng.gen_range(1..=6);
            let sink = Rc::clone(&completions);
            let total = count * ELEM;
            let op = engine
                .recv_nbx(
                    ep,
                    RecvBuffer::Contig(vec![0u8; total]),
                    count,
                    RecvParams::new(Datatype::Contig { elem_size: ELEM })
                        .callback(move |c| sink.borrow_mut().push((c.status.is_ok(), c.length, total))),
                )
                .unwrap();
            if let RecvOp::Complete { length, .. } = op {
                completions.borrow_mut().push((true, length, total));
            }
        }
    }
    // cancellation may leave a request mid-element, so only successful
    // completions are held to the granularity contract
    engine.ep_cleanup(ep, Error::Canceled);

    for &(ok, length, requested) in completions.borrow().iter() {
        if !ok {
            continue;
        }
        assert!(
            length == requested || length % ELEM == 0,
            "completion of {} bytes (requested {}) breaks element granularity",
            length,
            requested
        );
    }
}
