//! End-to-end provider scenarios over the simulated fabric.

use std::sync::Arc;
use std::time::Duration;

use ofiprov_core::av::MapAv;
use ofiprov_core::cntr::CntrAttr;
use ofiprov_core::config::{ProgressMode, ProviderConfig};
use ofiprov_core::cq::{CompletionQueue, CqAttr, CqEntry, CqErrEntry};
use ofiprov_core::domain::{CqHandle, Domain, DomainAttr, EpHandle};
use ofiprov_core::endpoint::{AtomicArgs, EpAttr, Endpoint, MsgArgs};
use ofiprov_core::error::{errno, ProviderError};
use ofiprov_core::flags::OpFlags;
use ofiprov_core::logging;
use ofiprov_core::lower::{AtomicOp, Iov, PeerAddr};
use ofiprov_core::sim::{SimFabric, SimFabricConfig};
use ofiprov_core::trigger::TriggeredOp;
use ofiprov_core::variant::VariantKind;
use ofiprov_core::vlane;

fn open_domain(config: ProviderConfig) -> (Arc<SimFabric>, Domain) {
    logging::init_tracing();
    let sim = Arc::new(SimFabric::new(SimFabricConfig {
        variant: config.variant,
        ..Default::default()
    }));
    let domain = Domain::open(config, DomainAttr::default(), sim.clone()).unwrap();
    (sim, domain)
}

struct Peer {
    handle: EpHandle,
    cq_handle: CqHandle,
    ep: Arc<Endpoint>,
    cq: Arc<CompletionQueue>,
}

fn open_peer(domain: &Domain, attr: EpAttr) -> Peer {
    open_peer_with_cq(domain, attr, CqAttr::default())
}

fn open_peer_with_cq(domain: &Domain, attr: EpAttr, cq_attr: CqAttr) -> Peer {
    let cq_handle = domain.cq_open(cq_attr).unwrap();
    let handle = domain.endpoint(attr).unwrap();
    domain
        .ep_bind_cq(handle, cq_handle, OpFlags::SEND | OpFlags::RECV)
        .unwrap();
    domain.ep_bind_av(handle, Arc::new(MapAv)).unwrap();
    domain.ep_enable(handle).unwrap();
    Peer {
        handle,
        cq_handle,
        ep: domain.ep(handle).unwrap(),
        cq: domain.cq(cq_handle).unwrap(),
    }
}

fn close_peer(domain: &Domain, peer: Peer) {
    domain.ep_close(peer.handle).unwrap();
    domain.cq_close(peer.cq_handle).unwrap();
}

/// Reads until `want` entries arrived, driving progress on each read.
fn drain(cq: &CompletionQueue, want: usize) -> Vec<CqEntry> {
    let mut out = Vec::new();
    for _ in 0..100 {
        match cq.read(want - out.len()) {
            Ok(entries) => out.extend(entries),
            Err(ProviderError::Again) => {}
            Err(e) => panic!("unexpected cq error: {}", e),
        }
        if out.len() >= want {
            break;
        }
    }
    out
}

fn next_error(cq: &CompletionQueue) -> CqErrEntry {
    for _ in 0..100 {
        match cq.read(1) {
            Err(ProviderError::ErrorAvailable) => return cq.readerr().unwrap(),
            Err(ProviderError::Again) => {}
            other => panic!("expected an error completion, got {:?}", other),
        }
    }
    panic!("no error completion arrived");
}

fn assert_quiet(cq: &CompletionQueue) {
    for _ in 0..3 {
        assert_eq!(cq.read(4).unwrap_err(), ProviderError::Again);
    }
}

#[test]
fn test_send_recv_loopback() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());

    let src = sim.memory().alloc(5);
    let dst = sim.memory().alloc(16);
    sim.memory().write(src, b"hello");

    b.ep.recv(Iov::new(dst, 16), None, a.ep.fi_addr(), 21).unwrap();
    a.ep.send(Iov::new(src, 5), None, b.ep.fi_addr(), 11).unwrap();

    let rx = drain(&b.cq, 1);
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].op_context, 21);
    assert_eq!(rx[0].flags, OpFlags::MSG | OpFlags::RECV);
    assert_eq!(rx[0].len, 5);
    assert_eq!(sim.memory().read(dst, 5).unwrap(), b"hello");

    let tx = drain(&a.cq, 1);
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].op_context, 11);
    assert_eq!(tx[0].flags, OpFlags::MSG | OpFlags::SEND);

    close_peer(&domain, a);
    close_peer(&domain, b);
    domain.close().unwrap();
}

#[test]
fn test_tagged_and_data_receives_per_variant() {
    for variant in [VariantKind::Stream, VariantKind::TagMatch, VariantKind::Datagram] {
        let (sim, domain) = open_domain(ProviderConfig {
            variant,
            ..Default::default()
        });
        let a = open_peer(&domain, EpAttr::default());
        let b = open_peer(&domain, EpAttr::default());
        let src = sim.memory().alloc(8);
        let dst = sim.memory().alloc(8);
        let other = sim.memory().alloc(8);

        b.ep.trecv(Iov::new(dst, 8), None, a.ep.fi_addr(), 0x4200, 0xFF, 1)
            .unwrap();
        a.ep.tsend(Iov::new(src, 8), None, b.ep.fi_addr(), 0x4217, 2)
            .unwrap();
        let rx = drain(&b.cq, 1);
        assert_eq!(rx.len(), 1, "{:?}", variant);
        assert_eq!(rx[0].flags, OpFlags::TAGGED | OpFlags::RECV, "{:?}", variant);
        assert_eq!(rx[0].tag, 0x4217, "{:?}", variant);
        assert_eq!(rx[0].len, 8, "{:?}", variant);

        b.ep.recv(Iov::new(other, 8), None, a.ep.fi_addr(), 3).unwrap();
        a.ep.senddata(Iov::new(src, 4), None, 0xD00D, b.ep.fi_addr(), 4)
            .unwrap();
        let rx = drain(&b.cq, 1);
        assert_eq!(rx.len(), 1, "{:?}", variant);
        assert!(rx[0].flags.contains(OpFlags::REMOTE_CQ_DATA), "{:?}", variant);
        assert_eq!(rx[0].data, 0xD00D, "{:?}", variant);
        assert_eq!(rx[0].tag, 0, "{:?}", variant);
        assert_eq!(rx[0].len, 4, "{:?}", variant);

        assert_eq!(drain(&a.cq, 2).len(), 2, "{:?}", variant);
        close_peer(&domain, a);
        close_peer(&domain, b);
        domain.close().unwrap();
    }
}

#[test]
fn test_tagged_send_with_data_unsupported_on_tag_matching() {
    let (sim, domain) = open_domain(ProviderConfig {
        variant: VariantKind::TagMatch,
        ..Default::default()
    });
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    let err = a
        .ep
        .tsenddata(Iov::new(src, 8), None, 1, a.ep.fi_addr(), 7, 0)
        .unwrap_err();
    assert_eq!(err.errno(), errno::ENOSYS);
    assert_eq!(a.cq.pool().in_use(), 0);
}

#[test]
fn test_zero_length_write_with_data_reaches_target() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());
    let target = sim.memory().alloc(64);
    let region = domain
        .mr_reg(Iov::new(target, 64), OpFlags::REMOTE_WRITE, 0, 0)
        .unwrap();
    let src = sim.memory().alloc(8);

    a.ep.writedata(Iov::new(src, 0), None, 0xBEEF, b.ep.fi_addr(), 0, region.key(), 7)
        .unwrap();

    let rx = drain(&b.cq, 1);
    assert_eq!(rx.len(), 1);
    assert_eq!(
        rx[0].flags,
        OpFlags::RMA | OpFlags::REMOTE_WRITE | OpFlags::REMOTE_CQ_DATA
    );
    assert_eq!(rx[0].len, 0);
    assert_eq!(rx[0].tag, 0);
    assert_eq!(rx[0].data, 0xBEEF);

    let tx = drain(&a.cq, 1);
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].op_context, 7);
    assert_eq!(tx[0].flags, OpFlags::RMA | OpFlags::WRITE);
}

#[test]
fn test_write_without_data_is_silent_at_target() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());
    let target = sim.memory().alloc(32);
    let region = domain
        .mr_reg(Iov::new(target, 32), OpFlags::REMOTE_WRITE, 0, 0)
        .unwrap();
    let cntr_handle = domain.cntr_open(CntrAttr::default()).unwrap();
    domain.mr_bind_cntr(region.key(), cntr_handle).unwrap();
    let cntr = domain.cntr(cntr_handle).unwrap();

    let src = sim.memory().alloc(8);
    sim.memory().write(src, b"abcdefgh");
    a.ep.write(Iov::new(src, 8), None, b.ep.fi_addr(), 8, region.key(), 1)
        .unwrap();
    a.ep.write(Iov::new(src, 4), None, b.ep.fi_addr(), 0, region.key(), 2)
        .unwrap();

    assert_eq!(drain(&a.cq, 2).len(), 2);
    assert_eq!(sim.memory().read(target, 4).unwrap(), b"abcd");
    assert_eq!(sim.memory().read(target + 8, 8).unwrap(), b"abcdefgh");
    assert_eq!(cntr.read(), 2);
    assert_quiet(&b.cq);
}

#[test]
fn test_rma_event_reports_every_remote_access() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(
        &domain,
        EpAttr {
            caps: OpFlags::RMA_EVENT,
            ..Default::default()
        },
    );
    let target = sim.memory().alloc(16);
    sim.memory().write(target, b"remote!!");
    let region = domain
        .mr_reg(Iov::new(target, 16), OpFlags::REMOTE_READ, 0, 0)
        .unwrap();
    let local = sim.memory().alloc(8);

    a.ep.read(Iov::new(local, 8), None, b.ep.fi_addr(), 0, region.key(), 5)
        .unwrap();
    let rx = drain(&b.cq, 1);
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].flags, OpFlags::RMA | OpFlags::REMOTE_READ);

    let tx = drain(&a.cq, 1);
    assert_eq!(tx[0].flags, OpFlags::RMA | OpFlags::READ);
    assert_eq!(sim.memory().read(local, 8).unwrap(), b"remote!!");
}

#[test]
fn test_remote_access_denied() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());
    let target = sim.memory().alloc(16);
    let region = domain
        .mr_reg(Iov::new(target, 16), OpFlags::REMOTE_READ, 0, 0)
        .unwrap();
    let src = sim.memory().alloc(8);
    sim.memory().write(src, b"XXXXXXXX");

    a.ep.write(Iov::new(src, 8), None, b.ep.fi_addr(), 0, region.key(), 11)
        .unwrap();
    let err = next_error(&a.cq);
    assert_eq!(err.err, errno::EACCES);
    assert_eq!(err.op_context, 11);
    assert_eq!(err.flags, OpFlags::RMA | OpFlags::WRITE);
    assert_eq!(a.cq.read(1).unwrap_err(), ProviderError::Again);

    assert_eq!(sim.memory().read(target, 8).unwrap(), vec![0; 8]);
    assert_eq!(domain.metrics().verify_failures, 1);
    assert_quiet(&b.cq);
}

#[test]
fn test_out_of_bounds_write_denied() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());
    let target = sim.memory().alloc(16);
    let region = domain
        .mr_reg(Iov::new(target, 16), OpFlags::REMOTE_WRITE, 0, 0)
        .unwrap();
    let src = sim.memory().alloc(8);

    a.ep.write(Iov::new(src, 8), None, b.ep.fi_addr(), 12, region.key(), 1)
        .unwrap();
    assert_eq!(next_error(&a.cq).err, errno::EACCES);

    a.ep.write(Iov::new(src, 8), None, b.ep.fi_addr(), 0, region.key() + 100, 2)
        .unwrap();
    assert_eq!(next_error(&a.cq).err, errno::EACCES);
}

#[test]
fn test_fetch_atomic_returns_previous_value() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());
    let target = sim.memory().alloc(8);
    sim.memory().write(target, &10u64.to_le_bytes());
    let region = domain
        .mr_reg(
            Iov::new(target, 8),
            OpFlags::REMOTE_READ | OpFlags::REMOTE_WRITE,
            0,
            0,
        )
        .unwrap();
    let operand = sim.memory().alloc(8);
    sim.memory().write(operand, &5u64.to_le_bytes());
    let result = sim.memory().alloc(8);

    a.ep.fetch_atomic(AtomicArgs {
        op: AtomicOp::Sum,
        operand: Iov::new(operand, 8),
        desc: None,
        compare: None,
        result: Some(Iov::new(result, 8)),
        addr: b.ep.fi_addr(),
        remote_addr: 0,
        key: region.key(),
        context: 9,
        flags: OpFlags::empty(),
    })
    .unwrap();

    let tx = drain(&a.cq, 1);
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].flags, OpFlags::ATOMIC | OpFlags::READ);
    assert_eq!(sim.memory().read_u64(target), Some(15));
    assert_eq!(sim.memory().read_u64(result), Some(10));

    let short = a.ep.atomic(AtomicArgs {
        op: AtomicOp::Write,
        operand: Iov::new(operand, 4),
        desc: None,
        compare: None,
        result: None,
        addr: b.ep.fi_addr(),
        remote_addr: 0,
        key: region.key(),
        context: 0,
        flags: OpFlags::empty(),
    });
    assert!(matches!(short, Err(ProviderError::InvalidArgument { .. })));
}

#[test]
fn test_triggers_fire_in_order() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let cntr = domain
        .cntr(domain.cntr_open(CntrAttr::default()).unwrap())
        .unwrap();
    let src = sim.memory().alloc(8);
    let send = |context| {
        TriggeredOp::Send(MsgArgs {
            iov: vec![Iov::new(src, 8)],
            addr: a.ep.fi_addr(),
            context,
            ..Default::default()
        })
    };

    a.ep.trigger(&cntr, 2, send(1)).unwrap();
    a.ep.trigger(&cntr, 1, send(2)).unwrap();
    a.ep.trigger(&cntr, 2, send(3)).unwrap();
    a.ep.trigger(&cntr, 5, send(4)).unwrap();
    assert_eq!(cntr.pending_triggers(), 4);
    assert_quiet(&a.cq);

    cntr.add(2);
    assert_eq!(cntr.pending_triggers(), 1);
    let tx = drain(&a.cq, 3);
    let order: Vec<u64> = tx.iter().map(|e| e.op_context).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(domain.metrics().triggers_fired, 3);
    assert_eq!(sim.unexpected_messages(1), 3);
}

#[test]
fn test_trigger_flag_rejected_on_direct_calls() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    let err = a
        .ep
        .sendmsg(MsgArgs {
            iov: vec![Iov::new(src, 8)],
            addr: a.ep.fi_addr(),
            flags: OpFlags::TRIGGER,
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.errno(), errno::EINVAL);
}

#[test]
fn test_endpoint_counters_follow_completions() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let cntr_handle = domain.cntr_open(CntrAttr::default()).unwrap();
    let cq_handle = domain.cq_open(CqAttr::default()).unwrap();
    let handle = domain.endpoint(EpAttr::default()).unwrap();
    domain
        .ep_bind_cq(handle, cq_handle, OpFlags::SEND | OpFlags::RECV)
        .unwrap();
    domain
        .ep_bind_cntr(handle, cntr_handle, OpFlags::SEND)
        .unwrap();
    domain.ep_bind_av(handle, Arc::new(MapAv)).unwrap();
    domain.ep_enable(handle).unwrap();
    let ep = domain.ep(handle).unwrap();
    let cntr = domain.cntr(cntr_handle).unwrap();
    let src = sim.memory().alloc(8);

    ep.send(Iov::new(src, 8), None, a.ep.fi_addr(), 1).unwrap();
    ep.send(Iov::new(src, 8), None, a.ep.fi_addr(), 2).unwrap();
    let missing = vlane::peer_to_addr(PeerAddr {
        context: 999,
        vlane: 0,
    });
    ep.send(Iov::new(src, 8), None, missing, 3).unwrap();

    cntr.wait(2, Duration::from_secs(5)).unwrap();
    assert_eq!(cntr.read(), 2);
    assert_eq!(cntr.read_err(), 1);
    assert_eq!(domain.cntr_close(cntr_handle).unwrap_err().errno(), errno::EBUSY);
    domain.ep_close(handle).unwrap();
    assert_eq!(domain.cntr_close(cntr_handle).unwrap(), 0);
}

#[test]
fn test_inject_failures_are_suppressed() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(128);
    let missing = vlane::peer_to_addr(PeerAddr {
        context: 999,
        vlane: 0,
    });

    a.ep.inject(Iov::new(src, 4), missing).unwrap();
    assert_quiet(&a.cq);
    assert_eq!(domain.metrics().errors_suppressed, 1);
    assert_eq!(a.cq.pool().in_use(), 0);

    let err = a.ep.inject(Iov::new(src, 128), missing).unwrap_err();
    assert!(matches!(err, ProviderError::MessageTooLong { len: 128, max: 64 }));

    a.ep.send(Iov::new(src, 4), None, missing, 5).unwrap();
    let err = next_error(&a.cq);
    assert_eq!(err.err, errno::EREMOTEIO);
    assert_eq!(err.op_context, 5);
    assert_eq!(err.flags, OpFlags::MSG | OpFlags::SEND);
}

#[test]
fn test_successful_inject_produces_no_completion() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    a.ep.inject(Iov::new(src, 8), a.ep.fi_addr()).unwrap();
    assert_quiet(&a.cq);
    assert_eq!(a.cq.pool().in_use(), 0);
    assert_eq!(sim.unexpected_messages(1), 1);
}

#[test]
fn test_error_precedes_later_successes() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    let missing = vlane::peer_to_addr(PeerAddr {
        context: 999,
        vlane: 0,
    });

    a.ep.send(Iov::new(src, 8), None, a.ep.fi_addr(), 1).unwrap();
    a.ep.send(Iov::new(src, 8), None, missing, 2).unwrap();
    a.ep.send(Iov::new(src, 8), None, a.ep.fi_addr(), 3).unwrap();

    let first = a.cq.read(8).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].op_context, 1);
    assert_eq!(a.cq.read(8).unwrap_err(), ProviderError::ErrorAvailable);
    assert_eq!(a.cq.read(8).unwrap_err(), ProviderError::ErrorAvailable);
    assert_eq!(a.cq.readerr().unwrap().op_context, 2);
    let rest = a.cq.read(8).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].op_context, 3);
}

#[test]
fn test_resource_management_bounds_outstanding_transfers() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    let dest = a.ep.fi_addr();

    for context in 0..1024 {
        a.ep.send(Iov::new(src, 8), None, dest, context).unwrap();
    }
    assert_eq!(
        a.ep.send(Iov::new(src, 8), None, dest, 1024).unwrap_err(),
        ProviderError::Again
    );

    let freed = a.cq.read(64).unwrap();
    assert_eq!(freed.len(), 64);
    a.ep.send(Iov::new(src, 8), None, dest, 1024).unwrap();
}

#[test]
fn test_full_queue_defers_completions_in_order() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let cq_handle = domain
        .cq_open(CqAttr {
            size: 4,
            ..Default::default()
        })
        .unwrap();
    let handle = domain.endpoint(EpAttr::default()).unwrap();
    domain
        .ep_bind_cq(handle, cq_handle, OpFlags::SEND | OpFlags::RECV)
        .unwrap();
    domain.ep_bind_av(handle, Arc::new(MapAv)).unwrap();
    domain.ep_enable(handle).unwrap();
    let ep = domain.ep(handle).unwrap();
    let cq = domain.cq(cq_handle).unwrap();
    let src = sim.memory().alloc(8);

    for context in 0..4 {
        ep.send(Iov::new(src, 8), None, ep.fi_addr(), context).unwrap();
    }
    domain.progress();
    assert_eq!(cq.len(), 4);
    assert_eq!(cq.free_slots(), 0);
    assert_eq!(cq.pool().in_use(), 0);

    ep.send(Iov::new(src, 8), None, ep.fi_addr(), 4).unwrap();
    ep.send(Iov::new(src, 8), None, ep.fi_addr(), 5).unwrap();
    domain.progress();
    assert_eq!(cq.len(), 4);
    assert_eq!(cq.pool().in_use(), 2);

    let first: Vec<u64> = cq.read(4).unwrap().iter().map(|e| e.op_context).collect();
    assert_eq!(first, vec![0, 1, 2, 3]);
    let rest: Vec<u64> = drain(&cq, 2).iter().map(|e| e.op_context).collect();
    assert_eq!(rest, vec![4, 5]);
}

#[test]
fn test_full_queue_does_not_stall_shared_context() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let small = CqAttr {
        size: 1,
        ..Default::default()
    };
    let idle = open_peer_with_cq(&domain, EpAttr::default(), small);
    let busy = open_peer_with_cq(
        &domain,
        EpAttr::default(),
        CqAttr {
            size: 16,
            ..Default::default()
        },
    );
    let src = sim.memory().alloc(8);

    idle.ep.send(Iov::new(src, 8), None, idle.ep.fi_addr(), 1).unwrap();
    domain.progress();
    assert_eq!(idle.cq.free_slots(), 0);
    idle.ep.send(Iov::new(src, 8), None, idle.ep.fi_addr(), 2).unwrap();

    busy.ep.send(Iov::new(src, 8), None, busy.ep.fi_addr(), 7).unwrap();
    let done: Vec<u64> = drain(&busy.cq, 1).iter().map(|e| e.op_context).collect();
    assert_eq!(done, vec![7]);
    assert_eq!(idle.cq.len(), 1);
    assert_eq!(idle.cq.pool().in_use(), 1);

    let idle_done: Vec<u64> = drain(&idle.cq, 2).iter().map(|e| e.op_context).collect();
    assert_eq!(idle_done, vec![1, 2]);
    assert_eq!(idle.cq.pool().in_use(), 0);
}

#[test]
fn test_remote_write_completes_while_target_queue_full() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer_with_cq(
        &domain,
        EpAttr::default(),
        CqAttr {
            size: 1,
            ..Default::default()
        },
    );
    let target = sim.memory().alloc(16);
    let region = domain
        .mr_reg(Iov::new(target, 16), OpFlags::REMOTE_WRITE, 0, 0)
        .unwrap();
    let src = sim.memory().alloc(8);

    b.ep.send(Iov::new(src, 8), None, b.ep.fi_addr(), 1).unwrap();
    domain.progress();
    assert_eq!(b.cq.free_slots(), 0);

    a.ep.writedata(Iov::new(src, 8), None, 0xCAFE, b.ep.fi_addr(), 0, region.key(), 9)
        .unwrap();
    let tx = drain(&a.cq, 1);
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].op_context, 9);
    assert_eq!(b.cq.len(), 1);

    let rx = drain(&b.cq, 2);
    assert_eq!(rx.len(), 2);
    assert_eq!(rx[0].op_context, 1);
    assert_eq!(rx[1].data, 0xCAFE);
    assert!(rx[1].flags.contains(OpFlags::REMOTE_CQ_DATA));
}

#[test]
fn test_auto_progress_blocking_read() {
    let (sim, domain) = open_domain(ProviderConfig {
        progress: ProgressMode::Auto,
        lock_level: 0,
        ..Default::default()
    });
    assert!(domain.engine().is_running());
    assert_eq!(domain.config().lock_level, 1);

    let a = open_peer(&domain, EpAttr::default());
    let b = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    let dst = sim.memory().alloc(8);
    b.ep.recv(Iov::new(dst, 8), None, a.ep.fi_addr(), 2).unwrap();
    a.ep.send(Iov::new(src, 8), None, b.ep.fi_addr(), 1).unwrap();

    let rx = b.cq.sread(1, Duration::from_secs(5)).unwrap();
    assert_eq!(rx[0].op_context, 2);
    let tx = a.cq.sread(1, Duration::from_secs(5)).unwrap();
    assert_eq!(tx[0].op_context, 1);

    close_peer(&domain, a);
    close_peer(&domain, b);
    domain.close().unwrap();
    assert!(!domain.engine().is_running());
}

#[tokio::test]
async fn test_auto_progress_async_read() {
    let (sim, domain) = open_domain(ProviderConfig {
        progress: ProgressMode::Auto,
        ..Default::default()
    });
    let a = open_peer(&domain, EpAttr::default());
    let src = sim.memory().alloc(8);
    let dst = sim.memory().alloc(8);
    a.ep.recv(Iov::new(dst, 8), None, a.ep.fi_addr(), 2).unwrap();
    a.ep.send(Iov::new(src, 8), None, a.ep.fi_addr(), 1).unwrap();

    let mut contexts = Vec::new();
    while contexts.len() < 2 {
        let entries = a.cq.read_async(2, Duration::from_secs(5)).await.unwrap();
        contexts.extend(entries.iter().map(|e| e.op_context));
    }
    contexts.sort_unstable();
    assert_eq!(contexts, vec![1, 2]);
}

#[test]
fn test_dedicated_contexts_exchange_messages() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(
        &domain,
        EpAttr {
            dedicated_context: true,
            ..Default::default()
        },
    );
    let b = open_peer(&domain, EpAttr::default());
    assert_ne!(a.ep.name().context, b.ep.name().context);
    assert_eq!(sim.stats().live_contexts, 2);

    let src = sim.memory().alloc(3);
    let dst = sim.memory().alloc(3);
    sim.memory().write(src, b"abc");
    b.ep.recv(Iov::new(dst, 3), None, a.ep.fi_addr(), 0).unwrap();
    a.ep.send(Iov::new(src, 3), None, b.ep.fi_addr(), 0).unwrap();
    assert_eq!(drain(&b.cq, 1).len(), 1);
    assert_eq!(drain(&a.cq, 1).len(), 1);
    assert_eq!(sim.memory().read(dst, 3).unwrap(), b"abc");

    close_peer(&domain, a);
    assert_eq!(sim.stats().live_contexts, 1);
    close_peer(&domain, b);
    domain.close().unwrap();
}

#[test]
fn test_domain_close_requires_closed_objects() {
    let (sim, domain) = open_domain(ProviderConfig::default());
    let a = open_peer(&domain, EpAttr::default());
    let buf = sim.memory().alloc(16);
    let region = domain
        .mr_reg(Iov::new(buf, 16), OpFlags::REMOTE_WRITE, 0, 0)
        .unwrap();

    assert_eq!(domain.close().unwrap_err().errno(), errno::EBUSY);
    assert_eq!(domain.cq_close(a.cq_handle).unwrap_err().errno(), errno::EBUSY);
    close_peer(&domain, a);
    assert_eq!(domain.close().unwrap_err().errno(), errno::EBUSY);
    domain.mr_close(region.key()).unwrap();
    domain.close().unwrap();
    assert_eq!(domain.close().unwrap_err().errno(), errno::FI_EOPBADSTATE);
}
