//! End-to-end transfers between hand-wired nodes.

use ferry_core::{
    Admission, Bitmap, Disposition, FerryCore, File, HostId, Message, Packet, Pending,
    ProtocolConfig, QueueMode, RetransmitKey, Role,
};

fn config() -> ProtocolConfig {
    ProtocolConfig {
        queue_mode: QueueMode::Fifo,
        ..Default::default()
    }
}

fn node(id: u32) -> FerryCore {
    FerryCore::new(HostId(id), config()).unwrap()
}

fn original(name: &str, owner: u32, time_request: f64) -> File {
    let data = (0..100).map(|i| i * 7 + owner).collect();
    File::new(name, HostId(owner), 5000, data, time_request)
}

/// Move every message `from` holds whose destination passes `select`, dropping those `lose` picks.
fn relay(
    from: &mut FerryCore,
    to: &mut FerryCore,
    now: f64,
    select: impl Fn(&Message) -> bool,
    mut lose: impl FnMut(&Message) -> bool,
) -> usize {
    let mut moved = 0;
    for m in from.outgoing() {
        if !select(&m) {
            continue;
        }
        let m = from.take_outgoing(&m.id).unwrap();
        moved += 1;
        if lose(&m) {
            continue;
        }
        assert_eq!(to.receive_message(&m, from.host(), now), Admission::Accepted);
        to.on_message_transferred(m, from.host(), now).unwrap();
    }
    moved
}

/// Direct contact between two nodes until neither has anything for the other.
fn settle(a: &mut FerryCore, b: &mut FerryCore, now: f64) {
    loop {
        let (ha, hb) = (a.host(), b.host());
        let moved = relay(a, b, now, |m| m.to == hb, |_| false)
            + relay(b, a, now, |m| m.to == ha, |_| false);
        if moved == 0 {
            break;
        }
    }
}

fn tick_both(a: &mut FerryCore, b: &mut FerryCore, ticks: u32) {
    for i in 1..=ticks {
        let now = f64::from(i) * 0.1;
        a.tick(now);
        b.tick(now);
    }
}

#[test]
fn lossless_transfer_copies_file_and_leaves_no_state() {
    let mut a = node(1);
    let mut b = node(2);
    let src = original("filename3", 2, 0.0);
    b.place_file(src.clone()).unwrap();

    let txn = a.create_request("filename3", b.host(), 0.0).unwrap();
    settle(&mut a, &mut b, 0.0);

    let copy = a.file("filename3").unwrap();
    assert_eq!(copy.data(), src.data());
    assert_eq!(copy.digest(), src.digest());
    assert!(!copy.is_initial());
    assert!(a.cache().chunk_set("filename3").is_none());
    assert_eq!(a.stats().files_reassembled, 1);

    tick_both(&mut a, &mut b, 400);
    assert!(a.registry().for_transaction(txn).is_empty());
    assert!(b.registry().for_transaction(txn).is_empty());
    assert!(a.outbox().is_empty());
    assert!(b.outbox().is_empty());
}

#[test]
fn lost_chunk_is_regenerated_alone() {
    let mut a = node(1);
    let mut b = node(2);
    let src = original("filename3", 2, 0.0);
    b.place_file(src.clone()).unwrap();
    let txn = a.create_request("filename3", b.host(), 0.0).unwrap();

    relay(&mut a, &mut b, 0.0, |_| true, |_| false);
    let lost_id = format!("chunk-{txn}-4");
    relay(&mut b, &mut a, 0.0, |_| true, |m| m.id == lost_id);

    let ack = a
        .outgoing()
        .into_iter()
        .find(|m| m.role() == Role::Ack)
        .unwrap();
    let Packet::Ack { bitmap } = &ack.packet else {
        panic!("expected Ack");
    };
    assert_eq!(bitmap.to_string(), "[1,1,1,1,0,1,1,1,1,1]");
    assert!(!a.has_file("filename3"));

    relay(&mut a, &mut b, 0.5, |_| true, |_| false);
    let resent = b.outgoing();
    let chunks: Vec<&Message> = resent.iter().filter(|m| m.role() == Role::Chunk).collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].id, lost_id);
    assert_eq!(resent.last().unwrap().role(), Role::Control);
    assert_eq!(b.stats().chunks_regenerated, 1);

    settle(&mut a, &mut b, 0.5);
    assert_eq!(a.file("filename3").unwrap().data(), src.data());
    assert!(!b
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));
}

#[test]
fn unanswered_request_is_retried_three_times_then_dropped() {
    let mut a = node(1);
    let txn = a.create_request("filename3", HostId(2), 0.0).unwrap();
    let key = RetransmitKey::new(Pending::Request, txn);
    let first = a.take_outgoing(&format!("req-{txn}"));
    assert!(first.is_some());

    let mut resent_at = Vec::new();
    for i in 1..=1000u32 {
        a.tick(f64::from(i) * 0.1);
        if a.take_outgoing(&format!("req-{txn}")).is_some() {
            resent_at.push(i);
        }
        if i == 799 {
            assert!(a.registry().contains(&key));
        }
    }
    assert_eq!(resent_at, vec![200, 400, 600]);
    assert!(!a.registry().contains(&key));
    assert_eq!(a.stats().retransmissions, 3);
    assert_eq!(a.stats().abandoned, 1);
}

#[test]
fn unconfirmed_control_is_retried_three_times() {
    let mut a = node(1);
    let mut b = node(2);
    b.place_file(original("filename3", 2, 0.0)).unwrap();
    let txn = a.create_request("filename3", b.host(), 0.0).unwrap();
    relay(&mut a, &mut b, 0.0, |_| true, |_| false);

    let control_id = format!("ctl-{txn}");
    let mut sends = 0;
    for i in 0..=1000u32 {
        if i > 0 {
            b.tick(f64::from(i) * 0.1);
        }
        for m in b.outgoing() {
            b.take_outgoing(&m.id);
            if m.id == control_id {
                sends += 1;
            }
        }
    }
    assert_eq!(sends, 4);
    assert!(!b
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));
}

#[test]
fn relay_serves_onward_and_discards_late_chunk() {
    let mut a = node(1);
    let mut b = node(2);
    let mut c = node(3);
    let src = original("filename5", 2, 0.0);
    b.place_file(src.clone()).unwrap();
    let txn = a.create_request("filename5", b.host(), 0.0).unwrap();

    // A -> C -> B for the Request.
    relay(&mut a, &mut c, 0.1, |_| true, |_| false);
    relay(&mut c, &mut b, 0.2, |m| m.to == HostId(2), |_| false);

    // B's burst reaches C, which reassembles and relays onward.
    let late = b
        .outgoing()
        .into_iter()
        .find(|m| m.role() == Role::Chunk)
        .unwrap();
    relay(&mut b, &mut c, 0.3, |_| true, |_| false);
    assert!(c.has_file("filename5"));
    assert!(c.cache().chunk_set("filename5").is_none());
    assert!(c
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));

    relay(&mut c, &mut a, 0.4, |m| m.to == HostId(1), |_| false);
    assert_eq!(a.file("filename5").unwrap().data(), src.data());

    relay(&mut a, &mut c, 0.5, |_| true, |_| false);
    relay(&mut c, &mut b, 0.5, |_| true, |_| false);
    assert!(!c
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));
    assert!(!b
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));

    // A late duplicate chunk is dropped without recreating the chunk buffer.
    assert_eq!(
        c.receive_message(&late, HostId(2), 0.6),
        Admission::Accepted
    );
    let d = c.on_message_transferred(late, HostId(2), 0.6).unwrap();
    assert_eq!(d, Disposition::Consumed);
    assert!(c.cache().chunk_set("filename5").is_none());
    assert!(c.cache().indexed("filename5").is_none());
    assert_eq!(c.file("filename5").unwrap().data(), src.data());
}

#[test]
fn full_cache_evicts_oldest_before_insert() {
    let small = ProtocolConfig {
        file_buffer_size: 10_000,
        ..config()
    };
    let mut a = FerryCore::new(HostId(1), small).unwrap();
    let mut b = node(2);
    a.place_file(original("filename1", 1, 2.0)).unwrap();
    a.place_file(original("filename2", 1, 1.0)).unwrap();
    b.place_file(original("filename3", 2, 0.0)).unwrap();

    a.create_request("filename3", b.host(), 5.0).unwrap();
    settle(&mut a, &mut b, 5.0);

    assert!(a.has_file("filename3"));
    assert!(a.has_file("filename1"));
    assert!(!a.has_file("filename2"));
    assert_eq!(a.stats().evictions, 1);
    assert!(a.cache().occupancy() <= a.cache().capacity());
}

#[test]
fn partial_acks_after_budget_is_spent_send_nothing() {
    let mut a = node(1);
    let mut b = node(2);
    b.place_file(original("filename3", 2, 0.0)).unwrap();
    let txn = a.create_request("filename3", b.host(), 0.0).unwrap();
    relay(&mut a, &mut b, 0.0, |_| true, |_| false);

    let mut missing_four = Bitmap::new(10);
    for i in (0..10).filter(|&i| i != 4) {
        missing_four.set(i);
    }
    let mut resent = Vec::new();
    for round in 0..4u32 {
        for m in b.outgoing() {
            b.take_outgoing(&m.id);
        }
        let now = f64::from(round + 1);
        let ack = Message::ack(a.host(), b.host(), "filename3", txn, missing_four, 64, now);
        b.on_message_transferred(ack, a.host(), now).unwrap();
        resent.push(b.outgoing().len());
    }

    // One chunk plus the Control per retry, then silence.
    assert_eq!(resent, vec![2, 2, 2, 0]);
    assert!(!b
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));
    assert_eq!(b.stats().chunks_regenerated, 3);
    assert_eq!(b.stats().retransmissions, 3);
    assert_eq!(b.stats().abandoned, 1);
}

#[test]
fn file_that_cannot_be_cached_is_not_confirmed() {
    let tight = ProtocolConfig {
        file_buffer_size: 5000,
        ..config()
    };
    let mut a = FerryCore::new(HostId(1), tight).unwrap();
    let mut b = node(2);
    let mut c = node(3);
    a.place_file(original("filename1", 1, 0.0)).unwrap();
    b.place_file(original("filename3", 2, 0.0)).unwrap();

    // A is busy serving filename1 to C, which pins it in A's full cache.
    c.create_request("filename1", a.host(), 0.0).unwrap();
    relay(&mut c, &mut a, 0.0, |_| true, |_| false);

    let txn = a.create_request("filename3", b.host(), 0.1).unwrap();
    relay(&mut a, &mut b, 0.1, |m| m.to == HostId(2), |_| false);
    relay(&mut b, &mut a, 0.2, |_| true, |_| false);

    assert!(!a.has_file("filename3"));
    assert!(a.has_file("filename1"));
    assert_eq!(a.stats().files_reassembled, 0);
    let ack = a
        .outgoing_for(b.host())
        .into_iter()
        .find(|m| m.role() == Role::Ack)
        .unwrap();
    assert_eq!(ack.packet, Packet::Ack { bitmap: Bitmap::new(10) });

    // B keeps the transfer open and sends everything again.
    relay(&mut a, &mut b, 0.3, |m| m.to == HostId(2), |_| false);
    assert!(b
        .registry()
        .contains(&RetransmitKey::new(Pending::Control, txn)));
    assert_eq!(b.stats().chunks_regenerated, 10);
}
