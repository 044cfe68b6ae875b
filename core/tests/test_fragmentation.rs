// Fragmentation and reassembly across the public API

use meshwire_core::protocol::{FragmentAssembler, FragmentHeader, FRAGMENT_CHUNK_SIZE, FRAGMENT_THRESHOLD};
use meshwire_core::{IdentityKeys, Packet, PacketType, PeerKey};
use proptest::prelude::*;
use std::time::Duration;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn sender() -> PeerKey {
    IdentityKeys::generate().public_key()
}

/// Feed packets in the given order; collect every completed payload
fn feed(assembler: &mut FragmentAssembler, packets: &[Packet], order: &[usize]) -> Vec<Vec<u8>> {
    order
        .iter()
        .filter_map(|&i| assembler.process_fragment(&packets[i]))
        .collect()
}

#[test]
fn test_size_matrix_delivers_exactly_once() {
    let from = sender();
    for len in [0usize, 499, 500, 501, 900, 901] {
        let data = payload(len);
        let mut assembler = FragmentAssembler::new();
        let expect_fragmented = len > FRAGMENT_THRESHOLD;
        assert_eq!(assembler.needs_fragmentation(&data), expect_fragmented, "len {len}");

        let packets = assembler.fragment(&data, from, None, 3).unwrap();
        let expected_count = len.div_ceil(FRAGMENT_CHUNK_SIZE).max(1);
        assert_eq!(packets.len(), expected_count, "len {len}");

        // Every fragment twice: the duplicate must never yield a second copy
        let order: Vec<usize> = (0..packets.len()).chain(0..packets.len()).collect();
        let delivered = feed(&mut assembler, &packets, &order);
        assert_eq!(delivered, vec![data], "len {len}");
        assert_eq!(assembler.active_sessions(), 0);
    }
}

#[test]
fn test_fragment_boundaries() {
    let from = sender();
    let assembler = FragmentAssembler::new();

    let packets = assembler.fragment(&payload(901), from, None, 7).unwrap();
    let types: Vec<PacketType> = packets.iter().map(|p| p.packet_type).collect();
    assert_eq!(
        types,
        vec![
            PacketType::FragmentStart,
            PacketType::FragmentContinue,
            PacketType::FragmentEnd
        ]
    );

    let chunk_lens: Vec<usize> = packets
        .iter()
        .map(|p| p.payload.len() - FragmentHeader::HEADER_SIZE)
        .collect();
    assert_eq!(chunk_lens, vec![450, 450, 1]);

    let ids: Vec<[u8; 16]> = packets
        .iter()
        .map(|p| FragmentHeader::from_bytes(&p.payload).unwrap().message_id)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    for (index, packet) in packets.iter().enumerate() {
        let header = FragmentHeader::from_bytes(&packet.payload).unwrap();
        assert_eq!(header.index as usize, index);
        assert_eq!(header.total, 3);
        assert_eq!(header.total_size, 901);
        assert!(packet.is_broadcast());
        assert_eq!(packet.ttl(), 7);
    }
}

#[test]
fn test_interleaved_messages_from_two_senders() {
    let (alice, bob) = (sender(), sender());
    let mut assembler = FragmentAssembler::new();
    let a = payload(1_400);
    let b: Vec<u8> = payload(2_000).into_iter().rev().collect();

    let from_alice = assembler.fragment(&a, alice, None, 3).unwrap();
    let from_bob = assembler.fragment(&b, bob, None, 3).unwrap();

    let mut delivered = Vec::new();
    let longest = from_alice.len().max(from_bob.len());
    for i in (0..longest).rev() {
        for packets in [&from_alice, &from_bob] {
            if let Some(packet) = packets.get(i) {
                delivered.extend(assembler.process_fragment(packet));
            }
        }
    }

    assert_eq!(delivered.len(), 2);
    assert!(delivered.contains(&a));
    assert!(delivered.contains(&b));
}

#[test]
fn test_non_fragment_packets_are_ignored() {
    let mut assembler = FragmentAssembler::new();
    let message = Packet::new(PacketType::Message, 3, sender(), None, b"hi".to_vec()).unwrap();
    assert!(assembler.process_fragment(&message).is_none());
    assert_eq!(assembler.active_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_session_expires_and_late_fragment_is_dropped() {
    let from = sender();
    let mut assembler =
        FragmentAssembler::with_limits(FRAGMENT_THRESHOLD, FRAGMENT_CHUNK_SIZE, Duration::from_secs(30))
            .unwrap();
    let packets = assembler.fragment(&payload(1_000), from, None, 3).unwrap();

    assert!(assembler.process_fragment(&packets[0]).is_none());
    assert!(assembler.process_fragment(&packets[1]).is_none());

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(assembler.cleanup_expired().is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let expired = assembler.cleanup_expired();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].sender, from);
    assert_eq!(expired[0].received, 2);
    assert_eq!(expired[0].total, 3);
    assert_eq!(assembler.active_sessions(), 0);

    // The missing tail shows up too late
    assert!(assembler.process_fragment(&packets[2]).is_none());
    assert_eq!(assembler.active_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_activity_extends_session_lifetime() {
    let mut assembler = FragmentAssembler::new();
    let data = payload(1_500);
    let packets = assembler.fragment(&data, sender(), None, 3).unwrap();
    assert_eq!(packets.len(), 4);

    for packet in &packets[..3] {
        assert!(assembler.process_fragment(packet).is_none());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(assembler.cleanup_expired().is_empty());
    }
    assert_eq!(assembler.process_fragment(&packets[3]), Some(data));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_arrival_order_reassembles(
        (data, order) in (FRAGMENT_THRESHOLD + 1..6_000usize).prop_flat_map(|len| {
            let count = len.div_ceil(FRAGMENT_CHUNK_SIZE);
            (
                proptest::collection::vec(any::<u8>(), len),
                Just((0..count).collect::<Vec<usize>>()).prop_shuffle(),
            )
        })
    ) {
        let mut assembler = FragmentAssembler::new();
        let packets = assembler.fragment(&data, sender(), None, 3).unwrap();
        prop_assert_eq!(packets.len(), order.len());

        let (last, head) = order.split_last().unwrap();
        for &i in head {
            prop_assert!(assembler.process_fragment(&packets[i]).is_none());
        }
        prop_assert_eq!(assembler.process_fragment(&packets[*last]), Some(data));

        for packet in &packets {
            prop_assert!(assembler.process_fragment(packet).is_none());
        }
    }

    #[test]
    fn prop_strict_subset_never_completes(
        (len, skip) in (FRAGMENT_THRESHOLD + 1..6_000usize).prop_flat_map(|len| {
            let count = len.div_ceil(FRAGMENT_CHUNK_SIZE);
            (Just(len), 0..count)
        })
    ) {
        let mut assembler = FragmentAssembler::new();
        let packets = assembler.fragment(&payload(len), sender(), None, 3).unwrap();

        for (i, packet) in packets.iter().enumerate() {
            if i == skip {
                continue;
            }
            prop_assert!(assembler.process_fragment(packet).is_none());
        }
        prop_assert_eq!(assembler.active_sessions(), 1);
    }
}
