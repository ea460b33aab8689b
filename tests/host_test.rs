//! End-to-end protocol tests: two hosts exchanging datagrams over the
//! in-memory test network.
//!
//! Naming convention: the client (connector) is always the first host
//! handed to the pump helpers and is tagged `'a'` in collected events;
//! the server (acceptor) is second and tagged `'b'`.

mod common;

use std::time::Instant;

use common::{establish, pump_once, pump_until, TestNetwork};
use lanes::{crc32_checksum, Event, Host, HostConfig, Packet, PacketFlags, PeerState};

const SERVER_ADDR: &str = "10.0.0.1:4000";
const CLIENT_ADDR: &str = "10.0.0.2:4001";

fn host_pair(
    network: &TestNetwork,
    client_config: HostConfig,
    server_config: HostConfig,
) -> (Host, Host) {
    let client = Host::with_socket(client_config, network.socket(CLIENT_ADDR)).expect("client");
    let server = Host::with_socket(server_config, network.socket(SERVER_ADDR)).expect("server");
    (client, server)
}

fn server_receives(events: &[(char, Event)]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|(host, event)| match event {
            Event::Receive { packet, .. } if *host == 'b' => Some(packet.data().to_vec()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_loopback_connect() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));

    let peer = client
        .connect(SERVER_ADDR.parse().unwrap(), 2, 0xDEAD_BEEF)
        .expect("connect");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 50, |events| {
        events.iter().filter(|(_, e)| matches!(e, Event::Connect { .. })).count() >= 2
    });

    // The server sees the client's handshake data; the client sees zero.
    assert!(events.iter().any(|(host, event)| {
        *host == 'b' && matches!(event, Event::Connect { data: 0xDEAD_BEEF, .. })
    }));
    assert!(events
        .iter()
        .any(|(host, event)| *host == 'a' && matches!(event, Event::Connect { data: 0, .. })));

    assert_eq!(client.peer(peer).unwrap().state(), PeerState::Connected);
    assert_eq!(client.peer(peer).unwrap().channel_count(), 2);
    assert_eq!(client.connected_peers(), 1);
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn test_reliable_echo() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, server_peer) = establish(&mut client, &mut server, SERVER_ADDR, 2, 0);

    client.send(client_peer, 0, Packet::reliable(&b"hello"[..])).expect("send");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 50, |events| {
        events.iter().any(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. }))
    });
    assert_eq!(server_receives(&events), vec![b"hello".to_vec()]);

    // And back the other way.
    server.send(server_peer, 0, Packet::reliable(&b"world"[..])).expect("send");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 50, |events| {
        events.iter().any(|(host, e)| *host == 'a' && matches!(e, Event::Receive { .. }))
    });

    let received = events
        .iter()
        .find_map(|(host, event)| match event {
            Event::Receive { channel_id, packet, .. } if *host == 'a' => {
                Some((*channel_id, packet.data().to_vec()))
            }
            _ => None,
        })
        .expect("receive on client");
    assert_eq!(received, (0, b"world".to_vec()));
}

#[test]
fn test_fragmented_reliable_roundtrip() {
    let network = TestNetwork::new();
    // A small MTU forces fragmentation of anything interesting.
    let (mut client, mut server) = host_pair(
        &network,
        HostConfig::new(1).mtu(576),
        HostConfig::new(1).mtu(576),
    );
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    client.send(client_peer, 0, Packet::reliable(payload.clone())).expect("send");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 200, |events| {
        events.iter().any(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. }))
    });

    // Exactly one packet, byte-identical to the original.
    assert_eq!(server_receives(&events), vec![payload]);
}

#[test]
fn test_boundary_fragment_sizes() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(
        &network,
        HostConfig::new(1).mtu(576),
        HostConfig::new(1).mtu(576),
    );
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    // 576 minus the 4-byte datagram header and the 24-byte fragment
    // command leaves 548 payload bytes per datagram: one packet exactly
    // at the limit, one just past it.
    let fragment_length = 548usize;
    let exact = vec![0x11u8; fragment_length];
    let split = vec![0x22u8; fragment_length + 1];

    client.send(client_peer, 0, Packet::reliable(exact.clone())).expect("send exact");
    client.send(client_peer, 0, Packet::reliable(split.clone())).expect("send split");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 100, |events| {
        events.iter().filter(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. })).count()
            >= 2
    });

    assert_eq!(server_receives(&events), vec![exact, split]);
}

#[test]
fn test_drop_and_retransmit() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    // Tighten the retransmission floor so the test completes quickly.
    client.timeout(client_peer, 32, 100, 5000).expect("timeout");

    network.drop_next(CLIENT_ADDR, SERVER_ADDR, 1);
    client.send(client_peer, 0, Packet::reliable(&b"hello"[..])).expect("send");

    let started = Instant::now();
    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 3000, |events| {
        events.iter().any(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. }))
    });

    assert_eq!(
        server_receives(&events),
        vec![b"hello".to_vec()],
        "retransmission never delivered the packet"
    );
    assert!(started.elapsed().as_secs() < 5);
}

#[test]
fn test_no_duplicate_delivery_under_datagram_duplication() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(
        &network,
        HostConfig::new(1).mtu(576),
        HostConfig::new(1).mtu(576),
    );
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    // Every datagram arrives twice from here on: plain reliable sends
    // and whole fragment sets must still come through exactly once.
    network.set_duplicate(true);

    client.send(client_peer, 0, Packet::reliable(&b"once"[..])).expect("send");
    let fragmented: Vec<u8> = (0..4000u32).map(|i| (i % 241) as u8).collect();
    client.send(client_peer, 0, Packet::reliable(fragmented.clone())).expect("send");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 200, |events| {
        events.iter().filter(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. })).count()
            >= 2
    });
    // A few extra rounds to surface any late duplicates.
    for _ in 0..20 {
        pump_once(&mut client, &mut server, &mut events);
    }

    assert_eq!(server_receives(&events), vec![b"once".to_vec(), fragmented]);
}

#[test]
fn test_unsequenced_reordered_delivery() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    network.set_duplicate(true);

    let batch = 100u16;
    for i in 0..batch {
        let payload = i.to_be_bytes().to_vec();
        client.send(client_peer, 0, Packet::unsequenced(payload)).expect("send");
        // Flush per packet so each rides its own datagram and the
        // reorder below actually scrambles arrival order.
        client.flush().expect("flush");
    }
    network.reorder_pending(SERVER_ADDR);

    let mut events = Vec::new();
    for _ in 0..100 {
        pump_once(&mut client, &mut server, &mut events);
    }

    let mut received: Vec<u16> = events
        .iter()
        .filter_map(|(host, event)| match event {
            Event::Receive { packet, .. } if *host == 'b' => {
                Some(u16::from_be_bytes([packet.data()[0], packet.data()[1]]))
            }
            _ => None,
        })
        .collect();

    // Each group at most once, nothing that was never sent, and the
    // window spans the whole batch so reordering alone loses nothing.
    let total = received.len();
    received.sort_unstable();
    received.dedup();
    assert_eq!(received.len(), total, "duplicate unsequenced delivery");
    assert!(received.iter().all(|value| *value < batch));
    assert_eq!(total, batch as usize);
}

#[test]
fn test_timeout_disconnect() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    client.timeout(client_peer, 4, 100, 400).expect("timeout");

    // The server goes silent; reliable traffic can never be
    // acknowledged again.
    client.send(client_peer, 0, Packet::reliable(&b"void"[..])).expect("send");

    let started = Instant::now();
    let mut disconnected_at = None;
    while started.elapsed().as_secs() < 30 {
        if let Some(Event::Disconnect { peer, .. }) = client.service(1).expect("service") {
            assert_eq!(peer, client_peer);
            disconnected_at = Some(started.elapsed());
            break;
        }
    }

    let elapsed = disconnected_at.expect("timeout disconnect event");
    assert!(elapsed.as_millis() >= 100, "disconnected too early: {elapsed:?}");
    assert!(elapsed.as_millis() < 10_000, "disconnected too late: {elapsed:?}");
    assert_eq!(client.peer(client_peer).unwrap().state(), PeerState::Disconnected);
}

#[test]
fn test_graceful_disconnect_carries_data() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, server_peer) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    client.disconnect(client_peer, 42).expect("disconnect");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 100, |events| {
        events.iter().filter(|(_, e)| matches!(e, Event::Disconnect { .. })).count() >= 2
    });

    // The notified side sees the disconnect data; the initiator's own
    // event carries none.
    assert!(events.iter().any(|(host, event)| {
        *host == 'b'
            && matches!(event, Event::Disconnect { peer, data: 42 } if *peer == server_peer)
    }));
    assert!(events.iter().any(|(host, event)| {
        *host == 'a'
            && matches!(event, Event::Disconnect { peer, data: 0 } if *peer == client_peer)
    }));

    assert_eq!(client.connected_peers(), 0);
    assert_eq!(server.connected_peers(), 0);
}

#[test]
fn test_channel_ordering_is_independent() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 2, 0);

    client.send(client_peer, 0, Packet::reliable(&b"c0-first"[..])).unwrap();
    client.send(client_peer, 1, Packet::reliable(&b"c1-first"[..])).unwrap();
    client.send(client_peer, 0, Packet::reliable(&b"c0-second"[..])).unwrap();

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 100, |events| {
        events.iter().filter(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. })).count()
            >= 3
    });

    let per_channel = |channel: u8| -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|(host, event)| match event {
                Event::Receive { channel_id, packet, .. }
                    if *host == 'b' && *channel_id == channel =>
                {
                    Some(packet.data().to_vec())
                }
                _ => None,
            })
            .collect()
    };

    assert_eq!(per_channel(0), vec![b"c0-first".to_vec(), b"c0-second".to_vec()]);
    assert_eq!(per_channel(1), vec![b"c1-first".to_vec()]);
}

#[test]
fn test_unreliable_and_unsequenced_modes() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    client.send(client_peer, 0, Packet::unreliable(&b"u"[..])).unwrap();
    client.send(client_peer, 0, Packet::unsequenced(&b"s"[..])).unwrap();

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 100, |events| {
        events.iter().filter(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. })).count()
            >= 2
    });

    let mut received = server_receives(&events);
    received.sort();
    assert_eq!(received, vec![b"s".to_vec(), b"u".to_vec()]);
}

#[test]
fn test_broadcast_reaches_all_peers() {
    let network = TestNetwork::new();
    let server_addr = "10.0.0.9:5000";
    let mut server =
        Host::with_socket(HostConfig::new(4), network.socket(server_addr)).expect("server");
    let mut c1 = Host::with_socket(HostConfig::new(1), network.socket("10.0.0.10:5001")).unwrap();
    let mut c2 = Host::with_socket(HostConfig::new(1), network.socket("10.0.0.11:5002")).unwrap();

    c1.connect(server_addr.parse().unwrap(), 1, 0).expect("connect c1");
    c2.connect(server_addr.parse().unwrap(), 1, 0).expect("connect c2");

    for _ in 0..50 {
        while c1.service(0).expect("service c1").is_some() {}
        while c2.service(0).expect("service c2").is_some() {}
        while server.service(0).expect("service server").is_some() {}
        if server.connected_peers() == 2 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(server.connected_peers(), 2);

    server.broadcast(0, Packet::reliable(&b"fanout"[..]));

    let mut got = (false, false);
    for _ in 0..100 {
        while server.service(0).unwrap().is_some() {}
        if let Some(Event::Receive { packet, .. }) = c1.service(0).unwrap() {
            assert_eq!(packet.data(), b"fanout");
            got.0 = true;
        }
        if let Some(Event::Receive { packet, .. }) = c2.service(0).unwrap() {
            assert_eq!(packet.data(), b"fanout");
            got.1 = true;
        }
        if got == (true, true) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(got, (true, true));
}

#[test]
fn test_throttle_configure_propagates() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, server_peer) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    client.throttle_configure(client_peer, 3000, 4, 1).expect("throttle configure");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 20, |_| false);

    let remote = server.peer(server_peer).expect("peer");
    assert_eq!(remote.packet_throttle_interval(), 3000);
    assert_eq!(remote.packet_throttle_acceleration(), 4);
    assert_eq!(remote.packet_throttle_deceleration(), 1);
}

#[test]
fn test_checksummed_traffic() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    client.checksum(Some(crc32_checksum()));
    server.checksum(Some(crc32_checksum()));

    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    client.send(client_peer, 0, Packet::reliable(&b"verified"[..])).expect("send");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 100, |events| {
        events.iter().any(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. }))
    });

    assert_eq!(server_receives(&events), vec![b"verified".to_vec()]);
}

#[test]
fn test_flush_transmits_without_service() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(&network, HostConfig::new(1), HostConfig::new(1));
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    client.send(client_peer, 0, Packet::reliable(&b"flushed"[..])).expect("send");
    client.flush().expect("flush");

    // Only the server is serviced; the datagram is already on the wire.
    let mut received = false;
    for _ in 0..20 {
        if let Some(Event::Receive { packet, .. }) = server.service(1).expect("service") {
            assert_eq!(packet.data(), b"flushed");
            received = true;
            break;
        }
    }
    assert!(received);
}

#[test]
fn test_send_rejects_bad_arguments() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(
        &network,
        HostConfig::new(1).maximum_packet_size(1024),
        HostConfig::new(1),
    );
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    // Oversized packet and out-of-range channel are both rejected.
    assert!(client.send(client_peer, 0, Packet::reliable(vec![0u8; 2048])).is_err());
    assert!(client.send(client_peer, 9, Packet::reliable(&b"x"[..])).is_err());
}

#[test]
fn test_unreliable_fragments_reassemble() {
    let network = TestNetwork::new();
    let (mut client, mut server) = host_pair(
        &network,
        HostConfig::new(1).mtu(576),
        HostConfig::new(1).mtu(576),
    );
    let (client_peer, _) = establish(&mut client, &mut server, SERVER_ADDR, 1, 0);

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 97) as u8).collect();
    client
        .send(
            client_peer,
            0,
            Packet::new(payload.clone(), PacketFlags::UNRELIABLE_FRAGMENT),
        )
        .expect("send");

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, 100, |events| {
        events.iter().any(|(host, e)| *host == 'b' && matches!(e, Event::Receive { .. }))
    });

    assert_eq!(server_receives(&events), vec![payload]);
}
