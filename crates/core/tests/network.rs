//! Server and client over real localhost sockets.

mod common;

use std::net::UdpSocket;
use std::time::Duration;

use common::{collector, connect, free_port, random_bytes, run_for, run_until};
use companion_link::transport::udp::MAX_UNRELIABLE_PAYLOAD;
use companion_link::{
    ChannelType, DisconnectStatus, LinkError, Message, Network, NetworkClient, NetworkConfig,
    NetworkEvent, NetworkServer,
};

fn drain_server(server: &mut NetworkServer) -> Vec<NetworkEvent> {
    std::iter::from_fn(|| server.poll_event()).collect()
}

fn drain_client(client: &mut NetworkClient) -> Vec<NetworkEvent> {
    std::iter::from_fn(|| client.poll_event()).collect()
}

#[test]
fn connect_then_stop_client_gracefully() {
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();

    let (client_remote, server_remote) = connect(&mut server, &mut client);
    assert_eq!(client_remote.id, client.id());
    assert_eq!(server_remote.id, server.id());
    assert_eq!(server_remote.addr.port(), server.port().unwrap());
    assert!(!client.is_connecting());

    assert_eq!(
        drain_server(&mut server),
        vec![NetworkEvent::Started, NetworkEvent::RemoteConnected(client_remote)]
    );
    assert_eq!(
        drain_client(&mut client),
        vec![NetworkEvent::Started, NetworkEvent::RemoteConnected(server_remote)]
    );

    client.stop();
    assert_eq!(
        drain_client(&mut client),
        vec![
            NetworkEvent::RemoteDisconnected {
                remote: server_remote,
                status: DisconnectStatus::Graceful
            },
            NetworkEvent::Stopped
        ]
    );

    assert!(run_until(|| {
        server.update();
        server.remote_count() == 0
    }));
    assert_eq!(
        drain_server(&mut server),
        vec![NetworkEvent::RemoteDisconnected {
            remote: client_remote,
            status: DisconnectStatus::Graceful
        }]
    );
}

#[test]
fn client_started_before_server_connects_once_it_is_up() {
    let port = free_port();
    let mut client = NetworkClient::new();
    client.connect_to_server("127.0.0.1", port, 0).unwrap();
    run_for(Duration::from_millis(100), || client.update());
    assert!(client.is_connecting());
    assert_eq!(client.remote_count(), 0);

    let mut server = NetworkServer::new();
    server.start_server(port).unwrap();
    assert!(run_until(|| {
        server.update();
        client.update();
        client.remote_count() == 1 && server.remote_count() == 1
    }));
    assert!(!client.is_connecting());
}

#[test]
fn client_reconnects_after_server_restart() {
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let port = server.port().unwrap();
    let mut client = NetworkClient::new();
    let (_, server_remote) = connect(&mut server, &mut client);
    drain_client(&mut client);

    server.stop();
    assert!(run_until(|| {
        client.update();
        client.remote_count() == 0
    }));
    assert_eq!(
        drain_client(&mut client),
        vec![NetworkEvent::RemoteDisconnected {
            remote: server_remote,
            status: DisconnectStatus::Graceful
        }]
    );
    assert!(client.is_connecting());

    server.start_server(port).unwrap();
    assert!(run_until(|| {
        server.update();
        client.update();
        client.remote_count() == 1
    }));
    let reconnected = client.server().unwrap();
    assert_eq!(reconnected.id, server.id());
    assert_eq!(
        drain_client(&mut client),
        vec![NetworkEvent::RemoteConnected(reconnected)]
    );
}

#[test]
fn aborted_client_is_reported_as_error() {
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (client_remote, _) = connect(&mut server, &mut client);
    drain_server(&mut server);

    client.abort();
    assert!(run_until(|| {
        server.update();
        server.remote_count() == 0
    }));
    assert_eq!(
        drain_server(&mut server),
        vec![NetworkEvent::RemoteDisconnected {
            remote: client_remote,
            status: DisconnectStatus::Error
        }]
    );
}

#[test]
fn silent_client_times_out() {
    let mut server = NetworkServer::with_config(NetworkConfig {
        timeout: Duration::from_millis(300),
        ..Default::default()
    });
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (client_remote, _) = connect(&mut server, &mut client);
    drain_server(&mut server);

    // The client stops pumping, so no heartbeat reaches the server.
    assert!(run_until(|| {
        server.update();
        server.remote_count() == 0
    }));
    assert_eq!(
        drain_server(&mut server),
        vec![NetworkEvent::RemoteDisconnected {
            remote: client_remote,
            status: DisconnectStatus::Timeout
        }]
    );
}

#[test]
fn heartbeats_keep_an_idle_connection_alive() {
    let config = NetworkConfig {
        heartbeat_interval: Duration::from_millis(50),
        timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let mut server = NetworkServer::with_config(config.clone());
    server.start_server(0).unwrap();
    let mut client = NetworkClient::with_config(config);
    connect(&mut server, &mut client);

    run_for(Duration::from_millis(800), || {
        server.update();
        client.update();
    });
    assert_eq!(server.remote_count(), 1);
    assert_eq!(client.remote_count(), 1);
}

#[test]
fn server_disconnects_one_client() {
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (client_remote, server_remote) = connect(&mut server, &mut client);
    drain_server(&mut server);
    drain_client(&mut client);

    server.disconnect(client_remote).unwrap();
    assert_eq!(
        drain_server(&mut server),
        vec![NetworkEvent::RemoteDisconnected {
            remote: client_remote,
            status: DisconnectStatus::Graceful
        }]
    );
    assert!(matches!(
        server.send_message(Message::new(client_remote, ChannelType::ReliableOrdered, vec![1])),
        Err(LinkError::InvalidRemote(_))
    ));

    assert!(run_until(|| {
        client.update();
        client.remote_count() == 0
    }));
    assert_eq!(
        drain_client(&mut client),
        vec![NetworkEvent::RemoteDisconnected {
            remote: server_remote,
            status: DisconnectStatus::Graceful
        }]
    );
    assert!(client.is_connecting());
}

#[test]
fn messages_flow_both_ways_on_both_channels() {
    const CLIENTS: usize = 3;
    let reliable_sizes = [1, 17, 1_000, 70_000, 1_000_000];
    let unreliable_sizes = [1, 512, 1_200];

    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = NetworkClient::new();
        let (on_server, on_client) = connect(&mut server, &mut client);

        let (handler, server_inbox) = collector();
        assert!(server.register_message_handler(on_server, handler).unwrap());
        let (handler, client_inbox) = collector();
        assert!(client.register_message_handler(on_client, handler).unwrap());

        clients.push((client, on_server, on_client, server_inbox, client_inbox));
    }

    let mut expected = Vec::new();
    for (client, on_server, on_client, _, _) in &clients {
        let down: Vec<_> = reliable_sizes.iter().map(|&n| random_bytes(n)).collect();
        let up: Vec<_> = reliable_sizes.iter().map(|&n| random_bytes(n)).collect();
        let down_datagrams: Vec<_> = unreliable_sizes.iter().map(|&n| random_bytes(n)).collect();
        let up_datagrams: Vec<_> = unreliable_sizes.iter().map(|&n| random_bytes(n)).collect();

        for data in &down {
            server
                .send_message(Message::new(*on_server, ChannelType::ReliableOrdered, data.clone()))
                .unwrap();
        }
        for data in &down_datagrams {
            server
                .send_message(Message::new(*on_server, ChannelType::UnreliableUnordered, data.clone()))
                .unwrap();
        }
        for data in &up {
            client
                .send_message(Message::new(*on_client, ChannelType::ReliableOrdered, data.clone()))
                .unwrap();
        }
        for data in &up_datagrams {
            client
                .send_message(Message::new(*on_client, ChannelType::UnreliableUnordered, data.clone()))
                .unwrap();
        }
        expected.push((down, up, down_datagrams, up_datagrams));
    }

    let per_direction = reliable_sizes.len() + unreliable_sizes.len();
    assert!(run_until(|| {
        server.update();
        for (client, ..) in clients.iter_mut() {
            client.update();
        }
        clients.iter().all(|(_, _, _, server_inbox, client_inbox)| {
            server_inbox.lock().len() == per_direction && client_inbox.lock().len() == per_direction
        })
    }));

    let split = |messages: &[Message], channel: ChannelType| -> Vec<Vec<u8>> {
        messages
            .iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.data.clone())
            .collect()
    };
    for ((_, on_server, on_client, server_inbox, client_inbox), (down, up, down_dg, up_dg)) in
        clients.iter().zip(expected)
    {
        let at_server = server_inbox.lock();
        let at_client = client_inbox.lock();
        assert!(at_server.iter().all(|m| m.remote == *on_server));
        assert!(at_client.iter().all(|m| m.remote == *on_client));

        assert_eq!(split(&at_client, ChannelType::ReliableOrdered), down);
        assert_eq!(split(&at_server, ChannelType::ReliableOrdered), up);

        let mut got = split(&at_client, ChannelType::UnreliableUnordered);
        let mut want = down_dg;
        got.sort();
        want.sort();
        assert_eq!(got, want);

        let mut got = split(&at_server, ChannelType::UnreliableUnordered);
        let mut want = up_dg;
        got.sort();
        want.sort();
        assert_eq!(got, want);
    }
}

#[test]
fn messages_wait_for_a_handler() {
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (on_server, on_client) = connect(&mut server, &mut client);

    let sent: Vec<_> = (0..10).map(|i| random_bytes(100 + i)).collect();
    for data in &sent {
        client
            .send_message(Message::new(on_client, ChannelType::ReliableOrdered, data.clone()))
            .unwrap();
    }
    run_for(Duration::from_millis(200), || {
        client.update();
        server.update();
    });

    let (handler, inbox) = collector();
    assert!(inbox.lock().is_empty());
    assert!(server.register_message_handler(on_server, handler.clone()).unwrap());
    assert!(server.register_message_handler(on_server, handler).unwrap());
    let (other, _) = collector();
    assert!(!server.register_message_handler(on_server, other).unwrap());

    assert!(run_until(|| {
        server.update();
        inbox.lock().len() == sent.len()
    }));
    let received: Vec<_> = inbox.lock().iter().map(|m| m.data.clone()).collect();
    assert_eq!(received, sent);

    assert!(server.deregister_message_handler(on_server).unwrap());
    assert!(server.deregister_message_handler(on_server).unwrap());
}

#[test]
fn unhandled_messages_are_capped() {
    let mut server = NetworkServer::with_config(NetworkConfig {
        max_pending_messages: 8,
        ..Default::default()
    });
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (on_server, on_client) = connect(&mut server, &mut client);

    let sent: Vec<Vec<u8>> = (0u32..50).map(|i| i.to_be_bytes().to_vec()).collect();
    for data in &sent {
        client
            .send_message(Message::new(on_client, ChannelType::ReliableOrdered, data.clone()))
            .unwrap();
    }
    run_for(Duration::from_millis(300), || {
        client.update();
        server.update();
    });

    let (handler, inbox) = collector();
    server.register_message_handler(on_server, handler).unwrap();
    assert!(run_until(|| {
        server.update();
        inbox.lock().len() == 8
    }));
    run_for(Duration::from_millis(100), || server.update());
    let received: Vec<_> = inbox.lock().iter().map(|m| m.data.clone()).collect();
    assert_eq!(received, sent[42..]);

    // Once a handler is registered nothing is dropped.
    for data in &sent {
        client
            .send_message(Message::new(on_client, ChannelType::ReliableOrdered, data.clone()))
            .unwrap();
    }
    assert!(run_until(|| {
        client.update();
        server.update();
        inbox.lock().len() == 8 + sent.len()
    }));
}

#[test]
fn datagrams_from_another_address_are_dropped() {
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (on_server, on_client) = connect(&mut server, &mut client);
    let (handler, inbox) = collector();
    server.register_message_handler(on_server, handler).unwrap();

    // A datagram header carrying the client's id, sent from another socket.
    let mut forged = vec![0xC1];
    forged.extend_from_slice(client.id().as_bytes());
    forged.extend_from_slice(b"forged");
    let intruder = UdpSocket::bind("127.0.0.1:0").unwrap();
    intruder
        .send_to(&forged, ("127.0.0.1", server.port().unwrap()))
        .unwrap();

    client
        .send_message(Message::new(
            on_client,
            ChannelType::UnreliableUnordered,
            b"genuine".to_vec(),
        ))
        .unwrap();
    assert!(run_until(|| {
        client.update();
        server.update();
        !inbox.lock().is_empty()
    }));
    run_for(Duration::from_millis(200), || {
        client.update();
        server.update();
    });
    let received: Vec<_> = inbox.lock().iter().map(|m| m.data.clone()).collect();
    assert_eq!(received, vec![b"genuine".to_vec()]);
}

#[test]
fn oversized_and_misaddressed_messages_are_rejected() {
    let mut server = NetworkServer::new();
    let mut client = NetworkClient::new();
    let sender = server.sender();

    let nobody = companion_link::Remote {
        id: uuid::Uuid::new_v4(),
        addr: "127.0.0.1:1".parse().unwrap(),
    };
    assert!(matches!(
        sender.send(Message::new(nobody, ChannelType::ReliableOrdered, vec![])),
        Err(LinkError::NotRunning)
    ));

    server.start_server(0).unwrap();
    let (on_server, _) = connect(&mut server, &mut client);
    assert!(sender.is_connected(&on_server));
    assert!(matches!(
        sender.send(Message::new(nobody, ChannelType::ReliableOrdered, vec![])),
        Err(LinkError::InvalidRemote(_))
    ));
    assert!(matches!(
        sender.send(Message::new(
            on_server,
            ChannelType::UnreliableUnordered,
            vec![0; MAX_UNRELIABLE_PAYLOAD + 1]
        )),
        Err(LinkError::MessageTooLarge { .. })
    ));
    sender
        .send(Message::new(
            on_server,
            ChannelType::UnreliableUnordered,
            vec![0; MAX_UNRELIABLE_PAYLOAD],
        ))
        .unwrap();
}
