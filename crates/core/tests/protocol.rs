//! Typed messages between a bound server protocol and its inverse on a client.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{connect, run_until};
use companion_link::protocol::{
    BinarySender, DataOptions, EventReceiver, EventSender, FilterMode, PixelFormat, Protocol,
    TextureData, TextureSender,
};
use companion_link::{ChannelType, LinkError, NetworkClient, NetworkServer, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CameraPose {
    position: [f32; 3],
    rotation: [f32; 4],
    fov: f32,
}

struct ServerSide {
    protocol: Protocol,
    started: EventSender,
    pose: BinarySender<CameraPose>,
    preview: TextureSender,
    ack: EventReceiver,
}

fn server_protocol() -> ServerSide {
    let mut protocol = Protocol::new("Camera Link", Version::new(1, 2, 0, 0)).unwrap();
    let started = EventSender::new("Started");
    let pose = BinarySender::<CameraPose>::with_options(
        "Pose",
        ChannelType::UnreliableUnordered,
        DataOptions {
            only_send_changed: false,
        },
    );
    let preview = TextureSender::new("Preview");
    let ack = EventReceiver::new("Ack");
    protocol.add(&started).unwrap();
    protocol.add(&pose).unwrap();
    protocol.add(&preview).unwrap();
    protocol.add(&ack).unwrap();
    ServerSide {
        protocol,
        started,
        pose,
        preview,
        ack,
    }
}

/// The client learns the protocol from its serialized form.
fn client_protocol(server: &Protocol) -> Protocol {
    let mut bytes = Vec::new();
    server.serialize(&mut bytes).unwrap();
    Protocol::deserialize(&mut bytes.as_slice())
        .unwrap()
        .create_inverse()
}

fn texture() -> TextureData {
    TextureData {
        width: 8,
        height: 4,
        format: PixelFormat::Rgba8Unorm,
        mip_count: 2,
        filter: FilterMode::Point,
        pixels: common::random_bytes(8 * 4 * 4 + 4 * 2 * 4),
        metadata: "preview".into(),
    }
}

#[test]
fn typed_messages_reach_the_inverse_protocol() {
    let side = server_protocol();
    let mirror = client_protocol(&side.protocol);
    assert!(mirror.is_read_only());
    assert_eq!(mirror.name(), "Camera Link");
    assert_eq!(mirror.len(), 4);

    let events = Arc::new(AtomicUsize::new(0));
    let poses = Arc::new(Mutex::new(Vec::new()));
    let textures = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        mirror
            .get_event_receiver("Started")
            .unwrap()
            .add_handler(move || {
                events.fetch_add(1, Ordering::SeqCst);
            });
        let poses = poses.clone();
        mirror
            .get_data_receiver::<CameraPose>("Pose")
            .unwrap()
            .add_handler(move |pose| poses.lock().push(pose));
        let textures = textures.clone();
        mirror
            .get_texture_receiver("Preview")
            .unwrap()
            .add_handler(move |t| textures.lock().push(t));
    }
    let acks = Arc::new(AtomicUsize::new(0));
    {
        let acks = acks.clone();
        side.ack.add_handler(move || {
            acks.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(matches!(side.started.send(), Err(LinkError::NotBound(_))));

    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (on_server, on_client) = connect(&mut server, &mut client);
    side.protocol.set_network(&mut server, on_server).unwrap();
    side.protocol.set_network(&mut server, on_server).unwrap();
    mirror.set_network(&mut client, on_client).unwrap();

    let pose = CameraPose {
        position: [0.0, 1.5, -2.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
        fov: 60.0,
    };
    let preview = texture();
    side.started.send().unwrap();
    side.pose.send(&pose).unwrap();
    side.preview.send(&preview).unwrap();
    mirror.get_event_sender("Ack").unwrap().send().unwrap();

    assert!(run_until(|| {
        server.update();
        client.update();
        events.load(Ordering::SeqCst) == 1
            && poses.lock().len() == 1
            && textures.lock().len() == 1
            && acks.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(poses.lock()[0], pose);
    assert_eq!(textures.lock()[0], preview);
}

#[test]
fn unchanged_data_is_not_resent() {
    let mut protocol = Protocol::new("Counter", Version::new(1, 0, 0, 0)).unwrap();
    let value = BinarySender::<u32>::new("Value");
    protocol.add(&value).unwrap();
    let mirror = client_protocol(&protocol);

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        mirror
            .get_data_receiver::<u32>("Value")
            .unwrap()
            .add_handler(move |v| received.lock().push(v));
    }

    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (on_server, on_client) = connect(&mut server, &mut client);
    protocol.set_network(&mut server, on_server).unwrap();
    mirror.set_network(&mut client, on_client).unwrap();

    for v in [1, 1, 1, 2, 2, 3] {
        value.send(&v).unwrap();
    }
    assert!(run_until(|| {
        server.update();
        client.update();
        received.lock().len() >= 3
    }));
    common::run_for(std::time::Duration::from_millis(100), || {
        server.update();
        client.update();
    });
    assert_eq!(*received.lock(), vec![1, 2, 3]);
}

#[test]
fn protocol_binds_only_once_per_remote() {
    let side = server_protocol();
    let other = server_protocol();

    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();
    let mut client = NetworkClient::new();
    let (on_server, _) = connect(&mut server, &mut client);

    side.protocol.set_network(&mut server, on_server).unwrap();
    assert!(matches!(
        other.protocol.set_network(&mut server, on_server),
        Err(LinkError::HandlerConflict(id)) if id == on_server.id
    ));
}

#[test]
fn one_protocol_serves_every_bound_remote() {
    let side = server_protocol();
    let mut server = NetworkServer::new();
    server.start_server(0).unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = NetworkClient::new();
        let (on_server, on_client) = connect(&mut server, &mut client);
        side.protocol.set_network(&mut server, on_server).unwrap();

        let mirror = client_protocol(&side.protocol);
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        mirror
            .get_event_receiver("Started")
            .unwrap()
            .add_handler(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        mirror.set_network(&mut client, on_client).unwrap();
        mirror.get_event_sender("Ack").unwrap().send().unwrap();
        clients.push((client, mirror, started));
    }

    let acks = Arc::new(AtomicUsize::new(0));
    {
        let acks = acks.clone();
        side.ack.add_handler(move || {
            acks.fetch_add(1, Ordering::SeqCst);
        });
    }

    side.started.send().unwrap();
    assert!(run_until(|| {
        server.update();
        for (client, _, _) in clients.iter_mut() {
            client.update();
        }
        acks.load(Ordering::SeqCst) == 2
            && clients
                .iter()
                .all(|(_, _, started)| started.load(Ordering::SeqCst) == 1)
    }));

    // The first client leaves; the second keeps receiving.
    let (mut gone, _, _) = clients.remove(0);
    gone.stop();
    assert!(run_until(|| {
        server.update();
        server.remote_count() == 1
    }));
    side.started.send().unwrap();
    let (client, _, started) = &mut clients[0];
    assert!(run_until(|| {
        server.update();
        client.update();
        started.load(Ordering::SeqCst) == 2
    }));

    client.stop();
    assert!(run_until(|| {
        server.update();
        server.remote_count() == 0
    }));
    assert!(matches!(side.started.send(), Err(LinkError::NotBound(_))));
}
