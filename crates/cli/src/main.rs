use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use companion_link::discovery::{DiscoveryClient, DiscoveryEvent, DiscoveryServer, ServerData};
use companion_link::media::rtp::RtpHeader;
use companion_link::media::sdp::{self, SdpMedia};
use companion_link::protocol::{BinarySender, EventReceiver, EventSender, Protocol};
use companion_link::{
    CodecInfo, FrameKind, NetworkEvent, NetworkServer, PayloadParser, Version,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(
    name = "companion-link",
    about = "Companion app link: peer server, discovery browser and RTP depacketizer"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a network server and announce it through discovery
    Serve {
        /// Port for the reliable (TCP) and unreliable (UDP) channels
        #[arg(long, short, default_value_t = 9000)]
        port: u16,
        /// Product name answered in discovery
        #[arg(long, default_value = "Virtual Camera")]
        product: String,
        /// Instance name announced in discovery
        #[arg(long, default_value = "companion-link")]
        instance: String,
    },
    /// List servers of a product found on the local network
    Discover {
        #[arg(long, default_value = "Virtual Camera")]
        product: String,
        /// Also report servers running on this machine
        #[arg(long)]
        include_local: bool,
        /// Seconds to browse for
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Receive an RTP stream over UDP and log every reconstructed frame
    Depacketize {
        /// Local address to receive RTP on
        #[arg(long, short, default_value = "0.0.0.0:5004")]
        bind: SocketAddr,
        /// SDP file describing the stream; the first media section is used
        #[arg(long, conflicts_with = "codec")]
        sdp: Option<PathBuf>,
        /// Encoding as in `a=rtpmap`, e.g. `H264/90000` or `PCMU/8000/1`
        #[arg(long)]
        codec: Option<String>,
        /// Format parameters as in `a=fmtp`
        #[arg(long)]
        fmtp: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Serve {
            port,
            product,
            instance,
        } => serve(port, &product, &instance),
        Command::Discover {
            product,
            include_local,
            seconds,
        } => discover(&product, include_local, Duration::from_secs(seconds)),
        Command::Depacketize {
            bind,
            sdp,
            codec,
            fmtp,
        } => depacketize(bind, sdp, codec, fmtp),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Flag cleared when the user presses Enter.
fn until_enter() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        flag.store(false, Ordering::SeqCst);
    });
    running
}

fn demo_protocol() -> Result<(Protocol, EventSender, BinarySender<u64>), Box<dyn std::error::Error>> {
    let mut protocol = Protocol::new("companion-link demo", Version::new(0, 1, 0, 0))?;
    let ping = EventSender::new("Ping");
    let uptime = BinarySender::<u64>::new("UptimeSeconds");
    let pong = EventReceiver::new("Pong");
    pong.add_handler(|| tracing::info!("pong received"));
    protocol.add(&ping)?;
    protocol.add(&uptime)?;
    protocol.add(&pong)?;
    Ok((protocol, ping, uptime))
}

fn serve(port: u16, product: &str, instance: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (protocol, ping, uptime) = demo_protocol()?;
    let mut server = NetworkServer::new();
    server.start_server(port)?;

    let data = ServerData::new(product, instance, Uuid::new_v4(), Version::new(0, 1, 0, 0))?;
    let end_points = [SocketAddr::from(([0, 0, 0, 0], port))];
    let mut discovery = DiscoveryServer::new();
    discovery.start(data, &end_points)?;

    println!("serving {product:?} on port {port}, press Enter to stop");
    let running = until_enter();
    let started = Instant::now();
    let mut last_tick = Instant::now();

    while running.load(Ordering::SeqCst) {
        server.update();
        discovery.update();

        while let Some(event) = server.poll_event() {
            tracing::info!(?event, "network event");
            if let NetworkEvent::RemoteConnected(remote) = event {
                if let Err(e) = protocol.set_network(&mut server, remote) {
                    tracing::warn!(remote = %remote.id, error = %e, "failed to bind protocol");
                }
            }
        }

        if last_tick.elapsed() >= Duration::from_secs(1) && server.remote_count() > 0 {
            last_tick = Instant::now();
            // Every connected remote is bound, so this reaches all of them.
            if let Err(e) = ping
                .send()
                .and_then(|()| uptime.send(&started.elapsed().as_secs()))
            {
                tracing::debug!(error = %e, "demo messages not sent");
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    discovery.stop();
    server.stop();
    Ok(())
}

fn discover(product: &str, include_local: bool, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = DiscoveryClient::new();
    client.start(product, include_local)?;
    let deadline = Instant::now() + duration;

    while Instant::now() < deadline {
        client.update();
        while let Some(event) = client.poll_event() {
            match event {
                DiscoveryEvent::ServerFound(info) => println!(
                    "found  {} / {} v{} {} at {:?}",
                    info.server.product_name(),
                    info.server.instance_name(),
                    info.server.version(),
                    info.server.id(),
                    info.end_points
                ),
                DiscoveryEvent::ServerLost(info) => {
                    println!("lost   {} {}", info.server.instance_name(), info.server.id())
                }
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    client.stop();
    Ok(())
}

fn stream_description(
    sdp_path: Option<PathBuf>,
    codec: Option<String>,
    fmtp: Option<String>,
) -> Result<(CodecInfo, u32), Box<dyn std::error::Error>> {
    let media = match (sdp_path, codec) {
        (Some(path), _) => sdp::parse_media(&std::fs::read_to_string(path)?)
            .into_iter()
            .next()
            .ok_or("SDP contains no media section")?,
        (None, Some(codec)) => {
            let mut fields = codec.split('/');
            SdpMedia {
                encoding: fields.next().map(str::to_string),
                clock_rate: fields.next().and_then(|c| c.parse().ok()).unwrap_or(90000),
                channels: fields.next().and_then(|c| c.parse().ok()),
                fmtp,
                ..Default::default()
            }
        }
        (None, None) => return Err("either --sdp or --codec is required".into()),
    };
    Ok((media.codec_info()?, media.rtp_clock_rate()))
}

fn depacketize(
    bind: SocketAddr,
    sdp_path: Option<PathBuf>,
    codec: Option<String>,
    fmtp: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (codec, clock_rate) = stream_description(sdp_path, codec, fmtp)?;
    let mut parser = PayloadParser::from_codec(&codec)?;
    parser.set_frame_handler(|frame| {
        let kind = match frame.kind {
            FrameKind::H264Intra { .. } => "h264 intra",
            FrameKind::H264Predicted => "h264 predicted",
            FrameKind::Jpeg => "jpeg",
            FrameKind::Aac { .. } => "aac",
            FrameKind::G711 { .. } => "g711",
            FrameKind::G726 { .. } => "g726",
            FrameKind::Pcm { .. } => "pcm",
        };
        tracing::info!(kind, size = frame.payload.len(), timestamp = ?frame.timestamp, "frame");
    });

    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;
    println!("receiving {} RTP on {bind}, press Enter to stop", codec.name());

    let running = until_enter();
    let mut buf = vec![0u8; 65_536];
    let mut first_timestamp = None;

    while running.load(Ordering::SeqCst) {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e.into()),
        };
        let (header, payload) = match RtpHeader::parse(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "dropping packet");
                continue;
            }
        };
        let first = *first_timestamp.get_or_insert(header.timestamp);
        let offset = header.time_offset(first, clock_rate);
        if let Err(e) = parser.parse(Some(offset), payload, header.marker) {
            tracing::warn!(error = %e, sequence = header.sequence, "payload rejected, resetting parser");
            parser.reset_state();
        }
    }
    Ok(())
}
