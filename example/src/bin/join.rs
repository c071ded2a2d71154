use anyhow::Result;
use clap::Parser;
use room_mesh::media::RtpMediaProvider;
use room_mesh::membership::HttpMembership;
use room_mesh::signaling::WsSignaling;
use room_mesh::{
    generate_peer_id, Controller, EmittedEvents, InitArgs, MediaKind, MeshConfig,
    RtcTransportFactory,
};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// room to join
    room: String,
    /// display name
    #[arg(short, long, default_value = "rust")]
    name: String,
    /// http base of the relay site, used for membership
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    site: String,
    /// websocket base of the relay
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    relay: String,
    /// JSON file overriding MeshConfig defaults
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
    /// join without a camera track
    #[arg(long)]
    no_camera: bool,
    #[arg(long, default_value = "info")]
    log: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, cli.log)
        .init();

    let config = match &cli.config {
        Some(path) => MeshConfig::from_json_file(path)?,
        None => MeshConfig::default(),
    };

    let mut kinds = vec![MediaKind::Audio];
    if !cli.no_camera {
        kinds.push(MediaKind::Video);
    }
    // capture is not part of this example. the inputs are where encoded RTP packets would go
    let (media, _inputs) = RtpMediaProvider::new(&kinds, "room-mesh-example");

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EmittedEvents>();
    let id = generate_peer_id();
    log::info!("joining {} as {} ({})", &cli.room, &cli.name, &id);

    let (controller, handle) = Controller::init(InitArgs {
        id,
        name: cli.name.clone(),
        room: cli.room.clone(),
        config: config.clone(),
        media: Arc::new(media),
        membership: Arc::new(HttpMembership::new(cli.site.clone())),
        transports: Arc::new(RtcTransportFactory::new(config.ice_servers.clone())),
        signal_chan: signal_tx,
        emitted_event_chan: event_tx,
    });
    let room_task = controller.spawn();

    let channel = WsSignaling::new(
        &cli.relay,
        &cli.room,
        config.channel.clone(),
        handle.clone(),
        signal_rx,
    );
    let channel_task = tokio::spawn(channel.run());

    handle.join().await?;

    tokio::select! {
        _ = handle_events(event_rx) => {
            println!("event stream ended");
        }
         _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    if let Err(e) = handle.leave().await {
        log::warn!("leave: {}", e);
    }
    let _ = room_task.await;
    match channel_task.await {
        Ok(Ok(())) => log::info!("signaling channel closed"),
        Ok(Err(e)) => log::warn!("signaling channel ended: {}", e),
        Err(e) => log::error!("signaling task panicked: {}", e),
    }
    Ok(())
}

async fn handle_events(mut event_rx: mpsc::UnboundedReceiver<EmittedEvents>) {
    while let Some(evt) = event_rx.recv().await {
        match evt {
            EmittedEvents::SessionState { peer, state } => {
                println!("{peer}: {state}");
            }
            EmittedEvents::RemoteTrack { peer, track } => {
                tokio::spawn(async move {
                    let mime_type = track.codec().await.capability.mime_type;
                    log::info!("receiving {} from {}", mime_type, &peer);
                    let packets = count_packets(track).await;
                    log::info!("{} track from {} ended after {} packets", mime_type, peer, packets);
                });
            }
            EmittedEvents::ParticipantLeft { peer } => println!("{peer} left"),
            EmittedEvents::PresenceChanged { peer, record } => {
                println!(
                    "{} ({}): camera {}, audio {}{}",
                    peer,
                    record.name.as_deref().unwrap_or("?"),
                    if record.camera_on() { "on" } else { "off" },
                    if record.audio_on() { "on" } else { "off" },
                    if record.mic_active { ", speaking" } else { "" }
                );
            }
            EmittedEvents::PeerUnreachable { peer } => println!("{peer} is unreachable"),
            EmittedEvents::Passthrough(envelope) => {
                log::debug!("ignoring {}", envelope.signal.kind());
            }
            EmittedEvents::Fatal(e) => {
                log::error!("{}", e);
                return;
            }
        }
    }
}

// rendering is out of scope. read the RTP stream so the receiver keeps draining
async fn count_packets(track: Arc<TrackRemote>) -> u64 {
    let mut packets = 0;
    while track.read_rtp().await.is_ok() {
        packets += 1;
        if packets % 500 == 0 {
            log::debug!("{} packets on track {}", packets, track.id().await);
        }
    }
    packets
}
