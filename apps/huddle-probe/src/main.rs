//! Spins up several in-process participants on a shared bus, has one of them
//! publish a synthetic video track, and reports whether every other
//! participant received it.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use huddle_signaling::{
    IceConfig, IceServerResolver, LocalMediaSource, LocalTrack, MediaHandle, NoLocalMedia, PeerId,
    PeerTransportFactory, PublishedMedia, RemoteMedia, SignalingConfig, SignalingManager,
    StaticIceServers, StreamKind, StreamObserver, WebRtcTransportFactory,
};
use logging::{LogConfig, LogLevel};
use signal_bus::LocalSignalBus;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Camera,
    Screen,
}

impl From<KindArg> for StreamKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Camera => StreamKind::Camera,
            KindArg::Screen => StreamKind::Screen,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "huddle-probe")]
struct Cli {
    /// Participants in the room; the first one publishes.
    #[arg(long, env = "HUDDLE_PROBE_PEERS", default_value_t = 3)]
    peers: usize,

    #[arg(long, value_enum, default_value_t = KindArg::Camera)]
    kind: KindArg,

    #[arg(long, env = "HUDDLE_PROBE_TIMEOUT_SECS", default_value_t = 20)]
    timeout_secs: u64,

    #[arg(long, value_enum, env = "HUDDLE_LOG_LEVEL", default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, env = "HUDDLE_LOG_FILE", help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[derive(Default)]
struct Tally {
    received: AtomicUsize,
    removed: AtomicUsize,
}

impl Tally {
    fn received(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    fn removed(&self) -> usize {
        self.removed.load(Ordering::Acquire)
    }
}

impl StreamObserver for Tally {
    fn on_stream_received(&self, peer: &PeerId, media: RemoteMedia, kind: StreamKind) {
        self.received.fetch_add(1, Ordering::AcqRel);
        info!(from = %peer, kind = %kind, tracks = media.tracks().len(), "stream received");
    }

    fn on_stream_removed(&self, peer: &PeerId, kind: StreamKind) {
        self.removed.fetch_add(1, Ordering::AcqRel);
        info!(from = %peer, kind = %kind, "stream removed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure!(cli.peers >= 2, "need at least two participants, got {}", cli.peers);
    let kind = StreamKind::from(cli.kind);
    let config = SignalingConfig::from_env();
    let ice = IceConfig::from_env().context("invalid ICE configuration")?;
    let resolver: Arc<dyn IceServerResolver> = Arc::new(StaticIceServers::from_config(&ice));
    let factory: Arc<dyn PeerTransportFactory> =
        Arc::new(WebRtcTransportFactory::new().context("failed to build webrtc api")?);
    let bus = Arc::new(LocalSignalBus::new());
    let tally = Arc::new(Tally::default());

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        kind.to_string(),
        "huddle-probe".to_owned(),
    ));
    let published = Arc::new(PublishedMedia::new());
    published.publish(MediaHandle::new(kind, vec![Arc::clone(&track) as LocalTrack]));

    let mut managers = Vec::with_capacity(cli.peers);
    for index in 0..cli.peers {
        let id = format!("peer-{index}");
        let media: Arc<dyn LocalMediaSource> = if index == 0 {
            published.clone()
        } else {
            Arc::new(NoLocalMedia)
        };
        let manager = SignalingManager::builder(id.as_str(), bus.clone(), factory.clone())
            .display_name(format!("Probe {index}"))
            .config(config.clone())
            .ice_servers(resolver.clone())
            .local_media(media)
            .observer(tally.clone())
            .build();
        manager.spawn_background();
        managers.push(manager);
    }

    let writer = tokio::spawn(write_frames(Arc::clone(&track)));
    let publisher = managers[0].local_id().clone();
    for viewer in &managers[1..] {
        viewer
            .request_stream(&publisher, kind)
            .await
            .with_context(|| format!("{} could not request {kind}", viewer.local_id()))?;
    }

    let expected = cli.peers - 1;
    let deadline = Instant::now() + Duration::from_secs(cli.timeout_secs);
    while tally.received() < expected && Instant::now() < deadline {
        sleep(Duration::from_millis(200)).await;
    }
    writer.abort();
    let dropped = tally.removed();
    if dropped > 0 {
        warn!(dropped, "streams went away before the probe finished");
    }

    for manager in &managers {
        for record in manager.snapshot() {
            println!(
                "{:<8} {:<28} {:<10} {:?}/{:?} transitions={} age={:.1}s",
                manager.local_id().to_string(),
                record.id.to_string(),
                record.state.as_str(),
                record.direction,
                record.role,
                record.transitions,
                record.age.as_secs_f32()
            );
        }
    }
    for manager in &managers {
        manager.shutdown().await;
    }

    let received = tally.received();
    if received < expected {
        bail!("only {received} of {expected} viewers received the {kind} stream");
    }
    println!(
        "all {expected} viewers received the {kind} stream, {} removed on shutdown",
        tally.removed() - dropped
    );
    Ok(())
}

async fn write_frames(track: Arc<TrackLocalStaticSample>) {
    let frame = Bytes::from_static(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00]);
    loop {
        let sample = Sample {
            data: frame.clone(),
            duration: FRAME_INTERVAL,
            ..Default::default()
        };
        if let Err(err) = track.write_sample(&sample).await {
            warn!(error = %err, "failed to write probe frame");
        }
        sleep(FRAME_INTERVAL).await;
    }
}
