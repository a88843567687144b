// ABOUTME: boxgate binary - loads configuration, wires the publisher stub, runs the proxy
// ABOUTME: The MQTT layer plugs into the same channels this main drains into the log

use argh::FromArgs;
use boxgate::config::{Config, ModeOverride};
use boxgate::publish::{ChannelSink, Event};
use boxgate::server;
use boxgate::stats::Stats;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Transparent interception proxy between a BOX energy controller and its
/// vendor cloud.
struct Args {
    /// path to the JSON config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// override the listen address (host:port)
    #[argh(option)]
    listen: Option<String>,

    /// override the cloud address (host:port)
    #[argh(option)]
    cloud: Option<String>,

    /// override the mode (auto, online, offline, hybrid)
    #[argh(option)]
    mode: Option<String>,
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen) = &args.listen {
        if let Some((host, port)) = split_addr(listen) {
            config.listen_host = host;
            config.listen_port = port;
        }
    }
    if let Some(cloud) = &args.cloud {
        if let Some((host, port)) = split_addr(cloud) {
            config.cloud_host = host;
            config.cloud_port = port;
        }
    }
    if let Some(mode) = &args.mode {
        config.mode_override = match mode.as_str() {
            "online" => ModeOverride::Online,
            "offline" => ModeOverride::Offline,
            "hybrid" => ModeOverride::Hybrid,
            _ => ModeOverride::Auto,
        };
    }
}

fn split_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

#[tokio::main]
async fn main() -> boxgate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Args = argh::from_env();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    info!(
        listen = %config.listen_addr(),
        cloud = %config.cloud_addr(),
        mode = ?config.mode_override,
        "boxgate starting"
    );

    // Publisher stub: until an MQTT layer is attached, observation events
    // are drained into the debug log so the channel never backs up.
    let (sink, mut events_rx) = ChannelSink::new(config.publish_depth, Stats::new());
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::Frame(frame) => {
                    debug!(direction = %frame.direction, class = %frame.class, "frame observed")
                }
                Event::Mode { from, to, reason } => {
                    info!(%from, %to, reason = %reason, "mode change observed")
                }
                Event::Control(update) => {
                    info!(id = %update.correlation_id, status = %update.status, "control update")
                }
            }
        }
    });

    // Control ingress: held open for an embedding publisher; unused by the
    // standalone binary.
    let (_control_tx, control_rx) = mpsc::channel(16);
    let (updates_tx, mut updates_rx) = mpsc::channel(16);
    tokio::spawn(async move { while updates_rx.recv().await.is_some() {} });

    let listener = TcpListener::bind(config.listen_addr()).await?;
    server::run(
        listener,
        config,
        Arc::new(sink),
        control_rx,
        updates_tx,
        tokio::signal::ctrl_c(),
    )
    .await
}
