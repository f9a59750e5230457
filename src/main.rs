//! peer-stream - Main entry point
//!
//! Shares a folder of videos on the LAN and streams videos from other peers.

use anyhow::{Context, Result};
use peer_stream::{
    Action, CliArgs, CommandPlayback, Config, EventSink, NoPlayback, Node, NodeEvent, PlaybackHook, ProgressDisplay,
    StreamRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        } else {
            error!("PANIC occurred at an unknown location");
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// Initialize logging based on CLI arguments
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level: {:?}", level);
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::load(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let playback: Arc<dyn PlaybackHook> = match config.player.as_deref().and_then(CommandPlayback::from_command_line) {
        Some(player) => Arc::new(player),
        None => Arc::new(NoPlayback),
    };

    let (events, rx) = EventSink::channel();
    let renderer = tokio::spawn(render_events(rx, ProgressDisplay::new(config.is_quiet())));

    let node = Node::start(&config, events, playback)
        .await
        .context("Failed to start peer")?;
    info!(
        "Peer {} up: control {}, discovery {:?}",
        node.peer_id(),
        node.control_addr(),
        node.discovery_addr().await
    );

    let result = match &args.action {
        Action::Serve => run_serve(&node, &config).await,
        Action::Search { query, wait } => run_search(&node, &config, query.as_deref().unwrap_or(""), *wait).await,
        Action::Stream { key, name, wait } => {
            let request = match name {
                Some(name) => StreamRequest::named(key.clone(), name.clone()),
                None => StreamRequest::new(key.clone()),
            };
            run_stream(&node, &config, request, *wait).await
        }
    };

    node.shutdown().await;
    drop(node);
    match tokio::time::timeout(Duration::from_secs(2), renderer).await {
        Ok(Err(e)) => warn!("Progress renderer stopped unexpectedly: {}", e),
        Err(_) => debug!("Progress renderer still draining at exit"),
        Ok(Ok(())) => {}
    }

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

/// Print events until every sender is gone
async fn render_events(mut rx: UnboundedReceiver<NodeEvent>, mut progress: ProgressDisplay) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = progress.handle_event(&event) {
            debug!("Failed to render event: {}", e);
        }
    }
}

/// Wait up to `wait` seconds for at least one peer to show up
async fn warm_up(node: &Node, wait: u64) {
    let deadline = Instant::now() + Duration::from_secs(wait);
    while Instant::now() < deadline {
        if !node.peers().await.is_empty() {
            // one more moment lets the rest of the LAN answer
            sleep(Duration::from_millis(300)).await;
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    debug!("No peers after {}s warm-up", wait);
}

/// Share the content root until Ctrl-C
async fn run_serve(node: &Node, config: &Config) -> Result<()> {
    let progress = ProgressDisplay::new(config.is_quiet());
    match &config.root {
        Some(root) => progress.print_status(&format!("Sharing {}", root.display()))?,
        None => progress.print_status("No content root configured; sharing nothing")?,
    }

    let mut ticker = interval(config.rescan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_digest = String::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let digest = node.rescan().await;
                if digest != last_digest {
                    info!("Catalog digest is now {}", digest);
                    last_digest = digest;
                }
                let fetched = node.refresh_network().await;
                debug!("Refreshed {} peer catalogs", fetched);
                progress.print_peers(&node.peers().await)?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, leaving the network");
                return Ok(());
            }
        }
    }
}

/// List what the network shares
async fn run_search(node: &Node, config: &Config, query: &str, wait: u64) -> Result<()> {
    let progress = ProgressDisplay::new(config.is_quiet());
    warm_up(node, wait).await;
    node.rescan().await;
    node.refresh_network().await;
    let listings = node.search(query).await;
    progress.print_listings(&listings)?;
    Ok(())
}

/// Stream one item, stopping cleanly on Ctrl-C
async fn run_stream(node: &Node, config: &Config, request: StreamRequest, wait: u64) -> Result<()> {
    let progress = ProgressDisplay::new(config.is_quiet());
    warm_up(node, wait).await;

    let key = request.key.clone();
    let handle = node.start_stream(request).context("Failed to start stream")?;
    let report = tokio::select! {
        report = handle.wait() => report,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping stream of {}", key);
            node.stop_stream(&key);
            return Ok(());
        }
    };

    let report = report.with_context(|| format!("Stream of {} failed", key))?;
    progress.print_complete(&report)?;
    Ok(())
}
