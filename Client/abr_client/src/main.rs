use std::sync::Arc;
use std::time::Duration;

use abr_client::args::{get_log_level_filter, parse_args, Args};
use abr_client::output::{event_callback, SegmentLog};
use abr_player::config::PlayerConfig;
use abr_player::crosslayer::CrossLayerAccountant;
use abr_player::error::PlayerResult;
use abr_player::mpd::Manifest;
use abr_player::segment::HttpFetcher;
use abr_player::AbrPlayer;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[tokio::main]
async fn main() {
    let args = parse_args();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(get_log_level_filter(&args));

    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global default subscriber");

    info!("Starting ABR client (headless)");
    info!("{:?}", args);

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn load_config(args: &Args) -> PlayerResult<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_json(&tokio::fs::read_to_string(path).await?)?,
        None => PlayerConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> PlayerResult<()> {
    let config = load_config(&args).await?;

    let client = reqwest::Client::new();
    let mut sources = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let manifest = Manifest::load(&client, url).await?;
        info!("Loaded {} with {} track(s)", url, manifest.tracks.len());
        sources.push(manifest);
    }

    // Packet events flow from the fetcher into the accountant
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let accountant = Arc::new(match config.predictor {
        Some(predictor) => CrossLayerAccountant::with_predictor(predictor.window),
        None => CrossLayerAccountant::new(),
    });
    let listener = accountant.listen(transport_rx);

    let fetcher = HttpFetcher::new(client)
        .with_transport_events(transport_tx)
        .with_retries(args.retries, Duration::from_millis(500));

    let log = match &args.output {
        Some(path) => Some(Arc::new(SegmentLog::create(path)?)),
        None => None,
    };

    let player = AbrPlayer::new(config, sources, Arc::new(fetcher))?
        .with_callback(event_callback(log.clone()))
        .with_accountant(Arc::clone(&accountant));
    let summary = player.run().await?;

    // Dropping the player closes the transport channel and ends the listener
    drop(player);
    if let Err(e) = listener.await {
        error!("Transport listener failed: {}", e);
    }
    if let Some(log) = log {
        log.flush()?;
    }

    match serde_json::to_string(&summary) {
        Ok(json) => info!("Session summary: {}", json),
        Err(_) => info!("Session summary: {:?}", summary),
    }
    Ok(())
}
