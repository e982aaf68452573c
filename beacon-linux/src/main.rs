// Beacon daemon: owns the registry on one task and feeds it host events.
// It has no GATT attribute server, so configuration sessions are not offered.

mod config;
mod events;
mod issuer;
mod radio;
mod store;
mod timers;

use anyhow::Context;
use beacon_core::beacon::UrlBeacon;
use beacon_core::{
    BeaconDefinition, BeaconKind, BeaconRegistry, Collaborators, ShortUrlIssuer,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::events::{now_ms, HostEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("beacon-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_env("BEACON_LOG")
        .or_else(|_| EnvFilter::try_new(&cfg.log))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let store = store::JsonFileStore::open(&cfg.store_path)
        .with_context(|| format!("opening store {}", cfg.store_path.display()))?;
    let issuer: Box<dyn ShortUrlIssuer> = match &cfg.issuer_url {
        Some(url) => Box::new(issuer::HttpIssuer::new(
            url.clone(),
            cfg.issuer_api_key.clone(),
            tx.clone(),
        )?),
        None => Box::new(issuer::NoIssuer::new(tx.clone())),
    };
    let radio = radio::DryRunRadio::new(tx.clone());
    #[cfg(unix)]
    radio::spawn_power_toggle(radio.power_switch(), tx.clone())?;

    let mut registry = BeaconRegistry::new(
        cfg.core.clone(),
        Collaborators {
            store: Box::new(store),
            issuer,
            wake: Box::new(timers::TokioWake::new(tx.clone())),
            notifier: Box::new(radio::LogNotifier),
            telemetry: Box::new(radio::HostTelemetry::new()),
        },
        Box::new(radio),
    );

    let loaded = registry.load(now_ms())?;
    info!(version = VERSION, loaded, store = %cfg.store_path.display(), "beacon daemon started");
    if registry.beacons().is_empty() {
        seed(&mut registry, &cfg.urls)?;
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            Some(event) = rx.recv() => handle(&mut registry, event),
        }
    }
    log_status(&registry);
    info!(tracked = registry.beacons().len(), "shutting down");
    Ok(())
}

/// One line per tracked beacon with its live advertiser, if any.
fn log_status(registry: &BeaconRegistry) {
    for beacon in registry.beacons() {
        let advertiser = registry.advertising().advertiser(beacon.ephemeral_id());
        info!(
            beacon = %beacon.key(),
            active = ?beacon.active_state,
            status = ?beacon.advertise_status,
            handle = advertiser.map(|a| a.handle.0),
            advertiser = ?advertiser.map(|a| a.state),
            "beacon status"
        );
    }
}

/// Create, save and start a URL beacon per configured URL.
fn seed(registry: &mut BeaconRegistry, urls: &[String]) -> anyhow::Result<()> {
    for url in urls {
        let mut def = BeaconDefinition::new(BeaconKind::EddystoneUrl(UrlBeacon {
            url: Some(url.clone()),
        }));
        registry.save(&mut def)?;
        if let Err(e) = registry.start(def, now_ms()) {
            warn!(url = %url, code = e.error_code(), "seed beacon did not start: {e}");
        }
    }
    Ok(())
}

fn handle(registry: &mut BeaconRegistry, event: HostEvent) {
    let now = now_ms();
    let result = match event {
        HostEvent::Wake(key) => registry.on_wake(key, now),
        HostEvent::AdvertiseStarted(handle, settings) => {
            registry.on_advertise_started(handle, settings);
            Ok(())
        }
        HostEvent::AdvertiseFailed(handle, code) => registry.on_advertise_failed(handle, code),
        HostEvent::ShortUrls { ticket, result } => registry.on_short_urls_issued(ticket, result, now),
        HostEvent::RadioEnabled => {
            registry.on_adapter_enabled(now);
            Ok(())
        }
        HostEvent::RadioDisabled => {
            registry.on_adapter_disabled();
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(code = e.error_code(), "{e}");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
