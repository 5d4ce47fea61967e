//! roost: reconcile a user's Nostr history onto their declared NIP-65 relays.
//!
//! Given an npub (or nprofile, or hex pubkey), roost fetches the user's
//! relay list document, derives their write and read relay sets, and walks
//! their history backward in bounded batches, republishing each event to
//! exactly the declared relays that are missing it.
//!
//! # Usage
//!
//! ```bash
//! # Full sync of both directions, starting from now
//! roost npub1...
//!
//! # Only events authored by the user, down to a floor
//! roost npub1... --direction write --stop-at 1700000000
//!
//! # Resume a failed run from the cursor it reported
//! roost npub1... --resume-from 1723456789
//!
//! # Skip the NIP-65 lookup and push to explicit relays
//! roost npub1... --relay wss://relay.damus.io,wss://nos.lol
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) cancels the active run at its next suspension point.
//! The engine reports the cursor it stopped at; pass it back with
//! `--resume-from` to continue where it left off.

mod relays;

use anyhow::{Context, Result, bail};
use clap::Parser;
use metrics::gauge;
use nostr::{Keys, RelayUrl, Timestamp};
use roost_core::metrics::{init_metrics, start_metrics_server};
use roost_core::{
    Bech32Resolver, IdentityResolver, KeysSigner, NormalizeResult, auth_always, normalize_relay_url,
};
use roost_sync::{
    ProgressSender, RelayPool, SyncEngine, SyncOptions, SyncPhase, SyncProgress, TransportConfig,
    read_filter, write_filter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Which relay sets to reconcile.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    /// Events authored by the user, onto their write relays.
    Write,
    /// Events mentioning the user, onto their read relays.
    Read,
    /// Write first, then read, strictly serially.
    Both,
}

/// Reconcile a user's events onto their declared NIP-65 relays.
#[derive(Parser, Debug)]
#[command(name = "roost")]
#[command(about = "Reconcile a user's events onto their declared NIP-65 relays")]
#[command(version)]
struct Args {
    /// User identity: npub, nprofile, or 64-character hex pubkey
    identity: String,

    /// Sync to these relays for both roles, skipping the NIP-65 lookup
    /// (comma-separated)
    #[arg(long, value_delimiter = ',')]
    relay: Option<Vec<String>>,

    /// Relays queried for the NIP-65 relay list document (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "wss://purplepag.es,wss://relay.damus.io,wss://relay.nostr.band"
    )]
    bootstrap_relays: Vec<String>,

    /// Which relay sets to reconcile
    #[arg(long, value_enum, default_value_t = Direction::Both)]
    direction: Direction,

    /// Newest timestamp to start from (unix seconds; defaults to now)
    #[arg(long)]
    resume_from: Option<u64>,

    /// Oldest timestamp to sync down to (unix seconds; omit for full history)
    #[arg(long)]
    stop_at: Option<u64>,

    /// Maximum write relays to target
    #[arg(long, default_value_t = roost_sync::MAX_WRITE_RELAYS)]
    max_write_relays: usize,

    /// Maximum read relays to target
    #[arg(long, default_value_t = roost_sync::MAX_READ_RELAYS)]
    max_read_relays: usize,

    /// Seconds between event publications
    #[arg(long, default_value = "10")]
    inter_event_delay: u64,

    /// Answer NIP-42 auth challenges from relays that ask
    #[arg(long)]
    auth: bool,

    /// Secret key (nsec or hex) used for auth challenges; ephemeral if omitted
    #[arg(long)]
    nsec: Option<String>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("roost_sync=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("sync_in_progress").set(0.0);
    }

    let resolved = Bech32Resolver
        .resolve(&args.identity)
        .context("could not resolve the identity argument")?;
    tracing::info!("Resolved identity to pubkey {}", resolved.pubkey);

    // Auth is opt-in: without --auth every challenge is declined and the
    // subscription proceeds un-authenticated.
    let transport_config = if args.auth {
        let keys = match &args.nsec {
            Some(secret) => Keys::parse(secret).context("could not parse --nsec")?,
            None => Keys::generate(),
        };
        TransportConfig {
            auth_policy: auth_always(),
            signer: Some(Arc::new(KeysSigner::new(keys))),
            ..Default::default()
        }
    } else {
        TransportConfig::default()
    };

    let pool = Arc::new(RelayPool::new(transport_config));
    let options = SyncOptions {
        inter_event_delay: Duration::from_secs(args.inter_event_delay),
        ..Default::default()
    };
    let engine = Arc::new(SyncEngine::with_options(Arc::clone(&pool), options));

    let ctrlc_engine = Arc::clone(&engine);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, cancelling sync...");
        ctrlc_engine.stop();
    })
    .context("Failed to set Ctrl+C handler")?;

    let (progress, progress_rx) = ProgressSender::channel();
    let renderer = spawn_progress_renderer(progress_rx);

    // --relay bypasses the NIP-65 lookup entirely: the given relays serve
    // both roles.
    let (write_targets, read_targets) = match &args.relay {
        Some(overrides) => {
            let urls = normalize_relay_args(overrides, &[]);
            if urls.is_empty() {
                bail!("no usable relays in --relay");
            }
            tracing::info!("Relay list overridden: {} relays for both roles", urls.len());
            (
                relays::cap_targets(urls.clone(), args.max_write_relays, "write"),
                relays::cap_targets(urls, args.max_read_relays, "read"),
            )
        }
        None => {
            let bootstrap = normalize_relay_args(&args.bootstrap_relays, &resolved.hint_relays);
            if bootstrap.is_empty() {
                bail!("no usable bootstrap relays");
            }
            let descriptors =
                relays::fetch_relay_list(&pool, &bootstrap, resolved.pubkey, &progress).await?;
            (
                relays::cap_targets(
                    roost_core::write_relays(&descriptors),
                    args.max_write_relays,
                    "write",
                ),
                relays::cap_targets(
                    roost_core::read_relays(&descriptors),
                    args.max_read_relays,
                    "read",
                ),
            )
        }
    };

    let initial_until = args.resume_from.map(Timestamp::from).unwrap_or_else(Timestamp::now);
    let stop_at = args.stop_at.map(Timestamp::from);

    tracing::info!("Configuration:");
    tracing::info!("  Direction:    {:?}", args.direction);
    tracing::info!("  Write relays: {}", format_targets(&write_targets));
    tracing::info!("  Read relays:  {}", format_targets(&read_targets));
    tracing::info!("  Start cursor: {}", format_timestamp(initial_until));
    tracing::info!(
        "  Stop at:      {}",
        stop_at.map_or_else(|| "beginning of history".to_string(), format_timestamp)
    );

    let mut write_synced = 0usize;
    let mut read_synced = 0usize;

    // Write sync and read sync share the pool and its sighting index but
    // never run concurrently.
    let run = async {
        if matches!(args.direction, Direction::Write | Direction::Both) {
            write_synced = run_direction(
                &engine,
                "write",
                &write_targets,
                write_filter(resolved.pubkey),
                initial_until,
                stop_at,
                &progress,
            )
            .await?;
        }
        if matches!(args.direction, Direction::Read | Direction::Both) {
            read_synced = run_direction(
                &engine,
                "read",
                &read_targets,
                read_filter(resolved.pubkey),
                initial_until,
                stop_at,
                &progress,
            )
            .await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    pool.close_all().await;
    drop(progress);
    let _ = renderer.await;

    run?;

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SYNC COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Write events at full coverage: {}", write_synced);
    tracing::info!("Read events at full coverage:  {}", read_synced);
    tracing::info!("Distinct events sighted:       {}", pool.sighting_count());

    Ok(())
}

/// Run one direction of the reconciliation.
async fn run_direction(
    engine: &SyncEngine,
    label: &str,
    targets: &[RelayUrl],
    filter: nostr::Filter,
    initial_until: Timestamp,
    stop_at: Option<Timestamp>,
    progress: &ProgressSender,
) -> Result<usize> {
    if targets.is_empty() {
        tracing::warn!("No {} relays declared, skipping {} sync", label, label);
        return Ok(0);
    }

    engine
        .pool()
        .connect(targets)
        .await
        .with_context(|| format!("failed to connect the {} relay set", label))?;

    tracing::info!("Starting {} sync across {} relays", label, targets.len());

    let report = engine
        .sync(targets, &filter, initial_until, stop_at, progress)
        .await
        .with_context(|| format!("{} sync failed", label))?;

    tracing::info!(
        "{} sync complete: {} events at full coverage",
        label,
        report.total_synced
    );
    Ok(report.total_synced)
}

/// Normalize relay URLs given on the command line, merged with any
/// nprofile hints. Unusable entries are skipped with a warning; callers
/// decide whether an empty result is fatal.
fn normalize_relay_args(configured: &[String], hints: &[RelayUrl]) -> Vec<RelayUrl> {
    let mut urls: Vec<RelayUrl> = Vec::new();

    let mut candidates: Vec<String> = configured.to_vec();
    candidates.extend(hints.iter().map(|u| u.to_string()));

    for raw in &candidates {
        match normalize_relay_url(raw) {
            NormalizeResult::Ok(normalized) => match RelayUrl::parse(&normalized) {
                Ok(url) => {
                    if !urls.contains(&url) {
                        urls.push(url);
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping relay {}: {}", raw, e);
                }
            },
            NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
                tracing::warn!("Skipping relay {}: {}", raw, reason);
            }
        }
    }

    urls
}

/// Render engine progress as log lines.
fn spawn_progress_renderer(mut rx: mpsc::UnboundedReceiver<SyncProgress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            match record.phase {
                SyncPhase::FetchingBatch => {
                    tracing::info!(
                        "{} (cursor {})",
                        record.message,
                        format_timestamp(record.cursor_until)
                    );
                }
                SyncPhase::SyncingEvent | SyncPhase::BatchComplete | SyncPhase::Complete => {
                    tracing::info!("{}", record.message);
                }
                SyncPhase::Error => {
                    tracing::error!("{}", record.message);
                    tracing::info!(
                        "Retry with --resume-from {} to continue from this point",
                        record.cursor_until.as_u64()
                    );
                }
                SyncPhase::Idle | SyncPhase::FetchingRelays => {
                    tracing::info!("{}", record.message);
                }
            }
        }
    })
}

fn format_targets(targets: &[RelayUrl]) -> String {
    if targets.is_empty() {
        return "(none)".to_string();
    }
    targets
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Unix seconds rendered for humans.
fn format_timestamp(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp(ts.as_u64() as i64, 0)
        .map(|dt| format!("{} ({})", ts.as_u64(), dt.format("%Y-%m-%d %H:%M:%S UTC")))
        .unwrap_or_else(|| ts.as_u64().to_string())
}
