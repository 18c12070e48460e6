//! fieldsync - operator CLI for the offline outbox and cache.
//!
//! Inspects the local store, probes reachability and drives sync passes
//! against the configured backend.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldsync_core::period::resolve_time_zone;
use fieldsync_core::store::keys;
use fieldsync_core::{
    Cache, Config, CredentialStore, EventBus, FlushReport, HttpProber, HydrateReport, OpKind,
    Outbox, OutboxId, PassOutcome, ReachabilityMonitor, RestBackend, Session, SessionData,
    SkipReason, SqliteStore, SyncCoordinator, YearMonth,
};

// ============================================================================
// Constants
// ============================================================================

/// Rolling log file prefix in the data directory
const LOG_FILE_PREFIX: &str = "fieldsync.log";

const USAGE: &str = "\
Usage: fieldsync <command>

Commands:
  init                        Write the current configuration to the config file
  status                      Pending outbox items, dead letters and session
  probe                       Probe the backend and the origin
  sync                        Probe, then flush the outbox and hydrate the cache
  dead                        List dead-lettered outbox items
  requeue <id>                Move a dead-lettered item back to pending
  login <user-id> [time-zone] Store a session (prompts for the access token)
  logout                      Forget the session and the stored API key";

/// Initialize the tracing subscriber: stderr plus a daily log file.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the program.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=fieldsync_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load().context("Failed to load configuration")?;
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let _guard = init_tracing(Some(&data_dir));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");
    info!(command, "fieldsync starting");

    match command {
        "init" => init(&config),
        "status" => status(&config),
        "probe" => probe(&config).await,
        "sync" => sync(&config).await,
        "dead" => dead(&config),
        "requeue" => {
            let id = args
                .get(1)
                .context("requeue needs an outbox id")?
                .parse::<i64>()
                .context("Outbox ids are integers")?;
            requeue(&config, OutboxId(id))
        }
        "login" => {
            let user_id = args.get(1).context("login needs a user id")?;
            login(&config, user_id, args.get(2).cloned())
        }
        "logout" => logout(&config),
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let path = config.store_path()?;
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn load_session(config: &Config) -> Result<Session> {
    let session = Session::new(config.data_dir()?);
    session.load()?;
    Ok(session)
}

fn api_key(config: &Config) -> Result<String> {
    if let Some(key) = &config.api_key {
        return Ok(key.clone());
    }
    CredentialStore::get_api_key(&config.backend_url)?.context(
        "No API key: set FIELDSYNC_API_KEY, add api_key to the config, or run `fieldsync login`",
    )
}

fn monitor(config: &Config, backend: &RestBackend, events: EventBus) -> ReachabilityMonitor {
    ReachabilityMonitor::new(
        Box::new(HttpProber::new()),
        backend.probe_url(),
        config.origin_url.clone(),
        events,
    )
    .with_timeout(config.sync.probe_timeout())
}

// ============================================================================
// Commands
// ============================================================================

fn init(config: &Config) -> Result<()> {
    let mut config = config.clone();
    // The API key goes to the keychain, never the config file
    if let Some(key) = config.api_key.take() {
        CredentialStore::store_api_key(&config.backend_url, &key)?;
    }
    config.save()?;
    println!("Wrote {}", Config::config_path()?.display());
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = open_store(config)?;

    let counts = store.pending_counts()?;
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    println!("Pending outbox items: {}", total);
    for kind in OpKind::ALL {
        let count = counts
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        if count > 0 {
            println!("  {:<15} {}", kind, count);
        }
    }
    println!("Dead letters: {}", store.dead_letters()?.len());

    let session = load_session(config)?;
    let Some(data) = session.get() else {
        println!("Session: none (run `fieldsync login`)");
        return Ok(());
    };
    println!("Session: {}", describe_session(&data));

    let tz = resolve_time_zone(
        data.time_zone.as_deref(),
        config.default_time_zone.as_deref(),
    );
    let month = YearMonth::from_date(Utc::now().with_timezone(&tz).date_naive());
    match store.entry(&keys::daily_month(&data.user_id, month))? {
        Some(entry) => println!("Cached {}: updated {}", month, entry.age_display()),
        None => println!("Cached {}: never hydrated", month),
    }
    Ok(())
}

fn describe_session(data: &SessionData) -> String {
    let zone = data.time_zone.as_deref().unwrap_or("default");
    if data.is_expired() {
        return format!("{} ({}), expired (run `fieldsync login`)", data.user_id, zone);
    }
    match data.minutes_until_expiry() {
        Some(minutes) if data.needs_refresh() => format!(
            "{} ({}), expires in {} min, log in again soon",
            data.user_id, zone, minutes
        ),
        Some(minutes) => format!("{} ({}), expires in {} min", data.user_id, zone, minutes),
        None => format!("{} ({})", data.user_id, zone),
    }
}

async fn probe(config: &Config) -> Result<()> {
    let backend = RestBackend::new(&config.backend_url, api_key(config).unwrap_or_default())?;
    let monitor = monitor(config, &backend, EventBus::new());

    let status = monitor.set_device_online(true).await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.can_sync() {
        println!("Backend unreachable at {}", backend.probe_url());
    }
    Ok(())
}

async fn sync(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let session = Arc::new(load_session(config)?);

    if !session.is_valid() {
        eprintln!("No valid session: flushing only, run `fieldsync login` to hydrate");
    }

    let mut backend = RestBackend::new(&config.backend_url, api_key(config)?)?;
    if let Some(data) = session.get() {
        backend = backend.with_token(data.token);
    }

    let events = EventBus::new();
    let reachability = Arc::new(monitor(config, &backend, events.clone()));
    let coordinator = SyncCoordinator::new(
        store,
        Arc::new(backend),
        reachability,
        session,
        events,
    )
    .with_config(config.sync.clone())
    .with_default_time_zone(config.default_time_zone.clone());

    let Some(report) = coordinator.initial_load(true).await else {
        return Ok(());
    };
    println!("Flush:     {}", describe_flush(&report.flush));
    println!("Hydration: {}", describe_hydration(&report.hydrate));
    Ok(())
}

fn describe_skip(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Unreachable => "skipped, backend unreachable",
        SkipReason::NoSession => "skipped, not logged in",
    }
}

fn describe_flush(outcome: &PassOutcome<FlushReport>) -> String {
    match outcome {
        PassOutcome::Completed(r) => {
            let mut line = format!(
                "{} replayed, {} retained, {} dead-lettered in {} calls",
                r.replayed, r.retained, r.dead_lettered, r.remote_calls
            );
            if let Some(reason) = r.aborted {
                line.push_str(&format!(" (stopped: {})", reason));
            }
            line
        }
        PassOutcome::Coalesced => "already running elsewhere".to_string(),
        PassOutcome::Skipped(reason) => describe_skip(*reason).to_string(),
    }
}

fn describe_hydration(outcome: &PassOutcome<HydrateReport>) -> String {
    match outcome {
        PassOutcome::Completed(r) => match r.failed {
            Some(reason) => format!("failed for {} ({})", r.user, reason),
            None => format!(
                "{} records for {} from {} to {}, {} pending kept",
                r.records, r.user, r.start, r.end, r.kept_pending
            ),
        },
        PassOutcome::Coalesced => "already running".to_string(),
        PassOutcome::Skipped(reason) => describe_skip(*reason).to_string(),
    }
}

fn dead(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let failed = store.dead_letters()?;
    if failed.is_empty() {
        println!("No dead-lettered items");
        return Ok(());
    }

    for item in failed {
        let created = DateTime::from_timestamp_millis(item.created_at)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "#{:<6} {:<15} {}  attempts={}  {}",
            item.id,
            item.kind,
            created,
            item.attempts,
            item.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn requeue(config: &Config, id: OutboxId) -> Result<()> {
    let store = open_store(config)?;
    if store.requeue(id)? {
        println!("Requeued #{}", id);
        Ok(())
    } else {
        bail!("No dead-lettered item #{}", id)
    }
}

fn login(config: &Config, user_id: &str, time_zone: Option<String>) -> Result<()> {
    if config.api_key.is_none() && CredentialStore::get_api_key(&config.backend_url)?.is_none() {
        let key = rpassword::prompt_password("API key: ")?;
        if !key.trim().is_empty() {
            CredentialStore::store_api_key(&config.backend_url, key.trim())?;
        }
    }

    let token = rpassword::prompt_password("Access token: ")?;
    if token.trim().is_empty() {
        bail!("An access token is required");
    }

    let mut data = SessionData::new(token.trim(), user_id);
    data.time_zone = time_zone.or_else(|| config.default_time_zone.clone());

    let session = Session::new(config.data_dir()?);
    session.update(data);
    session.save()?;
    println!("Logged in as {}", user_id);
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    load_session(config)?.clear()?;
    CredentialStore::delete(&config.backend_url)?;
    println!("Logged out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(expires_in: Option<Duration>) -> SessionData {
        let mut data = SessionData::new("jwt", "u1");
        data.time_zone = Some("America/Chicago".to_string());
        data.expires_at = expires_in.map(|d| Utc::now() + d);
        data
    }

    #[test]
    fn test_describe_session_without_expiry() {
        assert_eq!(describe_session(&session(None)), "u1 (America/Chicago)");
    }

    #[test]
    fn test_describe_session_near_and_past_expiry() {
        let soon = describe_session(&session(Some(Duration::minutes(2))));
        assert!(soon.ends_with("log in again soon"), "{}", soon);

        let later = describe_session(&session(Some(Duration::hours(2))));
        assert!(later.contains("expires in"));
        assert!(!later.contains("soon"));

        let expired = describe_session(&session(Some(Duration::minutes(-1))));
        assert!(expired.contains("expired"));
    }

    #[test]
    fn test_describe_flush_reports_abort() {
        let report = FlushReport {
            replayed: 3,
            remote_calls: 2,
            aborted: Some(fieldsync_core::FailureReason::Unauthenticated),
            ..Default::default()
        };
        let line = describe_flush(&PassOutcome::Completed(report));
        assert!(line.starts_with("3 replayed, 0 retained, 0 dead-lettered in 2 calls"));
        assert!(line.contains("stopped"));
    }
}
