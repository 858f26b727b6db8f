//! DriftSync CLI - Command line interface for inspecting and repairing a
//! device's sync state.
//!
//! This tool opens the local queue, replica and backups of one device
//! without contacting a remote, so it is safe to run while offline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use driftsync_common::{
    EntityKey, Operation, OperationFlags, OperationId, OperationKind, Priority,
};
use driftsync_sync::{
    failed_measurement, ConsistencyValidator, EngineConfig, EnqueueOptions,
    NetworkQualityMonitor, StaticProbe, SyncEngine, UnreachableRemote,
};

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(about = "DriftSync - Offline-first sync queue inspection")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (default: the platform data dir).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue depths, tier states and connectivity.
    Status,

    /// List the ready operations of a tier.
    Peek {
        /// Tier: "critical", "high", "medium" or "low".
        #[arg(short, long, default_value = "critical")]
        priority: String,

        /// Maximum number of operations shown.
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },

    /// Queue a mutation.
    Enqueue {
        /// Operation kind: "create", "update", "delete" or "emergency".
        #[arg(short, long, default_value = "update")]
        kind: String,

        /// Entity as "type/id".
        #[arg(short, long)]
        entity: String,

        /// JSON payload.
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Requested tier (can only raise the classified one).
        #[arg(long)]
        priority: Option<String>,

        /// Operation ids this one depends on.
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        #[arg(long)]
        safety: bool,

        #[arg(long)]
        time_sensitive: bool,

        #[arg(long)]
        emergency: bool,

        /// Complete once recorded locally.
        #[arg(long)]
        local_terminal: bool,
    },

    /// Commit what can be committed without a remote.
    Drain,

    /// List dead-lettered operations.
    DeadLetters,

    /// Move a dead-lettered operation back to its tier.
    Requeue {
        /// Operation id.
        id: String,
    },

    /// Delete every dead letter (a backup is taken first).
    PurgeDeadLetters,

    /// List entities held back by failed consistency checks.
    Quarantine,

    /// Return an entity ("type/id") to automatic processing.
    Release {
        entity: String,
    },

    /// List open replica conflicts.
    Conflicts,

    /// Create an emergency backup.
    Backup {
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },

    /// List emergency backups.
    Backups,

    /// Restore an emergency backup.
    Restore {
        /// Backup id.
        id: String,
    },

    /// Show the audit trail.
    Audit {
        /// Show only the most recent records.
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("driftsync"),
    };
    let config = load_config(&data_dir).await?;

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let engine = open_engine(config).await?;
    let result = run(&engine, cli.command).await;
    engine.shutdown().await.context("Failed to flush state")?;
    result
}

async fn run(engine: &SyncEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Status => cmd_status(engine).await,
        Commands::Peek { priority, limit } => cmd_peek(engine, &priority, limit).await,
        Commands::Enqueue {
            kind,
            entity,
            payload,
            priority,
            depends_on,
            safety,
            time_sensitive,
            emergency,
            local_terminal,
        } => {
            let flags = OperationFlags {
                time_sensitive,
                safety_domain: safety,
                emergency,
                local_terminal,
            };
            cmd_enqueue(engine, &kind, &entity, &payload, priority.as_deref(), &depends_on, flags)
                .await
        }
        Commands::Drain => cmd_drain(engine).await,
        Commands::DeadLetters => cmd_dead_letters(engine).await,
        Commands::Requeue { id } => cmd_requeue(engine, &id).await,
        Commands::PurgeDeadLetters => cmd_purge(engine).await,
        Commands::Quarantine => cmd_quarantine(engine),
        Commands::Release { entity } => cmd_release(engine, &entity).await,
        Commands::Conflicts => cmd_conflicts(engine).await,
        Commands::Backup { reason } => cmd_backup(engine, &reason).await,
        Commands::Backups => cmd_backups(engine).await,
        Commands::Restore { id } => cmd_restore(engine, &id).await,
        Commands::Audit { limit } => cmd_audit(engine, limit).await,
        Commands::Config => Ok(()),
    }
}

/// Load `config.json` from the data directory, creating it on first use so
/// the device id stays stable across runs.
async fn load_config(data_dir: &Path) -> Result<EngineConfig> {
    let path = data_dir.join("config.json");
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let config = EngineConfig::load(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(config);
    }

    let config = EngineConfig::new(data_dir);
    config.save(&path).await.context("Failed to write configuration")?;
    info!("Initialized {} for device {}", data_dir.display(), config.device_id);
    Ok(config)
}

async fn open_engine(config: EngineConfig) -> Result<SyncEngine> {
    let monitor = Arc::new(NetworkQualityMonitor::new(
        Arc::new(StaticProbe::offline()),
        config.network.clone(),
    ));
    monitor.record(failed_measurement());

    SyncEngine::open(
        config,
        Arc::new(UnreachableRemote),
        monitor,
        Arc::new(ConsistencyValidator::new()),
    )
    .await
    .context("Failed to open sync state")
}

fn parse_entity(s: &str) -> Result<EntityKey> {
    let (entity_type, id) = s
        .split_once('/')
        .filter(|(t, i)| !t.is_empty() && !i.is_empty())
        .with_context(|| format!("Invalid entity '{}', expected type/id", s))?;
    Ok(EntityKey::new(entity_type, id))
}

fn parse_priority(s: &str) -> Result<Priority> {
    s.parse().context("Invalid priority")
}

async fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let stats = engine.stats().await;

    println!("Device: {}", engine.config().device_id);
    println!("Connectivity: {:?}", stats.connectivity);
    println!("Queues:");
    for priority in Priority::DRAIN_ORDER {
        let depth = stats.store.queued.get(&priority).copied().unwrap_or(0);
        let state = stats.tiers.get(&priority).copied();
        println!("  {:<8} {:>6}  {:?}", priority.as_str(), depth, state);
    }
    println!("Dead letters: {}", stats.store.dead_letters);
    println!("Open conflicts: {}", stats.open_conflicts);
    println!("Quarantined: {}", stats.quarantined);
    println!("Audit records: {}", stats.store.audit_records);

    Ok(())
}

async fn cmd_peek(engine: &SyncEngine, priority: &str, limit: usize) -> Result<()> {
    let priority = parse_priority(priority)?;
    let ops = engine.store().peek(priority, limit).await?;

    if ops.is_empty() {
        println!("No ready operations in {}.", priority);
        return Ok(());
    }
    for op in ops {
        println!(
            "{}  {} {}  retries {}/{}{}",
            op.id,
            op.kind,
            op.entity,
            op.retry_count,
            op.max_retries,
            if op.safety_critical { "  [safety]" } else { "" }
        );
    }

    Ok(())
}

async fn cmd_enqueue(
    engine: &SyncEngine,
    kind: &str,
    entity: &str,
    payload: &str,
    priority: Option<&str>,
    depends_on: &[String],
    flags: OperationFlags,
) -> Result<()> {
    let kind: OperationKind = kind.parse().context("Invalid operation kind")?;
    let entity = parse_entity(entity)?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let device = engine.config().device()?;

    let mut options = EnqueueOptions::default();
    if let Some(priority) = priority {
        options = options.with_priority(parse_priority(priority)?);
    }
    if !depends_on.is_empty() {
        let deps = depends_on
            .iter()
            .map(|d| OperationId::new(d.as_str()))
            .collect::<driftsync_common::Result<Vec<_>>>()
            .context("Invalid dependency id")?;
        options = options.with_dependencies(deps);
    }

    let op = Operation::new(kind, entity, payload, device).with_flags(flags);
    let result = engine.enqueue(op, options).await?;

    if !result.success {
        anyhow::bail!(
            "Operation rejected: {}",
            result.error.unwrap_or_else(|| "unknown reason".to_string())
        );
    }
    println!("Queued {}", result.operation_id);
    if let (Some(priority), Some(position)) = (result.priority, result.queue_position) {
        println!("  Tier: {}", priority);
        println!("  Position: {}", position);
    }

    Ok(())
}

async fn cmd_drain(engine: &SyncEngine) -> Result<()> {
    let report = engine.drain_all().await?;

    println!("Committed locally: {}", report.committed.len());
    for id in &report.committed {
        println!("  {}", id);
    }
    if report.retryable > 0 {
        println!("Waiting for connectivity: {}", report.retryable);
    }
    if report.failed > 0 {
        println!("Dead-lettered: {}", report.failed);
    }

    Ok(())
}

async fn cmd_dead_letters(engine: &SyncEngine) -> Result<()> {
    let dead = engine.store().dead_letters().await;

    if dead.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }
    for entry in dead {
        println!(
            "{}  {} {}  {}",
            entry.operation.id,
            entry.operation.kind,
            entry.operation.entity,
            entry.dead_lettered_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("    {}", entry.reason);
    }

    Ok(())
}

async fn cmd_requeue(engine: &SyncEngine, id: &str) -> Result<()> {
    let id = OperationId::new(id).context("Invalid operation id")?;
    let receipt = engine
        .requeue_dead_letter(&id)
        .await
        .context("Failed to requeue")?;

    println!("Requeued {} into {}", receipt.operation_id, receipt.priority);

    Ok(())
}

async fn cmd_purge(engine: &SyncEngine) -> Result<()> {
    let purged = engine
        .purge_dead_letters()
        .await
        .context("Failed to purge dead letters")?;

    println!("Purged {} dead letters.", purged.len());

    Ok(())
}

fn cmd_quarantine(engine: &SyncEngine) -> Result<()> {
    let entries = engine.validator().quarantined();

    if entries.is_empty() {
        println!("Nothing quarantined.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  since {}",
            entry.entity,
            entry.since.format("%Y-%m-%d %H:%M:%S")
        );
        println!("    {}", entry.reason);
    }

    Ok(())
}

async fn cmd_release(engine: &SyncEngine, entity: &str) -> Result<()> {
    let entity = parse_entity(entity)?;

    if engine.release_quarantine(&entity).await? {
        println!("Released {}", entity);
    } else {
        println!("{} was not quarantined.", entity);
    }

    Ok(())
}

async fn cmd_conflicts(engine: &SyncEngine) -> Result<()> {
    let conflicts = engine.conflicts().await;

    if conflicts.is_empty() {
        println!("No open conflicts.");
        return Ok(());
    }
    for conflict in conflicts {
        println!("{}", conflict.key);
        println!("  local:  {}", conflict.local.value);
        println!("  remote: {}", conflict.remote.value);
    }

    Ok(())
}

async fn cmd_backup(engine: &SyncEngine, reason: &str) -> Result<()> {
    let info = engine.backup(reason).await.context("Failed to create backup")?;

    println!("Backup created: {}", info.id);
    println!("  Size: {} bytes", info.size);
    println!("  Location: {}", info.path.display());

    Ok(())
}

async fn cmd_backups(engine: &SyncEngine) -> Result<()> {
    let backups = engine.backups().await?;

    if backups.is_empty() {
        println!("No backups.");
        return Ok(());
    }
    for info in backups {
        println!(
            "{}  {}  {:>8} bytes  {}",
            info.id,
            info.timestamp.format("%Y-%m-%d %H:%M:%S"),
            info.size,
            info.reason
        );
    }

    Ok(())
}

async fn cmd_restore(engine: &SyncEngine, id: &str) -> Result<()> {
    let safety = engine
        .restore(id)
        .await
        .with_context(|| format!("Failed to restore backup {}", id))?;

    println!("Restored backup {}", id);
    println!("  Previous state saved as {}", safety.id);

    Ok(())
}

async fn cmd_audit(engine: &SyncEngine, limit: Option<usize>) -> Result<()> {
    let records = engine.store().audit_records().await;
    let skip = limit.map_or(0, |n| records.len().saturating_sub(n));

    for record in records.iter().skip(skip) {
        println!(
            "{}  {:<16} {}{}",
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", record.outcome),
            record.operation_id,
            record
                .detail
                .as_deref()
                .map(|d| format!("  ({})", d))
                .unwrap_or_default()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity() {
        let key = parse_entity("assessment/42").unwrap();
        assert_eq!(key, EntityKey::new("assessment", "42"));
        assert!(parse_entity("assessment").is_err());
        assert!(parse_entity("/42").is_err());
    }

    #[test]
    fn test_cli_parses_enqueue() {
        let cli = Cli::try_parse_from([
            "driftsync",
            "enqueue",
            "--entity",
            "note/1",
            "--payload",
            "{\"text\":\"hi\"}",
            "--safety",
            "--depends-on",
            "op-1",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue {
                safety, depends_on, ..
            } => {
                assert!(safety);
                assert_eq!(depends_on, vec!["op-1".to_string()]);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[tokio::test]
    async fn test_config_is_created_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().join("device");
        let first = load_config(&data_dir).await.unwrap();
        let second = load_config(&data_dir).await.unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert!(data_dir.join("config.json").exists());
    }
}
