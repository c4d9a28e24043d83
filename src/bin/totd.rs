use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info, warn};

use totd_sync::database_ops::{import_players, MemoryStore, PgStore, TotdStore};
use totd_sync::logging::{init_tracing, DEFAULT_FILTER};
use totd_sync::nadeo::NadeoUpstream;
use totd_sync::util::db::{migration_files, migrations_dir, Db};
use totd_sync::util::env as env_util;
use totd_sync::{NadeoConfig, SyncConfig, SyncEngine, SyncError};

#[derive(Parser, Debug)]
#[command(name = "totd", version, about = "Track of the Day ingestion pipeline")]
struct Cli {
    /// Run against an in-memory store; nothing is written to the database
    #[arg(long = "dry-run", global = true, action = ArgAction::SetTrue)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest TOTD maps month by month, newest first
    FetchMaps {
        /// Months of history to walk (default TOTD_MONTHS_BACK)
        #[arg(long)]
        months: Option<u32>,
    },
    /// Refresh author-medal leaderboards for the stalest maps
    RefreshLeaderboards {
        /// Maps to refresh this run (default TOTD_REFRESH_LIMIT)
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
        limit: Option<i64>,
    },
    /// Re-crawl every map for specific players and rewrite their counts
    RecheckPlayers(RecheckArgs),
    /// Load a `{displayName: accountId}` JSON dump into players
    ImportPlayers {
        #[arg(long)]
        file: PathBuf,
    },
    /// Apply pending SQL migrations
    Migrate,
}

#[derive(Args, Debug)]
struct RecheckArgs {
    /// Account id to recheck (repeatable)
    #[arg(long = "player")]
    players: Vec<String>,
    /// File with one account id per line; `#` starts a comment
    #[arg(long = "players-file")]
    players_file: Option<PathBuf>,
}

enum Backend {
    Memory(MemoryStore),
    Postgres(PgStore),
}

impl Backend {
    async fn open(dry_run: bool) -> Result<Self> {
        if dry_run {
            warn!("dry run: using in-memory store");
            return Ok(Self::Memory(MemoryStore::new()));
        }
        let url = env_util::db_url()?;
        let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 5u32);
        let db = Db::connect(&url, max_conns)
            .await
            .context("failed to connect to database")?;
        Ok(Self::Postgres(PgStore::new(db)))
    }

    fn store(&self) -> &dyn TotdStore {
        match self {
            Self::Memory(s) => s,
            Self::Postgres(s) => s,
        }
    }
}

fn read_player_ids(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading players file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn upstream_from_env() -> Result<(NadeoUpstream, SyncConfig)> {
    env_util::preflight_check(
        "totd",
        &[],
        &[
            "NADEO_SERVER_USERNAME",
            "NADEO_UBI_EMAIL",
            "NADEO_USER_AGENT",
            "NADEO_LIVE_API_BASE",
            "NADEO_CORE_API_BASE",
            "NADEO_REQUEST_DELAY_MS",
            "NADEO_MAX_RETRIES",
            "DATABASE_URL",
        ],
    )?;
    let nadeo = NadeoConfig::from_env()?;
    let sync = SyncConfig::from_env();
    let upstream = NadeoUpstream::from_config(&nadeo, sync.recheck_batch)?;
    info!(mode = ?upstream.auth_mode(), "upstream client ready");
    Ok((upstream, sync))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::FetchMaps { months } => {
            let (upstream, sync) = upstream_from_env()?;
            let backend = Backend::open(cli.dry_run).await?;
            let summary = SyncEngine::new(&upstream, backend.store(), sync)
                .ingest_maps(months)
                .await?;
            info!(?summary, "fetch-maps finished");
        }
        Command::RefreshLeaderboards { limit } => {
            let (upstream, sync) = upstream_from_env()?;
            let backend = Backend::open(cli.dry_run).await?;
            let summary = SyncEngine::new(&upstream, backend.store(), sync)
                .refresh_leaderboards(limit)
                .await?;
            info!(?summary, "refresh-leaderboards finished");
        }
        Command::RecheckPlayers(args) => {
            let mut ids = args.players;
            if let Some(path) = args.players_file.as_deref() {
                ids.extend(read_player_ids(path)?);
            }
            if ids.is_empty() {
                anyhow::bail!("recheck-players needs --player or --players-file");
            }
            let (upstream, sync) = upstream_from_env()?;
            let backend = Backend::open(cli.dry_run).await?;
            let summary = SyncEngine::new(&upstream, backend.store(), sync)
                .recheck_players(&ids)
                .await?;
            info!(?summary, "recheck-players finished");
        }
        Command::ImportPlayers { file } => {
            let backend = Backend::open(cli.dry_run).await?;
            let inserted = import_players(backend.store(), &file).await?;
            info!(inserted, "import-players finished");
        }
        Command::Migrate => {
            let dir = migrations_dir();
            if cli.dry_run {
                for m in migration_files(&dir)? {
                    info!(version = m.version, file = ?m.path, "would apply");
                }
                return Ok(());
            }
            let url = env_util::db_url()?;
            let db = Db::connect(&url, 1)
                .await
                .context("failed to connect to database")?;
            let applied = Db::run_migrations(&db.pool, &dir).await?;
            info!(applied, "migrate finished");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<SyncError>() {
            Some(se) if se.is_fatal() => error!(error = %se, "run aborted"),
            _ => {
                let chain = format!("{e:#}");
                error!(error = %chain, "run failed");
            }
        }
        return Err(e);
    }
    Ok(())
}
