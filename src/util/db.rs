use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::Result;
use crate::util::env::{env_flag, env_opt};

pub const DEFAULT_MIGRATIONS_DIR: &str = "./migrations";

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        // Default off; enable explicitly with AUTO_MIGRATE=1/true/on.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool, &migrations_dir()).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    /// Applies numbered `NNNN_name.sql` files not yet recorded in the tracking table.
    pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            info!(dir = %dir.display(), "no migrations directory; nothing to apply");
            return Ok(0);
        }
        // raw_sql keeps these off prepared statements under PgBouncer
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _totd_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;

        let mut applied: HashSet<i64> = HashSet::new();
        for r in sqlx::raw_sql("SELECT version FROM _totd_migrations")
            .fetch_all(pool)
            .await?
        {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut count = 0;
        for m in migration_files(dir)? {
            if !applied.insert(m.version) {
                continue;
            }
            let sql = std::fs::read_to_string(&m.path)?;
            info!(version = m.version, file = ?m.path, "applying migration");
            sqlx::raw_sql(sql.trim()).execute(pool).await?;

            let insert_stmt = format!(
                "INSERT INTO _totd_migrations(version, description) VALUES ({}, '{}')",
                m.version,
                m.description.replace('\'', "''")
            );
            sqlx::raw_sql(&insert_stmt).execute(pool).await?;
            count += 1;
        }
        info!(applied = count, "migrations up-to-date");
        Ok(count)
    }
}

pub fn migrations_dir() -> PathBuf {
    env_opt("MIGRATIONS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    pub description: String,
    pub path: PathBuf,
}

/// Numbered `.sql` files in version order. Anything else in the directory is ignored.
pub fn migration_files(dir: &Path) -> Result<Vec<MigrationFile>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(stem) = fname.strip_suffix(".sql") else {
            continue;
        };
        let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
        let Some(rest) = stem[digits.len()..].strip_prefix('_') else {
            continue;
        };
        if let Ok(version) = digits.parse::<i64>() {
            out.push(MigrationFile {
                version,
                description: rest.to_string(),
                path: path.clone(),
            });
        }
    }
    out.sort_by_key(|m| m.version);
    Ok(out)
}
