//! `kyc`: operator tool for the verification store.
//!
//! Reads `config.toml` (or the path given with `--config`), overlaid with
//! `KYC__*` environment variables, and opens the SQLite store it names.
//!
//! # Usage
//!
//! ```text
//! kyc sessions show 6f1c...
//! kyc sessions sweep
//! kyc images purge
//! kyc sagas list --status partially_rolled_back
//! kyc idempotency purge
//! kyc config check
//! ```

use std::{
  path::{Path, PathBuf},
  str::FromStr,
};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use kyc_core::{
  clock::{Clock, SystemClock},
  config::VerificationConfig,
  saga::SagaStatus,
  score::ScoreCalculator,
  store::{IdempotencyStore, SagaStore, SessionStore},
};
use kyc_engine::{SessionView, maintenance};
use kyc_store_sqlite::SqliteStore;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kyc", version, about = "Operator tool for the KYC verification store")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Inspect and maintain verification sessions.
  #[command(subcommand)]
  Sessions(SessionCommand),
  /// Maintain captured document and selfie images.
  #[command(subcommand)]
  Images(ImageCommand),
  /// Inspect provisioning sagas.
  #[command(subcommand)]
  Sagas(SagaCommand),
  /// Maintain idempotency records.
  #[command(subcommand)]
  Idempotency(IdempotencyCommand),
  /// Validate the effective configuration and print it.
  #[command(subcommand)]
  Config(ConfigCommand),
}

#[derive(Subcommand)]
enum SessionCommand {
  /// Print a session as a client would see it now.
  Show { session_id: Uuid },
  /// Recompute a session's overall score from its stored sub-scores.
  Rescore { session_id: Uuid },
  /// Persist `expired` for every stale session.
  Sweep,
}

#[derive(Subcommand)]
enum ImageCommand {
  /// Delete images of finished sessions older than `image_retention_hours`.
  Purge,
}

#[derive(Subcommand)]
enum SagaCommand {
  /// List sagas, optionally filtered by status.
  List {
    #[arg(long, value_parser = SagaStatus::from_str)]
    status: Option<SagaStatus>,
  },
  Show { correlation_id: Uuid },
}

#[derive(Subcommand)]
enum IdempotencyCommand {
  /// Delete records past their expiry.
  Purge,
}

#[derive(Subcommand)]
enum ConfigCommand {
  Check,
}

// ─── Config file ─────────────────────────────────────────────────────────────

/// Shape of `config.toml`.
#[derive(Deserialize)]
struct AppConfig {
  store_path:   PathBuf,
  #[serde(default)]
  verification: VerificationConfig,
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config.as_path()).required(false))
    .add_source(
      config::Environment::with_prefix("KYC")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;
  let app: AppConfig = settings
    .try_deserialize()
    .context("failed to deserialise configuration")?;
  app
    .verification
    .validate()
    .context("invalid verification configuration")?;

  let now = SystemClock.now();

  match cli.command {
    Command::Config(ConfigCommand::Check) => print_json(&app.verification)?,
    Command::Sessions(SessionCommand::Show { session_id }) => {
      let store = open_store(&app).await?;
      let session = load_session(&store, session_id).await?;
      print_json(&SessionView::at(session, now))?;
    }
    Command::Sessions(SessionCommand::Rescore { session_id }) => {
      let store = open_store(&app).await?;
      let session = load_session(&store, session_id).await?;
      let score =
        ScoreCalculator::new(app.verification.score_weights).score_session(&session);
      println!("stored {:.2}  recomputed {score:.2}", session.overall_score);
    }
    Command::Sessions(SessionCommand::Sweep) => {
      let store = open_store(&app).await?;
      let expired = maintenance::sweep_expired(&store, now).await?;
      println!("expired {expired} session(s)");
    }
    Command::Images(ImageCommand::Purge) => {
      let store = open_store(&app).await?;
      let purged = maintenance::purge_images(&store, &app.verification, now).await?;
      println!("purged {purged} image(s)");
    }
    Command::Sagas(SagaCommand::List { status }) => {
      let store = open_store(&app).await?;
      for saga in store.list_sagas(status).await? {
        println!(
          "{}  {:<22}  session {}  step {}/{}  {}",
          saga.correlation_id,
          saga.status(),
          saga.session_id,
          saga.current_step(),
          saga.total_steps(),
          saga.error().unwrap_or(""),
        );
      }
    }
    Command::Sagas(SagaCommand::Show { correlation_id }) => {
      let store = open_store(&app).await?;
      let Some(saga) = store.get_saga(correlation_id).await? else {
        bail!("saga {correlation_id} not found");
      };
      print_json(&saga)?;
    }
    Command::Idempotency(IdempotencyCommand::Purge) => {
      let store = open_store(&app).await?;
      let purged = store.purge_expired(now).await?;
      println!("purged {purged} record(s)");
    }
  }

  Ok(())
}

async fn open_store(app: &AppConfig) -> Result<SqliteStore> {
  let store_path = expand_tilde(&app.store_path);
  SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))
}

async fn load_session(
  store: &SqliteStore,
  session_id: Uuid,
) -> Result<kyc_core::session::VerificationSession> {
  store
    .get_session(session_id)
    .await?
    .with_context(|| format!("session {session_id} not found"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
