//! CLI parsing and worker configuration, following the teacher's
//! `Config::from_env` layering convention: CLI flags win, then environment,
//! then hard defaults.

use std::env;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;

/// Which queue this worker instance drains. Exactly one is selected by the
/// caller; mutual exclusion is enforced in [`Cli::parse_args`], not by clap's
/// arg groups, so that `-?` can be intercepted ahead of derive-based parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Event,
    Work,
}

/// Raw CLI surface. `-?` is handled outside of clap (see [`Cli::parse_args`])
/// because clap reserves `-h`/`--help` and a literal `-?` short flag cannot be
/// declared without colliding with clap's own help machinery.
#[derive(Parser, Debug)]
#[command(name = "queue-worker", disable_help_flag = true, disable_version_flag = true)]
pub struct Cli {
    #[arg(short = 'U', long = "user")]
    pub user: Option<String>,

    #[arg(short = 'h', long = "host")]
    pub host: Option<String>,

    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    #[arg(short = 'd', long = "dbname")]
    pub dbname: Option<String>,

    #[arg(short = 'E')]
    pub event_mode: bool,

    #[arg(short = 'W')]
    pub work_mode: bool,

    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

impl Cli {
    /// Parse `argv`, intercepting the bare `-?` usage flag before handing off
    /// to clap (clap cannot represent a short flag named `?`).
    pub fn parse_args(args: &[String]) -> Result<Self, CliError> {
        if args.iter().any(|a| a == "-?") {
            return Err(CliError::UsageRequested);
        }
        Cli::try_parse_from(std::iter::once(&"queue-worker".to_string()).chain(args.iter()))
            .map_err(|e| CliError::Invalid(e.to_string()))
    }
}

/// CLI-level failures, all of which the Supervisor turns into a usage message
/// and a non-zero exit, per spec section 6.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("usage requested")]
    UsageRequested,

    #[error("{0}")]
    Invalid(String),
}

pub const USAGE: &str = "\
usage: queue-worker -U user -h host -p port -d dbname (-E | -W)
       queue-worker -v
       queue-worker -?

  -U user    database user (default: postgres)
  -h host    database host (default: localhost)
  -p port    database port (default: 5432)
  -d dbname  database name (default: same as user)
  -E         run the event queue processor
  -W         run the work queue processor
  -v         print version and exit
  -?         print this message and exit";

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub mode: QueueMode,

    /// GUC key naming the SQL function the UID setter invokes
    /// (`set_uid_function` in the original extension's GUC layer).
    pub set_uid_function: String,
    /// Column name the `execute_asynchronously` flag is stored under in
    /// `event_queue`/`work_queue`; the event handler selects and re-inserts
    /// it under this name but never branches on its value (see spec Open
    /// Question 2).
    pub async_guc_name: String,
    /// Name of the optional audit extension (`cyanaudit` upstream) probed at
    /// startup; when present, successful query actions are labelled.
    pub audit_extension: String,
    /// Fully-qualified SQL function the audit hook calls to label the most
    /// recently committed transaction, e.g. `cyanaudit.fn_label_last_transaction`.
    pub audit_label_function: String,
    /// PostgreSQL extension this worker requires to be installed; startup
    /// fails fatally if absent.
    pub required_extension: String,

    pub user_agent: String,
    /// Fallback base URL substituted for the `__BASE_URL__` token in a work
    /// item's URI when `session_values` carries no `base_url` key.
    pub default_base_url: String,
}

impl WorkerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let _ = dotenv();

        if cli.event_mode == cli.work_mode {
            anyhow::bail!("exactly one of -E or -W must be given");
        }
        let mode = if cli.event_mode {
            QueueMode::Event
        } else {
            QueueMode::Work
        };

        let user = cli
            .user
            .clone()
            .or_else(|| env::var("PGUSER").ok())
            .unwrap_or_else(|| "postgres".to_string());
        let host = cli
            .host
            .clone()
            .or_else(|| env::var("PGHOST").ok())
            .unwrap_or_else(|| "localhost".to_string());
        let port = cli.port.or_else(|| {
            env::var("PGPORT").ok().and_then(|v| v.parse().ok())
        }).unwrap_or(5432);
        let dbname = cli
            .dbname
            .clone()
            .or_else(|| env::var("PGDATABASE").ok())
            .unwrap_or_else(|| user.clone());

        Ok(Self {
            user,
            host,
            port,
            dbname,
            mode,
            set_uid_function: env::var("SET_UID_FUNCTION")
                .unwrap_or_else(|_| "set_uid_function".to_string()),
            async_guc_name: env::var("ASYNC_GUC_NAME")
                .unwrap_or_else(|_| "execute_asynchronously".to_string()),
            audit_extension: env::var("AUDIT_EXTENSION")
                .unwrap_or_else(|_| "cyanaudit".to_string()),
            audit_label_function: env::var("AUDIT_LABEL_FUNCTION")
                .unwrap_or_else(|_| "cyanaudit.fn_label_last_transaction".to_string()),
            required_extension: env::var("REQUIRED_EXTENSION")
                .unwrap_or_else(|_| "event_manager".to_string()),
            user_agent: env::var("WORKER_USER_AGENT")
                .unwrap_or_else(|_| "event-manager/1.0".to_string()),
            default_base_url: env::var("DEFAULT_BASE_URL").unwrap_or_default(),
        })
    }

    /// PGPASSWORD is read only from the environment, never a CLI flag, so it
    /// cannot leak through `ps`.
    pub fn password() -> Option<String> {
        env::var("PGPASSWORD").ok()
    }

    pub fn connect_options(&self) -> Result<sqlx::postgres::PgConnectOptions> {
        let mut opts = sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.dbname);
        if let Some(password) = Self::password() {
            opts = opts.password(&password);
        }
        Ok(opts)
    }

    pub fn channel(&self) -> &'static str {
        match self.mode {
            QueueMode::Event => "new_event_queue_item",
            QueueMode::Work => "new_work_queue_item",
        }
    }
}

pub fn load() -> Result<WorkerConfig> {
    let args: Vec<String> = env::args().skip(1).collect();
    match Cli::parse_args(&args) {
        Ok(cli) => {
            if cli.version {
                println!(env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            WorkerConfig::from_cli(&cli).context("invalid configuration")
        }
        Err(CliError::UsageRequested) => {
            println!("{USAGE}");
            std::process::exit(1);
        }
        Err(CliError::Invalid(msg)) => {
            eprintln!("{USAGE}");
            eprintln!("error: {msg}");
            std::process::exit(1);
        }
    }
}
