//! keymend - repair documents stored under legacy prefixed keys
//!
//! Enumerates legacy ids through the query service (or an ids file),
//! resolves the bucket's vbucket map and migrates each document.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use colored::Colorize;
use tracing::info;

use keymend::codec::{KeyVariant, LegacyConvention};
use keymend::config::{Config, LogFormat, DEFAULT_KV_TLS_PORT};
use keymend::connection::KvConnector;
use keymend::index::{DocumentIndex, QueryServiceIndex, StaticIndex};
use keymend::migration::{
    add_test_document, MigrationEngine, MigrationError, MigrationOptions, RunSummary,
};
use keymend::node::AddOutcome;
use keymend::topology::TopologyResolver;

/// keymend - repair documents stored under legacy prefixed keys
#[derive(Parser, Debug)]
#[command(name = "keymend")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bucket to repair
    #[arg(short = 'b', long, env = "KEYMEND_BUCKET")]
    bucket: Option<String>,

    #[arg(short = 'u', long, env = "KEYMEND_USERNAME")]
    username: Option<String>,

    #[arg(short = 'p', long, env = "KEYMEND_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// KV node hostname
    #[arg(long, env = "KEYMEND_HOST")]
    host: Option<String>,

    /// KV node port (11210, or 11207 for TLS)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Encrypt every connection
    #[arg(long, action = ArgAction::SetTrue)]
    tls: bool,

    /// Extra CA certificate (PEM) for TLS
    #[arg(long, value_name = "FILE")]
    tls_ca_file: Option<PathBuf>,

    /// Accept any server certificate
    #[arg(long, action = ArgAction::SetTrue)]
    tls_no_verify: bool,

    /// Collection id of the legacy prefix (0-31)
    #[arg(long)]
    cid: Option<u32>,

    /// How the legacy ids were written
    #[arg(long, value_enum)]
    convention: Option<ConventionArg>,

    /// Key shapes whose vbuckets are probed (repeatable)
    #[arg(long = "probe", value_enum, action = ArgAction::Append)]
    probe: Vec<ProbeArg>,

    /// Search all vbuckets
    #[arg(long, action = ArgAction::SetTrue)]
    search_all_vbs: bool,

    /// Log each candidate's extended attributes
    #[arg(long, action = ArgAction::SetTrue)]
    print_xattrs: bool,

    /// Add docs removing the legacy key prefix
    #[arg(long, action = ArgAction::SetTrue)]
    restore: bool,

    /// Delete docs with the legacy key prefix
    #[arg(long, action = ArgAction::SetTrue)]
    delete: bool,

    /// Add a test doc with the legacy key prefix, then exit
    #[arg(long, value_name = "DOC_ID")]
    add_test_doc: Option<String>,

    /// Migrate the ids in this file instead of querying the index
    #[arg(long, value_name = "FILE")]
    ids_file: Option<PathBuf>,

    /// Documents processed concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Query service URL
    #[arg(long, value_name = "URL")]
    query_url: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'l', long, env = "KEYMEND_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ConventionArg {
    /// Collection-id varint prefix in a collection-aware bucket
    CollectionPrefix,
    /// Single null byte prefix in a bucket without collections
    NullPrefix,
}

impl From<ConventionArg> for LegacyConvention {
    fn from(arg: ConventionArg) -> Self {
        match arg {
            ConventionArg::CollectionPrefix => LegacyConvention::CollectionPrefix,
            ConventionArg::NullPrefix => LegacyConvention::NullPrefix,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProbeArg {
    AsGiven,
    Stripped,
    NullPrefixed,
}

impl From<ProbeArg> for KeyVariant {
    fn from(arg: ProbeArg) -> Self {
        match arg {
            ProbeArg::AsGiven => KeyVariant::AsGiven,
            ProbeArg::Stripped => KeyVariant::Stripped,
            ProbeArg::NullPrefixed => KeyVariant::NullPrefixed,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Config file (if any) with CLI overrides applied, validated
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let cluster = &mut config.cluster;
    if let Some(bucket) = &cli.bucket {
        cluster.bucket = bucket.clone();
    }
    if let Some(username) = &cli.username {
        cluster.username = username.clone();
    }
    if let Some(password) = &cli.password {
        cluster.password = password.clone();
    }
    if let Some(host) = &cli.host {
        cluster.host = host.clone();
    }
    if cli.tls {
        cluster.tls = true;
        if cli.port.is_none() && cluster.port == keymend::config::DEFAULT_KV_PORT {
            cluster.port = DEFAULT_KV_TLS_PORT;
        }
    }
    if let Some(port) = cli.port {
        cluster.port = port;
    }
    if let Some(ca_file) = &cli.tls_ca_file {
        cluster.tls_ca_file = Some(ca_file.clone());
    }
    if cli.tls_no_verify {
        cluster.tls_verify = false;
    }
    if let Some(url) = &cli.query_url {
        cluster.query_url = Some(url.clone());
    }

    let migration = &mut config.migration;
    if let Some(cid) = cli.cid {
        migration.collection_id = cid;
    }
    if let Some(convention) = cli.convention {
        migration.convention = convention.into();
    }
    if !cli.probe.is_empty() {
        migration.probe_variants = cli.probe.iter().map(|&p| p.into()).collect();
    }
    migration.search_all_vbuckets |= cli.search_all_vbs;
    migration.print_xattrs |= cli.print_xattrs;
    migration.restore |= cli.restore;
    migration.delete |= cli.delete;
    if let Some(workers) = cli.workers {
        migration.workers = workers;
    }

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging
fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let shape = config.key_shape()?;
    let options = MigrationOptions::from_config(config)?;

    // The index is read before any KV connection is opened, so a query
    // failure can never leave work half done.
    let ids = if cli.add_test_doc.is_some() {
        Vec::new()
    } else {
        let index: Box<dyn DocumentIndex> = match &cli.ids_file {
            Some(path) => Box::new(StaticIndex::from_file(path)?),
            None => Box::new(QueryServiceIndex::new(
                config.cluster.query_url(),
                &config.cluster.bucket,
                &config.cluster.username,
                &config.cluster.password,
                config.cluster.tls_verify,
                Duration::from_millis(config.cluster.request_timeout_ms),
            )?),
        };
        let ids = index.query(&shape.index_pattern()).await?;
        println!(
            "{} Indexed {} {} doc ids",
            "→".cyan().bold(),
            ids.len().to_string().yellow(),
            shape.convention()
        );
        ids
    };

    let connector = KvConnector::new(config.connection_config()?)?;
    let resolver = TopologyResolver::new(connector)
        .with_seed_port_for_all(config.cluster.tls, config.cluster.port);
    let topology = Arc::new(
        resolver
            .resolve(&config.cluster.host, config.cluster.port)
            .await?,
    );

    if let Some(plain_id) = &cli.add_test_doc {
        let result = tokio::select! {
            r = add_test_document(&topology, &shape, plain_id.as_bytes()) => r.map_err(anyhow::Error::from),
            _ = tokio::signal::ctrl_c() => Err(MigrationError::Interrupted.into()),
        };
        topology.close().await;
        for write in result? {
            let status = match write.outcome {
                AddOutcome::Created { .. } => "added".green(),
                AddOutcome::AlreadyExists => "already exists".yellow(),
            };
            println!("  test doc vb {:>4}  {}", write.vbucket, status);
        }
        return Ok(());
    }

    let engine = MigrationEngine::new(Arc::clone(&topology), options);
    let result = tokio::select! {
        r = engine.run(ids) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, closing connections");
            Err(MigrationError::Interrupted)
        }
    };
    topology.close().await;

    print_summary(&engine.summary());
    result.map(|_| ()).map_err(Into::into)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "──────────────────────────────────────────".dimmed());
    println!("  Not found      {}", summary.not_found.to_string().yellow());
    println!("  Already exist  {}", summary.already_exist.to_string().cyan());
    println!("  Added          {}", summary.added.to_string().green());
    println!("  Deleted        {}", summary.deleted.to_string().green());
    if summary.delete_failed > 0 {
        println!("  Delete failed  {}", summary.delete_failed.to_string().red());
    }
    if summary.skipped > 0 {
        println!("  Skipped        {}", summary.skipped.to_string().yellow());
    }
    if summary.failed > 0 {
        println!("  Failed         {}", summary.failed.to_string().red().bold());
        for id in &summary.failed_ids {
            println!("    {}", id);
        }
    }
}
