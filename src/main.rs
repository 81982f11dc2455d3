use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use redis::aio::ConnectionManager;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use logtrail::api;
use logtrail::config::Config;
use logtrail::consumer::IngestConsumer;
use logtrail::error_counts::RedisErrorCounters;
use logtrail::es_index::EsIndex;
use logtrail::kafka::KafkaSource;
use logtrail::query::QueryService;
use logtrail::recent::RedisRecencyBuffer;
use logtrail::store::Stores;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Consume,
    Serve,
    All,
}

impl Mode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "consume" => Some(Mode::Consume),
            "serve" => Some(Mode::Serve),
            "all" => Some(Mode::All),
            _ => None,
        }
    }

    fn consumes(self) -> bool {
        matches!(self, Mode::Consume | Mode::All)
    }

    fn serves(self) -> bool {
        matches!(self, Mode::Serve | Mode::All)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let (mode, cfg_path) = parse_args(std::env::args().skip(1));
    let cfg = Config::load(cfg_path)?;
    info!(?mode, "starting logtrail with config {:?}", redacted(&cfg));

    let stores = create_stores(&cfg).await?;
    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    if mode.consumes() {
        let consumer = IngestConsumer::new(stores.clone(), cfg.consumer_options());
        consumer.prepare().await?;
        let source = KafkaSource::connect(&cfg.kafka()).await?;
        let token = shutdown.clone();
        tasks.spawn(async move {
            consumer.run(source, token).await;
            ("consumer", Ok(()))
        });
    }

    if mode.serves() {
        let service = Arc::new(QueryService::new(stores.clone(), cfg.query_limits()));
        let addr = cfg.listen_addr;
        let token = shutdown.clone();
        tasks.spawn(async move { ("query api", api::serve(addr, service, token).await) });
    }

    let watcher = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(err) => error!("listening for shutdown signal failed: {err}"),
        }
        watcher.cancel();
    });

    let mut failed = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(task = name, "task finished"),
            Ok((name, Err(err))) => {
                error!(task = name, "task failed: {err:#}");
                failed = true;
            }
            Err(err) => {
                error!("task panicked: {err}");
                failed = true;
            }
        }
        // One component stopping takes the process down with it.
        shutdown.cancel();
    }

    if failed {
        anyhow::bail!("logtrail stopped with errors");
    }
    Ok(())
}

/// `[consume|serve|all] [config.toml]`; the mode defaults to `all`.
fn parse_args(mut args: impl Iterator<Item = String>) -> (Mode, Option<PathBuf>) {
    let Some(first) = args.next() else {
        return (Mode::All, None);
    };
    match Mode::parse(&first) {
        Some(mode) => (mode, args.next().map(PathBuf::from)),
        None => (Mode::All, Some(PathBuf::from(first))),
    }
}

fn redacted(cfg: &Config) -> Config {
    let mut shown = cfg.clone();
    if !shown.es_pass.is_empty() {
        shown.es_pass = "***".into();
    }
    shown
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();
}

async fn create_stores(cfg: &Config) -> Result<Stores> {
    let index = EsIndex::new(
        cfg.es_url.clone(),
        cfg.es_user.clone(),
        cfg.es_pass.clone(),
        cfg.http_timeout(),
        cfg.index_name.clone(),
    )?;

    let client = redis::Client::open(&*cfg.redis_url)
        .with_context(|| format!("invalid redis url {}", cfg.redis_url))?;
    let conn = ConnectionManager::new(client)
        .await
        .with_context(|| format!("connecting to redis at {}", cfg.redis_url))?;
    info!(url = %cfg.redis_url, "redis connected");

    Ok(Stores::new(
        Arc::new(index),
        Arc::new(RedisRecencyBuffer::new(
            conn.clone(),
            cfg.latest_key.clone(),
            cfg.latest_capacity,
        )),
        Arc::new(RedisErrorCounters::new(
            conn,
            cfg.error_key_prefix.clone(),
            cfg.error_ttl(),
        )),
    ))
}
