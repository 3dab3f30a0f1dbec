use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{middleware::from_fn_with_state, routing::get, Router};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use redis::aio::ConnectionManager;

use livetraffic::metrics::CycleTimings;
use livetraffic::middleware::{record_digest, DigestRecorder};
use livetraffic::persister::{PersistKind, Persister};
use livetraffic::server::{self, Dashboard};
use livetraffic::store::{Store, DEFAULT_RANDMAX, DEFAULT_TTL_SECS};
use livetraffic::transport::{PublishQueue, Publisher, Subscriber, REPORT_TOPIC};
use livetraffic::{Config, Orchestrator, Signal};

#[derive(Debug, Parser)]
#[command(name = "livetraffic")]
#[command(about = "Rolling-window statistics over live HTTP request digests", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Redis server used for pub/sub and persistence
    #[arg(long, global = true, default_value = "redis://127.0.0.1:6379/")]
    redis: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute statistics every period and print them as JSON lines
    Top {
        /// Seconds between two compute cycles
        #[arg(long, default_value_t = 10)]
        period: u64,

        /// Seconds of history to keep
        #[arg(long, default_value_t = 300)]
        duration: i64,

        /// Tenant of the default slice (empty for all tenants)
        #[arg(long, default_value = "")]
        tenant: String,

        /// Also keep one slice per tenant seen
        #[arg(long)]
        multiplex: bool,

        /// Only replay persisted data, do not subscribe
        #[arg(long)]
        read_only: bool,

        /// Loader to resurrect from before going live (redis_http, redis_stats)
        #[arg(long = "reload")]
        reload: Vec<String>,

        /// Number of slow requests to report
        #[arg(long, default_value_t = 10)]
        slow: usize,

        /// Serve the dashboard on this address
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Persist digests or aggregates so `top --reload` can resurrect them
    Persist {
        #[arg(long, value_enum, default_value_t = Kind::Http)]
        kind: Kind,

        /// Seconds before persisted items expire
        #[arg(long, default_value_t = DEFAULT_TTL_SECS)]
        ttl: u64,

        /// Upper bound of the random key suffix
        #[arg(long, default_value_t = DEFAULT_RANDMAX)]
        randmax: u32,
    },

    /// Serve a small instrumented app publishing a digest per request
    Demo {
        #[arg(long, default_value = "0.0.0.0:3000")]
        listen: SocketAddr,

        /// Tenant id attached to every digest
        #[arg(long, default_value = "")]
        tenant: String,

        /// Cookie identifying a visitor
        #[arg(long)]
        cookie: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Http,
    Stats,
}

impl From<Kind> for PersistKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Http => PersistKind::Http,
            Kind::Stats => PersistKind::Stats,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" },
    ))
    .init();

    match cli.command {
        Command::Top {
            period,
            duration,
            tenant,
            multiplex,
            read_only,
            reload,
            slow,
            listen,
        } => {
            let config = Config {
                period: Duration::from_secs(period),
                window_secs: duration,
                multiplex,
                default_tenant: tenant,
                read_only,
                loaders: reload,
                slow_requests: slow,
            };
            top(&cli.redis, config, listen).await
        }
        Command::Persist { kind, ttl, randmax } => {
            persist(&cli.redis, kind.into(), ttl, randmax).await
        }
        Command::Demo {
            listen,
            tenant,
            cookie,
        } => demo(&cli.redis, listen, &tenant, cookie.as_deref()).await,
    }
}

/// Spawns the single publisher task and returns the queue feeding it.
async fn publish_queue(client: &redis::Client) -> Result<PublishQueue> {
    let conn = ConnectionManager::new(client.clone())
        .await
        .context("cannot connect to redis")?;
    let (queue, rx) = PublishQueue::new();
    Publisher::spawn(conn, rx);
    Ok(queue)
}

async fn top(url: &str, config: Config, listen: Option<SocketAddr>) -> Result<()> {
    let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
    let read_only = config.read_only;
    let needs_store = !config.loaders.is_empty();

    let sink = if read_only {
        None
    } else {
        Some(publish_queue(&client).await?)
    };

    let timings = Arc::new(CycleTimings::new());
    let mut orchestrator = Orchestrator::new(config, sink)?.with_timings(Arc::clone(&timings));

    if needs_store {
        let mut store = Store::connect(url).await?;
        orchestrator.resurrect(&mut store).await?;
    }
    if !read_only {
        let subscriber = Subscriber::redis(&client, REPORT_TOPIC).await?;
        orchestrator = orchestrator.with_subscriber(subscriber);
    }

    let dashboard = Arc::new(Dashboard::new(timings));
    if let Some(addr) = listen {
        let app = server::create_router(Arc::clone(&dashboard));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind dashboard to {addr}"))?;
        info!("dashboard on http://{addr}/api/report");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("dashboard stopped: {e}");
            }
        });
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping after this cycle");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    orchestrator
        .run(|report| {
            match serde_json::to_string(report) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("cannot encode report: {e}"),
            }
            dashboard.publish(report);
            if stop.load(Ordering::SeqCst) {
                Signal::Kill
            } else {
                Signal::Continue
            }
        })
        .await?;
    Ok(())
}

async fn persist(url: &str, kind: PersistKind, ttl: u64, randmax: u32) -> Result<()> {
    let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
    let mut subscriber = Subscriber::redis(&client, kind.topic()).await?;
    let mut store = Store::connect(url).await?;
    let mut persister = Persister::new(kind, ttl, randmax);

    let stored = persister
        .run(&mut subscriber, &mut store, |_, _| Signal::Continue)
        .await?;
    info!("persisted {stored} items");
    Ok(())
}

async fn demo(url: &str, listen: SocketAddr, tenant: &str, cookie: Option<&str>) -> Result<()> {
    let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
    let queue = publish_queue(&client).await?;
    let recorder = DigestRecorder::new(queue, tenant, cookie);

    let app = Router::new()
        .route("/", get(|| async { "hello" }))
        .route("/slow", get(slow))
        .layer(from_fn_with_state(recorder, record_digest));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot bind to {listen}"))?;
    info!("demo app on http://{listen}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn slow() -> &'static str {
    let ms = rand::random::<u64>() % 500;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "done"
}
