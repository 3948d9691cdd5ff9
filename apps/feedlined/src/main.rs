mod config;
mod rules;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use feedline_core::{FeedtypeDb, Pattern, ProductClass, ProductSpec, Timestamp};
use feedline_node::cancel::{CancelFlag, CANCEL_POLL};
use feedline_node::config::NodeConfig;
use feedline_node::error::SessionError;
use feedline_node::offer::offer_products;
use feedline_node::persistence::{load_store_snapshot, save_store_snapshot, PersistenceError};
use feedline_node::registry::{MemoryRegistry, SessionRegistry};
use feedline_node::requester::{Requester, TcpConnector};
use feedline_node::requests::RequesterPlan;
use feedline_node::server::{serve_connection, ServerContext};
use feedline_node::store::{MemoryStore, StoreLimits};
use feedline_node::upstream::FeedMode;
use feedline_transport::{PeerLink, TcpLink};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::flag;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::DaemonConfig;
use crate::rules::{Rules, RulesError};

const HOUSEKEEPING_TICK: Duration = Duration::from_millis(250);
const LOG_LEVELS: [&str; 3] = ["info", "debug", "trace"];

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve downstreams and run the configured requests (default)
    Run,
    /// Subscribe to notifications from an upstream and log them
    Notifyme {
        /// Upstream `host[:port]`
        server: String,
        #[command(flatten)]
        selection: Selection,
    },
    /// Offer the stored products matching a class to a downstream, once
    Send {
        /// Downstream `host[:port]`
        server: String,
        #[command(flatten)]
        selection: Selection,
    },
    /// Parse the rule table and print the requester plans
    CheckRules,
}

#[derive(clap::Args, Debug, Clone)]
struct Selection {
    /// Feedtype expression, e.g. `IDS|DDPLUS`
    #[arg(long, short, default_value = "ANY")]
    feedtype: String,
    /// Identifier pattern
    #[arg(long, short, default_value = ".*")]
    pattern: String,
    /// How far back to start, in seconds
    #[arg(long, short, default_value_t = 3600)]
    offset: u64,
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error("bad selection: {0}")]
    Selection(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Reloadable log filter driven by SIGUSR1/SIGUSR2.
struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
    level: usize,
    rotate: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
}

impl LogControl {
    fn init() -> Self {
        let base = std::env::var("FEEDLINE_LOG").unwrap_or_else(|_| "info".to_string());
        let filter = EnvFilter::try_new(&base).unwrap_or_else(|_| EnvFilter::new("info"));
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        Self {
            handle,
            base,
            level: 0,
            rotate: Arc::new(AtomicBool::new(false)),
            reset: Arc::new(AtomicBool::new(false)),
        }
    }

    fn register_signals(&self) {
        let _ = flag::register(SIGUSR2, Arc::clone(&self.rotate));
        let _ = flag::register(SIGUSR1, Arc::clone(&self.reset));
    }

    fn poll(&mut self) {
        if self.rotate.swap(false, Ordering::Relaxed) {
            self.level = (self.level + 1) % LOG_LEVELS.len();
            let level = LOG_LEVELS[self.level];
            match self.handle.reload(EnvFilter::new(level)) {
                Ok(()) => info!("log level now {level}"),
                Err(err) => warn!("couldn't change log level: {err}"),
            }
        }
        if self.reset.swap(false, Ordering::Relaxed) {
            self.level = 0;
            let filter = EnvFilter::try_new(&self.base).unwrap_or_else(|_| EnvFilter::new("info"));
            match self.handle.reload(filter) {
                Ok(()) => info!("log filter reset to {}", self.base),
                Err(err) => warn!("couldn't reset log filter: {err}"),
            }
        }
    }
}

fn store_limits(config: &DaemonConfig) -> StoreLimits {
    StoreLimits {
        max_products: config.max_products,
        max_bytes: config.max_store_bytes,
        max_product_size: config.max_product_size,
    }
}

fn open_store(config: &DaemonConfig, feedtypes: &Arc<FeedtypeDb>) -> MemoryStore {
    let store = MemoryStore::with_feedtypes(store_limits(config), Arc::clone(feedtypes));
    match load_store_snapshot(&config.store_path, &store) {
        Ok(count) => info!("loaded {count} products from {}", config.store_path.display()),
        Err(err) => warn!("starting with an empty store: {err}"),
    }
    store
}

fn snapshot(store: &MemoryStore, path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            error!("snapshot failed: {}: {err}", parent.display());
            return;
        }
    }
    match save_store_snapshot(path, store) {
        Ok(count) => debug!("saved {count} products to {}", path.display()),
        Err(err) => error!("snapshot failed: {err}"),
    }
}

/// Feedtype names from the rule table when it exists, else the built-in table.
fn feedtype_db(config: &DaemonConfig) -> Result<Arc<FeedtypeDb>, DaemonError> {
    if config.rules_path.exists() {
        Ok(rules::load(&config.rules_path)?.feedtypes)
    } else {
        Ok(Arc::new(FeedtypeDb::standard()))
    }
}

fn selection_class(db: &FeedtypeDb, selection: &Selection) -> Result<ProductClass, DaemonError> {
    let feedtype = db
        .parse(&selection.feedtype)
        .map_err(|err| DaemonError::Selection(err.to_string()))?;
    let pattern = Pattern::new(selection.pattern.as_str()).map_err(|err| DaemonError::Selection(err.to_string()))?;
    let from = Timestamp::now().saturating_sub(Duration::from_secs(selection.offset));
    Ok(ProductClass::new(
        from,
        Timestamp::END,
        vec![ProductSpec { feedtype, pattern }],
    ))
}

fn server_address(text: &str) -> Result<(String, u16), DaemonError> {
    rules::split_server(text).ok_or_else(|| DaemonError::Selection(format!("bad server {text:?}")))
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ServerContext<MemoryStore, MemoryRegistry>,
    fatal: mpsc::UnboundedSender<SessionError>,
) {
    while !ctx.shutdown.is_cancelled() {
        let (stream, addr) = match tokio::time::timeout(CANCEL_POLL, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let link = match TcpLink::from_stream(stream, None) {
            Ok(link) => link,
            Err(err) => {
                warn!("dropping connection from {addr}: {err}");
                continue;
            }
        };
        debug!("connection from {}", link.peer());
        let ctx = ctx.clone();
        let fatal = fatal.clone();
        tokio::spawn(async move {
            match serve_connection(link, ctx).await {
                Ok(outcome) => debug!("connection from {addr} ended: {outcome:?}"),
                Err(err) if err.is_process_fatal() => {
                    error!("{err}");
                    let _ = fatal.send(err);
                }
                Err(err) if err.is_routine() => info!("{err}"),
                Err(err) => warn!("{err}"),
            }
        });
    }
}

async fn run(config: DaemonConfig, rules: Rules, shutdown: CancelFlag, mut log: LogControl) -> Result<(), DaemonError> {
    let store = open_store(&config, &rules.feedtypes);
    let node = Arc::new(config.node.clone());
    let registry = MemoryRegistry::with_feedtypes(node.anti_dos, Arc::clone(&rules.feedtypes));
    let acl = Arc::new(rules.acl);
    let ctx = ServerContext::new(
        Arc::clone(&acl),
        Arc::clone(&node),
        store.clone(),
        registry.clone(),
        shutdown.clone(),
    );

    let listener = TcpListener::bind((config.listen.as_str(), config.port)).await?;
    info!("listening on {}:{}", config.listen, config.port);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let server = tokio::spawn(accept_loop(listener, ctx, fatal_tx.clone()));

    std::fs::create_dir_all(&config.state_dir)?;
    let connector = TcpConnector {
        timeout: config.connect_timeout,
    };
    let mut requesters = Vec::new();
    for plan in acl.requests().plans() {
        info!(
            "requesting {} from {}:{} as {}",
            plan.class,
            plan.server,
            plan.port,
            if plan.is_primary { "primary" } else { "alternate" }
        );
        let requester = Requester::new(plan, FeedMode::Feed, connector, store.clone(), config.node.clone())
            .with_state_dir(&config.state_dir)
            .with_feedtypes(Arc::clone(&rules.feedtypes));
        let shutdown = shutdown.clone();
        let fatal = fatal_tx.clone();
        requesters.push(tokio::spawn(async move {
            if let Err(err) = requester.run(shutdown).await {
                if err.is_process_fatal() {
                    let _ = fatal.send(err);
                }
            }
        }));
    }
    drop(fatal_tx);

    let mut tick = tokio::time::interval(HOUSEKEEPING_TICK);
    let mut last_snapshot = Instant::now();
    let result = loop {
        tokio::select! {
            _ = tick.tick() => {}
            Some(err) = fatal_rx.recv() => break Err(err.into()),
        }
        log.poll();
        if shutdown.is_cancelled() {
            break Ok(());
        }
        if last_snapshot.elapsed() >= config.snapshot_interval {
            snapshot(&store, &config.store_path);
            last_snapshot = Instant::now();
        }
    };

    info!("shutting down");
    shutdown.cancel();
    registry.delete_all();
    let _ = server.await;
    for requester in requesters {
        let _ = requester.await;
    }
    snapshot(&store, &config.store_path);
    store.close();
    result
}

async fn notifyme(config: DaemonConfig, server: &str, selection: &Selection, shutdown: CancelFlag) -> Result<(), DaemonError> {
    let (host, port) = server_address(server)?;
    let feedtypes = feedtype_db(&config)?;
    let class = selection_class(&feedtypes, selection)?;
    let plan = RequesterPlan {
        server: host,
        port,
        class,
        is_primary: true,
        feed_count: 1,
    };
    let connector = TcpConnector {
        timeout: config.connect_timeout,
    };
    let store = MemoryStore::with_feedtypes(store_limits(&config), Arc::clone(&feedtypes));
    Requester::new(plan, FeedMode::Notify, connector, store, config.node)
        .with_feedtypes(feedtypes)
        .run(shutdown)
        .await?;
    Ok(())
}

async fn send(config: DaemonConfig, server: &str, selection: &Selection, shutdown: CancelFlag) -> Result<(), DaemonError> {
    let (host, port) = server_address(server)?;
    let feedtypes = feedtype_db(&config)?;
    let class = selection_class(&feedtypes, selection)?;
    let store = MemoryStore::with_feedtypes(store_limits(&config), feedtypes);
    load_store_snapshot(&config.store_path, &store)?;
    let mut link = TcpLink::connect(&host, port, config.connect_timeout)
        .await
        .map_err(|source| SessionError::ClientTransport {
            peer: format!("{host}:{port}"),
            source,
        })?;
    let summary = offer_products(&mut link, &store, class, &config.node, &shutdown).await?;
    println!("sent {} products, {} declined", summary.sent, summary.declined);
    Ok(())
}

fn check_rules(config: &DaemonConfig) -> Result<(), DaemonError> {
    let rules = rules::load(&config.rules_path)?;
    let acl = &rules.acl;
    println!(
        "{} allow, {} accept, {} request entries",
        acl.allows().len(),
        acl.accepts().len(),
        acl.requests().rules().len()
    );
    for plan in acl.requests().plans() {
        println!(
            "{}:{} {} (x{}) {}",
            plan.server,
            plan.port,
            if plan.is_primary { "primary" } else { "alternate" },
            plan.feed_count,
            plan.class
        );
    }
    Ok(())
}

fn node_summary(node: &NodeConfig) -> String {
    format!(
        "interval {:?}, inactive timeout {:?}, max latency {:?}, versions {:?}",
        node.interval, node.inactive_timeout, node.max_latency, node.protocol_versions
    )
}

#[tokio::main]
async fn main() {
    let log = LogControl::init();
    let cli = Cli::parse();

    let config = match DaemonConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let shutdown = CancelFlag::new();
    let _ = flag::register(SIGTERM, shutdown.as_arc());
    let _ = flag::register(SIGINT, shutdown.as_arc());

    let result = match &cli.command {
        None | Some(Commands::Run) => match rules::load(&config.rules_path) {
            Ok(rules) => {
                log.register_signals();
                info!("starting on port {} ({})", config.port, node_summary(&config.node));
                run(config, rules, shutdown, log).await
            }
            Err(err) => Err(err.into()),
        },
        Some(Commands::Notifyme { server, selection }) => notifyme(config, server, selection, shutdown).await,
        Some(Commands::Send { server, selection }) => send(config, server, selection, shutdown).await,
        Some(Commands::CheckRules) => check_rules(&config),
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PORT;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["feedlined"]).expect("parse");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["feedlined", "-c", "etc/feedlined.toml", "run"]).expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("etc/feedlined.toml")));
        assert!(matches!(cli.command, Some(Commands::Run)));

        let cli = Cli::try_parse_from(["feedlined", "notifyme", "idd.example.org", "-f", "IDS|DDPLUS", "-o", "60"])
            .expect("parse");
        match cli.command {
            Some(Commands::Notifyme { server, selection }) => {
                assert_eq!(server, "idd.example.org");
                assert_eq!(selection.feedtype, "IDS|DDPLUS");
                assert_eq!(selection.pattern, ".*");
                assert_eq!(selection.offset, 60);
            }
            _ => panic!("expected Notifyme command"),
        }

        let cli = Cli::try_parse_from(["feedlined", "send", "down.example:1388", "-p", "^SA"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Send { .. })));
        assert!(matches!(
            Cli::try_parse_from(["feedlined", "check-rules"]).expect("parse").command,
            Some(Commands::CheckRules)
        ));
    }

    #[test]
    fn selection_builds_a_windowed_class() {
        let selection = Selection {
            feedtype: "WMO".to_string(),
            pattern: "^S".to_string(),
            offset: 600,
        };
        let class = selection_class(&FeedtypeDb::standard(), &selection).expect("class");
        assert_eq!(class.specs.len(), 1);
        assert_eq!(class.to, Timestamp::END);
        assert!(class.from <= Timestamp::now().saturating_sub(Duration::from_secs(600)));

        let bad = Selection {
            pattern: "(".to_string(),
            ..selection
        };
        assert!(matches!(
            selection_class(&FeedtypeDb::standard(), &bad),
            Err(DaemonError::Selection(_))
        ));
    }

    #[test]
    fn server_address_defaults_port() {
        assert_eq!(
            server_address("idd.example.org").expect("address"),
            ("idd.example.org".to_string(), DEFAULT_PORT)
        );
        assert!(server_address("").is_err());
    }

    #[test]
    fn snapshot_round_trips_through_the_store_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("products.cbor");
        let store = MemoryStore::default();
        snapshot(&store, &path);
        assert!(path.exists());
        let reloaded = MemoryStore::default();
        assert_eq!(load_store_snapshot(&path, &reloaded).expect("load"), 0);
        assert!(reloaded.is_empty());
    }
}
