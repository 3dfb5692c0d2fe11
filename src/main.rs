use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use pulse_analytics::{format_duration, AggregateStore, ReportGenerator, ReportKind};
use pulse_core::config::AppConfig;
use pulse_core::geo::GeoChain;
use pulse_core::session::PageEnvironment;
use pulse_core::storage::MemoryStore;
use pulse_tracker::{PageContext, SessionTracker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str =
    "visitor_pulse=info,pulse_core=info,pulse_analytics=info,pulse_tracker=info,pulse_server=info,warn";

#[derive(Parser)]
#[command(
    name = "visitor-pulse",
    about = "Privacy-light visitor analytics with live cross-tab statistics",
    version,
    author
)]
struct Cli {
    /// Path to config file (default: ~/.config/visitor-pulse/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the durable store directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one tab session over the given paths, then end it
    Visit {
        /// Paths in navigation order
        #[arg(short, long = "path", required = true)]
        paths: Vec<String>,
        /// User agent of the simulated tab
        #[arg(long, default_value = "")]
        user_agent: String,
        /// Referrer of the first page
        #[arg(long, default_value = "")]
        referrer: String,
        /// Skip geolocation lookups
        #[arg(long)]
        no_geo: bool,
    },

    /// Print current statistics
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Render a markdown report
    Report {
        #[arg(value_enum, default_value_t = ReportArg::Summary)]
        kind: ReportArg,
    },

    /// Print statistics whenever they change, until interrupted
    Watch,

    /// Delete all history and daily aggregates
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Start the HTTP dashboard server
    Serve {
        /// Bind host
        #[arg(long)]
        host: Option<String>,
        /// Bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show or manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportArg {
    Weekly,
    Monthly,
    Summary,
}

impl From<ReportArg> for ReportKind {
    fn from(arg: ReportArg) -> Self {
        match arg {
            ReportArg::Weekly => ReportKind::Weekly,
            ReportArg::Monthly => ReportKind::Monthly,
            ReportArg::Summary => ReportKind::Summary,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Initialize default configuration file
    Init,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up tracing.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load config.
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    // Apply CLI overrides.
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }

    if let Commands::Config { action } = &cli.command {
        return handle_config_command(action.as_ref(), &config);
    }

    // Commands that exit right away gain nothing from watching the store.
    if !matches!(cli.command, Commands::Watch | Commands::Serve { .. }) {
        config.storage.watch = false;
    }

    let store = Arc::new(AggregateStore::open(&config)?);
    tracing::debug!("Store directory: {}", config.store_dir().display());

    match cli.command {
        Commands::Visit {
            paths,
            user_agent,
            referrer,
            no_geo,
        } => {
            let geo = if no_geo {
                GeoChain::disabled()
            } else {
                GeoChain::from_config(&config.geo)
            };
            visit(&config, store, geo, PageEnvironment::new(user_agent, referrer), &paths).await;
        }
        Commands::Stats { json } => {
            let stats = store.statistics();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", ReportGenerator::text_summary(&stats));
                for visitor in &stats.recent_visitors {
                    println!(
                        "  {}  {:<8} {:<8} {:<8} {:>3} views  {}",
                        visitor.entry_at.format("%Y-%m-%d %H:%M"),
                        visitor.browser,
                        visitor.os,
                        visitor.device,
                        visitor.page_views,
                        visitor
                            .duration_secs
                            .map(format_duration)
                            .unwrap_or_else(|| "online".into()),
                    );
                }
            }
        }
        Commands::Report { kind } => {
            print!("{}", ReportGenerator::render(&store, kind.into()));
        }
        Commands::Watch => {
            let (_subscription, mut rx) = store.watch();
            loop {
                tokio::select! {
                    stats = rx.recv() => match stats {
                        Some(stats) => {
                            println!("── {} ──", chrono_now());
                            print!("{}", ReportGenerator::text_summary(&stats));
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear analytics without --yes");
            }
            store.clear(None);
            println!("Analytics cleared");
        }
        Commands::Serve { host, port } => {
            if let Some(h) = host {
                config.server.host = h;
            }
            if let Some(p) = port {
                config.server.port = p;
            }
            pulse_server::serve(config, store).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

/// Run one tab through `paths`. The tab scope lives only as long as the
/// process, like a browser tab's session storage.
async fn visit(
    config: &AppConfig,
    store: Arc<AggregateStore>,
    geo: GeoChain,
    env: PageEnvironment,
    paths: &[String],
) {
    let tracker = Arc::new(SessionTracker::new(
        Arc::new(MemoryStore::new()),
        store,
        geo,
        env,
    ));
    let mut page = PageContext::new(tracker, &config.tracker);

    let mut iter = paths.iter();
    if let Some(first) = iter.next() {
        page.mount(first).await;
    }
    for path in iter {
        page.navigate(path).await;
    }

    if let Some(session) = page.dispose().await {
        println!(
            "Recorded session {} ({} page views, {} from {})",
            session.id,
            session.page_views,
            session.browser,
            if session.country.is_empty() {
                session.ip_address.as_str()
            } else {
                session.country.as_str()
            },
        );
    }
}

fn chrono_now() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn handle_config_command(action: Option<&ConfigAction>, config: &AppConfig) -> Result<()> {
    match action {
        Some(ConfigAction::Show) | None => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        Some(ConfigAction::Init) => {
            let path = AppConfig::default_path();
            if path.exists() {
                println!("Config already exists at: {}", path.display());
            } else {
                config.save()?;
                println!("Created default config at: {}", path.display());
            }
        }
        Some(ConfigAction::Path) => {
            println!("{}", AppConfig::default_path().display());
        }
    }
    Ok(())
}
