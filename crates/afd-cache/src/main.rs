use afd_cache::{
    cli::{print_refresh_results, print_server_url},
    config::{load_offices, select_store},
    nws::{NwsClient, DEFAULT_NWS_BASE_URL},
    server::Server,
};
use afd_cache_core::{
    cache::ProductCache,
    refresh::{Refresher, DEFAULT_CONCURRENCY},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    subcmd: ServSubcommand,
}

#[derive(Args)]
struct StoreOpts {
    /// `s3://bucket/prefix` for a remote store, or a local directory.
    #[clap(env = "AFD_STORE")]
    store: Option<String>,

    #[clap(long, default_value = "data", env = "AFD_DATA_DIR")]
    data_dir: PathBuf,

    /// Never use the remote store, even if one is configured.
    #[clap(long, env = "AFD_LOCAL")]
    local: bool,
}

#[derive(Args)]
struct RefreshOpts {
    /// JSON file holding an array of office codes.
    #[clap(long, env = "AFD_OFFICES_FILE")]
    offices_file: Option<PathBuf>,

    /// Comma-separated office codes. Takes precedence over --offices-file.
    #[clap(long, env = "AFD_OFFICES")]
    offices: Option<String>,

    #[clap(long, default_value = DEFAULT_NWS_BASE_URL, env = "NWS_API_BASE")]
    nws_base_url: Url,

    #[clap(long, env = "NWS_USER_AGENT")]
    user_agent: Option<String>,

    #[clap(long, default_value = "20", env = "NWS_REQUEST_TIMEOUT_SECONDS")]
    request_timeout_seconds: u64,

    #[clap(long, default_value_t = DEFAULT_CONCURRENCY, env = "AFD_REFRESH_CONCURRENCY")]
    concurrency: usize,
}

#[derive(Subcommand)]
enum ServSubcommand {
    Serve {
        #[clap(flatten)]
        store: StoreOpts,

        #[clap(flatten)]
        refresh: RefreshOpts,

        #[clap(long, default_value = "8080", env = "PORT")]
        port: u16,
        #[clap(long, env = "AFD_HOST")]
        host: Option<IpAddr>,

        /// Refresh every configured office on this interval. Off when unset.
        #[clap(long, env = "AFD_REFRESH_INTERVAL_SECONDS")]
        refresh_interval_seconds: Option<u64>,

        /// Bearer token required by `POST /refresh`.
        #[clap(long, env = "AFD_REFRESH_TOKEN")]
        refresh_token: Option<String>,

        #[clap(long)]
        prod: bool,
    },

    /// Refresh offices once and print the outcome of each.
    Refresh {
        #[clap(flatten)]
        store: StoreOpts,

        #[clap(flatten)]
        refresh: RefreshOpts,

        /// Limit the run to these configured offices.
        #[clap(long = "only", value_delimiter = ',')]
        only: Vec<String>,

        /// Ignore stored validators and refetch.
        #[clap(long)]
        force: bool,

        #[clap(long)]
        json: bool,
    },

    /// Print the offices that currently have a cached product.
    ListOffices {
        #[clap(flatten)]
        store: StoreOpts,
    },

    Version,
}

async fn open_cache(opts: &StoreOpts) -> Result<Arc<ProductCache>> {
    let store = select_store(
        opts.store.as_deref(),
        &opts.data_dir,
        opts.local,
        |key| env::var(key).ok(),
    )
    .await?;
    Ok(Arc::new(ProductCache::new(store)))
}

fn build_refresher(cache: Arc<ProductCache>, opts: &RefreshOpts) -> Result<Refresher> {
    let offices = load_offices(opts.offices.as_deref(), opts.offices_file.as_deref())?;
    if offices.is_empty() {
        tracing::warn!("No offices configured. Set --offices or --offices-file.");
    }

    let user_agent = opts
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("afd-cache/{} (no-contact@invalid)", VERSION));
    let upstream = NwsClient::new(
        opts.nws_base_url.clone(),
        &user_agent,
        Duration::from_secs(opts.request_timeout_seconds),
    )?;

    Ok(Refresher::new(cache, Arc::new(upstream), offices).with_concurrency(opts.concurrency))
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down.");
        },
        _ = async {
            #[cfg(unix)]
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => signal.recv().await,
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<Option<()>>().await
                }
            }

            #[cfg(not(unix))]
            std::future::pending::<Option<()>>().await
        } => {
            tracing::info!("Received SIGTERM, shutting down.");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    match &opts.subcmd {
        ServSubcommand::Serve {
            store,
            refresh,
            port,
            host,
            refresh_interval_seconds,
            refresh_token,
            prod,
        } => {
            let cache = open_cache(store).await?;
            let refresher = build_refresher(cache, refresh)?;

            if refresh_token.is_none() {
                tracing::warn!("No refresh token set. Only use this for local development!");
            }

            let addr = SocketAddr::new(
                host.unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
                *port,
            );
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;

            if !prod {
                print_server_url(addr, refresh_token.is_some());
            }

            let token = CancellationToken::new();
            let server = Server::new(
                Arc::new(refresher),
                refresh_token.clone(),
                refresh_interval_seconds.map(Duration::from_secs),
                token.clone(),
            );

            let prod = *prod;
            let handle = tokio::spawn(async move { server.serve(listener, prod).await });

            tracing::info!("Listening on http://{}", addr);

            shutdown_signal().await;
            token.cancel();

            handle.await??;
            tracing::info!("Server shut down.");
        }
        ServSubcommand::Refresh {
            store,
            refresh,
            only,
            force,
            json,
        } => {
            let cache = open_cache(store).await?;
            let refresher = build_refresher(cache, refresh)?;

            let subset = (!only.is_empty()).then_some(only.as_slice());
            if subset.is_none() && refresher.offices().is_empty() {
                anyhow::bail!("No offices configured.");
            }

            let results = refresher.run_refresh(subset, *force).await;
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "ok": true,
                        "results": results,
                    }))?
                );
            } else {
                print_refresh_results(&results);
            }
        }
        ServSubcommand::ListOffices { store } => {
            let cache = open_cache(store).await?;
            for office in cache.list_offices_with_payload().await? {
                println!("{}", office);
            }
        }
        ServSubcommand::Version => {
            println!("{}", VERSION);
        }
    }

    Ok(())
}
