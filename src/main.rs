//! logd: a document log server.
//!
//! Persists structured documents as an append-only log of patches, serves
//! snapshot reads through a size-bound path index, and coordinates atomic
//! multi-participant transactions over TCP sessions and HTTP.

mod cli;

use clap::Parser;
use logd::server;
use logd_store::{Store, StoreConfig};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let opts = cli::Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOGD_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    std::process::exit(runtime.block_on(run(opts)));
}

async fn run(opts: cli::Opts) -> i32 {
    let config = StoreConfig::from_path(&opts.data_dir).build();
    let store = match Store::open(config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open store");
            return 1;
        }
    };

    if opts.snapshot {
        return match store.write_snapshot().await {
            Ok(Some((lo, hi))) => {
                info!(lo, hi, "snapshot written");
                exitcode::OK
            }
            Ok(None) => {
                info!("nothing to snapshot");
                exitcode::OK
            }
            Err(e) => {
                error!(error = %e, "snapshot failed");
                1
            }
        };
    }

    let listener = match TcpListener::bind(opts.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %opts.listen, error = %e, "failed to bind session listener");
            return 1;
        }
    };

    let context = server::ServerContext::new(store.clone());
    let tcp = tokio::spawn(server::tcp::serve(context.clone(), listener));

    let http = opts.http.map(|addr| {
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(e) = server::http::serve(context, addr).await {
                error!(error = %e, "http server failed");
            }
        })
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    tcp.abort();
    if let Some(http) = http {
        http.abort();
    }
    exitcode::OK
}
