use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// The document log server: append-only patch storage with snapshot reads
/// and atomic multi-participant transactions.
#[derive(Debug, Parser)]
#[command(name = "logd", version, about)]
pub struct Opts {
    /// Data directory the store owns.
    #[arg(long, env = "LOGD_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Address for the TCP session server.
    #[arg(long, default_value = "127.0.0.1:7070")]
    pub listen: SocketAddr,

    /// Address for the HTTP endpoint; disabled when absent.
    #[arg(long)]
    pub http: Option<SocketAddr>,

    /// Compose the current view into a snapshot, then exit.
    #[arg(long)]
    pub snapshot: bool,
}
