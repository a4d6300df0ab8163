use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tscast::{Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "tscast-server",
    about = "RTSP streaming server for pre-segmented MPEG-TS media"
)]
struct Args {
    /// RTSP bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Registration control-channel bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:8600")]
    control_bind: String,

    /// Root directory holding one media directory per unit id
    #[arg(long, default_value = "/var/lib/tscast/media")]
    media_root: PathBuf,

    /// Registration realm
    #[arg(long, default_value = "tscast")]
    realm: String,

    /// Registration shared secret
    #[arg(long, default_value = "changeme")]
    secret: String,

    /// Idle session eviction limit, seconds
    #[arg(long, default_value_t = 3600)]
    idle_limit: u64,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = ServerConfig {
        rtsp_bind: args.bind.clone(),
        control_bind: args.control_bind,
        media_root: args.media_root,
        realm: args.realm,
        secret: args.secret,
        idle_limit: Duration::from_secs(args.idle_limit),
        ..ServerConfig::default()
    };

    let mut server = Server::new(config);
    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("tscast server on {} — press Enter to stop", args.bind);
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    server.stop();
}
