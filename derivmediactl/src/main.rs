use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = derivmediactl::Cli::parse();
    if let Err(err) = derivmediactl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
