use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = Cli::parse().run().await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
