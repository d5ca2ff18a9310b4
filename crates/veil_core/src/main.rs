use anyhow::Context;
use tracing_subscriber::EnvFilter;
use veil_core::{fetch, Config};
use veil_net::Transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::args()
        .nth(1)
        .context("usage: veil <https://url>")?;
    let config = Config::from_env()?;

    // Logs go to a file so stdout carries only the result.
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "veil.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    tracing::info!(profile = %config.transport.profile, "starting veil");
    let transport = Transport::new(config.transport)?;
    let fetched = fetch(&transport, &url).await?;

    println!("{} {:?} {} bytes", fetched.status, fetched.version, fetched.body_len);
    Ok(())
}
