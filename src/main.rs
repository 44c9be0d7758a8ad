use anyhow::Result;
use twitch_opticon::app::App;
use twitch_opticon::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get logging settings
    let config = AppConfig::load();

    // stdout is the prompt, so logs go to a daily rotating file.
    let log_dir = config.logging.log_directory.as_deref().unwrap_or("logs");
    let file_appender = tracing_appender::rolling::daily(log_dir, "twitch-opticon.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG takes precedence over the config.
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::from_default_env(),
        Err(_) => tracing_subscriber::EnvFilter::new(config.logging.filter_directive()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .compact()
        .init();

    let mut app = App::new(config)?;
    let res = app.run().await;

    if let Err(err) = res {
        // Detailed traces are in the log file.
        eprintln!("{err:?}");
        return Err(err);
    }

    Ok(())
}
