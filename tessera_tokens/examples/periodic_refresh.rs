use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tessera_clock::DurationSecs;
use tessera_tokens::{fetchers::HttpTokenFetcher, stores::FileTokenStore, TokenServer};
use tokio::time;

#[derive(Debug, Parser)]
#[command(about = "Keeps a shared token file fresh and reads from it periodically")]
struct Opts {
    /// The issuing service's token URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The file shared by every process caching this token
    #[arg(short = 'f', long, env, default_value = ".token.json")]
    token_file: PathBuf,

    /// How long, in seconds, a refresh lock may be held before others take it over
    #[arg(short, long, env, default_value_t = 60)]
    lease: u64,

    /// How often, in seconds, to read the token
    #[arg(short, long, env, default_value_t = 5)]
    every: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let store =
        Arc::new(FileTokenStore::new(opts.token_file).with_lease(DurationSecs(opts.lease)));
    let fetcher = HttpTokenFetcher::new(reqwest::Client::new(), opts.token_url);
    let server = TokenServer::spawn(store, fetcher);

    let mut interval = time::interval(Duration::from_secs(opts.every.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        match server.token().await {
            Ok(token) => tracing::info!(token = format_args!("{:#?}", token), "pulled token"),
            Err(error) => tracing::error!(
                error = (&error as &dyn std::error::Error),
                "unable to get token"
            ),
        }
    }

    server.shutdown().await;
    Ok(())
}
