#[macro_use]
extern crate clap;

use relaychat::client::{Client, DEFAULT_SERVER};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> relaychat::Result<()> {
    let matches = clap_app!(
        client =>
            (name: "relaychat-client")
            (version: "0.1")
            (author: "Andrew Lyjak <andrew.lyjak@gmail.com>")
            (about: "Terminal client for relaychat. Type `login <name>`, then `chat <name>`; `\\q` ends a chat.")
            (@arg ADDRESS: "The hostname:port of the server [default: 127.0.0.1:7777].")
    ).get_matches();

    // Logs go to stderr so they don't interleave with chat lines.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let addr = matches.value_of("ADDRESS").unwrap_or(DEFAULT_SERVER);
    let client = match Client::connect(addr).await {
        Ok(client) => client,
        Err(err) => {
            error!(%addr, error = %err, "unable to connect");
            return Err(err.into());
        }
    };
    println!("connected to {}; commands: login <name>, chat <name>", addr);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    client
        .run(tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await?;
    Ok(())
}
