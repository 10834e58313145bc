#[macro_use]
extern crate clap;

use relaychat::server::{Config, Server};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> relaychat::Result<()> {
    let matches = clap_app!(
        relaychat =>
            (version: "0.1")
            (author: "Andrew Lyjak <andrew.lyjak@gmail.com>")
            (about: "A one-to-one TCP chat relay. Clients `login <name>`, then `chat <name>`.")
            (@arg ADDRESS: "The hostname:port to listen on [default: 0.0.0.0:7777].")
            (@arg CLOSE: -q --close +takes_value "The line that ends a chat [default: \\q].")
            (@arg BACKLOG: -b --backlog +takes_value "Accepted connections that may wait for a handler [default: 64].")
    ).get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = Config::default();
    if let Some(addr) = matches.value_of("ADDRESS") {
        config.addr = addr.to_string();
    }
    if let Some(close) = matches.value_of("CLOSE") {
        config.close_token = close.to_string();
    }
    if matches.is_present("BACKLOG") {
        config.handoff_capacity = value_t!(matches, "BACKLOG", usize).unwrap_or_else(|e| e.exit());
    }

    let server = match Server::bind(config.clone()).await {
        Ok(server) => server,
        Err(err) => {
            error!(addr = %config.addr, error = %err, "unable to bind");
            return Err(err.into());
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            return;
        }
        info!("stopping");
        shutdown.cancel();
    });

    server.run().await?;
    Ok(())
}
