use args::Args;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    server::logger::init(&args.log_filter);

    let config = config::Config::load(&args.config)?;

    let listen_address = args
        .listen
        .or(config.server.listen_address)
        .unwrap_or_else(|| "127.0.0.1:8484".parse().expect("valid default address"));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received ctrl-c, shutting down");
                shutdown.cancel();
            }
        });
    }

    server::serve(server::ServeConfig {
        listen_address,
        config,
        shutdown_signal: shutdown,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: None,
    })
    .await
}
