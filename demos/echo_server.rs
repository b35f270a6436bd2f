use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use kcpmux::config::EngineConfig;
use kcpmux::server::Server;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    port: u16,

    #[clap(long, default_value = "0.0.0.0")]
    bind: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const MAX_WAITING: usize = 100;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut server = Server::new();
    server.configure(EngineConfig::low_latency())?;
    server.set_timeout(Duration::from_secs(30));

    server.set_new_connection_hook(|session| {
        info!(conv = session.conv(), "new client from {:?}", session.peer_addr());

        session.set_min_rto(30);
        session.set_fast_resend(2);
        session.set_stream_mode(false);
        session.set_dead_link(20);

        session.set_data_callback(|session, msg| {
            let text = String::from_utf8_lossy(msg);
            info!(conv = session.conv(), "received: {}", text);

            let waiting = session.waiting_count();
            if waiting > MAX_WAITING {
                warn!(conv = session.conv(), waiting, "send queue is backed up - not replying");
                return;
            }

            let reply = if text == "PING" {
                "PONG".to_string()
            }
            else if text.contains("ATTACK") || text.contains("BUY") {
                format!("CONFIRMED: {}", text)
            }
            else {
                format!("ECHO: {}", text)
            };
            if let Err(e) = session.send_reliable(reply.as_bytes()) {
                warn!(conv = session.conv(), "could not reply: {}", e);
            }
        });

        session.set_close_callback(|session| {
            info!(conv = session.conv(), "client {:?} is gone", session.peer_addr());
        });
    });

    let local_addr = server.bind_and_listen(&args.bind, args.port).await?;
    info!("echo server listening on {:?} - Ctrl+C to stop", local_addr);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted - shutting down");
        }
        shutdown.cancel();
    });

    server.run().await?;
    info!("echo server stopped");
    Ok(())
}
