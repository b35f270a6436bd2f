use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use kcpmux::client::Client;
use kcpmux::config::EngineConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

#[derive(Parser)]
struct Args {
    server_ip: String,
    server_port: u16,

    #[clap(long, default_value_t = 1234)]
    conv: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// Runs the client's event loop for `duration`. Returns `false` if the whole program was
///  interrupted in the meantime.
async fn run_for(client: &mut Client, shutdown: &CancellationToken, duration: Duration) -> anyhow::Result<bool> {
    let phase = shutdown.child_token();
    let phase_end = phase.clone();
    let (result, _) = tokio::join!(
        client.run_until(phase),
        async move {
            tokio::time::sleep(duration).await;
            phase_end.cancel();
        },
    );
    result?;
    Ok(!shutdown.is_cancelled())
}

fn send(client: &mut Client, msg: &str) {
    match client.send(msg.as_bytes()) {
        Ok(()) => info!("sent: {}", msg),
        Err(e) => error!("could not send {:?}: {}", msg, e),
    }
}

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

    let mut client = Client::new();
    client.configure(EngineConfig::low_latency())?;
    client.set_data_callback(|session, msg| {
        info!("reply: {} (waiting: {})", String::from_utf8_lossy(msg), session.waiting_count());
    });
    client.set_close_callback(|session| {
        info!(conv = session.conv(), "connection closed");
    });

    client.connect(&args.server_ip, args.server_port, args.conv).await?;
    info!(conv = args.conv, "connected to {}:{} - Ctrl+C to stop", args.server_ip, args.server_port);

    let shutdown = client.shutdown_token();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted - disconnecting");
        }
        interrupt.cancel();
    });

    let script: Vec<(String, Duration)> = vec![
        ("PING".to_string(), Duration::from_millis(500)),
        ("ATTACK: Enemy #123".to_string(), Duration::from_secs(2)),
        ("BUY: Item #456, Price: 100".to_string(), Duration::from_secs(2)),
    ].into_iter()
        .chain((1..=5).map(|i| (format!("message #{}", i), Duration::from_millis(500))))
        .collect();

    if run_for(&mut client, &shutdown, Duration::from_secs(1)).await? {
        for (msg, pause) in script {
            send(&mut client, &msg);
            if !run_for(&mut client, &shutdown, pause).await? {
                break;
            }
        }
    }

    if !shutdown.is_cancelled() {
        info!("all messages sent - Ctrl+C to stop");
        client.run().await?;
    }

    client.disconnect();
    Ok(())
}
