//! kcpmux demo binary.
//!
//! `serve` accepts sessions on one UDP port and logs (or echoes) their
//! messages; `connect` dials a server, sends a few messages and closes
//! gracefully.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mux_session::{
    ChannelAcceptor, Dialer, Listener, SessionConfig, SessionEvent, SessionTable,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::KcpmuxConfig;
use logging::{KcpmuxLogFormatter, SpanConvLayer};

/// Reliable sessions multiplexed over one UDP socket
#[derive(Parser, Debug)]
#[command(name = "kcpmux", version, about = "Multiplexed KCP sessions over one UDP socket")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path (YAML, `session:` section)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Keepalive interval, e.g. 30s (0s disables)
    #[arg(long, global = true)]
    keepalive: Option<humantime::Duration>,

    /// Idle timeout, e.g. 180s
    #[arg(long, global = true)]
    idle_timeout: Option<humantime::Duration>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept sessions and log their messages
    Serve {
        /// UDP port to listen on (dual-stack when available)
        #[arg(long, default_value_t = 12345)]
        port: u16,

        /// Send every received message back to its sender
        #[arg(long)]
        echo: bool,
    },
    /// Dial a server, send messages, then close
    Connect {
        /// Server address, e.g. 127.0.0.1:12345
        #[arg(long)]
        remote: SocketAddr,

        /// Number of messages to send
        #[arg(long, default_value_t = 5)]
        count: u32,

        /// Pause between messages, e.g. 1s
        #[arg(long, default_value = "1s")]
        interval: humantime::Duration,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("kcpmux={}", args.log_level).parse()?)
        .add_directive(format!("mux_session={}", args.log_level).parse()?);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(SpanConvLayer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(KcpmuxLogFormatter::new("kcpmux")),
        )
        .init();

    info!("Starting kcpmux v{}", env!("CARGO_PKG_VERSION"));

    let mut config = KcpmuxConfig::load(args.config.as_deref())?;
    config.apply_cli_overrides(
        args.keepalive.map(Duration::from),
        args.idle_timeout.map(Duration::from),
    );
    config.session.validate()?;

    match args.command {
        Command::Serve { port, echo } => serve(port, echo, config.session).await,
        Command::Connect {
            remote,
            count,
            interval,
        } => connect(remote, count, interval.into(), config.session).await,
    }
}

async fn serve(port: u16, echo: bool, session_config: SessionConfig) -> anyhow::Result<()> {
    let (acceptor, mut accepted, mut events) = ChannelAcceptor::new();
    let listener = Listener::bind_port(port, session_config, Arc::new(acceptor))
        .await
        .with_context(|| format!("failed to bind UDP port {}", port))?;
    let listener = Arc::new(listener);
    let table = listener.table().clone();
    listener.clone().spawn();

    info!("Serving on {} (echo: {})", listener.local_addr(), echo);

    loop {
        tokio::select! {
            Some(session) = accepted.recv() => {
                info!(conv = session.conv(), "Accepted session from {}", session.remote_addr());
            }
            Some(event) = events.recv() => match event {
                SessionEvent::Received { conv, message } => {
                    info!(conv, "Received: {}", String::from_utf8_lossy(&message));
                    if echo {
                        match table.get(conv) {
                            Some(session) => {
                                if let Err(e) = session.send(&message) {
                                    warn!(conv, "Echo failed: {}", e);
                                }
                            }
                            None => warn!(conv, "Session gone before echo"),
                        }
                    }
                }
                SessionEvent::Closed { conv } => info!(conv, "Session closing"),
            },
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                info!("Shutting down, closing {} sessions", table.len());
                close_all(&table).await;
                return Ok(());
            }
        }
    }
}

/// Close every live session and wait for each to drain
async fn close_all(table: &SessionTable) {
    let handles: Vec<_> = table.sessions().iter().map(|session| session.close()).collect();
    for handle in handles {
        handle.wait().await;
    }
}

async fn connect(
    remote: SocketAddr,
    count: u32,
    interval: Duration,
    session_config: SessionConfig,
) -> anyhow::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    let session = Dialer::new(session_config)
        .dial(remote, Arc::new(tx))
        .await
        .with_context(|| format!("failed to connect to {}", remote))?;
    let conv = session.conv();
    info!(conv, "Connected to {}", remote);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Received { conv, message } => {
                    info!(conv, "Received: {}", String::from_utf8_lossy(&message))
                }
                SessionEvent::Closed { conv } => info!(conv, "Session closing"),
            }
        }
    });

    for n in 1..=count {
        if session.is_closed() {
            warn!(conv, "Session closed by server after {} messages", n - 1);
            break;
        }
        let message = format!("hello {}", n);
        session.send(message.as_bytes())?;
        info!(conv, "Sent: {}", message);
        tokio::time::sleep(interval).await;
    }

    info!(conv, "Closing");
    session.close().wait().await;
    let stats = session.stats();
    info!(
        conv,
        "Closed: {} datagrams out, {} in, {} messages delivered",
        stats.datagrams_out,
        stats.datagrams_in,
        stats.messages_delivered
    );
    Ok(())
}
