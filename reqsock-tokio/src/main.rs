// reqsock: send one request to configured peers, or run an echo peer to answer them.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use reqsock_tokio::{config, tcp, ReqSocket};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

const USAGE: &str = "usage: reqsock [--version] <command>

commands:
  request <part>...   send a multipart request to the configured peers, print the reply
  echo <addr>         listen on <addr> and answer every request with its own body";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("reqsock {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    match args.first().map(String::as_str) {
        Some("request") => rt.block_on(run_request(cfg, &args[1..])),
        Some("echo") => {
            let addr: SocketAddr = args
                .get(1)
                .context("echo needs a listen address")?
                .parse()
                .context("invalid listen address")?;
            rt.block_on(run_echo(addr))
        }
        _ => {
            eprintln!("{}", USAGE);
            bail!("no command given");
        }
    }
}

async fn run_request(cfg: config::Config, parts: &[String]) -> anyhow::Result<()> {
    if parts.is_empty() {
        bail!("request needs at least one part");
    }
    if cfg.connect.is_empty() {
        bail!("no peers configured (set `connect` in config or REQSOCK_CONNECT)");
    }
    let mut socket = ReqSocket::new(&cfg);
    let handle = socket.handle();
    for endpoint in &cfg.connect {
        let addr: SocketAddr = endpoint
            .parse()
            .with_context(|| format!("invalid endpoint {}", endpoint))?;
        if let Err(e) = tcp::connect(&handle, addr, cfg.send_hwm).await {
            tracing::warn!(%addr, error = %e, "cannot connect");
        }
    }

    let frames = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
    socket.send(frames).await.context("send failed")?;
    let reply = socket.receive().await.context("receive failed")?;
    for part in reply {
        println!("{}", String::from_utf8_lossy(&part));
    }
    socket.close();
    Ok(())
}

async fn run_echo(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "echo peer listening");
    let accept = async {
        let mut failures = 0u32;
        loop {
            let (mut stream, remote) = match listener.accept().await {
                Ok(x) => {
                    failures = 0;
                    x
                }
                Err(e) => {
                    // EMFILE and friends persist across retries.
                    let delay = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(error = %e, retry_in = ?delay, "accept failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            tokio::spawn(async move {
                if let Err(e) = tcp::greet(&mut stream).await {
                    tracing::warn!(%remote, error = %e, "greeting failed");
                    return;
                }
                tracing::info!(%remote, "requester connected");
                let mut buf = Vec::new();
                loop {
                    match tcp::read_message(&mut stream, &mut buf).await {
                        Ok(Some(envelope)) => {
                            tracing::debug!(%remote, frames = envelope.len(), "echoing request");
                            if let Err(e) = tcp::write_message(&mut stream, &envelope).await {
                                tracing::debug!(%remote, error = %e, "write failed");
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(%remote, error = %e, "read failed");
                            break;
                        }
                    }
                }
                tracing::info!(%remote, "requester disconnected");
            });
        }
    };
    tokio::select! {
        _ = accept => {}
        r = shutdown_signal() => r?,
    }
    Ok(())
}

/// Delay before retrying after `failures` consecutive accept errors: doubles from 10ms, capped at 1s.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
