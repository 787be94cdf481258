//! Minimal TLS test server.
//!
//! Presents a given certificate chain file verbatim (bundle order reaches
//! the wire untouched) and answers each connection with one canned HTTP
//! response. Runs until interrupted; SIGINT and SIGTERM both trigger a
//! graceful exit so the harness can reap it between test cases.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use argh::FromArgs;
use chainsweep::{logger, tls};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Serve TLS with a given certificate chain and key until interrupted.
#[derive(Debug, FromArgs)]
struct Options {
    /// path to the PEM certificate chain to present, leaf first
    #[argh(positional)]
    chain: PathBuf,

    /// path to the server private key (PEM)
    #[argh(positional)]
    key: PathBuf,

    /// address to listen on
    #[argh(option, default = "default_listen_addr()")]
    listen: SocketAddr,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 45011))
}

fn main() -> ExitCode {
    logger::init();

    let opts = argh::from_env::<Options>();

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")
        .and_then(|rt| rt.block_on(serve(opts)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("chainsweep-server failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(opts: Options) -> anyhow::Result<()> {
    let chain = tls::load_cert_chain(&opts.chain)?;
    let key = tls::load_private_key(&opts.key)?;
    let config = tls::server_config(chain, key)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("Failed to bind {}", opts.listen))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read the bound address")?;

    // Ready marker. The harness polls the socket; humans read this line.
    println!("listening on port {}", local_addr.port());

    loop {
        tokio::select! {
            biased;
            () = shutdown_signal() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("accept failed: {err}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    // Readiness probes disconnect before the handshake;
                    // that lands here and is not an error worth surfacing.
                    if let Err(err) = handle_conn(acceptor, stream).await {
                        debug!("connection from {peer}: {err:#}");
                    }
                });
            }
        }
    }

    info!("shutting down");
    Ok(())
}

/// Complete the TLS handshake, read whatever the client sends, answer with
/// the canned response, and close.
async fn handle_conn(
    acceptor: TlsAcceptor,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let mut tls_stream = acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;

    let mut buf = [0u8; 1024];
    let _ = tls_stream.read(&mut buf).await;

    tls_stream
        .write_all(RESPONSE)
        .await
        .context("Failed to write response")?;
    tls_stream
        .shutdown()
        .await
        .context("Failed to close stream")?;
    Ok(())
}

/// Resolves on ctrl-c (SIGINT) or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                return std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => (),
            _ = sigterm.recv() => (),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
