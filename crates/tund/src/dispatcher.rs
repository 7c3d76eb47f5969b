//! Accept loop: admission control, then handshake dispatch

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};
use tungate::ConnectionPermit;

use crate::context::ServerContext;
use crate::control::{register_proxy, run_control, Stream};
use crate::msg::{read_msg, Message};

/// Deadline for the TLS handshake and the first message
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept connections until the listener fails permanently
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => accept(&ctx, stream, addr),
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

/// Admit or drop one inbound connection
pub fn accept(ctx: &Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) {
    let key = addr.ip().to_string();

    if !ctx.ip_limiter.allow_ip(&key) {
        warn!("Rate limit exceeded for {}, closing", key);
        return;
    }

    let Some(permit) = ctx.conn_limiter.acquire(&key) else {
        warn!("Connection limit exceeded for {}, closing", key);
        return;
    };

    debug!("New connection from {}", addr);
    let ctx = Arc::clone(ctx);
    spawn_guarded(permit, addr, handle_connection(ctx, stream, addr));
}

/// Run `handler` holding `permit`.
///
/// The handler runs in its own task so a panic stops at the task boundary;
/// the permit is dropped with the task whatever way it ends.
pub fn spawn_guarded<F>(permit: ConnectionPermit, addr: SocketAddr, handler: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let _permit = permit;
        handler.await
    });

    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => debug!("Connection closed: {}", addr),
            Ok(Err(e)) => warn!("Error handling connection {}: {:#}", addr, e),
            Err(e) if e.is_panic() => error!("Connection handler for {} panicked", addr),
            Err(e) => error!("Connection handler for {} failed: {}", addr, e),
        }
    })
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let stream: Box<dyn Stream> = match ctx.tls.acceptor() {
        Some(acceptor) => {
            let tls = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .context("TLS handshake timed out")?
                .context("TLS handshake failed")?;
            Box::new(tls)
        }
        None => Box::new(stream),
    };
    let mut conn = BufReader::new(stream);

    let first = timeout(HANDSHAKE_TIMEOUT, read_msg(&mut conn))
        .await
        .context("Timed out waiting for the first message")??;

    match first {
        None => Ok(()),
        Some(Message::Auth(auth)) => run_control(ctx, conn, auth, addr).await,
        Some(Message::RegProxy(reg)) => register_proxy(&ctx, conn, reg),
        Some(other) => bail!("Unexpected first message: {:?}", other),
    }
}
