//! Control sessions and proxy connections

use std::collections::VecDeque;
use std::hash::BuildHasher;
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::RandomState;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::msg::{read_msg, write_msg, Auth, AuthResp, Message, NewTunnel, RegProxy, ReqTunnel};

/// Idle proxy connections kept per control; extra ones are closed
pub const MAX_IDLE_PROXIES: usize = 10;

/// Byte stream a connection runs over, plain TCP or TLS
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A buffered connection; the buffer may already hold bytes read past the
/// handshake
pub type Conn = BufReader<Box<dyn Stream>>;

/// A client's control connection as seen by the rest of the server
pub struct Control {
    client_id: String,
    shutdown: Notify,
    tunnels: Mutex<Vec<String>>,
    proxies: Mutex<VecDeque<Conn>>,
}

impl Control {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            shutdown: Notify::new(),
            tunnels: Mutex::new(Vec::new()),
            proxies: Mutex::new(VecDeque::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Ask the session to end. Stored if the session is not waiting yet.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// URLs of the tunnels this control registered
    pub fn tunnels(&self) -> Vec<String> {
        self.tunnels.lock().clone()
    }

    /// Park an idle proxy connection. Returns false and drops the
    /// connection when the pool is full.
    pub fn put_proxy(&self, conn: Conn) -> bool {
        let mut proxies = self.proxies.lock();
        if proxies.len() >= MAX_IDLE_PROXIES {
            return false;
        }
        proxies.push_back(conn);
        true
    }

    /// Take the oldest idle proxy connection
    pub fn take_proxy(&self) -> Option<Conn> {
        self.proxies.lock().pop_front()
    }

    pub fn idle_proxies(&self) -> usize {
        self.proxies.lock().len()
    }
}

fn new_client_id(user: &str, addr: SocketAddr) -> String {
    format!("{:016x}", RandomState::new().hash_one((user, addr)))
}

/// Run a control session after its `Auth` message has been read
pub async fn run_control(
    ctx: Arc<ServerContext>,
    mut conn: Conn,
    auth: Auth,
    addr: SocketAddr,
) -> Result<()> {
    let client_id = auth
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| new_client_id(&auth.user, addr));

    let control = Arc::new(Control::new(client_id.clone()));
    ctx.controls.add(Arc::clone(&control));
    info!(
        "Control {} authenticated from {} (user {}, version {})",
        client_id, addr, auth.user, auth.version
    );

    let result = control_loop(&ctx, &control, &mut conn).await;

    for url in control.tunnels() {
        ctx.tunnels.remove(&url);
    }
    ctx.controls.remove(&control);
    while control.take_proxy().is_some() {}
    info!("Control {} closed ({} remaining)", client_id, ctx.controls.len());

    result
}

async fn control_loop(ctx: &ServerContext, control: &Control, conn: &mut Conn) -> Result<()> {
    let resp = Message::AuthResp(AuthResp {
        client_id: control.client_id().to_string(),
        error: None,
    });
    write_msg(conn, &resp).await?;

    loop {
        let msg = tokio::select! {
            msg = read_msg(conn) => msg?,
            _ = control.shutdown.notified() => {
                info!("Control {} replaced by a newer connection", control.client_id());
                return Ok(());
            }
        };

        let reply = match msg {
            None => return Ok(()),
            Some(Message::Ping) => Message::Pong,
            Some(Message::ReqTunnel(req)) => Message::NewTunnel(request_tunnel(ctx, control, req)),
            Some(other) => {
                warn!(
                    "Unexpected message on control {}: {:?}",
                    control.client_id(),
                    other
                );
                continue;
            }
        };
        write_msg(conn, &reply).await?;
    }
}

fn request_tunnel(ctx: &ServerContext, control: &Control, req: ReqTunnel) -> NewTunnel {
    match ctx
        .tunnels
        .register_for_client(&req.protocol, control.client_id(), req.subdomain.as_deref())
    {
        Ok(url) => {
            control.tunnels.lock().push(url.clone());
            NewTunnel {
                req_id: req.req_id,
                url: Some(url),
                error: None,
            }
        }
        Err(e) => {
            warn!("Tunnel request from {} failed: {}", control.client_id(), e);
            NewTunnel {
                req_id: req.req_id,
                url: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Hand a proxy connection to the control that owns `reg.client_id`
pub fn register_proxy(ctx: &ServerContext, conn: Conn, reg: RegProxy) -> Result<()> {
    let control = ctx
        .controls
        .get(&reg.client_id)
        .ok_or_else(|| anyhow!("No control found for client {}", reg.client_id))?;

    if control.put_proxy(conn) {
        debug!(
            "Proxy registered for client {} ({} idle)",
            reg.client_id,
            control.idle_proxies()
        );
    } else {
        debug!("Proxy pool full for client {}, closing", reg.client_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use tokio::io::{duplex, BufReader, DuplexStream};

    fn conn(stream: DuplexStream) -> Conn {
        BufReader::new(Box::new(stream) as Box<dyn Stream>)
    }

    fn auth(client_id: Option<&str>) -> Auth {
        Auth {
            client_id: client_id.map(str::to_string),
            user: "demo".to_string(),
            version: "1".to_string(),
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_control_session() {
        let ctx = test_context();
        let (server, client) = duplex(4096);
        let session = tokio::spawn(run_control(
            Arc::clone(&ctx),
            conn(server),
            auth(Some("abc")),
            addr(),
        ));

        let mut client = BufReader::new(client);
        match read_msg(&mut client).await.unwrap() {
            Some(Message::AuthResp(resp)) => assert_eq!(resp.client_id, "abc"),
            other => panic!("unexpected {:?}", other),
        }

        write_msg(&mut client, &Message::Ping).await.unwrap();
        assert_eq!(read_msg(&mut client).await.unwrap(), Some(Message::Pong));

        let req = Message::ReqTunnel(ReqTunnel {
            req_id: "1".to_string(),
            protocol: "http".to_string(),
            subdomain: Some("demo".to_string()),
        });
        write_msg(&mut client, &req).await.unwrap();
        let url = match read_msg(&mut client).await.unwrap() {
            Some(Message::NewTunnel(tunnel)) => tunnel.url.unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ctx.tunnels.get(&url).unwrap().client_id, "abc");
        assert!(ctx.controls.get("abc").is_some());

        drop(client);
        session.await.unwrap().unwrap();

        assert!(ctx.tunnels.get(&url).is_none());
        assert!(ctx.controls.get("abc").is_none());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_control() {
        let ctx = test_context();

        let (server1, client1) = duplex(4096);
        let first = tokio::spawn(run_control(Arc::clone(&ctx), conn(server1), auth(Some("abc")), addr()));
        let mut client1 = BufReader::new(client1);
        assert!(matches!(read_msg(&mut client1).await.unwrap(), Some(Message::AuthResp(_))));

        let (server2, client2) = duplex(4096);
        let second = tokio::spawn(run_control(Arc::clone(&ctx), conn(server2), auth(Some("abc")), addr()));
        let mut client2 = BufReader::new(client2);
        assert!(matches!(read_msg(&mut client2).await.unwrap(), Some(Message::AuthResp(_))));

        // The first session ends without touching the newer registration.
        first.await.unwrap().unwrap();
        assert_eq!(ctx.controls.len(), 1);

        drop(client2);
        second.await.unwrap().unwrap();
        assert_eq!(ctx.controls.len(), 0);
    }

    #[tokio::test]
    async fn test_generated_client_id() {
        let ctx = test_context();
        let (server, client) = duplex(4096);
        let session = tokio::spawn(run_control(Arc::clone(&ctx), conn(server), auth(None), addr()));

        let mut client = BufReader::new(client);
        match read_msg(&mut client).await.unwrap() {
            Some(Message::AuthResp(resp)) => assert_eq!(resp.client_id.len(), 16),
            other => panic!("unexpected {:?}", other),
        }

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_proxy_registration() {
        let ctx = test_context();
        let control = Arc::new(Control::new("abc"));
        ctx.controls.add(Arc::clone(&control));

        let (server, _client) = duplex(64);
        let reg = RegProxy {
            client_id: "abc".to_string(),
        };
        register_proxy(&ctx, conn(server), reg).unwrap();
        assert_eq!(control.idle_proxies(), 1);
        assert!(control.take_proxy().is_some());

        let (server, _client) = duplex(64);
        let unknown = RegProxy {
            client_id: "nobody".to_string(),
        };
        assert!(register_proxy(&ctx, conn(server), unknown).is_err());
    }

    #[test]
    fn test_proxy_pool_is_capped() {
        let control = Control::new("abc");
        let mut clients = Vec::new();

        for _ in 0..MAX_IDLE_PROXIES {
            let (server, client) = duplex(64);
            clients.push(client);
            assert!(control.put_proxy(conn(server)));
        }
        let (server, _client) = duplex(64);
        assert!(!control.put_proxy(conn(server)));
        assert_eq!(control.idle_proxies(), MAX_IDLE_PROXIES);
    }
}
