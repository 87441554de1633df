use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, Notify, mpsc, watch},
    time::timeout,
};
use uuid::Uuid;

use crate::burrow::{
    config::ServerConfig,
    net::normalize_bind_addr,
    tunnel::{
        POLL_INTERVAL,
        frame::{Frame, FrameDecoder, FrameError, MAX_DATA_SIZE},
        registry::Registry,
    },
};

const ACCEPT_QUEUE: usize = 100;

/// One public connection's write side plus its close signal. Kept in the
/// registry so the tunnel reader can route response frames back to it.
struct PublicConn {
    writer: Mutex<OwnedWriteHalf>,
    closed: Notify,
}

/// Write side of the active tunnel connection. The generation number lets a
/// superseded tunnel reader detect that a later client replaced it.
struct TunnelWriter {
    generation: u64,
    writer: Mutex<OwnedWriteHalf>,
}

struct Shared {
    public_conns: Registry<PublicConn>,
    tunnel: ArcSwapOption<TunnelWriter>,
    generations: AtomicU64,
}

/// The relay endpoint: accepts public connections on one port and the tunnel
/// client on another, multiplexing public traffic over the tunnel by
/// correlation id. Only one tunnel client is honored at a time; a later
/// client connection replaces the current one.
pub struct Server {
    public_ln: TcpListener,
    client_ln: TcpListener,
    public_addr: SocketAddr,
    client_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind both listeners. Bind failure is process-fatal.
    pub async fn bind(cfg: &ServerConfig) -> anyhow::Result<Self> {
        let public_ln = listen(cfg.public_port).await?;
        let client_ln = listen(cfg.client_port).await?;
        let public_addr = public_ln.local_addr()?;
        let client_addr = client_ln.local_addr()?;

        tracing::info!(
            public_addr = %public_addr,
            client_addr = %client_addr,
            "relay: listening"
        );

        Ok(Self {
            public_ln,
            client_ln,
            public_addr,
            client_addr,
            shared: Arc::new(Shared {
                public_conns: Registry::new(),
                tunnel: ArcSwapOption::const_empty(),
                generations: AtomicU64::new(0),
            }),
        })
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (mut public_rx, public_task) = accept_loop(self.public_ln);
        let (mut client_rx, client_task) = accept_loop(self.client_ln);

        let res = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                conn = public_rx.recv() => {
                    let Some(conn) = conn else {
                        break Err(anyhow::anyhow!("relay: public listener closed"));
                    };
                    if let Ok(remote) = conn.peer_addr() {
                        tracing::info!(remote = %remote, "relay: public connection");
                    }
                    let shared = self.shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(handle_public_conn(shared, conn, shutdown));
                }
                conn = client_rx.recv() => {
                    let Some(conn) = conn else {
                        break Err(anyhow::anyhow!("relay: client listener closed"));
                    };
                    if let Ok(remote) = conn.peer_addr() {
                        tracing::info!(remote = %remote, "relay: tunnel client connection");
                    }
                    let (rd, wr) = conn.into_split();
                    let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
                    // Last writer wins: a later client replaces the tunnel.
                    self.shared.tunnel.store(Some(Arc::new(TunnelWriter {
                        generation,
                        writer: Mutex::new(wr),
                    })));
                    let shared = self.shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(run_tunnel_reader(shared, rd, generation, shutdown));
                }
            }
        };

        public_task.abort();
        client_task.abort();
        tracing::info!("relay: stopped");
        res
    }
}

async fn listen(port: u16) -> anyhow::Result<TcpListener> {
    let addr = normalize_bind_addr(&format!(":{port}")).into_owned();
    TcpListener::bind(&addr)
        .await
        .map_err(|err| anyhow::anyhow!("relay: bind {addr}: {err}"))
}

/// Long-lived acceptor feeding a bounded queue; terminates and closes the
/// queue when the listener errors.
fn accept_loop(ln: TcpListener) -> (mpsc::Receiver<TcpStream>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
    let task = tokio::spawn(async move {
        loop {
            match ln.accept().await {
                Ok((conn, _)) => {
                    if tx.send(conn).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(err = %err, "relay: accept failed");
                    break;
                }
            }
        }
    });
    (rx, task)
}

/// Per-public-connection task: assign a fresh correlation id, register the
/// write half, then pump public bytes into tunnel frames. A read error or EOF
/// on the public socket is the normal close path.
async fn handle_public_conn(
    shared: Arc<Shared>,
    conn: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = Uuid::new_v4();
    let (mut rd, wr) = conn.into_split();
    let entry = Arc::new(PublicConn {
        writer: Mutex::new(wr),
        closed: Notify::new(),
    });
    shared.public_conns.insert(id, entry.clone()).await;

    let mut buf = vec![0u8; MAX_DATA_SIZE];
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = entry.closed.notified() => break,
            res = rd.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        tracing::info!(id = %id, "relay: public connection closed");
                        break;
                    }
                    Err(err) => {
                        tracing::info!(id = %id, err = %err, "relay: public connection dropped");
                        break;
                    }
                    Ok(n) => {
                        let Some(tunnel) = shared.tunnel.load_full() else {
                            tracing::info!(id = %id, "relay: dropping connection, no tunnel client");
                            break;
                        };

                        let frame = Frame::new(id, Bytes::copy_from_slice(&buf[..n]));
                        tracing::debug!(id = %id, len = n, "relay: forwarding request data");

                        let mut w = tunnel.writer.lock().await;
                        if let Err(err) = w.write_all(&frame.encode()).await {
                            tracing::error!(id = %id, err = %err, "relay: could not send frame to tunnel client");
                            break;
                        }
                    }
                }
            }
        }
    }

    shared.public_conns.remove(&id).await;
}

/// Tunnel reader for one client connection: decode frames and route them back
/// to the originating public socket by correlation id. Exits on tunnel EOF or
/// when a later client connection supersedes this one.
async fn run_tunnel_reader(
    shared: Arc<Shared>,
    rd: OwnedReadHalf,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dec = FrameDecoder::new(rd);

    loop {
        match shared.tunnel.load().as_deref() {
            Some(t) if t.generation == generation => {}
            _ => {
                tracing::info!(generation, "relay: tunnel superseded by newer client");
                return;
            }
        }

        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = timeout(POLL_INTERVAL, dec.read_frame()) => {
                match res {
                    // Poll timeout: loop so cancellation and supersession are
                    // observed promptly.
                    Err(_) => continue,
                    Ok(Ok(frame)) => route_frame(&shared, frame).await,
                    Ok(Err(FrameError::Eof)) => {
                        tracing::error!("relay: lost tunnel client connection");
                        break;
                    }
                    Ok(Err(err)) => {
                        // The delimiter framing has no resync point, so any
                        // other decode error is terminal for this link too.
                        tracing::error!(err = %err, "relay: unreadable tunnel stream, dropping link");
                        break;
                    }
                }
            }
        }
    }

    // Clear the current-tunnel slot only if it is still ours.
    let _ = shared.tunnel.rcu(|cur| match cur {
        Some(t) if t.generation == generation => None,
        other => other.clone(),
    });
}

async fn route_frame(shared: &Shared, frame: Frame) {
    let Some(public) = shared.public_conns.lookup(&frame.id).await else {
        tracing::error!(id = %frame.id, "relay: no public socket for frame, discarding");
        return;
    };

    if frame.is_close() {
        tracing::debug!(id = %frame.id, "relay: close signal, closing public socket");
        shared.public_conns.remove(&frame.id).await;
        public.closed.notify_one();
        return;
    }

    tracing::debug!(id = %frame.id, len = frame.data.len(), "relay: forwarding response data");
    let mut w = public.writer.lock().await;
    if let Err(err) = w.write_all(&frame.data).await {
        drop(w);
        tracing::error!(id = %frame.id, err = %err, "relay: could not forward response data");
        shared.public_conns.remove(&frame.id).await;
        public.closed.notify_one();
    }
}
