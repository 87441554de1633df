use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, watch},
    time::timeout,
};
use uuid::Uuid;

use crate::burrow::{
    config::ClientConfig,
    tunnel::{
        POLL_INTERVAL,
        frame::{Frame, FrameDecoder, FrameError, MAX_DATA_SIZE},
        registry::Registry,
    },
};

const WORK_QUEUE: usize = 100;

/// One upstream connection's write side, keyed by correlation id. Entries are
/// not evicted; a dead upstream surfaces as a write error on the next frame
/// for its id, and that request is dropped.
struct Upstream {
    writer: Mutex<OwnedWriteHalf>,
}

/// The tunnel client endpoint: dials the relay once, decodes request frames,
/// and fans them out to per-session connections against the local upstream.
pub struct Client {
    cfg: ClientConfig,
    upstreams: Arc<Registry<Upstream>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        Self {
            cfg,
            upstreams: Arc::new(Registry::new()),
        }
    }

    /// Dial the relay and run until the tunnel link is lost or shutdown
    /// fires. Failure to reach the relay at startup is fatal and propagates.
    pub async fn connect(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let conn = TcpStream::connect(&self.cfg.server_addr)
            .await
            .with_context(|| format!("client: dial relay {}", self.cfg.server_addr))?;

        tracing::info!(
            server_addr = %self.cfg.server_addr,
            upstream_port = self.cfg.port,
            "client: connected to relay"
        );

        let (rd, wr) = conn.into_split();
        let tunnel_wr = Arc::new(Mutex::new(wr));

        let (tx, mut rx) = mpsc::channel::<Frame>(WORK_QUEUE);
        let reader = tokio::spawn(read_tunnel_frames(rd, tx, shutdown.clone()));

        // Single consumer: frames for one id are forwarded in arrival order.
        while let Some(frame) = rx.recv().await {
            let id = frame.id;
            if let Err(err) = self.forward_frame(frame, &tunnel_wr, &shutdown).await {
                tracing::error!(id = %id, err = %err, "client: could not forward request");
            }
        }

        let _ = reader.await;
        tracing::info!("client: stopped");
        Ok(())
    }

    /// Write the frame's data to the session's upstream connection, dialing
    /// the upstream on first use of an id. A dial failure drops this request;
    /// later frames for the same id will retry the dial.
    ///
    /// Invariant: only the single queue consumer in `connect` calls this.
    /// The gap between `lookup` and `insert` relies on that; a second
    /// consumer would have to dial under the registry lock to avoid
    /// duplicate upstream connections for one id.
    async fn forward_frame(
        &self,
        frame: Frame,
        tunnel_wr: &Arc<Mutex<OwnedWriteHalf>>,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if let Some(up) = self.upstreams.lookup(&frame.id).await {
            let mut w = up.writer.lock().await;
            timeout(self.cfg.timeout, w.write_all(&frame.data))
                .await
                .context("client: upstream write timed out")??;
            return Ok(());
        }

        let addr = format!("127.0.0.1:{}", self.cfg.port);
        let conn = timeout(self.cfg.timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("client: dial upstream {addr} timed out"))?
            .with_context(|| format!("client: dial upstream {addr}"))?;

        tracing::debug!(id = %frame.id, upstream = %addr, "client: new upstream session");

        let (rd, wr) = conn.into_split();
        let up = Arc::new(Upstream {
            writer: Mutex::new(wr),
        });
        self.upstreams.insert(frame.id, up.clone()).await;

        {
            let mut w = up.writer.lock().await;
            timeout(self.cfg.timeout, w.write_all(&frame.data))
                .await
                .context("client: upstream write timed out")??;
        }

        tokio::spawn(relay_responses(
            frame.id,
            rd,
            tunnel_wr.clone(),
            shutdown.clone(),
        ));
        Ok(())
    }
}

/// Tunnel-reader loop: decode frames off the relay link and queue them for
/// the forwarder. EOF means the relay is gone, which ends the endpoint.
async fn read_tunnel_frames(
    rd: OwnedReadHalf,
    tx: mpsc::Sender<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dec = FrameDecoder::new(rd);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            res = timeout(POLL_INTERVAL, dec.read_frame()) => {
                match res {
                    Err(_) => continue,
                    Ok(Ok(frame)) => {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Ok(Err(FrameError::Eof)) => {
                        tracing::error!("client: lost connection to relay, stopping");
                        return;
                    }
                    Ok(Err(err)) => {
                        tracing::error!(err = %err, "client: could not read request frame");
                        return;
                    }
                }
            }
        }
    }
}

/// Per-session response relay: stream upstream bytes back over the tunnel as
/// frames for this id. Upstream EOF emits the close signal so the relay can
/// shut the matching public socket.
async fn relay_responses(
    id: Uuid,
    mut rd: OwnedReadHalf,
    tunnel_wr: Arc<Mutex<OwnedWriteHalf>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATA_SIZE];

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            res = timeout(POLL_INTERVAL, rd.read(&mut buf)) => {
                let frame = match res {
                    // No data yet; keep the session alive.
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        tracing::debug!(id = %id, "client: upstream closed, signaling session close");
                        Frame::close(id)
                    }
                    Ok(Ok(n)) => Frame::new(id, Bytes::copy_from_slice(&buf[..n])),
                    Ok(Err(err)) => {
                        tracing::error!(id = %id, err = %err, "client: could not read response data");
                        return;
                    }
                };

                let done = frame.is_close();
                let mut w = tunnel_wr.lock().await;
                if let Err(err) = w.write_all(&frame.encode()).await {
                    tracing::error!(id = %id, err = %err, "client: could not send response data");
                    return;
                }
                drop(w);
                if done {
                    return;
                }
            }
        }
    }
}
