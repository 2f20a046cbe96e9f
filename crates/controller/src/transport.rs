//! TCP transports bridging the broker to minions and API clients.
//!
//! Both channels speak length-delimited frames carrying bincode-encoded
//! frame structs. The minion channel is ROUTER-like: each connection opens
//! with a hello frame naming the minion's primary MAC, which becomes the
//! connection identity; the broker trusts that identity, never the sender
//! field inside later frames. The API channel assigns each client an ad-hoc
//! id that the broker echoes back on replies.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use lattice_primitives::codec;
use lattice_primitives::{AppId, Envelope, MacAddr, MinionAppId};

use crate::broker::{ApiIngress, MinionIngress};

/// First frame on a minion connection.
#[derive(Debug, Serialize, Deserialize)]
struct MinionHello {
    mac: MacAddr,
}

/// Minion -> controller frame.
#[derive(Debug, Serialize, Deserialize)]
struct MinionFrame {
    recv_app: AppId,
    sender_app: MinionAppId,
    envelope: Envelope,
}

/// Controller -> minion frame.
#[derive(Debug, Serialize, Deserialize)]
struct ToMinionFrame {
    recv_app: MinionAppId,
    sender_app: AppId,
    envelope: Envelope,
}

/// API client -> controller frame.
#[derive(Debug, Serialize, Deserialize)]
struct ApiFrame {
    recv_app: AppId,
    envelope: Envelope,
}

/// Controller -> API client frame.
#[derive(Debug, Serialize, Deserialize)]
struct ApiReplyFrame {
    sender_app: AppId,
    envelope: Envelope,
}

type ConnRegistry = Arc<RwLock<HashMap<MacAddr, mpsc::Sender<ToMinionFrame>>>>;

/// Accepts minion connections and shuttles frames between TCP and the broker.
pub struct MinionTransport {
    listener: TcpListener,
    ingress: mpsc::Sender<MinionIngress>,
    egress: mpsc::Receiver<(MacAddr, MinionAppId, AppId, Envelope)>,
    conns: ConnRegistry,
}

impl MinionTransport {
    pub fn new(
        listener: TcpListener,
        ingress: mpsc::Sender<MinionIngress>,
        egress: mpsc::Receiver<(MacAddr, MinionAppId, AppId, Envelope)>,
    ) -> Self {
        Self {
            listener,
            ingress,
            egress,
            conns: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "minion channel listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "minion connection accepted");
                            let ingress = self.ingress.clone();
                            let conns = Arc::clone(&self.conns);
                            tokio::spawn(handle_minion_conn(stream, ingress, conns));
                        }
                        Err(err) => warn!(?err, "minion accept failed"),
                    }
                }
                frame = self.egress.recv() => {
                    let Some((mac, recv_app, sender_app, envelope)) = frame else {
                        return;
                    };
                    let tx = self.conns.read().get(&mac).cloned();
                    match tx {
                        Some(tx) => {
                            if tx.try_send(ToMinionFrame {
                                recv_app,
                                sender_app,
                                envelope,
                            }).is_err() {
                                metrics::counter!("transport_minion_send_failures").increment(1);
                                debug!(%mac, "minion connection backlogged, frame dropped");
                            }
                        }
                        None => {
                            metrics::counter!("transport_minion_send_failures").increment(1);
                            debug!(%mac, "no connection for minion, frame dropped");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_minion_conn(
    stream: TcpStream,
    ingress: mpsc::Sender<MinionIngress>,
    conns: ConnRegistry,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    // The hello frame fixes the connection identity.
    let mac = match framed.next().await {
        Some(Ok(bytes)) => match codec::decode::<MinionHello>(&bytes) {
            Ok(hello) => hello.mac,
            Err(err) => {
                warn!(?err, "minion hello malformed, closing connection");
                return;
            }
        },
        _ => return,
    };

    let (tx, mut outbound) = mpsc::channel::<ToMinionFrame>(64);
    // Latest connection wins; a stale connection for the same minion is
    // superseded when the minion reconnects.
    conns.write().insert(mac, tx);
    info!(%mac, "minion attached");

    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(bytes)) => {
                        match codec::decode::<MinionFrame>(&bytes) {
                            Ok(frame) => {
                                if ingress
                                    .send((mac, frame.recv_app, frame.sender_app, frame.envelope))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(err) => {
                                metrics::counter!("transport_malformed_frames").increment(1);
                                warn!(%mac, ?err, "malformed minion frame dropped");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        debug!(%mac, ?err, "minion read error");
                        break;
                    }
                    None => break,
                }
            }
            out = outbound.recv() => {
                let Some(frame) = out else { break };
                let Ok(bytes) = codec::encode(&frame) else { continue };
                if framed.send(bytes.into()).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(%mac, "minion detached");
    drop(outbound);
    let mut registry = conns.write();
    // Only remove if this connection still owns the slot.
    if registry.get(&mac).map(|tx| tx.is_closed()) == Some(true) {
        registry.remove(&mac);
    }
}

/// Accepts local API clients.
pub struct ApiTransport {
    listener: TcpListener,
    ingress: mpsc::Sender<ApiIngress>,
    egress: mpsc::Receiver<(String, AppId, Envelope)>,
    clients: Arc<RwLock<HashMap<String, mpsc::Sender<ApiReplyFrame>>>>,
    next_client: u64,
}

impl ApiTransport {
    pub fn new(
        listener: TcpListener,
        ingress: mpsc::Sender<ApiIngress>,
        egress: mpsc::Receiver<(String, AppId, Envelope)>,
    ) -> Self {
        Self {
            listener,
            ingress,
            egress,
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "api channel listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.next_client += 1;
                            let client_id = format!("api-{}-{}", peer.port(), self.next_client);
                            let ingress = self.ingress.clone();
                            let clients = Arc::clone(&self.clients);
                            tokio::spawn(handle_api_conn(stream, client_id, ingress, clients));
                        }
                        Err(err) => warn!(?err, "api accept failed"),
                    }
                }
                reply = self.egress.recv() => {
                    let Some((client_id, sender_app, envelope)) = reply else {
                        return;
                    };
                    let tx = self.clients.read().get(&client_id).cloned();
                    if let Some(tx) = tx {
                        let _ = tx.try_send(ApiReplyFrame { sender_app, envelope });
                    } else {
                        debug!(client = %client_id, "api client gone, reply dropped");
                    }
                }
            }
        }
    }
}

async fn handle_api_conn(
    stream: TcpStream,
    client_id: String,
    ingress: mpsc::Sender<ApiIngress>,
    clients: Arc<RwLock<HashMap<String, mpsc::Sender<ApiReplyFrame>>>>,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (tx, mut replies) = mpsc::channel::<ApiReplyFrame>(64);
    clients.write().insert(client_id.clone(), tx);

    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(bytes)) => match codec::decode::<ApiFrame>(&bytes) {
                        Ok(frame) => {
                            if ingress
                                .send((client_id.clone(), frame.recv_app, frame.envelope))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(client = %client_id, ?err, "malformed api frame dropped");
                        }
                    },
                    _ => break,
                }
            }
            reply = replies.recv() => {
                let Some(frame) = reply else { break };
                let Ok(bytes) = codec::encode(&frame) else { continue };
                if framed.send(bytes.into()).await.is_err() {
                    break;
                }
            }
        }
    }

    clients.write().remove(&client_id);
}

// ---------------------------------------------------------------------------
// HA peer channel (publish/subscribe)
// ---------------------------------------------------------------------------

/// Fan heartbeat envelopes out to every connected peer subscription. In the
/// two-controller deployment there is exactly one subscriber (the peer),
/// but nothing depends on that.
pub async fn run_peer_publisher(
    listener: TcpListener,
    mut frames: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "peer publish channel listening");
    let subscribers: Arc<RwLock<Vec<mpsc::Sender<Envelope>>>> = Arc::new(RwLock::new(Vec::new()));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "peer subscribed");
                        let (tx, mut rx) = mpsc::channel::<Envelope>(16);
                        subscribers.write().push(tx);
                        tokio::spawn(async move {
                            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                            while let Some(envelope) = rx.recv().await {
                                let Ok(bytes) = codec::encode(&envelope) else { continue };
                                if framed.send(bytes.into()).await.is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    Err(err) => warn!(?err, "peer accept failed"),
                }
            }
            frame = frames.recv() => {
                let Some(envelope) = frame else { return };
                subscribers.write().retain(|tx| tx.try_send(envelope.clone()).is_ok() || !tx.is_closed());
            }
        }
    }
}

/// Subscribe to the peer controller's publish channel, reconnecting
/// indefinitely. Received envelopes feed the HA replicator.
pub async fn run_peer_subscriber(
    peer_addr: String,
    inbound: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let retry = std::time::Duration::from_secs(2);
    loop {
        if *shutdown.borrow() {
            return;
        }
        let stream = tokio::select! {
            _ = shutdown.changed() => continue,
            conn = TcpStream::connect(&peer_addr) => conn,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                debug!(peer = %peer_addr, ?err, "peer connect failed, retrying");
                tokio::time::sleep(retry).await;
                continue;
            }
        };
        info!(peer = %peer_addr, "subscribed to peer controller");
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(bytes)) => match codec::decode::<Envelope>(&bytes) {
                            Ok(envelope) => {
                                if inbound.send(envelope).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!(?err, "malformed peer frame dropped"),
                        },
                        _ => break,
                    }
                }
            }
        }
        debug!(peer = %peer_addr, "peer connection lost");
        tokio::time::sleep(retry).await;
    }
}
