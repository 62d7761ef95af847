//! Server role: accepts remote actor connections, ingests their trajectories,
//! answers their inference requests and broadcasts weight updates.
//!
//! A broken peer connection is never fatal: its pending work is dropped and
//! the rest keep being served.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use sp_core::tensor;
use sp_net::protocol::{Hello, InferResponse, Message, ModelUpdate};
use sp_net::{recv_message, send_message};

use crate::{ManagerError, Shared};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PEER_OUTBOUND_QUEUE: usize = 64;

struct Peer {
    stream: TcpStream,
    outbound: Option<mpsc::SyncSender<Message>>,
    alive: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    wants_model_updates: bool,
}

impl Peer {
    fn shutdown_and_join(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.outbound.take();
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        if let Some(h) = self.writer.take() {
            let _ = h.join();
        }
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    accept: Option<JoinHandle<()>>,
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl ServerHandle {
    pub(crate) fn start(shared: Arc<Shared>, addr: &str) -> Result<Self, ManagerError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let peers: Arc<Mutex<Vec<Peer>>> = Arc::new(Mutex::new(Vec::new()));

        let accept = {
            let peers = Arc::clone(&peers);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("sp-server-accept".to_string())
                .spawn(move || {
                    let next_peer_id = AtomicU64::new(1);
                    loop {
                        if shared.terminated() {
                            return;
                        }
                        match listener.accept() {
                            Ok((stream, peer_addr)) => {
                                match attach_peer(
                                    &shared,
                                    stream,
                                    peer_addr,
                                    next_peer_id.fetch_add(1, Ordering::Relaxed),
                                ) {
                                    Ok(peer) => {
                                        let mut guard = peers.lock().unwrap();
                                        guard.retain_mut(|p| {
                                            if p.alive.load(Ordering::Relaxed) {
                                                true
                                            } else {
                                                p.shutdown_and_join();
                                                false
                                            }
                                        });
                                        guard.push(peer);
                                    }
                                    Err(e) => {
                                        eprintln!("[server] handshake with {peer_addr} failed: {e}");
                                    }
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                std::thread::sleep(ACCEPT_POLL);
                            }
                            Err(e) => {
                                eprintln!("[server] accept error: {e}");
                                std::thread::sleep(ACCEPT_POLL);
                            }
                        }
                    }
                })
                .map_err(ManagerError::Io)?
        };

        Ok(Self {
            local_addr,
            accept: Some(accept),
            peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_peers(&self) -> usize {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.alive.load(Ordering::Relaxed))
            .count()
    }

    /// Queue a weight snapshot to every attached peer that subscribes to
    /// updates. Best effort: a peer with a full queue just misses this one.
    pub(crate) fn broadcast_model(&self, tag: &str, blob: Vec<u8>) {
        let peers = self.peers.lock().unwrap();
        for p in peers.iter() {
            if !p.wants_model_updates || !p.alive.load(Ordering::Relaxed) {
                continue;
            }
            if let Some(tx) = &p.outbound {
                let _ = tx.try_send(Message::ModelUpdate(ModelUpdate {
                    tag: tag.to_string(),
                    blob: blob.clone(),
                }));
            }
        }
    }

    pub(crate) fn shutdown(&mut self) {
        for p in self.peers.lock().unwrap().iter_mut() {
            p.shutdown_and_join();
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(h) = self.accept.take() {
            let _ = h.join();
        }
        for p in self.peers.lock().unwrap().iter_mut() {
            p.shutdown_and_join();
        }
    }
}

/// Handshake a fresh connection and spawn its reader/writer threads.
fn attach_peer(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: u64,
) -> Result<Peer, ManagerError> {
    stream.set_nodelay(true).ok();
    stream.set_nonblocking(false)?;

    let mut handshake_stream = stream.try_clone()?;
    let hello = match recv_message(&mut handshake_stream)? {
        Message::Hello(h) => h,
        other => {
            return Err(ManagerError::Wire(sp_net::WireError::Decode(
                sp_net::codec::DecodeError::BadKind(other.kind() as u8),
            )))
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::sync_channel::<Message>(PEER_OUTBOUND_QUEUE);
    let alive = Arc::new(AtomicBool::new(true));

    // Every peer gets the current weights once at attach time; tournament
    // opponents get nothing further.
    let wants_model_updates = hello.wants_model_updates && !hello.tournament_opponent;
    {
        let weights = shared.current_weights();
        if !weights.tensors.is_empty() && hello.wants_model_updates {
            let _ = outbound_tx.try_send(Message::ModelUpdate(ModelUpdate {
                tag: "latest".to_string(),
                blob: weights.to_bytes()?,
            }));
        }
    }

    let reader = {
        let shared = Arc::clone(shared);
        let alive = Arc::clone(&alive);
        let outbound = outbound_tx.clone();
        let mut stream = stream.try_clone()?;
        std::thread::Builder::new()
            .name(format!("sp-server-peer{id}-r"))
            .spawn(move || {
                peer_reader_loop(&shared, &mut stream, &outbound, &alive, &hello, peer_addr);
            })
            .map_err(ManagerError::Io)?
    };

    let writer = {
        let alive = Arc::clone(&alive);
        let mut stream = stream.try_clone()?;
        std::thread::Builder::new()
            .name(format!("sp-server-peer{id}-w"))
            .spawn(move || {
                while let Ok(msg) = outbound_rx.recv() {
                    if !alive.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(e) = send_message(&mut stream, &msg) {
                        eprintln!("[server] peer {peer_addr} write failed: {e}");
                        alive.store(false, Ordering::Relaxed);
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        return;
                    }
                }
            })
            .map_err(ManagerError::Io)?
    };

    Ok(Peer {
        stream,
        outbound: Some(outbound_tx),
        alive,
        reader: Some(reader),
        writer: Some(writer),
        wants_model_updates,
    })
}

fn peer_reader_loop(
    shared: &Arc<Shared>,
    stream: &mut TcpStream,
    outbound: &mpsc::SyncSender<Message>,
    alive: &Arc<AtomicBool>,
    hello: &Hello,
    peer_addr: SocketAddr,
) {
    loop {
        if shared.terminated() || !alive.load(Ordering::Relaxed) {
            return;
        }
        let msg = match recv_message(stream) {
            Ok(m) => m,
            Err(e) => {
                if alive.swap(false, Ordering::Relaxed) && !shared.terminated() {
                    eprintln!("[server] peer {peer_addr} dropped: {e}");
                }
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        };
        match msg {
            Message::TrainBatch(t) => {
                let add = tensor::from_safetensors(&t.blob)
                    .map_err(ManagerError::from)
                    .and_then(|(stacked, _meta)| {
                        let slots = tensor::unstack_named(&stacked)?;
                        shared.replay.add_all(slots).map_err(ManagerError::from)
                    });
                if let Err(e) = add {
                    // Bad remote data drops the peer, not the run.
                    eprintln!("[server] peer {peer_addr} sent a bad train batch: {e}");
                    alive.store(false, Ordering::Relaxed);
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return;
                }
            }
            Message::RequestModel => {
                let weights = shared.current_weights();
                if let Ok(blob) = weights.to_bytes() {
                    let _ = outbound.try_send(Message::ModelUpdate(ModelUpdate {
                        tag: "latest".to_string(),
                        blob,
                    }));
                }
            }
            Message::InferRequest(req) => {
                let batch = match tensor::from_safetensors(&req.blob) {
                    Ok((b, _meta)) => b,
                    Err(e) => {
                        eprintln!("[server] peer {peer_addr} sent a bad infer request: {e}");
                        alive.store(false, Ordering::Relaxed);
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        return;
                    }
                };
                let request_id = req.request_id;
                let reply_out = outbound.clone();
                let submit = shared.act_channel.submit_with(
                    batch,
                    Box::new(move |result| {
                        if let Ok(reply) = result {
                            if let Ok(blob) = tensor::to_safetensors(&reply, None) {
                                let _ = reply_out.try_send(Message::InferResponse(InferResponse {
                                    request_id,
                                    blob,
                                }));
                            }
                        }
                        // A failed evaluation leaves the request unanswered;
                        // the peer's own timeout handles it.
                    }),
                );
                if submit.is_err() {
                    return;
                }
            }
            other => {
                eprintln!(
                    "[server] peer {peer_addr} (rank {}) sent unexpected {:?}; dropping it",
                    hello.rank,
                    other.kind()
                );
                alive.store(false, Ordering::Relaxed);
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        }
    }
}
