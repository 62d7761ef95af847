//! Client role: connect outward and behave as a remote actor.
//!
//! The connection carries trajectories upstream, weight updates downstream,
//! and optional remote inference. Replies are routed back to callers by
//! request id, one pending entry per in-flight request.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rustc_hash::FxHashMap;

use sp_core::model::WeightsSnapshot;
use sp_core::tensor::{self, NamedTensors};
use sp_net::protocol::{Hello, InferRequest, Message, TrainBatch};
use sp_net::{recv_message, send_message};

use crate::{ManagerError, Shared};

const OUTBOUND_QUEUE: usize = 256;
const MODEL_REQUEST_PERIOD: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

type PendingMap = Arc<Mutex<FxHashMap<u64, mpsc::Sender<Result<NamedTensors, ManagerError>>>>>;

pub struct ClientHandle {
    stream: TcpStream,
    outbound: Option<mpsc::SyncSender<Message>>,
    alive: Arc<AtomicBool>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    requester: Option<JoinHandle<()>>,
}

impl ClientHandle {
    pub(crate) fn start(shared: Arc<Shared>, addr: &str) -> Result<Self, ManagerError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();

        let mut hello_stream = stream.try_clone()?;
        send_message(
            &mut hello_stream,
            &Message::Hello(Hello {
                rank: 0,
                wants_model_updates: !shared.dont_request_model_updates.load(Ordering::Relaxed),
                tournament_opponent: shared.is_tournament_opponent.load(Ordering::Relaxed),
            }),
        )?;

        let (outbound_tx, outbound_rx) = mpsc::sync_channel::<Message>(OUTBOUND_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(FxHashMap::default()));

        let reader = {
            let shared = Arc::clone(&shared);
            let alive = Arc::clone(&alive);
            let pending = Arc::clone(&pending);
            let mut stream = stream.try_clone()?;
            std::thread::Builder::new()
                .name("sp-client-r".to_string())
                .spawn(move || {
                    reader_loop(&shared, &mut stream, &alive, &pending);
                })
                .map_err(ManagerError::Io)?
        };

        let writer = {
            let alive = Arc::clone(&alive);
            let mut stream = stream.try_clone()?;
            std::thread::Builder::new()
                .name("sp-client-w".to_string())
                .spawn(move || {
                    while let Ok(msg) = outbound_rx.recv() {
                        if !alive.load(Ordering::Relaxed) {
                            return;
                        }
                        if let Err(e) = send_message(&mut stream, &msg) {
                            eprintln!("[client] write failed: {e}");
                            alive.store(false, Ordering::Relaxed);
                            let _ = stream.shutdown(std::net::Shutdown::Both);
                            return;
                        }
                    }
                })
                .map_err(ManagerError::Io)?
        };

        // Periodically ask for fresh weights, unless this manager is a frozen
        // opponent.
        let requester = {
            let shared = Arc::clone(&shared);
            let alive = Arc::clone(&alive);
            let outbound = outbound_tx.clone();
            std::thread::Builder::new()
                .name("sp-client-mreq".to_string())
                .spawn(move || {
                    let mut since_request = MODEL_REQUEST_PERIOD;
                    loop {
                        if shared.terminated() || !alive.load(Ordering::Relaxed) {
                            return;
                        }
                        if since_request >= MODEL_REQUEST_PERIOD {
                            since_request = Duration::ZERO;
                            if !shared.dont_request_model_updates.load(Ordering::Relaxed) {
                                let _ = outbound.try_send(Message::RequestModel);
                            }
                        }
                        std::thread::sleep(SHUTDOWN_POLL);
                        since_request += SHUTDOWN_POLL;
                    }
                })
                .map_err(ManagerError::Io)?
        };

        Ok(Self {
            stream,
            outbound: Some(outbound_tx),
            alive,
            pending,
            next_request_id: AtomicU64::new(1),
            reader: Some(reader),
            writer: Some(writer),
            requester: Some(requester),
        })
    }

    fn outbound(&self) -> Result<&mpsc::SyncSender<Message>, ManagerError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(ManagerError::Disconnected);
        }
        self.outbound.as_ref().ok_or(ManagerError::Disconnected)
    }

    /// Send a finished trajectory to the serving side's replay buffer.
    pub fn push_trajectory(&self, trajectory: &NamedTensors) -> Result<(), ManagerError> {
        let blob = tensor::to_safetensors(trajectory, None)?;
        self.outbound()?
            .send(Message::TrainBatch(TrainBatch { blob }))
            .map_err(|_| ManagerError::Disconnected)
    }

    /// Evaluate an observation batch on the serving side.
    pub fn infer(
        &self,
        batch: &NamedTensors,
        timeout: Duration,
    ) -> Result<NamedTensors, ManagerError> {
        let blob = tensor::to_safetensors(batch, None)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending.lock().unwrap().insert(request_id, tx);

        let sent = self
            .outbound()
            .and_then(|out| {
                out.send(Message::InferRequest(InferRequest { request_id, blob }))
                    .map_err(|_| ManagerError::Disconnected)
            });
        if let Err(e) = sent {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(ManagerError::Channel(sp_channel::ChannelError::Timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ManagerError::Disconnected),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.outbound.take();
    }

    pub(crate) fn join(&mut self) {
        self.shutdown();
        for h in [
            self.reader.take(),
            self.writer.take(),
            self.requester.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = h.join();
        }
        fail_all_pending(&self.pending);
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.join();
    }
}

fn reader_loop(
    shared: &Arc<Shared>,
    stream: &mut TcpStream,
    alive: &Arc<AtomicBool>,
    pending: &PendingMap,
) {
    loop {
        if shared.terminated() || !alive.load(Ordering::Relaxed) {
            return;
        }
        let msg = match recv_message(stream) {
            Ok(m) => m,
            Err(e) => {
                if alive.swap(false, Ordering::Relaxed) && !shared.terminated() {
                    eprintln!("[client] connection lost: {e}");
                }
                let _ = stream.shutdown(std::net::Shutdown::Both);
                fail_all_pending(pending);
                return;
            }
        };
        match msg {
            Message::ModelUpdate(update) => {
                if shared.dont_request_model_updates.load(Ordering::Relaxed) {
                    continue;
                }
                match WeightsSnapshot::from_bytes(&update.blob) {
                    Ok(weights) => shared.swap_weights(weights),
                    Err(e) => eprintln!("[client] bad model update '{}': {e}", update.tag),
                }
            }
            Message::InferResponse(resp) => {
                let entry = pending.lock().unwrap().remove(&resp.request_id);
                if let Some(tx) = entry {
                    let result = tensor::from_safetensors(&resp.blob)
                        .map(|(batch, _meta)| batch)
                        .map_err(ManagerError::from);
                    let _ = tx.send(result);
                }
            }
            other => {
                eprintln!("[client] unexpected message {:?}", other.kind());
            }
        }
    }
}

fn fail_all_pending(pending: &PendingMap) {
    let drained: Vec<_> = {
        let mut guard = pending.lock().unwrap();
        guard.drain().collect()
    };
    for (_id, tx) in drained {
        let _ = tx.send(Err(ManagerError::Disconnected));
    }
}
