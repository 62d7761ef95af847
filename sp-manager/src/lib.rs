//! `ModelManager`: owns the replay buffer, the actor-facing channels and the
//! current weights, and wires the optional network roles.
//!
//! One manager serves one model. The training side swaps weights in with
//! [`ModelManager::update_model`]; actors evaluate against whichever snapshot
//! was current when their batch was collected. A second manager with
//! [`ModelManager::set_is_tournament_opponent`] set acts as a frozen
//! evaluation opponent.

mod client;
mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use rustc_hash::FxHashMap;
use thiserror::Error;

use sp_channel::{train_channel, ChannelError, InferenceChannel, TrainReceiver, TrainSender};
use sp_core::config::SimulationConfig;
use sp_core::model::{EvalError, Evaluator, WeightsSnapshot};
use sp_core::tensor::{self, NamedTensors, TensorError};
use sp_replay::{ReplayBuffer, ReplayError};
use sp_net::WireError;

pub use client::ClientHandle;
pub use server::ServerHandle;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("both server and client roles were configured; exactly one may be active")]
    ConflictingRoles,
    #[error("network role already started")]
    RoleAlreadyActive,
    #[error("no client role is active")]
    NoClientRole,
    #[error("remote peer disconnected")]
    Disconnected,
    #[error("manager terminated")]
    Terminated,
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long the serving loop waits for the first request before returning
    /// an empty batch to check for shutdown.
    pub act_collect_timeout: Duration,
    pub replay_capacity: usize,
    pub train_channel_slots: usize,
    /// Poll interval of the trajectory ingest thread.
    pub train_channel_timeout: Duration,
    pub seed: u64,
}

impl ManagerConfig {
    pub fn from_simulation(sim: &SimulationConfig) -> Self {
        Self {
            act_collect_timeout: Duration::from_millis(10),
            replay_capacity: sim.replay_capacity,
            train_channel_slots: sim.train_channel_slots,
            train_channel_timeout: Duration::from_millis(sim.train_channel_timeout_ms),
            seed: sim.seed,
        }
    }
}

/// State shared with the network and ingest threads.
pub(crate) struct Shared {
    pub(crate) replay: ReplayBuffer,
    pub(crate) act_channel: InferenceChannel,
    pub(crate) weights: RwLock<Arc<WeightsSnapshot>>,
    pub(crate) tournament: Mutex<FxHashMap<String, Arc<WeightsSnapshot>>>,
    pub(crate) is_tournament_opponent: AtomicBool,
    pub(crate) dont_request_model_updates: AtomicBool,
    pub(crate) terminated: AtomicBool,
    pub(crate) fault: Mutex<Option<ManagerError>>,
}

impl Shared {
    pub(crate) fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }

    pub(crate) fn current_weights(&self) -> Arc<WeightsSnapshot> {
        Arc::clone(&self.weights.read().unwrap())
    }

    pub(crate) fn swap_weights(&self, weights: WeightsSnapshot) {
        *self.weights.write().unwrap() = Arc::new(weights);
    }

    fn record_fault(&self, err: ManagerError) {
        let mut fault = self.fault.lock().unwrap();
        if fault.is_none() {
            *fault = Some(err);
        }
        self.terminated.store(true, Ordering::Relaxed);
    }
}

enum RoleState {
    Unset,
    Server(ServerHandle),
    Client(ClientHandle),
}

/// Handle actors keep: inference request/reply plus the trajectory push.
#[derive(Clone)]
pub struct ActorHandle {
    shared: Arc<Shared>,
    train_tx: TrainSender,
}

impl ActorHandle {
    /// Submit an observation batch and block until the evaluation loop
    /// answers; the actor's only suspension point.
    pub fn infer(&self, batch: NamedTensors) -> Result<NamedTensors, ManagerError> {
        Ok(self.shared.act_channel.request(batch)?)
    }

    /// Hand a finished trajectory (slots stacked along a new leading dim) to
    /// the ingest thread.
    pub fn push_trajectory(&self, trajectory: NamedTensors) -> Result<(), ManagerError> {
        Ok(self.train_tx.push(trajectory)?)
    }
}

pub struct ModelManager {
    cfg: ManagerConfig,
    shared: Arc<Shared>,
    train_tx: TrainSender,
    ingest: Mutex<Option<JoinHandle<()>>>,
    role: Mutex<RoleState>,
}

impl ModelManager {
    /// Build a manager with an empty replay buffer.
    pub fn new(cfg: ManagerConfig) -> Self {
        let replay = ReplayBuffer::new(cfg.replay_capacity, cfg.seed);
        Self::with_buffer(cfg, replay)
    }

    /// Build a manager around a restored replay buffer.
    pub fn with_buffer(cfg: ManagerConfig, replay: ReplayBuffer) -> Self {
        let (train_tx, train_rx) = train_channel(cfg.train_channel_slots, cfg.train_channel_timeout);
        let shared = Arc::new(Shared {
            replay,
            act_channel: InferenceChannel::new("act"),
            weights: RwLock::new(Arc::new(WeightsSnapshot::default())),
            tournament: Mutex::new(FxHashMap::default()),
            is_tournament_opponent: AtomicBool::new(false),
            dont_request_model_updates: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            fault: Mutex::new(None),
        });
        let ingest = spawn_ingest(Arc::clone(&shared), train_rx);
        Self {
            cfg,
            shared,
            train_tx,
            ingest: Mutex::new(Some(ingest)),
            role: Mutex::new(RoleState::Unset),
        }
    }

    pub fn actor_handle(&self) -> ActorHandle {
        ActorHandle {
            shared: Arc::clone(&self.shared),
            train_tx: self.train_tx.clone(),
        }
    }

    // Replay pass-throughs.

    pub fn sample(&self, batchsize: usize) -> Result<NamedTensors, ManagerError> {
        Ok(self.shared.replay.sample(batchsize)?)
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.replay.size()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.shared.replay.capacity()
    }

    pub fn buffer_full(&self) -> bool {
        self.shared.replay.is_full()
    }

    pub fn buffer_num_add(&self) -> u64 {
        self.shared.replay.num_added()
    }

    pub fn buffer_num_sample(&self) -> u64 {
        self.shared.replay.num_sampled()
    }

    pub fn export_buffer(&self) -> Result<Vec<u8>, ManagerError> {
        Ok(self.shared.replay.export()?)
    }

    // Weights.

    /// Swap in fresh weights; future evaluations use them, in-flight ones
    /// keep the snapshot they already grabbed. Server role broadcasts to
    /// attached peers.
    pub fn update_model(&self, weights: WeightsSnapshot) -> Result<(), ManagerError> {
        let blob = weights.to_bytes()?;
        self.shared.swap_weights(weights);
        if let RoleState::Server(server) = &*self.role.lock().unwrap() {
            server.broadcast_model("latest", blob);
        }
        Ok(())
    }

    pub fn current_weights(&self) -> Arc<WeightsSnapshot> {
        self.shared.current_weights()
    }

    /// Store a named frozen snapshot for later evaluation matches.
    pub fn add_tournament_model(&self, tag: impl Into<String>, weights: WeightsSnapshot) {
        self.shared
            .tournament
            .lock()
            .unwrap()
            .insert(tag.into(), Arc::new(weights));
    }

    pub fn tournament_model(&self, tag: &str) -> Option<Arc<WeightsSnapshot>> {
        self.shared.tournament.lock().unwrap().get(tag).cloned()
    }

    pub fn tournament_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .shared
            .tournament
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }

    pub fn set_is_tournament_opponent(&self, v: bool) {
        self.shared.is_tournament_opponent.store(v, Ordering::Relaxed);
    }

    pub fn is_tournament_opponent(&self) -> bool {
        self.shared.is_tournament_opponent.load(Ordering::Relaxed)
    }

    pub fn set_dont_request_model_updates(&self, v: bool) {
        self.shared
            .dont_request_model_updates
            .store(v, Ordering::Relaxed);
    }

    // Network roles.

    /// Listen for remote actors. Fails if a role is already active.
    pub fn start_server(&self, endpoint: &str) -> Result<(), ManagerError> {
        let addr = sp_net::parse_tcp_endpoint(endpoint)?;
        let mut role = self.role.lock().unwrap();
        match &*role {
            RoleState::Unset => {}
            RoleState::Client(_) => return Err(ManagerError::ConflictingRoles),
            RoleState::Server(_) => return Err(ManagerError::RoleAlreadyActive),
        }
        let server = ServerHandle::start(Arc::clone(&self.shared), addr)?;
        *role = RoleState::Server(server);
        Ok(())
    }

    /// Connect outward and behave as a remote actor. Fails if a role is
    /// already active.
    pub fn start_client(&self, endpoint: &str) -> Result<(), ManagerError> {
        let addr = sp_net::parse_tcp_endpoint(endpoint)?;
        let mut role = self.role.lock().unwrap();
        match &*role {
            RoleState::Unset => {}
            RoleState::Server(_) => return Err(ManagerError::ConflictingRoles),
            RoleState::Client(_) => return Err(ManagerError::RoleAlreadyActive),
        }
        let client = ClientHandle::start(Arc::clone(&self.shared), addr)?;
        *role = RoleState::Client(client);
        Ok(())
    }

    /// Bound address of the server role (for tests and logs).
    pub fn server_addr(&self) -> Option<std::net::SocketAddr> {
        match &*self.role.lock().unwrap() {
            RoleState::Server(s) => Some(s.local_addr()),
            _ => None,
        }
    }

    pub fn connected_peers(&self) -> usize {
        match &*self.role.lock().unwrap() {
            RoleState::Server(s) => s.connected_peers(),
            _ => 0,
        }
    }

    /// Push a finished trajectory upstream over the client connection.
    pub fn remote_push_trajectory(&self, trajectory: &NamedTensors) -> Result<(), ManagerError> {
        match &*self.role.lock().unwrap() {
            RoleState::Client(c) => c.push_trajectory(trajectory),
            _ => Err(ManagerError::NoClientRole),
        }
    }

    /// Evaluate an observation batch on the serving side over the wire.
    pub fn remote_infer(
        &self,
        batch: &NamedTensors,
        timeout: Duration,
    ) -> Result<NamedTensors, ManagerError> {
        match &*self.role.lock().unwrap() {
            RoleState::Client(c) => c.infer(batch, timeout),
            _ => Err(ManagerError::NoClientRole),
        }
    }

    // Serving.

    /// Run the evaluation loop until terminated: collect waiting requests,
    /// evaluate under the current snapshot, split the reply back.
    pub fn serve_inference(&self, evaluator: &dyn Evaluator) -> Result<(), ManagerError> {
        loop {
            if self.shared.terminated() {
                return Ok(());
            }
            let collected = match self.shared.act_channel.collect(self.cfg.act_collect_timeout) {
                Ok(c) => c,
                Err(ChannelError::Terminated) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if collected.is_empty() {
                continue;
            }
            let weights = self.shared.current_weights();
            let Some(batch) = collected.batch() else {
                continue;
            };
            let reply = evaluator.evaluate(&weights, batch)?;
            self.shared.act_channel.reply(collected, reply)?;
        }
    }

    /// Cooperative shutdown: flip the flag and wake everything that blocks.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::Relaxed);
        self.shared.act_channel.terminate();
        let mut role = self.role.lock().unwrap();
        match &mut *role {
            RoleState::Server(s) => s.shutdown(),
            RoleState::Client(c) => c.shutdown(),
            RoleState::Unset => {}
        }
    }

    /// Join background threads and surface any fault recorded by them.
    pub fn join(&self) -> Result<(), ManagerError> {
        if let Some(h) = self.ingest.lock().unwrap().take() {
            let _ = h.join();
        }
        let mut role = self.role.lock().unwrap();
        match std::mem::replace(&mut *role, RoleState::Unset) {
            RoleState::Server(mut s) => s.join(),
            RoleState::Client(mut c) => c.join(),
            RoleState::Unset => {}
        }
        drop(role);
        self.shared.fault.lock().unwrap().take().map_or(Ok(()), Err)
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        self.terminate();
        let _ = self.join();
    }
}

/// Drain finished trajectories into the replay buffer until shutdown.
fn spawn_ingest(shared: Arc<Shared>, rx: TrainReceiver) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("sp-ingest".to_string())
        .spawn(move || loop {
            match rx.drain_next() {
                Ok(Some(trajectory)) => {
                    let slots = match tensor::unstack_named(&trajectory) {
                        Ok(s) => s,
                        Err(e) => {
                            shared.record_fault(ManagerError::Tensor(e));
                            return;
                        }
                    };
                    if let Err(e) = shared.replay.add_all(slots) {
                        shared.record_fault(ManagerError::Replay(e));
                        return;
                    }
                }
                Ok(None) => {
                    if shared.terminated() {
                        return;
                    }
                }
                Err(_) => return,
            }
        })
        .expect("spawn ingest thread")
}
