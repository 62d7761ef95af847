//! Multi-process training coordination over the wire protocol.
//!
//! Rank 0 owns the replay buffer and the rendezvous listener; ranks 1..n
//! connect and identify themselves. Collectives are deliberately simple:
//! `scatter` hands rank i its shard in one call, `barrier` releases only when
//! every rank has arrived, and `broadcast` ships the initial parameters and
//! buffers so all ranks start bit-identical. Remote-replay mode lets a
//! non-zero rank prefetch its next shard while the current step computes.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use sp_core::tensor::{self, NamedTensors};
use sp_net::protocol::{Barrier, Hello, Message, ModelUpdate, SampleReply, SampleRequest, Shard};
use sp_net::{parse_tcp_endpoint, recv_message, send_message};
use sp_replay::ReplayError;

use crate::TrainError;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

struct PeerConn {
    rank: u32,
    stream: TcpStream,
}

enum Role {
    Rank0 { peers: Vec<PeerConn> },
    Peer { stream: TcpStream },
}

pub struct DistributedTrainCoordinator {
    rank: u32,
    world_size: usize,
    role: Role,
}

/// Bound rendezvous listener; lets rank 0 publish its address before the
/// group has formed.
pub struct Rank0Listener {
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
}

impl Rank0Listener {
    pub fn bind(endpoint: &str) -> Result<Self, TrainError> {
        let listener = TcpListener::bind(parse_tcp_endpoint(endpoint)?)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Accept ranks 1..world_size and form the group.
    pub fn accept_group(self, world_size: usize) -> Result<DistributedTrainCoordinator, TrainError> {
        if world_size < 2 {
            return Err(TrainError::BadGroup(format!(
                "world_size {world_size} needs no coordinator"
            )));
        }
        let listener = self.listener;
        let mut peers: Vec<PeerConn> = Vec::with_capacity(world_size - 1);
        while peers.len() < world_size - 1 {
            let (mut stream, _) = listener.accept()?;
            stream.set_nodelay(true).ok();
            let rank = match recv_message(&mut stream)? {
                Message::Hello(Hello { rank, .. }) => rank,
                other => {
                    return Err(TrainError::Protocol {
                        rank: 0,
                        detail: format!("expected Hello, got {:?}", other.kind()),
                    })
                }
            };
            if rank == 0 || rank as usize >= world_size || peers.iter().any(|p| p.rank == rank) {
                return Err(TrainError::BadGroup(format!(
                    "bad or duplicate rank {rank} in a group of {world_size}"
                )));
            }
            peers.push(PeerConn { rank, stream });
        }
        peers.sort_by_key(|p| p.rank);
        Ok(DistributedTrainCoordinator {
            rank: 0,
            world_size,
            role: Role::Rank0 { peers },
        })
    }
}

impl DistributedTrainCoordinator {
    /// Rank 0: listen on the rendezvous endpoint until all other ranks have
    /// attached and identified themselves.
    pub fn rank0(endpoint: &str, world_size: usize) -> Result<Self, TrainError> {
        Rank0Listener::bind(endpoint)?.accept_group(world_size)
    }

    /// Rank 1..n: connect to rank 0 and identify.
    pub fn peer(endpoint: &str, rank: u32, world_size: usize) -> Result<Self, TrainError> {
        if rank == 0 || rank as usize >= world_size {
            return Err(TrainError::BadGroup(format!(
                "rank {rank} invalid in a group of {world_size}"
            )));
        }
        let mut stream = TcpStream::connect(parse_tcp_endpoint(endpoint)?)?;
        stream.set_nodelay(true).ok();
        send_message(
            &mut stream,
            &Message::Hello(Hello {
                rank,
                wants_model_updates: true,
                tournament_opponent: false,
            }),
        )?;
        Ok(Self {
            rank,
            world_size,
            role: Role::Peer { stream },
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Block until every rank has arrived.
    pub fn barrier(&mut self) -> Result<(), TrainError> {
        match &mut self.role {
            Role::Rank0 { peers } => {
                for p in peers.iter_mut() {
                    match recv_message(&mut p.stream)? {
                        Message::Barrier(Barrier { rank }) if rank == p.rank => {}
                        other => {
                            return Err(TrainError::Protocol {
                                rank: p.rank,
                                detail: format!("expected Barrier, got {:?}", other.kind()),
                            })
                        }
                    }
                }
                for p in peers.iter_mut() {
                    send_message(&mut p.stream, &Message::BarrierRelease)?;
                }
                Ok(())
            }
            Role::Peer { stream } => {
                send_message(stream, &Message::Barrier(Barrier { rank: self.rank }))?;
                match recv_message(stream)? {
                    Message::BarrierRelease => Ok(()),
                    other => Err(TrainError::Protocol {
                        rank: 0,
                        detail: format!("expected BarrierRelease, got {:?}", other.kind()),
                    }),
                }
            }
        }
    }

    /// Rank 0: ship a tagged tensor map to every rank.
    pub fn broadcast(&mut self, tag: &str, tensors: &NamedTensors) -> Result<(), TrainError> {
        let Role::Rank0 { peers } = &mut self.role else {
            return Err(TrainError::BadGroup(
                "broadcast is a rank-0 operation".to_string(),
            ));
        };
        let blob = tensor::to_safetensors(tensors, None)?;
        for p in peers.iter_mut() {
            send_message(
                &mut p.stream,
                &Message::ModelUpdate(ModelUpdate {
                    tag: tag.to_string(),
                    blob: blob.clone(),
                }),
            )?;
        }
        Ok(())
    }

    /// Ranks 1..n: receive one broadcast tensor map.
    pub fn recv_broadcast(&mut self) -> Result<(String, NamedTensors), TrainError> {
        let Role::Peer { stream } = &mut self.role else {
            return Err(TrainError::BadGroup(
                "recv_broadcast is a non-rank-0 operation".to_string(),
            ));
        };
        match recv_message(stream)? {
            Message::ModelUpdate(ModelUpdate { tag, blob }) => {
                let (tensors, _meta) = tensor::from_safetensors(&blob)?;
                Ok((tag, tensors))
            }
            other => Err(TrainError::Protocol {
                rank: 0,
                detail: format!("expected ModelUpdate, got {:?}", other.kind()),
            }),
        }
    }

    /// Rank 0: scatter per-rank shares in one call; returns rank 0's own
    /// shard. `shards[i]` goes to rank i.
    pub fn scatter(
        &mut self,
        step: u64,
        mut shards: Vec<NamedTensors>,
    ) -> Result<NamedTensors, TrainError> {
        let Role::Rank0 { peers } = &mut self.role else {
            return Err(TrainError::BadGroup(
                "scatter is a rank-0 operation".to_string(),
            ));
        };
        if shards.len() != self.world_size {
            return Err(TrainError::BadGroup(format!(
                "scatter got {} shards for a group of {}",
                shards.len(),
                self.world_size
            )));
        }
        for p in peers.iter_mut() {
            let blob = tensor::to_safetensors(&shards[p.rank as usize], None)?;
            send_message(&mut p.stream, &Message::Shard(Shard { step, blob }))?;
        }
        Ok(shards.swap_remove(0))
    }

    /// Ranks 1..n: receive this rank's shard of the current step.
    pub fn recv_shard(&mut self) -> Result<(u64, NamedTensors), TrainError> {
        let Role::Peer { stream } = &mut self.role else {
            return Err(TrainError::BadGroup(
                "recv_shard is a non-rank-0 operation".to_string(),
            ));
        };
        match recv_message(stream)? {
            Message::Shard(Shard { step, blob }) => {
                let (tensors, _meta) = tensor::from_safetensors(&blob)?;
                Ok((step, tensors))
            }
            other => Err(TrainError::Protocol {
                rank: 0,
                detail: format!("expected Shard, got {:?}", other.kind()),
            }),
        }
    }
}

type SampleFn = dyn Fn(usize) -> Result<NamedTensors, ReplayError> + Send + Sync;

/// Serves replay samples to remote ranks: one `SampleRequest` in, one
/// `SampleReply` out, per connection.
pub struct ReplaySampleServer {
    local_addr: std::net::SocketAddr,
    terminated: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl ReplaySampleServer {
    pub fn start(endpoint: &str, sampler: Arc<SampleFn>) -> Result<Self, TrainError> {
        let listener = TcpListener::bind(parse_tcp_endpoint(endpoint)?)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let terminated = Arc::new(AtomicBool::new(false));

        let accept = {
            let terminated = Arc::clone(&terminated);
            std::thread::Builder::new()
                .name("sp-replay-server".to_string())
                .spawn(move || loop {
                    if terminated.load(Ordering::Relaxed) {
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let sampler = Arc::clone(&sampler);
                            let terminated = Arc::clone(&terminated);
                            let _ = std::thread::Builder::new()
                                .name("sp-replay-server-conn".to_string())
                                .spawn(move || serve_samples(stream, &*sampler, &terminated));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL);
                        }
                        Err(_) => std::thread::sleep(ACCEPT_POLL),
                    }
                })?
        };

        Ok(Self {
            local_addr,
            terminated,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.terminated.store(true, Ordering::Relaxed);
        if let Some(h) = self.accept.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ReplaySampleServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_samples(mut stream: TcpStream, sampler: &SampleFn, terminated: &AtomicBool) {
    stream.set_nodelay(true).ok();
    loop {
        if terminated.load(Ordering::Relaxed) {
            return;
        }
        let batchsize = match recv_message(&mut stream) {
            Ok(Message::SampleRequest(SampleRequest { batchsize })) => batchsize as usize,
            Ok(_) | Err(_) => return,
        };
        let reply = sampler(batchsize)
            .ok()
            .and_then(|batch| tensor::to_safetensors(&batch, None).ok());
        let Some(blob) = reply else { return };
        if send_message(&mut stream, &Message::SampleReply(SampleReply { blob })).is_err() {
            return;
        }
    }
}

struct PrefetchSlot {
    batch: Mutex<Option<Result<NamedTensors, String>>>,
    ready: Condvar,
    taken: Condvar,
}

/// Remote-replay client with one shard of lookahead: the background thread
/// fetches the next batch while the caller's current step computes.
pub struct RemoteSampler {
    slot: Arc<PrefetchSlot>,
    terminated: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    stream: TcpStream,
}

impl RemoteSampler {
    pub fn connect(endpoint: &str, batchsize: usize) -> Result<Self, TrainError> {
        let stream = TcpStream::connect(parse_tcp_endpoint(endpoint)?)?;
        stream.set_nodelay(true).ok();
        let slot = Arc::new(PrefetchSlot {
            batch: Mutex::new(None),
            ready: Condvar::new(),
            taken: Condvar::new(),
        });
        let terminated = Arc::new(AtomicBool::new(false));

        let worker = {
            let slot = Arc::clone(&slot);
            let terminated = Arc::clone(&terminated);
            let mut stream = stream.try_clone()?;
            std::thread::Builder::new()
                .name("sp-remote-sampler".to_string())
                .spawn(move || loop {
                    {
                        let mut guard = slot.batch.lock().unwrap();
                        while guard.is_some() && !terminated.load(Ordering::Relaxed) {
                            guard = slot.taken.wait(guard).unwrap();
                        }
                    }
                    if terminated.load(Ordering::Relaxed) {
                        return;
                    }
                    let fetched = fetch_batch(&mut stream, batchsize);
                    let failed = fetched.is_err();
                    *slot.batch.lock().unwrap() = Some(fetched);
                    slot.ready.notify_all();
                    if failed {
                        return;
                    }
                })?
        };

        Ok(Self {
            slot,
            terminated,
            worker: Some(worker),
            stream,
        })
    }

    /// Take the prefetched batch (blocking until one is available) and kick
    /// off the next fetch.
    pub fn next_batch(&self) -> Result<NamedTensors, TrainError> {
        let mut guard = self.slot.batch.lock().unwrap();
        while guard.is_none() {
            if self.terminated.load(Ordering::Relaxed) {
                return Err(TrainError::Terminated);
            }
            guard = self.slot.ready.wait(guard).unwrap();
        }
        let out = guard.take();
        drop(guard);
        self.slot.taken.notify_all();
        match out {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(detail)) => Err(TrainError::Protocol { rank: 0, detail }),
            None => Err(TrainError::Terminated),
        }
    }

    pub fn shutdown(&mut self) {
        self.terminated.store(true, Ordering::Relaxed);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.slot.taken.notify_all();
        self.slot.ready.notify_all();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

impl Drop for RemoteSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fetch_batch(stream: &mut TcpStream, batchsize: usize) -> Result<NamedTensors, String> {
    send_message(
        stream,
        &Message::SampleRequest(SampleRequest {
            batchsize: batchsize as u32,
        }),
    )
    .map_err(|e| e.to_string())?;
    match recv_message(stream).map_err(|e| e.to_string())? {
        Message::SampleReply(SampleReply { blob }) => tensor::from_safetensors(&blob)
            .map(|(batch, _meta)| batch)
            .map_err(|e| e.to_string()),
        other => Err(format!("expected SampleReply, got {:?}", other.kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use sp_core::schema;
    use sp_core::tensor::Tensor;
    use sp_replay::ReplayBuffer;

    fn shard(v: f32) -> NamedTensors {
        let mut b = NamedTensors::new();
        b.insert(
            schema::OBS.to_string(),
            Tensor::from_f32(vec![2, 1], vec![v; 2]).unwrap(),
        );
        b
    }

    fn bound_rank0() -> (Rank0Listener, String) {
        let listener = Rank0Listener::bind("tcp://127.0.0.1:0").unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr());
        (listener, endpoint)
    }

    #[test]
    fn scatter_hands_each_rank_its_own_shard() {
        let (listener, endpoint) = bound_rank0();
        let rank0 = std::thread::spawn(move || {
            let mut c = listener.accept_group(3).unwrap();
            let own = c
                .scatter(7, vec![shard(0.0), shard(1.0), shard(2.0)])
                .unwrap();
            assert_eq!(own[schema::OBS].as_f32().unwrap(), &[0.0, 0.0]);
            c.barrier().unwrap();
        });

        let mut peers = Vec::new();
        for rank in [1u32, 2u32] {
            let ep = endpoint.clone();
            peers.push(std::thread::spawn(move || {
                let mut c = DistributedTrainCoordinator::peer(&ep, rank, 3).unwrap();
                let (step, got) = c.recv_shard().unwrap();
                assert_eq!(step, 7);
                assert_eq!(got[schema::OBS].as_f32().unwrap(), &[rank as f32; 2]);
                c.barrier().unwrap();
            }));
        }
        rank0.join().unwrap();
        for p in peers {
            p.join().unwrap();
        }
    }

    #[test]
    fn barrier_waits_for_the_slowest_rank() {
        let (listener, endpoint) = bound_rank0();
        let rank0 = std::thread::spawn(move || {
            let mut c = listener.accept_group(3).unwrap();
            c.barrier().unwrap();
        });
        let ep1 = endpoint.clone();
        let fast = std::thread::spawn(move || {
            let mut c = DistributedTrainCoordinator::peer(&ep1, 1, 3).unwrap();
            let t0 = Instant::now();
            c.barrier().unwrap();
            t0.elapsed()
        });
        let ep2 = endpoint.clone();
        let slow = std::thread::spawn(move || {
            let mut c = DistributedTrainCoordinator::peer(&ep2, 2, 3).unwrap();
            std::thread::sleep(Duration::from_millis(150));
            c.barrier().unwrap();
        });

        let fast_wait = fast.join().unwrap();
        slow.join().unwrap();
        rank0.join().unwrap();
        assert!(
            fast_wait >= Duration::from_millis(100),
            "fast rank was released before the slow one arrived ({fast_wait:?})"
        );
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let (listener, endpoint) = bound_rank0();
        let rank0 = std::thread::spawn(move || {
            let mut c = listener.accept_group(2).unwrap();
            c.broadcast("params", &shard(3.5)).unwrap();
        });
        let mut c = DistributedTrainCoordinator::peer(&endpoint, 1, 2).unwrap();
        let (tag, got) = c.recv_broadcast().unwrap();
        assert_eq!(tag, "params");
        assert_eq!(got[schema::OBS].as_f32().unwrap(), &[3.5, 3.5]);
        rank0.join().unwrap();
    }

    #[test]
    fn remote_sampler_prefetches_from_the_replay_server() {
        let buf = Arc::new(ReplayBuffer::new(32, 5));
        for i in 0..8 {
            let mut slot = NamedTensors::new();
            slot.insert(
                schema::OBS.to_string(),
                Tensor::from_f32(vec![1], vec![i as f32]).unwrap(),
            );
            buf.add(slot).unwrap();
        }
        let sampler_buf = Arc::clone(&buf);
        let mut server = ReplaySampleServer::start(
            "tcp://127.0.0.1:0",
            Arc::new(move |n| sampler_buf.sample(n)),
        )
        .unwrap();

        let endpoint = format!("tcp://{}", server.local_addr());
        let sampler = RemoteSampler::connect(&endpoint, 4).unwrap();
        for _ in 0..3 {
            let batch = sampler.next_batch().unwrap();
            assert_eq!(batch[schema::OBS].shape(), &[4, 1]);
        }
        assert!(buf.num_sampled() >= 12);

        drop(sampler);
        server.shutdown();
    }
}
