//! Request/reply rendezvous between actor threads and the evaluation loop.
//!
//! An actor submits an observation batch and blocks on its ticket until the
//! serving loop answers. The serving loop collects *all* currently-waiting
//! requests (up to a timeout) into one concatenated batch, evaluates once,
//! and the reply is split back row-for-row per request. No ordering exists
//! across actors; within one actor the next request only goes out after the
//! previous reply arrived.

use std::sync::mpsc;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use sp_core::tensor::{batch_rows, concat_named, split_named, NamedTensors};

use crate::ChannelError;

/// Consumes one reply (or the terminal error) for a single request.
pub type ReplySink = Box<dyn FnOnce(Result<NamedTensors, ChannelError>) + Send>;

struct Pending {
    batch: NamedTensors,
    rows: usize,
    sink: ReplySink,
}

#[derive(Default)]
struct Shared {
    pending: Vec<Pending>,
    terminated: bool,
}

pub struct InferenceChannel {
    name: String,
    shared: Mutex<Shared>,
    cv: Condvar,
}

/// Handle an actor blocks on until its reply is routed back.
pub struct Ticket {
    rx: mpsc::Receiver<Result<NamedTensors, ChannelError>>,
}

impl Ticket {
    pub fn recv(&self) -> Result<NamedTensors, ChannelError> {
        match self.rx.recv() {
            Ok(r) => r,
            Err(_) => Err(ChannelError::Disconnected),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<NamedTensors, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ChannelError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Result<Option<NamedTensors>, ChannelError> {
        match self.rx.try_recv() {
            Ok(r) => Ok(Some(r?)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

/// One drained collection: the concatenated batch plus the bookkeeping needed
/// to route the reply back.
pub struct Collected {
    batch: Option<NamedTensors>,
    counts: Vec<usize>,
    sinks: Vec<ReplySink>,
    total_rows: usize,
}

impl Collected {
    fn empty() -> Self {
        Self {
            batch: None,
            counts: Vec::new(),
            sinks: Vec::new(),
            total_rows: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.sinks.len()
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn batch(&self) -> Option<&NamedTensors> {
        self.batch.as_ref()
    }
}

impl InferenceChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Mutex::new(Shared::default()),
            cv: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a request whose reply goes to `sink`. Used directly by the
    /// network server; local actors go through [`InferenceChannel::submit`].
    pub fn submit_with(&self, batch: NamedTensors, sink: ReplySink) -> Result<(), ChannelError> {
        let rows = match batch_rows(&batch) {
            Ok(r) => r,
            Err(_) => {
                sink(Err(ChannelError::BadRequest("inconsistent leading dim")));
                return Err(ChannelError::BadRequest("inconsistent leading dim"));
            }
        };
        let mut shared = self.shared.lock().unwrap();
        if shared.terminated {
            drop(shared);
            sink(Err(ChannelError::Terminated));
            return Err(ChannelError::Terminated);
        }
        shared.pending.push(Pending { batch, rows, sink });
        drop(shared);
        self.cv.notify_one();
        Ok(())
    }

    /// Enqueue a request and return the ticket the actor blocks on.
    pub fn submit(&self, batch: NamedTensors) -> Result<Ticket, ChannelError> {
        let (tx, rx) = mpsc::channel();
        self.submit_with(
            batch,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )?;
        Ok(Ticket { rx })
    }

    /// Submit and block until the reply arrives; the actor's only suspension
    /// point.
    pub fn request(&self, batch: NamedTensors) -> Result<NamedTensors, ChannelError> {
        self.submit(batch)?.recv()
    }

    /// Drain all currently-waiting requests into one batch.
    ///
    /// Waits up to `timeout` for the first request; an empty collection on
    /// timeout lets the caller check for shutdown instead of blocking
    /// forever. `Err(Terminated)` once the channel is shut down and drained.
    pub fn collect(&self, timeout: Duration) -> Result<Collected, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock().unwrap();
        loop {
            if !shared.pending.is_empty() {
                return Self::drain(&mut shared);
            }
            if shared.terminated {
                return Err(ChannelError::Terminated);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Collected::empty());
            }
            let (guard, _timeout_result) =
                self.cv.wait_timeout(shared, deadline - now).unwrap();
            shared = guard;
        }
    }

    fn drain(shared: &mut Shared) -> Result<Collected, ChannelError> {
        let pending = std::mem::take(&mut shared.pending);
        let mut counts = Vec::with_capacity(pending.len());
        let mut sinks = Vec::with_capacity(pending.len());
        let mut batches = Vec::with_capacity(pending.len());
        let mut total_rows = 0usize;
        for p in pending {
            counts.push(p.rows);
            total_rows += p.rows;
            batches.push(p.batch);
            sinks.push(p.sink);
        }
        let refs: Vec<&NamedTensors> = batches.iter().collect();
        let batch = match concat_named(&refs) {
            Ok(b) => b,
            Err(e) => {
                for sink in sinks {
                    sink(Err(ChannelError::MixedSchema));
                }
                return Err(ChannelError::Tensor(e));
            }
        };
        Ok(Collected {
            batch: Some(batch),
            counts,
            sinks,
            total_rows,
        })
    }

    /// Split the reply back per request and wake every waiter.
    pub fn reply(&self, collected: Collected, response: NamedTensors) -> Result<(), ChannelError> {
        let rows = batch_rows(&response)?;
        if rows != collected.total_rows {
            let expected = collected.total_rows;
            for sink in collected.sinks {
                sink(Err(ChannelError::ReplyShape { expected, got: rows }));
            }
            return Err(ChannelError::ReplyShape {
                expected,
                got: rows,
            });
        }
        let parts = split_named(&response, &collected.counts)?;
        for (part, sink) in parts.into_iter().zip(collected.sinks) {
            sink(Ok(part));
        }
        Ok(())
    }

    /// Shut down: fail the waiting requests and wake the collecting loop.
    pub fn terminate(&self) {
        let drained = {
            let mut shared = self.shared.lock().unwrap();
            shared.terminated = true;
            std::mem::take(&mut shared.pending)
        };
        for p in drained {
            (p.sink)(Err(ChannelError::Terminated));
        }
        self.cv.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().unwrap().terminated
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().unwrap().pending.len()
    }
}
