//! Control bus: broadcast of integer signal codes across machines.
//!
//! The aggregator binds a [`BusPublisher`]; parties and power collectors each
//! connect a [`BusSubscriber`] before publishing starts. Frames are 4-byte
//! big-endian `i32` codes. Delivery is at-most-once: a code published before
//! a subscriber connects is never seen by it, and there is no replay.
//!
//! [`barrier_wait`] synchronizes on codes emitted by several independent
//! peers. Peers live on other hosts with no acknowledgement channel, so it is
//! a polling loop. It has no timeout: it returns only once every endpoint has
//! yielded the target code.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{AppResult, FleetError};

const FRAME_LEN: usize = 4;

/// Phase signals exchanged over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Parties start the evaluation phase (100)
    BeginEval,
    /// Evaluation after synchronization (101)
    BeginEvalPostSync,
    /// Party is up (200). Also sent as "work done" at the end of a phase
    PartyStarted,
    /// Party finished evaluating (201)
    EvalFinished,
    /// Party finished the post-sync evaluation (202)
    EvalFinishedPostSync,
    /// Collectors complete their logs and exit (300)
    StopPowerCollection,
    /// Party is shutting down (404)
    PartyClosing,
}

impl Signal {
    /// Work-done shares its code with party-started.
    pub const WORK_DONE: Signal = Signal::PartyStarted;

    /// Wire code of this signal.
    pub fn code(self) -> i32 {
        match self {
            Signal::BeginEval => 100,
            Signal::BeginEvalPostSync => 101,
            Signal::PartyStarted => 200,
            Signal::EvalFinished => 201,
            Signal::EvalFinishedPostSync => 202,
            Signal::StopPowerCollection => 300,
            Signal::PartyClosing => 404,
        }
    }

    /// Signal carried by `code`, if it is a known one.
    pub fn from_code(code: i32) -> Option<Signal> {
        match code {
            100 => Some(Signal::BeginEval),
            101 => Some(Signal::BeginEvalPostSync),
            200 => Some(Signal::PartyStarted),
            201 => Some(Signal::EvalFinished),
            202 => Some(Signal::EvalFinishedPostSync),
            300 => Some(Signal::StopPowerCollection),
            404 => Some(Signal::PartyClosing),
            _ => None,
        }
    }
}

type Subscribers = Arc<RwLock<Vec<(SocketAddr, TcpStream)>>>;

/// Publishing side of the bus.
///
/// Dropping the publisher stops the accept loop, which releases the port
/// and closes every subscriber connection.
pub struct BusPublisher {
    local_addr: SocketAddr,
    subscribers: Subscribers,
    accept_task: JoinHandle<()>,
}

impl BusPublisher {
    /// Bind `addr` and start accepting subscribers in the background.
    pub async fn bind(addr: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Control bus listening on {}", local_addr);

        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let accepted = subscribers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!("Bus subscriber connected: {}", peer);
                        let _ = socket.set_nodelay(true);
                        accepted.write().await.push((peer, socket));
                    }
                    Err(e) => warn!("Bus accept error: {}", e),
                }
            }
        });

        Ok(Self {
            local_addr,
            subscribers,
            accept_task,
        })
    }

    /// Address actually bound, with the real port when 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `code` to every connected subscriber, dropping dead ones.
    /// Returns the number of subscribers that received it.
    pub async fn publish(&self, code: i32) -> usize {
        let frame = code.to_be_bytes();
        let mut subscribers = self.subscribers.write().await;
        let mut delivered = Vec::with_capacity(subscribers.len());
        for (peer, mut socket) in subscribers.drain(..) {
            match socket.write_all(&frame).await {
                Ok(()) => delivered.push((peer, socket)),
                Err(e) => debug!("Dropping bus subscriber {}: {}", peer, e),
            }
        }
        let count = delivered.len();
        *subscribers = delivered;
        debug!("Published {} to {} subscriber(s)", code, count);
        count
    }

    /// [`publish`](Self::publish) the code of `signal`.
    pub async fn publish_signal(&self, signal: Signal) -> usize {
        self.publish(signal.code()).await
    }

    /// Subscribers currently connected.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Wait until at least `count` subscribers are connected.
    pub async fn wait_for_subscribers(&self, count: usize, limit: Duration) -> AppResult<()> {
        let waiting = async {
            while self.subscriber_count().await < count {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(limit, waiting).await.map_err(|_| {
            FleetError::Protocol(format!(
                "only {} of {} bus subscribers connected",
                self.subscribers.try_read().map(|s| s.len()).unwrap_or(0),
                count
            ))
        })
    }

    /// Stop accepting and close every subscriber connection. The port is
    /// free again once this returns.
    pub async fn shutdown(mut self) {
        self.accept_task.abort();
        // Resolves once the task is gone and the listener with it.
        let _ = (&mut self.accept_task).await;
        let mut subscribers = self.subscribers.write().await;
        for (_, socket) in subscribers.iter_mut() {
            let _ = socket.shutdown().await;
        }
        subscribers.clear();
        info!("Control bus on {} closed", self.local_addr);
    }
}

impl Drop for BusPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Anything a barrier can poll without blocking.
pub trait SignalSource {
    /// Next pending code, or `None` when nothing has arrived.
    fn try_recv(&mut self) -> AppResult<Option<i32>>;
}

/// Receiving side of the bus.
#[derive(Debug)]
pub struct BusSubscriber {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl BusSubscriber {
    /// Connect to the publisher at `addr`.
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            FleetError::connectivity(addr.to_string(), format!("bus connect failed: {}", e))
        })?;
        Ok(Self {
            stream,
            pending: Vec::new(),
        })
    }

    fn take_frame(&mut self) -> Option<i32> {
        if self.pending.len() < FRAME_LEN {
            return None;
        }
        let frame: Vec<u8> = self.pending.drain(..FRAME_LEN).collect();
        Some(i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]))
    }

    /// Wait for the next code.
    pub async fn recv(&mut self) -> AppResult<i32> {
        loop {
            if let Some(code) = SignalSource::try_recv(self)? {
                return Ok(code);
            }
            self.stream.readable().await?;
        }
    }
}

impl SignalSource for BusSubscriber {
    fn try_recv(&mut self) -> AppResult<Option<i32>> {
        loop {
            if let Some(code) = self.take_frame() {
                return Ok(Some(code));
            }
            let mut buf = [0u8; 64];
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(FleetError::Protocol("control bus closed".to_string()));
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Sleep intervals of [`barrier_wait`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierPolicy {
    /// Pause between sweeps while some endpoint is still unsatisfied
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Pause after the sweep that satisfied the last endpoint
    #[serde(with = "humantime_serde")]
    pub settle_interval: Duration,
}

impl Default for BarrierPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            settle_interval: Duration::from_millis(50),
        }
    }
}

/// Block until every endpoint has yielded exactly `code` at least once.
///
/// Each sweep polls every unsatisfied endpoint once. Other codes are consumed
/// and ignored. Returns the number of sweeps performed.
pub async fn barrier_wait<S: SignalSource>(
    endpoints: &mut [S],
    code: i32,
    policy: &BarrierPolicy,
) -> AppResult<usize> {
    let started = Instant::now();
    let mut satisfied = vec![false; endpoints.len()];
    let mut sweeps = 0;
    loop {
        sweeps += 1;
        for (endpoint, done) in endpoints.iter_mut().zip(satisfied.iter_mut()) {
            if *done {
                continue;
            }
            match endpoint.try_recv()? {
                Some(received) if received == code => *done = true,
                Some(other) => debug!("Barrier on {} ignored code {}", code, other),
                None => {}
            }
        }
        if satisfied.iter().all(|done| *done) {
            sleep(policy.settle_interval).await;
            debug!(
                "Barrier on {} released after {} sweep(s) in {:?}",
                code,
                sweeps,
                started.elapsed()
            );
            return Ok(sweeps);
        }
        sleep(policy.poll_interval).await;
    }
}
