//! Delivery of finalized response sets to the server.
//!
//! [`SubmissionBatch`] holds the not-yet-acknowledged sets and decides what
//! each delivery attempt contains. [`Submitter`] drives it from a worker
//! thread: one attempt in flight at a time, exponential backoff after a
//! failure, and a retry that covers whatever the batch holds by then.
//! A set leaves the batch only when a request containing it was accepted.

use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{SourceError, TransportError};
use crate::responses::{Participant, ResponseSet};
use crate::Row;

/// Exponential backoff: `min(cap, base * 2^failures)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(120))
    }
}

/// Resolves once the batch it was taken from becomes empty.
#[derive(Debug)]
pub struct Drained {
    rx: Receiver<()>,
}

impl Drained {
    fn channel() -> (Sender<()>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// Blocks until drained. Returns false if the submitter went away first.
    pub fn wait(&self) -> bool {
        self.rx.recv().is_ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    set: Arc<ResponseSet>,
}

/// Snapshot of the batch sent in one request.
#[derive(Debug, Clone)]
pub struct Attempt {
    ids: Vec<u64>,
    sets: Vec<Arc<ResponseSet>>,
}

impl Attempt {
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn sets(&self) -> &[Arc<ResponseSet>] {
        &self.sets
    }

    /// All rows of all sets, in batch order.
    pub fn rows(&self) -> Vec<&Row> {
        self.sets.iter().flat_map(|set| set.rows()).collect()
    }
}

#[derive(Debug, Default)]
pub struct SubmissionBatch {
    entries: Vec<Entry>,
    next_id: u64,
    in_flight: bool,
    failures: u32,
    backoff: Backoff,
    drained: Vec<Sender<()>>,
}

impl SubmissionBatch {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    /// Appends a set. Returns the attempt to start when nothing is in flight.
    pub fn enqueue(&mut self, set: ResponseSet) -> Option<Attempt> {
        self.entries.push(Entry {
            id: self.next_id,
            set: Arc::new(set),
        });
        self.next_id += 1;
        if self.in_flight {
            return None;
        }
        self.in_flight = true;
        Some(self.snapshot())
    }

    /// Removes exactly the sets of an accepted attempt. Returns the follow-up
    /// attempt when sets remain.
    pub fn acknowledge(&mut self, attempt: &Attempt) -> Option<Attempt> {
        self.entries.retain(|entry| !attempt.ids.contains(&entry.id));
        self.failures = 0;
        if self.entries.is_empty() {
            self.in_flight = false;
            for tx in self.drained.drain(..) {
                let _ = tx.send(());
            }
            return None;
        }
        Some(self.snapshot())
    }

    /// Records a failed attempt and returns how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.backoff.delay(self.failures)
    }

    /// Snapshot of the current contents after a backoff.
    pub fn retry(&mut self) -> Option<Attempt> {
        if self.entries.is_empty() {
            error!("attempted to submit responses with an empty batch");
            self.in_flight = false;
            return None;
        }
        Some(self.snapshot())
    }

    pub fn on_drained(&mut self) -> Drained {
        let (tx, drained) = Drained::channel();
        if self.entries.is_empty() {
            let _ = tx.send(());
        } else {
            self.drained.push(tx);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn snapshot(&self) -> Attempt {
        Attempt {
            ids: self.entries.iter().map(|entry| entry.id).collect(),
            sets: self.entries.iter().map(|entry| Arc::clone(&entry.set)).collect(),
        }
    }
}

/// Body of one delivery request.
#[derive(Debug, Serialize)]
pub struct DeliveryRequest<'a> {
    pub participant: &'a Participant,
    pub rows: Vec<&'a Row>,
}

impl DeliveryRequest<'_> {
    pub fn form_fields(&self) -> Result<[(&'static str, String); 4], serde_json::Error> {
        Ok([
            ("u", self.participant.username.clone()),
            ("i", self.participant.id.clone()),
            ("e", self.participant.experiment.clone()),
            ("responses", serde_json::to_string(&self.rows)?),
        ])
    }
}

pub trait Transport: Send + 'static {
    fn deliver(&mut self, request: &DeliveryRequest<'_>) -> Result<(), TransportError>;
}

/// Form-encoded POST; the server accepts with status 200 and an empty body.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Transport for HttpTransport {
    fn deliver(&mut self, request: &DeliveryRequest<'_>) -> Result<(), TransportError> {
        let fields = request.form_fields()?;
        let response = self.client.post(&self.url).form(&fields).send()?;
        let status = response.status();
        let body = response.text()?;
        if status == reqwest::StatusCode::OK && body.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Appends delivered rows as JSON lines to a local file.
#[derive(Debug, Clone)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows previously written to `path`; empty when the file does not exist.
    pub fn read_rows(path: &Path) -> Result<Vec<Row>, SourceError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let io_err = |source: std::io::Error| SourceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = fs::File::open(path).map_err(io_err)?;
        let mut rows = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line).map_err(|source| SourceError::Json {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })?;
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Transport for FileTransport {
    fn deliver(&mut self, request: &DeliveryRequest<'_>) -> Result<(), TransportError> {
        let io_err = |source: std::io::Error| TransportError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut payload = String::new();
        for row in &request.rows {
            payload.push_str(&serde_json::to_string(row)?);
            payload.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(payload.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }
}

/// Delivers through `inner` and, once a request is accepted, appends the
/// same rows to a local file so the session can be resumed from disk.
#[derive(Debug)]
pub struct MirroredTransport<T> {
    inner: T,
    mirror: FileTransport,
}

impl<T: Transport> MirroredTransport<T> {
    pub fn new(inner: T, mirror: FileTransport) -> Self {
        Self { inner, mirror }
    }
}

impl<T: Transport> Transport for MirroredTransport<T> {
    fn deliver(&mut self, request: &DeliveryRequest<'_>) -> Result<(), TransportError> {
        self.inner.deliver(request)?;
        // The server already holds these rows; failing here would resend them.
        if let Err(err) = self.mirror.deliver(request) {
            warn!(
                error = %err,
                path = %self.mirror.path().display(),
                "accepted responses could not be mirrored locally"
            );
        }
        Ok(())
    }
}

struct WorkerState {
    batch: SubmissionBatch,
    ready: Option<Attempt>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the submission batch of one session and its delivery worker.
pub struct Submitter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Submitter {
    pub fn spawn<T: Transport>(transport: T, participant: Participant, backoff: Backoff) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState {
                batch: SubmissionBatch::new(backoff),
                ready: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || deliver_loop(&worker_shared, transport, &participant));
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues a set for delivery without waiting for the network.
    pub fn enqueue(&self, set: ResponseSet) {
        let mut state = self.shared.lock();
        if let Some(attempt) = state.batch.enqueue(set) {
            state.ready = Some(attempt);
            self.shared.wake.notify_all();
        }
    }

    pub fn on_drained(&self) -> Drained {
        self.shared.lock().batch.on_drained()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().batch.len()
    }

    pub fn failures(&self) -> u32 {
        self.shared.lock().batch.failures()
    }

    /// Stops the worker at its next suspension point and returns the number
    /// of sets left undelivered.
    pub fn shutdown(mut self) -> usize {
        self.stop();
        self.pending()
    }

    fn stop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("submission worker panicked");
            }
        }
        let pending = self.pending();
        if pending > 0 {
            warn!(pending, "submitter stopped with undelivered response sets");
        }
    }
}

impl Drop for Submitter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn deliver_loop<T: Transport>(shared: &Shared, mut transport: T, participant: &Participant) {
    loop {
        let attempt = {
            let state = shared.lock();
            let mut state = shared
                .wake
                .wait_while(state, |s| s.ready.is_none() && !s.shutdown)
                .unwrap_or_else(PoisonError::into_inner);
            if state.shutdown {
                return;
            }
            match state.ready.take() {
                Some(attempt) => attempt,
                None => continue,
            }
        };

        let request = DeliveryRequest {
            participant,
            rows: attempt.rows(),
        };
        let outcome = transport.deliver(&request);

        let mut state = shared.lock();
        match outcome {
            Ok(()) => {
                info!(
                    sets = attempt.len(),
                    rows = request.rows.len(),
                    "response sets delivered"
                );
                state.ready = state.batch.acknowledge(&attempt);
            }
            Err(err) => {
                let delay = state.batch.fail();
                warn!(
                    error = %err,
                    failures = state.batch.failures(),
                    delay_secs = delay.as_secs_f64(),
                    "response delivery failed, waiting to try again"
                );
                let (resumed, _) = shared
                    .wake
                    .wait_timeout_while(state, delay, |s| !s.shutdown)
                    .unwrap_or_else(PoisonError::into_inner);
                state = resumed;
                if state.shutdown {
                    return;
                }
                info!(pending = state.batch.len(), "attempting to submit responses again");
                state.ready = state.batch.retry();
            }
        }
    }
}
