//! Write actor handle and control loop

use super::registry::Shared;
use super::{WriteOp, WriterConfig};
use crate::docstore::{compact_path, DocStore, OpenMode, WriteBatch};
use crate::stats::DbStats;
use crate::{Result, SeriesError};
use bytes::Bytes;
use crossbeam_channel::{after, bounded, select, tick, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a write actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorState {
    Running = 0,
    /// Quit was signalled; the mailbox and the open batch are being flushed
    Draining = 1,
    Closed = 2,
}

impl ActorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ActorState::Running,
            1 => ActorState::Draining,
            _ => ActorState::Closed,
        }
    }
}

/// One-shot shutdown signal. Closing it twice reports `AlreadyClosed`.
#[derive(Clone)]
pub(crate) struct QuitSignal {
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl QuitSignal {
    fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(0);
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub(crate) fn close(&self) -> Result<()> {
        match self.tx.lock().take() {
            Some(_) => Ok(()),
            None => Err(SeriesError::AlreadyClosed),
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Handle to the actor owning one database's writable store
pub struct WriteActor {
    dbname: String,
    id: u64,
    tx: Sender<WriteOp>,
    /// `true` while the mailbox accepts items. Senders hold the read side
    /// across `send` so the actor can close the mailbox without losing items.
    gate: Arc<RwLock<bool>>,
    quit: QuitSignal,
    state: Arc<AtomicU8>,
    /// Disconnects when the control loop exits
    finished: Receiver<()>,
}

impl WriteActor {
    /// Start the control loop for `store` on its own thread
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        dbname: &str,
        id: u64,
        store: DocStore,
    ) -> Result<Arc<WriteActor>> {
        let config = shared.config.clone();
        let (tx, rx) = bounded(config.queue_depth);
        let (quit, quit_rx) = QuitSignal::new();
        let (finished_tx, finished) = bounded::<()>(0);
        let gate = Arc::new(RwLock::new(true));
        let state = Arc::new(AtomicU8::new(ActorState::Running as u8));

        let control = ControlLoop {
            dbname: dbname.to_string(),
            id,
            path: store.path().to_path_buf(),
            store,
            batch: WriteBatch::new(),
            stats: shared.stats.db(dbname),
            config,
            shared: shared.clone(),
            gate: gate.clone(),
            state: state.clone(),
        };

        shared.actor_started();
        let spawned = std::thread::Builder::new()
            .name(format!("writer-{}", dbname))
            .spawn(move || {
                control.run(rx, quit_rx);
                drop(finished_tx);
            });
        if let Err(e) = spawned {
            shared.actor_stopped();
            return Err(e.into());
        }

        debug!("Started write actor {} for {}", id, dbname);

        Ok(Arc::new(WriteActor {
            dbname: dbname.to_string(),
            id,
            tx,
            gate,
            quit,
            state,
            finished,
        }))
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Identity of this actor instance; a reopened database gets a new id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ActorState {
        ActorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Operations waiting in the mailbox
    pub fn mailbox_len(&self) -> usize {
        self.tx.len()
    }

    /// Request shutdown. Returns `AlreadyClosed` if it was already requested.
    pub fn close(&self) -> Result<()> {
        self.quit.close()
    }

    pub fn is_closing(&self) -> bool {
        self.quit.is_closed()
    }

    /// Enqueue an item, blocking while the mailbox is full. Hands the item
    /// back if the actor no longer accepts work.
    pub fn deliver(&self, op: WriteOp) -> std::result::Result<(), WriteOp> {
        let open = self.gate.read();
        if !*open {
            return Err(op);
        }
        self.tx.send(op).map_err(|e| e.into_inner())
    }

    pub fn store(&self, key: impl Into<String>, body: impl Into<Bytes>) -> Result<()> {
        self.deliver(WriteOp::Store {
            key: key.into(),
            body: body.into(),
        })
        .map_err(|_| SeriesError::AlreadyClosed)
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<()> {
        self.deliver(WriteOp::Delete { key: key.into() })
            .map_err(|_| SeriesError::AlreadyClosed)
    }

    /// Compact the database, blocking until the actor has finished
    pub fn compact(&self) -> Result<()> {
        let (done, result) = bounded(1);
        self.deliver(WriteOp::Compact { done })
            .map_err(|_| SeriesError::AlreadyClosed)?;
        result.recv().map_err(|_| SeriesError::AlreadyClosed)?
    }

    /// Wait for the control loop to exit. Returns `false` on timeout.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        matches!(
            self.finished.recv_timeout(timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        )
    }
}

impl std::fmt::Debug for WriteActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteActor")
            .field("dbname", &self.dbname)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// State owned by the actor thread
struct ControlLoop {
    dbname: String,
    id: u64,
    path: PathBuf,
    store: DocStore,
    batch: WriteBatch,
    stats: Arc<DbStats>,
    config: WriterConfig,
    shared: Arc<Shared>,
    gate: Arc<RwLock<bool>>,
    state: Arc<AtomicU8>,
}

impl ControlLoop {
    fn run(mut self, rx: Receiver<WriteOp>, quit: Receiver<()>) {
        let liveness = tick(self.config.live_interval);
        let mut ops_since_tick: u64 = 0;

        loop {
            self.stats.set_queue_len(self.batch.len() + rx.len());
            let flush_timer = after(self.config.flush_interval);

            select! {
                recv(rx) -> msg => match msg {
                    Ok(op) => {
                        ops_since_tick += 1;
                        self.handle(op);
                    }
                    Err(_) => break,
                },
                recv(quit) -> _ => break,
                recv(flush_timer) -> _ => self.flush("timer"),
                recv(liveness) -> _ => {
                    if ops_since_tick == 0 && self.batch.is_empty() && rx.is_empty() {
                        info!("Closing idle database {}", self.dbname);
                        self.shared.deregister(&self.dbname, self.id);
                        break;
                    }
                    ops_since_tick = 0;
                }
            }
        }

        self.drain(&rx);
    }

    fn handle(&mut self, op: WriteOp) {
        match op {
            WriteOp::Store { key, body } => {
                self.batch.upsert(key, body);
                self.flush_if_full();
            }
            WriteOp::Delete { key } => {
                self.batch.delete(key);
                self.flush_if_full();
            }
            WriteOp::Compact { done } => {
                let result = self.compact();
                if let Err(e) = &result {
                    warn!("Compaction of {} failed: {}", self.dbname, e);
                }
                let _ = done.send(result);
            }
        }
    }

    fn flush_if_full(&mut self) {
        if self.batch.len() >= self.config.max_batch {
            self.flush("batch full");
        }
    }

    fn flush(&mut self, reason: &str) {
        if self.batch.is_empty() {
            return;
        }
        let start = Instant::now();
        let pending = self.batch.len();
        match self.store.commit(&mut self.batch) {
            Ok(n) => {
                self.stats.add_written(n);
                debug!(
                    "Flushed {} items to {} in {:?} ({})",
                    n,
                    self.dbname,
                    start.elapsed(),
                    reason
                );
            }
            Err(e) => {
                error!(
                    "Error committing {} items to {}, dropping batch: {}",
                    pending, self.dbname, e
                );
                self.batch.clear();
            }
        }
        self.stats.set_queue_len(0);
    }

    fn compact(&mut self) -> Result<()> {
        self.flush("pre-compact");

        let start = Instant::now();
        let side = compact_path(&self.path);
        if let Err(e) = self.store.compact_to(&side) {
            let _ = std::fs::remove_file(&side);
            return Err(SeriesError::CompactionFailed(e.to_string()));
        }
        if let Err(e) = std::fs::rename(&side, &self.path) {
            let _ = std::fs::remove_file(&side);
            return Err(SeriesError::CompactionFailed(format!(
                "replacing {:?}: {}",
                self.path, e
            )));
        }
        info!("Finished compaction of {} in {:?}", self.dbname, start.elapsed());

        match DocStore::open(&self.path, OpenMode::ReadWrite, self.config.store.clone()) {
            Ok(store) => {
                self.store = store;
                self.batch = WriteBatch::new();
                Ok(())
            }
            Err(e) => crate::fatal(SeriesError::ReopenFailed(format!("{}: {}", self.dbname, e))),
        }
    }

    /// Close the mailbox, apply whatever is still queued, commit and exit
    fn drain(mut self, rx: &Receiver<WriteOp>) {
        self.state
            .store(ActorState::Draining as u8, Ordering::Release);
        let start = Instant::now();

        self.shared.deregister(&self.dbname, self.id);

        // Senders blocked on a full mailbox hold the gate's read side, so keep
        // consuming until the write side can be taken.
        loop {
            self.drain_queued(rx);
            if let Some(mut open) = self.gate.try_write() {
                *open = false;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.drain_queued(rx);

        self.flush("close");
        self.stats.set_queue_len(0);
        self.stats.record_close();
        debug!("Closed {} in {:?}", self.dbname, start.elapsed());

        self.state.store(ActorState::Closed as u8, Ordering::Release);
        self.shared.actor_stopped();
    }

    fn drain_queued(&mut self, rx: &Receiver<WriteOp>) {
        loop {
            match rx.try_recv() {
                Ok(op) => self.handle(op),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}
