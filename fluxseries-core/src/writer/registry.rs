//! Process-wide map from database name to its live write actor

use super::{WriteActor, WriterConfig};
use crate::docstore::{store_path, DocStore, OpenMode};
use crate::stats::EngineStats;
use crate::{Result, SeriesError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// State shared between the registry and every actor thread
pub(crate) struct Shared {
    pub(crate) data_dir: PathBuf,
    pub(crate) config: WriterConfig,
    pub(crate) stats: Arc<EngineStats>,
    actors: Mutex<HashMap<String, Arc<WriteActor>>>,
    live: Mutex<usize>,
    all_stopped: Condvar,
    next_id: AtomicU64,
}

impl Shared {
    /// Remove `dbname` from the map if it still points at actor `id`, and
    /// request that actor's shutdown
    pub(crate) fn deregister(&self, dbname: &str, id: u64) {
        let mut actors = self.actors.lock();
        if actors.get(dbname).map(|a| a.id()) == Some(id) {
            if let Some(actor) = actors.remove(dbname) {
                let _ = actor.close();
            }
        }
    }

    pub(crate) fn actor_started(&self) {
        *self.live.lock() += 1;
    }

    pub(crate) fn actor_stopped(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.all_stopped.notify_all();
        }
    }
}

/// Registry of write actors, at most one per database name
#[derive(Clone)]
pub struct WriterRegistry {
    shared: Arc<Shared>,
}

impl WriterRegistry {
    pub fn new(data_dir: PathBuf, config: WriterConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            shared: Arc::new(Shared {
                data_dir,
                config,
                stats,
                actors: Mutex::new(HashMap::new()),
                live: Mutex::new(0),
                all_stopped: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.shared.stats
    }

    /// Return the live actor for `dbname`, opening the store and starting a
    /// new actor if there is none. The flag reports whether one was started.
    ///
    /// Without `create`, a database with no store file is `NotFound`.
    pub fn get_or_create(&self, dbname: &str, create: bool) -> Result<(Arc<WriteActor>, bool)> {
        let mut actors = self.shared.actors.lock();
        if let Some(actor) = actors.get(dbname) {
            return Ok((actor.clone(), false));
        }

        let mode = if create {
            OpenMode::Create
        } else {
            OpenMode::ReadWrite
        };
        let store = DocStore::open(
            store_path(&self.shared.data_dir, dbname),
            mode,
            self.shared.config.store.clone(),
        )?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let actor = WriteActor::spawn(self.shared.clone(), dbname, id, store)?;
        actors.insert(dbname.to_string(), actor.clone());
        info!("Opened database {}", dbname);

        Ok((actor, true))
    }

    /// Live actor for `dbname`, if any
    pub fn get(&self, dbname: &str) -> Option<Arc<WriteActor>> {
        self.shared.actors.lock().get(dbname).cloned()
    }

    pub fn is_open(&self, dbname: &str) -> bool {
        self.shared.actors.lock().contains_key(dbname)
    }

    /// Names of databases with a live actor, sorted
    pub fn open_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.actors.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop the entry for `dbname` and request the actor's shutdown unless it
    /// is already shutting down. Returns the removed actor.
    pub fn remove(&self, dbname: &str) -> Option<Arc<WriteActor>> {
        let removed = self.shared.actors.lock().remove(dbname);
        if let Some(actor) = &removed {
            match actor.close() {
                Ok(()) | Err(SeriesError::AlreadyClosed) => {}
                Err(e) => debug!("Closing {}: {}", dbname, e),
            }
        }
        removed
    }

    /// Request shutdown of every actor. Does not wait; see [`wait_all`](Self::wait_all).
    pub fn close_all(&self) {
        let actors = self.shared.actors.lock();
        for (name, actor) in actors.iter() {
            if actor.close().is_ok() {
                info!("Shutting down open database {}", name);
            }
        }
    }

    /// Number of actor threads that have not finished draining
    pub fn live_actors(&self) -> usize {
        *self.shared.live.lock()
    }

    /// Block until every actor thread has exited, or `timeout` passes
    pub fn wait_all(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live.lock();
        while *live > 0 {
            if self
                .shared
                .all_stopped
                .wait_until(&mut live, deadline)
                .timed_out()
            {
                return if *live == 0 {
                    Ok(())
                } else {
                    Err(SeriesError::Timeout)
                };
            }
        }
        Ok(())
    }
}
