// Directory-backed durable queue
//
// Every message is one file named by its publish id. Ready messages are kept
// in memory in FIFO order; a message file is only removed once the delivery is
// acked or nacked without requeue, so anything unsettled comes back on reopen.

use super::{Delivery, QueueConsumer, WorkQueue};
use crate::error::QueueError;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const MESSAGE_EXT: &str = "msg";
const TEMP_EXT: &str = "tmp";

#[derive(Debug, Clone, Copy)]
struct Message {
    id: u64,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// Delivery tag -> message handed to a consumer but not settled yet
    unsettled: HashMap<u64, Message>,
    next_id: u64,
    next_tag: u64,
}

struct Shared {
    dir: PathBuf,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    fn message_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:020}.{MESSAGE_EXT}"))
    }

    fn ensure_reachable(&self) -> Result<(), QueueError> {
        let meta = fs::metadata(&self.dir)?;
        if !meta.is_dir() {
            return Err(io::Error::other(format!("{:?} is not a directory", self.dir)).into());
        }
        Ok(())
    }

    fn remove_message(&self, id: u64) -> io::Result<()> {
        match fs::remove_file(self.message_path(id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Durable work queue stored in a single directory.
#[derive(Clone)]
pub struct DiskQueue {
    shared: Arc<Shared>,
}

impl DiskQueue {
    /// Open (or create) the queue directory. Messages left over from a previous
    /// process are ready again, in publish order.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(MESSAGE_EXT) => {
                    if let Some(id) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        ids.push(id);
                    }
                }
                // Interrupted publish, never acknowledged to the publisher
                Some(TEMP_EXT) => {
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }
        ids.sort_unstable();

        if !ids.is_empty() {
            tracing::info!("Recovered {} unsettled messages from {:?}", ids.len(), dir);
        }

        let state = QueueState {
            next_id: ids.last().map_or(0, |id| id + 1),
            ready: ids
                .into_iter()
                .map(|id| Message {
                    id,
                    redelivered: false,
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }
}

impl WorkQueue for DiskQueue {
    fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        let id = {
            let mut state = self.shared.lock()?;
            let id = state.next_id;
            state.next_id += 1;
            id
        };

        let tmp = self.shared.dir.join(format!("{id:020}.{TEMP_EXT}"));
        let written = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(payload)?;
            file.sync_all()?;
            fs::rename(&tmp, self.shared.message_path(id))
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        // FIFO per publisher; a single frame source publishes each run
        self.shared.lock()?.ready.push_back(Message {
            id,
            redelivered: false,
        });
        self.shared.available.notify_one();
        Ok(())
    }

    fn open_consumer(&self, prefetch: usize) -> Result<Box<dyn QueueConsumer>, QueueError> {
        self.shared.ensure_reachable()?;
        Ok(Box::new(DiskConsumer {
            shared: self.shared.clone(),
            prefetch: prefetch.max(1),
            outstanding: Vec::new(),
        }))
    }

    fn purge(&self) -> Result<usize, QueueError> {
        self.shared.ensure_reachable()?;
        let drained: Vec<Message> = self.shared.lock()?.ready.drain(..).collect();
        for message in &drained {
            if let Err(e) = self.shared.remove_message(message.id) {
                tracing::warn!("Failed to remove purged message {}: {}", message.id, e);
            }
        }
        Ok(drained.len())
    }

    fn depth(&self) -> Result<usize, QueueError> {
        self.shared.ensure_reachable()?;
        let state = self.shared.lock()?;
        Ok(state.ready.len() + state.unsettled.len())
    }
}

/// A consumer registration. Dropping it puts unsettled deliveries back at the
/// head of the queue.
pub struct DiskConsumer {
    shared: Arc<Shared>,
    prefetch: usize,
    outstanding: Vec<u64>,
}

impl DiskConsumer {
    fn settle(&mut self, tag: u64) -> Result<Message, QueueError> {
        let pos = self
            .outstanding
            .iter()
            .position(|t| *t == tag)
            .ok_or(QueueError::UnknownDelivery(tag))?;
        let message = self
            .shared
            .lock()?
            .unsettled
            .remove(&tag)
            .ok_or(QueueError::UnknownDelivery(tag))?;
        self.outstanding.swap_remove(pos);
        Ok(message)
    }
}

impl QueueConsumer for DiskConsumer {
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        if self.outstanding.len() >= self.prefetch {
            return Err(QueueError::PrefetchExceeded(self.prefetch));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock()?;
        loop {
            let next = state.ready.pop_front();
            if let Some(message) = next {
                let tag = state.next_tag;
                state.next_tag += 1;
                state.unsettled.insert(tag, message);
                drop(state);

                match fs::read(self.shared.message_path(message.id)) {
                    Ok(payload) => {
                        self.outstanding.push(tag);
                        return Ok(Some(Delivery {
                            tag,
                            payload,
                            redelivered: message.redelivered,
                        }));
                    }
                    Err(e) => {
                        let mut relocked = self.shared.lock()?;
                        relocked.unsettled.remove(&tag);
                        if e.kind() == io::ErrorKind::NotFound {
                            tracing::warn!("Message {} vanished from disk, skipping", message.id);
                            state = relocked;
                            continue;
                        }
                        relocked.ready.push_front(message);
                        drop(relocked);
                        self.shared.available.notify_one();
                        return Err(e.into());
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }
    }

    fn ack(&mut self, tag: u64) -> Result<(), QueueError> {
        let message = self.settle(tag)?;
        self.shared.remove_message(message.id)?;
        Ok(())
    }

    fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), QueueError> {
        let message = self.settle(tag)?;
        if requeue {
            self.shared.lock()?.ready.push_front(Message {
                id: message.id,
                redelivered: true,
            });
            self.shared.available.notify_one();
        } else {
            self.shared.remove_message(message.id)?;
        }
        Ok(())
    }
}

impl Drop for DiskConsumer {
    fn drop(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }
        if let Ok(mut state) = self.shared.state.lock() {
            for tag in self.outstanding.drain(..).rev() {
                if let Some(message) = state.unsettled.remove(&tag) {
                    state.ready.push_front(Message {
                        id: message.id,
                        redelivered: true,
                    });
                }
            }
        }
        self.shared.available.notify_all();
    }
}
