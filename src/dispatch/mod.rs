#![forbid(unsafe_code)]

//! Publishing notification messages.
//!
//! A [`Channel`] is a publish-only sink. [`Dispatcher`] encodes a
//! [`ProcessorMessage`] and hands it to the channel once; it never retries.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::message::{encode, ProcessorMessage};
use crate::primitives::io::{join_path, FileStore};
use crate::types::{OffloadError, Result};

/// Publish-only message sink.
pub trait Channel: Send + Sync {
    /// Publishes one serialized message. Returns once the attempt completes.
    fn publish(&self, payload: &[u8]) -> Result<()>;
}

impl<C: Channel + ?Sized> Channel for &C {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        (**self).publish(payload)
    }
}

/// Encodes messages and publishes them on a channel.
pub struct Dispatcher<C> {
    channel: C,
}

impl<C: Channel> Dispatcher<C> {
    /// Wraps `channel`.
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Encodes and publishes `message`.
    pub fn dispatch(&self, message: &ProcessorMessage) -> Result<()> {
        let payload = encode(message)?;
        self.dispatch_encoded(message, &payload)
    }

    /// Publishes `payload`, the encoding of `message`, exactly once.
    ///
    /// Callers that retry keep the payload and call this again; the message is
    /// only used for logging.
    pub fn dispatch_encoded(&self, message: &ProcessorMessage, payload: &[u8]) -> Result<()> {
        let published = self.channel.publish(payload).map_err(|err| match err {
            OffloadError::Dispatch(_) => err,
            other => OffloadError::Dispatch(other.to_string()),
        });
        match published {
            Ok(()) => {
                debug!(
                    path = message.storage_path(),
                    algorithm = message.algorithm(),
                    bytes = payload.len(),
                    "dispatch.published"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    path = message.storage_path(),
                    error = %err,
                    "dispatch.failed"
                );
                Err(err)
            }
        }
    }
}

/// Channel that records every payload in memory.
#[derive(Default)]
pub struct MemoryChannel {
    published: Mutex<Vec<Vec<u8>>>,
}

impl MemoryChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published so far, in publish order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published.lock().clone()
    }

    /// Number of payloads published so far.
    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    /// Returns true if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Channel for MemoryChannel {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        self.published.lock().push(payload.to_vec());
        Ok(())
    }
}

/// Durable outbox: every payload becomes its own committed blob under a directory.
///
/// Blobs are named by a zero-padded sequence number, so listing the directory
/// yields messages in publish order.
pub struct SpoolChannel<F> {
    store: F,
    dir: String,
    next: AtomicU64,
}

impl<F: FileStore> SpoolChannel<F> {
    /// Opens an outbox under `dir`, continuing after any messages already spooled there.
    pub fn open(store: F, dir: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        let next = store
            .list(&dir)?
            .iter()
            .filter_map(|path| {
                path.rsplit('/')
                    .next()
                    .and_then(|name| name.strip_suffix(".json"))
                    .and_then(|seq| seq.parse::<u64>().ok())
            })
            .max()
            .map_or(0, |last| last + 1);
        Ok(Self {
            store,
            dir,
            next: AtomicU64::new(next),
        })
    }

    /// Paths of spooled messages, oldest first.
    pub fn spooled(&self) -> Result<Vec<String>> {
        self.store.list(&self.dir)
    }

    /// Store the outbox writes to.
    pub fn store(&self) -> &F {
        &self.store
    }
}

impl<F: FileStore> Channel for SpoolChannel<F> {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        let path = join_path(&self.dir, &format!("{seq:020}.json"));
        let mut writer = self.store.create(&path)?;
        writer.write_all(payload)?;
        writer.commit()?;
        Ok(())
    }
}
