//! Embedded store — JSON tree + watch channels behind one `RwLock`.
//!
//! DESIGN
//! ======
//! Every mutation takes the write lock, edits the tree, then pushes fresh
//! snapshots to the watchers whose path overlaps the change. Watch channels
//! compare before sending, so a subscriber is only woken when its snapshot
//! is actually different.
//!
//! Document roots touched since the last flush are tracked in a dirty set
//! that the persistence task drains. A room is two documents: `rooms/{id}`
//! holds everything but presence, and `rooms/{id}/users` holds presence, so
//! cursor traffic only rewrites the small presence document.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{RwLock, watch};
use tracing::debug;

use super::{ConnectionId, Store, StoreError, Subscription, paths_overlap, segments};

/// Number of leading path segments that form a persisted document.
const DOCUMENT_DEPTH: usize = 2;

/// Child of a document root that is persisted as a document of its own.
const PRESENCE_KEY: &str = "users";

pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Last allocated append key, as a number.
    last_key: AtomicU64,
}

struct Inner {
    root: Value,
    watchers: HashMap<String, watch::Sender<Option<Value>>>,
    hooks: HashMap<ConnectionId, HashMap<String, Value>>,
    dirty: HashSet<String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                root: Value::Object(Map::new()),
                watchers: HashMap::new(),
                hooks: HashMap::new(),
                dirty: HashSet::new(),
            }),
            last_key: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // PERSISTENCE SUPPORT
    // =========================================================================

    /// Install a document loaded from durable storage. Does not mark it dirty.
    ///
    /// Presence records come back inactive: the connections that owned them
    /// died with the previous process, and their disconnect hooks with them.
    /// Callers load a room document before its presence document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` for an empty document path.
    pub async fn load_document(&self, path: &str, doc: Value) -> Result<(), StoreError> {
        let segs = segments(path)?;
        let mut doc = strip_nulls(doc);
        let presence = match segs.len() {
            DOCUMENT_DEPTH => doc.get_mut(PRESENCE_KEY),
            n if n == DOCUMENT_DEPTH + 1 && segs[DOCUMENT_DEPTH] == PRESENCE_KEY => Some(&mut doc),
            _ => None,
        };
        if let Some(Value::Object(records)) = presence {
            for record in records.values_mut() {
                if let Value::Object(fields) = record {
                    fields.insert("active".to_owned(), Value::Bool(false));
                }
            }
        }
        let mut inner = self.inner.write().await;
        set_at(&mut inner.root, &segs, doc);
        inner.notify(path);
        Ok(())
    }

    /// Drain the dirty set, returning each document root with its current
    /// snapshot (`None` when the document was deleted). A room snapshot
    /// leaves out its presence, which is flushed as its own document.
    pub async fn take_dirty(&self) -> Vec<(String, Option<Value>)> {
        let mut inner = self.inner.write().await;
        let dirty: Vec<String> = inner.dirty.drain().collect();
        dirty
            .into_iter()
            .map(|path| {
                let snapshot = segments(&path).ok().and_then(|segs| {
                    let doc = get_at(&inner.root, &segs)?.clone();
                    match doc {
                        Value::Object(mut map) if segs.len() == DOCUMENT_DEPTH => {
                            map.remove(PRESENCE_KEY);
                            (!map.is_empty()).then_some(Value::Object(map))
                        }
                        other => Some(other),
                    }
                });
                (path, snapshot)
            })
            .collect()
    }

    /// Re-mark documents whose flush failed so the next cycle retries them.
    pub async fn restore_dirty(&self, paths: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.write().await;
        inner.dirty.extend(paths);
    }

    /// Number of live watch channels. Closed ones are pruned on the next mutation.
    pub async fn watcher_count(&self) -> usize {
        self.inner.read().await.watchers.len()
    }

    /// Allocate a key that sorts after every key handed out before, including
    /// keys from earlier processes (the counter is seeded from the clock).
    fn next_key(&self) -> String {
        let floor = now_ms().saturating_mul(1000);
        let mut current = self.last_key.load(Ordering::Relaxed);
        loop {
            let next = floor.max(current + 1);
            match self
                .last_key
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return format!("{next:020}"),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn apply(&mut self, segs: &[&str], value: Value) {
        set_at(&mut self.root, segs, strip_nulls(value));
        if segs.len() > DOCUMENT_DEPTH && segs[DOCUMENT_DEPTH] == PRESENCE_KEY {
            self.dirty.insert(segs[..=DOCUMENT_DEPTH].join("/"));
            return;
        }
        let doc_len = segs.len().min(DOCUMENT_DEPTH);
        let root = segs[..doc_len].join("/");
        // Replacing a whole room replaces its presence document too.
        if segs.len() == DOCUMENT_DEPTH {
            self.dirty.insert(format!("{root}/{PRESENCE_KEY}"));
        }
        self.dirty.insert(root);
    }

    /// Push fresh snapshots to every watcher affected by a change at `changed`.
    fn notify(&mut self, changed: &str) {
        self.watchers.retain(|_, tx| tx.receiver_count() > 0);
        for (watched, tx) in &self.watchers {
            if !paths_overlap(watched, changed) {
                continue;
            }
            let snapshot = segments(watched)
                .ok()
                .and_then(|segs| get_at(&self.root, &segs).cloned());
            tx.send_if_modified(|current| {
                if *current == snapshot {
                    return false;
                }
                *current = snapshot;
                true
            });
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = segments(path)?;
        let inner = self.inner.read().await;
        Ok(get_at(&inner.root, &segs).cloned())
    }

    async fn write(&self, path: &str, patch: Value) -> Result<(), StoreError> {
        let base = segments(path)?;
        let Value::Object(fields) = patch else {
            return Err(StoreError::NotAnObject(path.to_owned()));
        };
        // Validate every key before touching the tree so a bad patch is all-or-nothing.
        let mut updates = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let rel = segments(&key)?;
            let full: Vec<String> = base.iter().chain(rel.iter()).map(|s| (*s).to_owned()).collect();
            updates.push((full, value));
        }

        let mut inner = self.inner.write().await;
        for (full, value) in updates {
            let segs: Vec<&str> = full.iter().map(String::as_str).collect();
            inner.apply(&segs, value);
        }
        inner.notify(path);
        Ok(())
    }

    async fn append(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let mut segs = segments(path)?;
        let key = self.next_key();
        segs.push(&key);
        let mut inner = self.inner.write().await;
        inner.apply(&segs, value);
        inner.notify(&segs.join("/"));
        debug!(path, %key, "store: appended");
        Ok(key)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let segs = segments(path)?;
        let mut inner = self.inner.write().await;
        inner.apply(&segs, Value::Null);
        inner.notify(path);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let segs = segments(path)?;
        let key = segs.join("/");
        let mut inner = self.inner.write().await;
        let snapshot = get_at(&inner.root, &segs).cloned();
        let rx = match inner.watchers.get(&key) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(snapshot);
                inner.watchers.insert(key.clone(), tx);
                rx
            }
        };
        Ok(Subscription::new(key, rx))
    }

    async fn on_disconnect(&self, conn: ConnectionId, path: &str, value: Value) -> Result<(), StoreError> {
        let key = segments(path)?.join("/");
        let mut inner = self.inner.write().await;
        inner.hooks.entry(conn).or_default().insert(key, value);
        Ok(())
    }

    async fn cancel_on_disconnect(&self, conn: ConnectionId, path: &str) -> Result<(), StoreError> {
        let key = segments(path)?.join("/");
        let mut inner = self.inner.write().await;
        if let Some(hooks) = inner.hooks.get_mut(&conn) {
            hooks.remove(&key);
            if hooks.is_empty() {
                inner.hooks.remove(&conn);
            }
        }
        Ok(())
    }

    async fn disconnect(&self, conn: ConnectionId) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(hooks) = inner.hooks.remove(&conn) else {
            return Ok(0);
        };
        let count = hooks.len();
        for (path, value) in hooks {
            let segs = segments(&path)?;
            inner.apply(&segs, value);
            inner.notify(&path);
        }
        debug!(%conn, count, "store: ran disconnect hooks");
        Ok(count)
    }
}

// =============================================================================
// TREE HELPERS
// =============================================================================

fn get_at<'a>(node: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    segs.iter().try_fold(node, |cur, seg| cur.as_object()?.get(*seg))
}

/// Set `value` at `segs` below `node`, creating intermediate objects. A null
/// value removes the leaf, and parents left empty are pruned.
fn set_at(node: &mut Value, segs: &[&str], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        if value.is_null() || is_empty_object(&value) {
            map.remove(*head);
        } else {
            map.insert((*head).to_owned(), value);
        }
        return;
    }
    let child = map.entry((*head).to_owned()).or_insert(Value::Null);
    set_at(child, rest, value);
    if child.is_null() || is_empty_object(child) {
        map.remove(*head);
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

/// Drop null fields (recursively) so optional fields never linger as `null`.
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .filter(|(_, v)| !is_empty_object(v))
                .collect(),
        ),
        other => other,
    }
}

fn now_ms() -> u64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
