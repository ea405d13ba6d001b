//! Message-page reconciliation: overlap detection, adaptive re-fetch, and
//! comment back-fill.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::index::{MessageRef, TokenIndex};
use super::model::{Message, MessageStream, ReadStatus};
use crate::counters::Counters;
use crate::error::{Error, InvariantViolation, Result};
use crate::store::{SourceId, Store};
use crate::transport::{FetchRequest, Transport, report_messages};

/// Hard upper bound on a requested page size.
pub const MAX_FETCH_SIZE: usize = 4096;

/// Default page size for debounced refreshes.
pub const DEFAULT_PAGE_SIZE: usize = 4;

/// Page size for a top-level stream with nothing cached yet.
pub const FULL_HISTORY_COUNT: usize = 100_000;

/// Minimum time between refreshes of one stream.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(10);

/// Boxed future for the re-entrant fetch paths (back-fill and thread
/// restore recurse through the reconciler).
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-stream reconciliation state. The surrounding mutex is the per-key
/// in-flight guard: a second reconciliation for the same stream waits for
/// the first, so the cursor-based overlap scan never interleaves.
#[derive(Debug, Default)]
struct StreamCache {
    restored: bool,
    messages: Vec<Message>,
}

/// What a merge decided about one incoming page.
enum MergeDecision {
    /// Page merged; comment back-fills to run, as `(thread key, size)`.
    Merged { backfills: Vec<(String, usize)> },
    /// No overlap and no proof of continuity; fetch a larger page.
    NeedLarger { page_len: usize },
}

/// Merges incoming message pages into per-stream caches.
///
/// Caches restore lazily from the store on first touch. Reconciliation for
/// one stream is serialized; distinct streams proceed independently. Faults
/// stay local to one stream's cache.
pub struct MessageReconciler<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    source: SourceId,
    version: String,
    counters: Counters,
    caches: StdMutex<HashMap<String, Arc<Mutex<StreamCache>>>>,
    index: StdMutex<TokenIndex>,
    refreshed: StdMutex<HashMap<String, Instant>>,
}

impl<S: Store, T: Transport> MessageReconciler<S, T> {
    /// Creates a reconciler over `store` and `transport` for one game.
    #[must_use]
    pub fn new(store: Arc<S>, transport: Arc<T>, source: SourceId, version: &str) -> Self {
        Self::with_counters(store, transport, source, version, Counters::new())
    }

    /// Creates a reconciler sharing an existing counter sink.
    #[must_use]
    pub fn with_counters(
        store: Arc<S>,
        transport: Arc<T>,
        source: SourceId,
        version: &str,
        counters: Counters,
    ) -> Self {
        Self {
            store,
            transport,
            source,
            version: version.to_string(),
            counters,
            caches: StdMutex::new(HashMap::new()),
            index: StdMutex::new(TokenIndex::new()),
            refreshed: StdMutex::new(HashMap::new()),
        }
    }

    /// The diagnostic counter sink.
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Refreshes `stream` unless it was refreshed within the debounce
    /// window; a debounced call is a no-op reporting prior success.
    ///
    /// # Errors
    ///
    /// Propagates storage, transport, and size-bound faults from the fetch.
    pub async fn refresh(&self, stream: &MessageStream) -> Result<bool> {
        let now = Instant::now();
        {
            let mut refreshed = self.refreshed.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = refreshed.get(stream.cache_key()) {
                if now.duration_since(*last) < REFRESH_DEBOUNCE {
                    self.counters.bump("refresh_debounced");
                    return Ok(true);
                }
            }
            refreshed.insert(stream.cache_key().to_string(), now);
        }
        self.request_recent(stream, DEFAULT_PAGE_SIZE).await
    }

    /// Fetches a page of the most recent entries of `stream` and reconciles
    /// it, growing the page as needed to find the overlap.
    ///
    /// # Errors
    ///
    /// Propagates storage and transport faults, and reports
    /// [`Error::SizeBound`] when the adaptive re-fetch would exceed the cap.
    pub async fn request_recent(&self, stream: &MessageStream, size: usize) -> Result<bool> {
        self.fetch_and_merge(stream, size).await
    }

    /// Fetches a page of a message's comment thread and reconciles it.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::request_recent`].
    pub async fn request_comments(&self, message_key: &str, size: usize) -> Result<bool> {
        self.fetch_and_merge(&MessageStream::Thread(message_key.to_string()), size)
            .await
    }

    /// Restores `stream` from the store without fetching.
    ///
    /// # Errors
    ///
    /// Returns a storage fault when the restore read fails; the cache stays
    /// unrestored and a later call may retry.
    pub async fn open(&self, stream: &MessageStream) -> Result<()> {
        let slot = self.slot(stream.cache_key());
        let mut cache = slot.lock().await;
        self.ensure_restored(stream, &mut cache).await
    }

    /// Messages currently cached for `stream`, most recent first.
    pub async fn cached_messages(&self, stream: &MessageStream) -> Vec<Message> {
        match self.existing_slot(stream.cache_key()) {
            Some(slot) => slot.lock().await.messages.clone(),
            None => Vec::new(),
        }
    }

    /// True when any cached event is newer than `timestamp` (epoch millis).
    ///
    /// # Errors
    ///
    /// Propagates faults from the underlying refresh.
    pub async fn has_events_newer_than(&self, timestamp: i64) -> Result<bool> {
        self.refresh(&MessageStream::Events).await?;
        let events = self.cached_messages(&MessageStream::Events).await;
        Ok(events.iter().any(|message| timestamp < -message.date))
    }

    /// References to messages whose indexed bodies contain `token`.
    #[must_use]
    pub fn search(&self, token: &str) -> Vec<MessageRef> {
        let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        index.lookup(token).to_vec()
    }

    /// Drops every in-memory cache, the token index, and the debounce
    /// clocks. Persisted records are untouched.
    pub fn unload(&self) {
        self.caches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.refreshed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn fetch_and_merge(&self, stream: &MessageStream, initial_size: usize) -> Result<bool> {
        let slot = self.slot(stream.cache_key());
        let mut cache = slot.lock().await;
        self.ensure_restored(stream, &mut cache).await?;

        let mut size = initial_size;
        loop {
            let count = if stream.is_top_level() && cache.messages.is_empty() {
                FULL_HISTORY_COUNT
            } else {
                size
            };
            let request = self.build_request(stream, count);
            let body = request.to_document()?;
            let response = match self.transport.post(request.path(), &body).await {
                Ok(response) => response,
                Err(fault) => {
                    self.counters.bump("error_transport");
                    error!(stream = %stream, error = %fault, "message fetch failed");
                    return Err(fault.into());
                }
            };
            let Some(raw) = report_messages(&response) else {
                self.counters.bump("incoming_undefined");
                warn!(stream = %stream, "response carried no report messages");
                return Ok(false);
            };
            let mut incoming: Vec<Message> = serde_json::from_value(raw.clone())?;
            for message in &mut incoming {
                message.derive_date();
            }

            match self.merge_page(stream, &mut cache, incoming).await? {
                MergeDecision::Merged { backfills } => {
                    drop(cache);
                    for (key, delta) in backfills {
                        let thread = MessageStream::Thread(key.clone());
                        if let Err(fault) = self.fetch_boxed(&thread, delta).await {
                            self.counters.bump("error_comment_backfill");
                            warn!(thread = %key, error = %fault, "comment back-fill failed");
                        }
                    }
                    return Ok(true);
                }
                MergeDecision::NeedLarger { page_len } => {
                    let doubled = page_len * 2;
                    if doubled > MAX_FETCH_SIZE || doubled == 0 {
                        self.counters.bump("error_invalid_fetch_size");
                        warn!(stream = %stream, size = doubled, "fetch size out of bounds");
                        return Err(Error::SizeBound(doubled));
                    }
                    self.counters.bump("refetch_doubled");
                    debug!(stream = %stream, size = doubled, "no overlap found, doubling fetch");
                    size = doubled;
                }
            }
        }
    }

    /// Merges one incoming page into the cache.
    ///
    /// Scans incoming entries against the cache head: an unchanged match (or
    /// cache exhaustion) fixes the overlap boundary, a changed match
    /// supersedes the cached head and rescans. Timestamp ties directly before
    /// the boundary whose keys are already cached are absorbed into the
    /// overlap so equal-timestamp reorderings merge deterministically.
    async fn merge_page(
        &self,
        stream: &MessageStream,
        cache: &mut StreamCache,
        mut incoming: Vec<Message>,
    ) -> Result<MergeDecision> {
        if cache.messages.is_empty() {
            info!(stream = %stream, len = incoming.len(), "accepting full page into empty cache");
            let backfills = self.persist_new(stream, &incoming).await?;
            self.index_new(stream, &incoming);
            cache.messages = incoming;
            return Ok(MergeDecision::Merged { backfills });
        }

        let original_len = cache.messages.len();
        let mut overlap_offset: Option<usize> = None;
        let mut matched = 0usize;
        let mut i = 0usize;
        while i < incoming.len() {
            let head_matches = cache
                .messages
                .first()
                .is_some_and(|head| head.key == incoming[i].key);
            if !head_matches {
                i += 1;
                continue;
            }
            matched += 1;
            let unchanged = cache
                .messages
                .first()
                .is_some_and(|head| self.is_unchanged(stream, &incoming[i], head));
            if unchanged || matched >= original_len {
                let known: HashSet<String> =
                    cache.messages.iter().map(|m| m.key.clone()).collect();
                let boundary_created = incoming[i].created.clone();
                while i > 0
                    && incoming[i - 1].created == boundary_created
                    && known.contains(&incoming[i - 1].key)
                {
                    self.counters.bump("overlap_tie_absorbed");
                    i -= 1;
                }
                self.check_boundary(stream, &incoming, i, &known);
                overlap_offset = Some(i);
                break;
            }
            // Changed in place: the cached head is superseded, and the page
            // is rescanned against the next cached entry.
            cache.messages.remove(0);
            i = 1;
        }

        // Data-loss avoidance: the page outran the cache without overlapping
        // it, so every unknown key is genuinely new.
        if overlap_offset.is_none() && incoming.len() > cache.messages.len() {
            self.counters.bump("force_restore");
            info!(
                stream = %stream,
                incoming = incoming.len(),
                cached = cache.messages.len(),
                "page outran the cache, merging unknown keys"
            );
            let known: HashSet<String> = cache.messages.iter().map(|m| m.key.clone()).collect();
            let mut fresh: Vec<Message> = incoming
                .into_iter()
                .filter(|message| !known.contains(&message.key))
                .collect();
            let backfills = self.persist_new(stream, &fresh).await?;
            self.index_new(stream, &fresh);
            fresh.append(&mut cache.messages);
            cache.messages = fresh;
            return Ok(MergeDecision::Merged { backfills });
        }

        let Some(offset) = overlap_offset else {
            return Ok(MergeDecision::NeedLarger {
                page_len: incoming.len(),
            });
        };

        incoming.truncate(offset);
        if stream.supersedes_on_update() && !incoming.is_empty() {
            let incoming_keys: HashSet<&str> =
                incoming.iter().map(|message| message.key.as_str()).collect();
            let before = cache.messages.len();
            cache
                .messages
                .retain(|message| !incoming_keys.contains(message.key.as_str()));
            let removed = before - cache.messages.len();
            if removed > 0 {
                debug!(stream = %stream, removed, "superseded cached entries removed");
            }
        }
        let backfills = self.persist_new(stream, &incoming).await?;
        self.index_new(stream, &incoming);
        let new_count = incoming.len();
        incoming.append(&mut cache.messages);
        cache.messages = incoming;
        debug!(stream = %stream, new = new_count, total = cache.messages.len(), "page merged");
        Ok(MergeDecision::Merged { backfills })
    }

    /// Boundary invariant: every entry at or after the boundary duplicates
    /// cached data, and none before it does. Violations are reported and
    /// counted; the merge still proceeds best-effort.
    fn check_boundary(
        &self,
        stream: &MessageStream,
        incoming: &[Message],
        boundary: usize,
        known: &HashSet<String>,
    ) {
        let mut overlaps_found = true;
        for entry in &incoming[boundary..] {
            if !known.contains(&entry.key) {
                overlaps_found = false;
                self.counters.bump("error_overlap_gap");
                let violation = InvariantViolation::OverlapGap {
                    key: entry.key.clone(),
                };
                warn!(stream = %stream, %violation, "overlap boundary invariant violated");
            }
        }
        self.counters.bump(format!("overlaps_found_{overlaps_found}"));

        let mut collisions_found = false;
        for entry in &incoming[..boundary] {
            if known.contains(&entry.key) {
                collisions_found = true;
                self.counters.bump("error_boundary_collision");
                let violation = InvariantViolation::BoundaryCollision {
                    key: entry.key.clone(),
                };
                warn!(stream = %stream, %violation, "overlap boundary invariant violated");
            }
        }
        self.counters
            .bump(format!("collisions_found_{collisions_found}"));
    }

    fn is_unchanged(&self, stream: &MessageStream, incoming: &Message, cached: &Message) -> bool {
        if stream.tracks_status() && incoming.status.is_some() && incoming.status != cached.status
        {
            self.counters.bump("status_changed");
            return false;
        }
        let unchanged = incoming.comment_count == cached.comment_count;
        self.counters.bump(format!("is_unchanged_{unchanged}"));
        unchanged
    }

    /// Persists `messages` and collects the comment back-fills they imply:
    /// a read message with comments schedules a fetch sized to the delta
    /// against its loaded thread; unread messages skip the fetch so reading
    /// state is never forced as a side effect.
    async fn persist_new(
        &self,
        stream: &MessageStream,
        messages: &[Message],
    ) -> Result<Vec<(String, usize)>> {
        let namespace = self.source.namespace(stream.cache_key());
        let mut backfills = Vec::new();
        for message in messages {
            let record = serde_json::to_value(message)?;
            if let Err(fault) = self.store.put(&namespace, &message.key, &record).await {
                self.counters.bump("error_persist_message");
                error!(stream = %stream, key = %message.key, error = %fault, "failed to persist message");
                return Err(fault.into());
            }

            let Some(comment_count) = message.comment_count else {
                continue;
            };
            if comment_count == 0 {
                continue;
            }
            if message.status == Some(ReadStatus::Read) {
                let target = usize::try_from(comment_count).unwrap_or(usize::MAX);
                let delta = match self.loaded_len(&message.key) {
                    None => target,
                    Some(len) => (target + 1).saturating_sub(len),
                };
                if delta > 0 {
                    backfills.push((message.key.clone(), delta));
                } else {
                    self.counters.bump("comment_backfill_current");
                }
            } else {
                self.counters.bump("skip_unread_comments");
                debug!(key = %message.key, "skipping comment fetch for unread message");
            }
        }
        Ok(backfills)
    }

    async fn ensure_restored(&self, stream: &MessageStream, cache: &mut StreamCache) -> Result<()> {
        if cache.restored {
            return Ok(());
        }
        let namespace = self.source.namespace(stream.cache_key());
        let records = match self.store.get_all_ordered_by(&namespace, "date").await {
            Ok(records) => records,
            Err(fault) => {
                self.counters.bump("error_restore_messages");
                error!(stream = %stream, error = %fault, "failed to restore message cache");
                return Err(fault.into());
            }
        };

        let mut messages = Vec::with_capacity(records.len());
        for record in &records {
            match serde_json::from_value::<Message>(record.clone()) {
                Ok(message) => messages.push(message),
                Err(fault) => {
                    self.counters.bump("error_restore_decode");
                    error!(stream = %stream, error = %fault, "skipping corrupt message record");
                }
            }
        }
        self.index_new(stream, &messages);
        info!(stream = %stream, len = messages.len(), "restored message cache");
        cache.messages = messages;
        cache.restored = true;

        // Conversations carry their comment threads; restore those too so
        // back-fill deltas see the loaded lengths.
        if matches!(stream, MessageStream::Conversations) {
            self.counters.bump("loading_conversations_from_db");
            let keys: Vec<String> = cache
                .messages
                .iter()
                .map(|message| message.key.clone())
                .collect();
            for key in keys {
                let thread = MessageStream::Thread(key);
                if let Err(fault) = self.open_boxed(&thread).await {
                    warn!(thread = %thread, error = %fault, "thread restore failed");
                }
            }
        }
        Ok(())
    }

    /// Type-erased re-entry points: back-fill and thread restore recurse
    /// into the fetch path, so the future must be boxed behind a named type.
    fn fetch_boxed<'a>(
        &'a self,
        stream: &'a MessageStream,
        size: usize,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.fetch_and_merge(stream, size))
    }

    fn open_boxed<'a>(&'a self, stream: &'a MessageStream) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.open(stream))
    }

    fn build_request(&self, stream: &MessageStream, count: usize) -> FetchRequest {
        match stream {
            MessageStream::Thread(key) => {
                FetchRequest::comments(key, count, &self.version, self.source)
            }
            top_level => {
                FetchRequest::messages(top_level.cache_key(), count, &self.version, self.source)
            }
        }
    }

    fn index_new(&self, stream: &MessageStream, messages: &[Message]) {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        index.extend(stream.cache_key(), messages);
    }

    /// In-memory length of a loaded thread cache, `None` when the thread has
    /// not been restored (or is busy reconciling).
    fn loaded_len(&self, key: &str) -> Option<usize> {
        let slot = self.existing_slot(key)?;
        let cache = slot.try_lock().ok()?;
        cache.restored.then_some(cache.messages.len())
    }

    fn slot(&self, key: &str) -> Arc<Mutex<StreamCache>> {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        caches
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamCache::default())))
            .clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Mutex<StreamCache>>> {
        let caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        caches.get(key).cloned()
    }
}
