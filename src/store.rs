use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::{
    error::{ActilogError, Result},
    event::{ContextMap, Event, EventId, Initiator, Level},
    permit::CategoryGrant,
};

const SEP: u8 = 0x1F;
const PREFIX_EVENT: &str = "evt";
const PREFIX_CONTEXT: &str = "ctx";

/// Pre-grouping scan restriction pushed down into the store: the caller's
/// category grant plus the snapshot ceiling pinned by the first page.
#[derive(Debug, Clone)]
pub struct ScanFilter<'a> {
    pub grant: &'a CategoryGrant,
    pub ceiling: Option<EventId>,
}

/// Ordered read access to events, id descending. The query engine depends
/// on this port, not on the RocksDB store directly.
pub trait EventScan: Send + Sync {
    /// Permission-filtered events at or below the ceiling, newest first.
    fn scan_desc(&self, filter: &ScanFilter<'_>) -> Result<Vec<Event>>;

    /// Up to `limit` raw events strictly below `below`, newest first. No
    /// category or occasion filtering; used for boundary resolution only.
    fn raw_below(&self, below: EventId, limit: usize) -> Result<Vec<Event>>;

    /// Up to `limit` permitted events with the given occasion id, at or
    /// below `anchor`, newest first. Backs on-demand group expansion.
    fn occasion_below(
        &self,
        anchor: EventId,
        occasion_id: &str,
        limit: usize,
        grant: &CategoryGrant,
    ) -> Result<Vec<Event>>;
}

/// Point lookup of auxiliary context attributes by event id.
pub trait ContextScan: Send + Sync {
    fn context_for(&self, ids: &[EventId]) -> Result<BTreeMap<EventId, ContextMap>>;
}

/// Write-path input. The id and, unless supplied, the timestamp are
/// assigned by the store at append time.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub category: String,
    pub level: Level,
    pub message: String,
    pub initiator: Initiator,
    pub occasion_id: Option<String>,
    pub context: ContextMap,
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct EventStore {
    db: DBWithThreadMode<MultiThreaded>,
    last_id: AtomicU64,
    write_lock: Mutex<()>,
}

impl EventStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)
            .map_err(|err| ActilogError::Storage(err.to_string()))?;

        let last_id = highest_event_id(&db)?.map(EventId::as_u64).unwrap_or(0);

        Ok(Self {
            db,
            last_id: AtomicU64::new(last_id),
            write_lock: Mutex::new(()),
        })
    }

    /// Appends one event and its context entries in a single batch. Ids are
    /// assigned under the write lock so they are strictly increasing and
    /// never reused, even across interleaved writers.
    pub fn append(&self, input: AppendRequest) -> Result<Event> {
        let _guard = self.write_lock.lock();

        let id = EventId::from_u64(self.last_id.fetch_add(1, Ordering::SeqCst) + 1);
        let event = Event {
            id,
            timestamp: input.timestamp.unwrap_or_else(Utc::now),
            category: input.category,
            level: input.level,
            message: input.message,
            initiator: input.initiator,
            occasion_id: input.occasion_id,
        };

        let mut batch = WriteBatch::default();
        batch.put(event_key(id), serde_json::to_vec(&event)?);
        for (key, value) in &input.context {
            batch.put(context_key(id, key), value.as_bytes());
        }
        self.db.write(batch)?;

        counter!("actilog_events_appended_total").increment(1);
        Ok(event)
    }

    /// Retention sweep: deletes every event older than `cutoff` together
    /// with its context rows. Returns the number of events removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock();

        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        let prefix = event_prefix();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let event: Event = serde_json::from_slice(&value)?;
            if event.timestamp >= cutoff {
                continue;
            }
            batch.delete(key.to_vec());
            for context_row in self.context_rows(event.id)? {
                batch.delete(context_row);
            }
            removed += 1;
        }

        if removed > 0 {
            self.db.write(batch)?;
            counter!("actilog_events_purged_total").increment(removed as u64);
        }
        Ok(removed)
    }

    pub fn last_id(&self) -> Option<EventId> {
        match self.last_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(EventId::from_u64(id)),
        }
    }

    fn context_rows(&self, id: EventId) -> Result<Vec<Vec<u8>>> {
        let prefix = context_prefix(id);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn scan_events<F>(&self, from: EventId, mut visit: F) -> Result<()>
    where
        F: FnMut(Event) -> bool,
    {
        let prefix = event_prefix();
        let start = event_key(from);
        let iter = self
            .db
            .iterator(IteratorMode::From(start.as_slice(), Direction::Reverse));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let event: Event = serde_json::from_slice(&value)?;
            if !visit(event) {
                break;
            }
        }
        Ok(())
    }
}

impl EventScan for EventStore {
    fn scan_desc(&self, filter: &ScanFilter<'_>) -> Result<Vec<Event>> {
        if filter.grant.is_empty() {
            return Ok(Vec::new());
        }

        let start = filter.ceiling.unwrap_or(EventId::from_u64(u64::MAX));
        let mut events = Vec::new();
        self.scan_events(start, |event| {
            if event.id <= start && filter.grant.permits(&event.category) {
                events.push(event);
            }
            true
        })?;
        Ok(events)
    }

    fn raw_below(&self, below: EventId, limit: usize) -> Result<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        self.scan_events(below, |event| {
            if event.id < below {
                events.push(event);
            }
            events.len() < limit
        })?;
        Ok(events)
    }

    fn occasion_below(
        &self,
        anchor: EventId,
        occasion_id: &str,
        limit: usize,
        grant: &CategoryGrant,
    ) -> Result<Vec<Event>> {
        if limit == 0 || grant.is_empty() {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        self.scan_events(anchor, |event| {
            if event.id <= anchor
                && event.occasion() == Some(occasion_id)
                && grant.permits(&event.category)
            {
                events.push(event);
            }
            events.len() < limit
        })?;
        Ok(events)
    }
}

impl ContextScan for EventStore {
    fn context_for(&self, ids: &[EventId]) -> Result<BTreeMap<EventId, ContextMap>> {
        let mut joined = BTreeMap::new();
        for &id in ids {
            let prefix = context_prefix(id);
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));

            let mut entries = ContextMap::new();
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let name = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                entries.insert(name, String::from_utf8_lossy(&value).into_owned());
            }
            joined.insert(id, entries);
        }
        Ok(joined)
    }
}

fn highest_event_id(db: &DBWithThreadMode<MultiThreaded>) -> Result<Option<EventId>> {
    let prefix = event_prefix();
    let upper = event_key(EventId::from_u64(u64::MAX));
    let mut iter = db.iterator(IteratorMode::From(upper.as_slice(), Direction::Reverse));

    match iter.next() {
        Some(item) => {
            let (key, _) = item?;
            if key.starts_with(prefix.as_slice()) {
                Ok(Some(decode_event_id(&key)))
            } else {
                Ok(None)
            }
        }
        None => Ok(None),
    }
}

fn event_prefix() -> Vec<u8> {
    let mut prefix = PREFIX_EVENT.as_bytes().to_vec();
    prefix.push(SEP);
    prefix
}

fn event_key(id: EventId) -> Vec<u8> {
    let mut key = event_prefix();
    key.extend_from_slice(&id.as_u64().to_be_bytes());
    key
}

fn context_prefix(id: EventId) -> Vec<u8> {
    let mut prefix = PREFIX_CONTEXT.as_bytes().to_vec();
    prefix.push(SEP);
    prefix.extend_from_slice(&id.as_u64().to_be_bytes());
    prefix.push(SEP);
    prefix
}

fn context_key(id: EventId, name: &str) -> Vec<u8> {
    let mut key = context_prefix(id);
    key.extend_from_slice(name.as_bytes());
    key
}

fn decode_event_id(key: &[u8]) -> EventId {
    let offset = PREFIX_EVENT.len() + 1;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[offset..offset + 8]);
    EventId::from_u64(u64::from_be_bytes(raw))
}
