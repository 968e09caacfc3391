use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::histogram;

use crate::{
    error::Result,
    event::{Event, EventId},
    permit::PermissionResolver,
    query::{QueryEngine, QueryRequest, QueryResult},
    store::{AppendRequest, EventStore},
};

/// Shared context tying the event store, the permission resolver and the
/// paging defaults together so the REST and CLI surfaces sit on one API.
#[derive(Clone)]
pub struct LogService {
    store: Arc<EventStore>,
    resolver: Arc<dyn PermissionResolver>,
    list_page_size: usize,
    page_limit: usize,
}

impl LogService {
    pub fn new(
        store: Arc<EventStore>,
        resolver: Arc<dyn PermissionResolver>,
        list_page_size: usize,
        page_limit: usize,
    ) -> Self {
        Self {
            store,
            resolver,
            list_page_size,
            page_limit,
        }
    }

    pub fn store(&self) -> Arc<EventStore> {
        Arc::clone(&self.store)
    }

    /// Default page size for callers that want a bounded page without
    /// picking a size themselves (the CLI does). A request that leaves
    /// `page_size` at 0 still gets the unbounded single page.
    pub fn list_page_size(&self) -> usize {
        self.list_page_size
    }

    pub fn record(&self, input: AppendRequest) -> Result<Event> {
        self.store.append(input)
    }

    pub fn query(&self, token: Option<&str>, mut request: QueryRequest) -> Result<QueryResult> {
        if request.page_size > self.page_limit {
            request.page_size = self.page_limit;
        }
        let grant = self.resolver.resolve(token);

        let started = Instant::now();
        let engine = QueryEngine::new(self.store.as_ref(), self.store.as_ref());
        let result = engine.query(&grant, &request);
        histogram!("actilog_query_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    pub fn expand_group(
        &self,
        token: Option<&str>,
        anchor: EventId,
        occasion_id: &str,
        count: usize,
    ) -> Result<Vec<Event>> {
        let grant = self.resolver.resolve(token);
        let engine = QueryEngine::new(self.store.as_ref(), self.store.as_ref());
        engine.expand_group(&grant, anchor, occasion_id, count)
    }

    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store.purge_older_than(cutoff)
    }
}
