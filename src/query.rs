use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ActilogError, Result},
    event::{ContextMap, Event, EventId, Level},
    permit::CategoryGrant,
    store::{ContextScan, EventScan, ScanFilter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Grouped listing over the full pipeline: permission filter, run
    /// grouping, pagination, boundary resolution.
    #[default]
    Listing,
    /// Flat expansion of one previously collapsed group.
    ExpandGroup,
}

/// Stage at which the optional level/search refinement runs. Pre-grouping
/// removes events from the stream and therefore changes member counts;
/// post-grouping only hides representatives and preserves counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    PreGrouping,
    #[default]
    PostGrouping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    #[serde(default)]
    pub stage: FilterStage,
    #[serde(default)]
    pub min_level: Option<Level>,
    #[serde(default)]
    pub search: Option<String>,
}

impl Refinement {
    fn matches(&self, event: &Event) -> bool {
        if let Some(floor) = self.min_level {
            if event.level < floor {
                return false;
            }
        }
        if let Some(needle) = &self.search {
            if !event.message.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandSpec {
    pub anchor: EventId,
    pub occasion_id: String,
    pub count: usize,
}

/// All fields default rather than fail: a missing page size means an
/// unbounded page and a missing page means page 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub mode: QueryMode,
    /// Groups per page; 0 returns everything on a single page.
    #[serde(default)]
    pub page_size: usize,
    /// 1-based; 0 is treated as 1.
    #[serde(default)]
    pub page: usize,
    /// Post-grouping member filter: only these ids may represent a group.
    #[serde(default)]
    pub id_allowlist: Option<BTreeSet<EventId>>,
    /// Inclusive upper id bound ("first-page pin"). Doubles as the snapshot
    /// bound on the raw scan so repeated queries with the same ceiling are
    /// stable while writers keep appending.
    #[serde(default)]
    pub ceiling: Option<EventId>,
    #[serde(default)]
    pub refinement: Option<Refinement>,
    /// Required when `mode` is `ExpandGroup`.
    #[serde(default)]
    pub expand: Option<ExpandSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupedEvent {
    #[serde(flatten)]
    pub event: Event,
    /// Size of the full permission-filtered run, independent of any
    /// post-grouping filter that may have displaced the representative.
    pub member_count: u64,
    pub context: ContextMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub groups: Vec<GroupedEvent>,
    /// Matching group count before pagination.
    pub total_groups: usize,
    pub page: usize,
    pub page_count: usize,
    /// 1-based row range of this page; both 0 when the page is empty.
    pub rows_from: usize,
    pub rows_to: usize,
    /// Id of the newest returned representative.
    pub max_id: Option<EventId>,
    /// Low-water mark: the smallest id accounted for by this page,
    /// including members hidden inside the last group. Callers resume with
    /// a ceiling strictly below this id.
    pub min_id: Option<EventId>,
}

/// Stateless, read-only query front end over the event and context ports.
pub struct QueryEngine<'a> {
    events: &'a dyn EventScan,
    context: &'a dyn ContextScan,
}

// === Occasion grouping ===

/// One maximal contiguous run of equal occasion ids, members newest first.
/// Events without an occasion id never chain, so each forms a run of one.
#[derive(Debug)]
struct Run {
    members: Vec<Event>,
}

impl Run {
    fn member_count(&self) -> u64 {
        self.members.len() as u64
    }
}

fn group_runs(events: Vec<Event>) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for event in events {
        let continues = match (runs.last(), event.occasion()) {
            (Some(run), Some(occasion)) => {
                run.members
                    .last()
                    .and_then(Event::occasion)
                    .is_some_and(|prev| prev == occasion)
            }
            _ => false,
        };

        if continues {
            runs.last_mut()
                .expect("run exists when continuing")
                .members
                .push(event);
        } else {
            runs.push(Run {
                members: vec![event],
            });
        }
    }
    runs
}

impl<'a> QueryEngine<'a> {
    pub fn new(events: &'a dyn EventScan, context: &'a dyn ContextScan) -> Self {
        Self { events, context }
    }

    /// Dispatches to the grouped listing or the flat expand path.
    pub fn query(&self, grant: &CategoryGrant, request: &QueryRequest) -> Result<QueryResult> {
        match request.mode {
            QueryMode::Listing => self.listing(grant, request),
            QueryMode::ExpandGroup => self.expand(grant, request),
        }
    }

    /// Flat, ungrouped view of one occasion: up to `count` events with the
    /// given occasion id at or below `anchor`, newest first.
    pub fn expand_group(
        &self,
        grant: &CategoryGrant,
        anchor: EventId,
        occasion_id: &str,
        count: usize,
    ) -> Result<Vec<Event>> {
        self.events.occasion_below(anchor, occasion_id, count, grant)
    }

    fn listing(&self, grant: &CategoryGrant, request: &QueryRequest) -> Result<QueryResult> {
        let refinement = request.refinement.as_ref();
        let pre_refine = refinement.filter(|r| r.stage == FilterStage::PreGrouping);
        let post_refine = refinement.filter(|r| r.stage == FilterStage::PostGrouping);

        // Stage 1: permission filter and snapshot ceiling, before grouping.
        let mut stream = self.events.scan_desc(&ScanFilter {
            grant,
            ceiling: request.ceiling,
        })?;
        if let Some(refine) = pre_refine {
            stream.retain(|event| refine.matches(event));
        }

        let runs = group_runs(stream);

        // Stage 2: member filters on the grouped stream. A run stays
        // visible as long as one member survives; its newest surviving
        // member represents it and the count is never recomputed.
        let mut visible: Vec<(Event, u64)> = Vec::new();
        for run in &runs {
            let Some(representative) = run
                .members
                .iter()
                .find(|member| member_survives(member.id, request))
            else {
                continue;
            };
            if let Some(refine) = post_refine {
                if !refine.matches(representative) {
                    continue;
                }
            }
            visible.push((representative.clone(), run.member_count()));
        }

        let total_groups = visible.len();
        let page = request.page.max(1);
        let page_count = page_count(total_groups, request.page_size);

        // Saturating: a page far past the end lands on an empty window
        // instead of overflowing.
        let offset = match request.page_size {
            0 => 0,
            size => (page - 1).saturating_mul(size),
        };
        let window: Vec<(Event, u64)> = if offset >= total_groups {
            Vec::new()
        } else {
            let end = match request.page_size {
                0 => total_groups,
                size => offset.saturating_add(size).min(total_groups),
            };
            visible[offset..end].to_vec()
        };

        let returned = window.len();
        let rows_from = if returned > 0 { offset + 1 } else { 0 };
        let rows_to = if returned > 0 { offset + returned } else { 0 };

        let max_id = window.first().map(|(event, _)| event.id);
        let min_id = match window.last() {
            Some((last, member_count)) => Some(self.resolve_min_id(last.id, *member_count)?),
            None => None,
        };

        let groups = self.join_context(window)?;

        Ok(QueryResult {
            groups,
            total_groups,
            page,
            page_count,
            rows_from,
            rows_to,
            max_id,
            min_id,
        })
    }

    /// Finds the id of the oldest member of the last group on the page.
    ///
    /// The hidden siblings are the next `member_count - 1` events below the
    /// representative in raw descending order. This relies on the run being
    /// contiguous in the permission-filtered stream; it is not an
    /// occasion-filtered lookup. If a concurrent purge shrank the run the
    /// smallest id actually retrieved is used instead, which over-reports
    /// the boundary but never re-exposes a row already accounted for.
    fn resolve_min_id(&self, last_id: EventId, member_count: u64) -> Result<EventId> {
        let extra = member_count.saturating_sub(1) as usize;
        if extra == 0 {
            return Ok(last_id);
        }
        let hidden = self.events.raw_below(last_id, extra)?;
        Ok(hidden.last().map(|event| event.id).unwrap_or(last_id))
    }

    fn expand(&self, grant: &CategoryGrant, request: &QueryRequest) -> Result<QueryResult> {
        let spec = request.expand.as_ref().ok_or_else(|| {
            ActilogError::InvalidRequest(
                "expand mode requires anchor, occasion_id and count".into(),
            )
        })?;

        let events =
            self.expand_group(grant, spec.anchor, &spec.occasion_id, spec.count)?;

        let total_groups = events.len();
        let max_id = events.first().map(|event| event.id);
        let min_id = events.last().map(|event| event.id);
        let rows_to = total_groups;

        let flat: Vec<(Event, u64)> = events.into_iter().map(|event| (event, 1)).collect();
        let groups = self.join_context(flat)?;

        Ok(QueryResult {
            rows_from: if total_groups > 0 { 1 } else { 0 },
            rows_to,
            total_groups,
            page: 1,
            page_count: if total_groups > 0 { 1 } else { 0 },
            max_id,
            min_id,
            groups,
        })
    }

    /// Attaches context entries to exactly the events being returned.
    fn join_context(&self, window: Vec<(Event, u64)>) -> Result<Vec<GroupedEvent>> {
        let ids: Vec<EventId> = window.iter().map(|(event, _)| event.id).collect();
        let mut joined = self.context.context_for(&ids)?;

        Ok(window
            .into_iter()
            .map(|(event, member_count)| {
                let context = joined.remove(&event.id).unwrap_or_default();
                GroupedEvent {
                    event,
                    member_count,
                    context,
                }
            })
            .collect())
    }
}

fn member_survives(id: EventId, request: &QueryRequest) -> bool {
    if let Some(allowlist) = &request.id_allowlist {
        if !allowlist.contains(&id) {
            return false;
        }
    }
    if let Some(ceiling) = request.ceiling {
        if id > ceiling {
            return false;
        }
    }
    true
}

fn page_count(total_groups: usize, page_size: usize) -> usize {
    if total_groups == 0 {
        return 0;
    }
    match page_size {
        0 => 1,
        size => total_groups.div_ceil(size),
    }
}
