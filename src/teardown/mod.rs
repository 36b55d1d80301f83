pub mod scrape;

use indexmap::IndexMap;

use crate::events::{Event, EventKind, ResourceKind, UnixTime};
use crate::fleet::{sort_key, truncate_chars, Phase, MAX_ERROR_CHARS};

pub use scrape::LogScraper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Pending,
    Deleting,
    Deleted,
    Failed,
}

impl ResourceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceStatus::Deleted | ResourceStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::Deleted => "deleted",
            ResourceStatus::Failed => "failed",
        }
    }

    fn can_become(self, next: ResourceStatus) -> bool {
        match next {
            ResourceStatus::Pending => false,
            ResourceStatus::Deleting => self == ResourceStatus::Pending,
            ResourceStatus::Deleted | ResourceStatus::Failed => !self.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    pub error: Option<String>,
    pub finished_at: Option<UnixTime>,
}

impl Resource {
    fn new(kind: ResourceKind, id: &str, name: &str, status: ResourceStatus) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            kind,
            status,
            error: None,
            finished_at: None,
        }
    }

    fn matches(&self, needle: &str) -> bool {
        !needle.is_empty() && (self.name == needle || self.id.starts_with(needle))
    }
}

/// What the teardown run is currently doing, for the header line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TeardownStage {
    #[default]
    Waiting,
    Discovering,
    FoundServers,
    FoundVolumes,
    Deleting(ResourceKind),
    Complete,
}

impl TeardownStage {
    fn rank(self) -> u8 {
        match self {
            TeardownStage::Waiting => 0,
            TeardownStage::Discovering => 1,
            TeardownStage::FoundServers => 2,
            TeardownStage::FoundVolumes => 3,
            TeardownStage::Deleting(_) => 4,
            TeardownStage::Complete => 5,
        }
    }

    pub fn label(self) -> String {
        match self {
            TeardownStage::Waiting => "Waiting".to_owned(),
            TeardownStage::Discovering => "Discovering".to_owned(),
            TeardownStage::FoundServers => "Found servers".to_owned(),
            TeardownStage::FoundVolumes => "Found volumes".to_owned(),
            TeardownStage::Deleting(kind) => format!("Deleting {}s", kind.label()),
            TeardownStage::Complete => "Complete".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub total: usize,
    pub pending: usize,
    pub deleting: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ResourceCounts {
    pub fn finished(&self) -> usize {
        self.deleted + self.failed
    }
}

/// Servers and volumes seen during teardown, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    resources: IndexMap<String, Resource>,
    stage: TeardownStage,
    structured: bool,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> TeardownStage {
        self.stage
    }

    /// Whether the event stream has reported any discovery.
    pub fn has_structured_data(&self) -> bool {
        self.structured
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn find(&self, kind: ResourceKind, needle: &str) -> Option<&Resource> {
        self.resources
            .values()
            .find(|resource| resource.kind == kind && resource.matches(needle))
    }

    /// Servers first, then volumes, each in display order.
    pub fn sorted(&self) -> Vec<&Resource> {
        let mut sorted = self.resources.values().collect::<Vec<&Resource>>();
        sorted.sort_by_cached_key(|resource| {
            let kind_rank = match resource.kind {
                ResourceKind::Server => 0u8,
                ResourceKind::Volume => 1u8,
            };
            (kind_rank, sort_key(&resource.name, ""))
        });
        sorted
    }

    pub fn counts(&self, kind: Option<ResourceKind>) -> ResourceCounts {
        let mut counts = ResourceCounts::default();
        for resource in self
            .resources
            .values()
            .filter(|resource| kind.map_or(true, |kind| resource.kind == kind))
        {
            counts.total += 1;
            match resource.status {
                ResourceStatus::Pending => counts.pending += 1,
                ResourceStatus::Deleting => counts.deleting += 1,
                ResourceStatus::Deleted => counts.deleted += 1,
                ResourceStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn apply(&mut self, event: &Event, now: UnixTime) -> bool {
        let ts = event.unix_ts.unwrap_or(now);
        match &event.kind {
            EventKind::PlaybookStart { playbook } => {
                if Phase::from_playbook(playbook) != Some(Phase::Teardown) {
                    return false;
                }
                self.set_stage(TeardownStage::Discovering)
            }
            EventKind::PlaybookEnd { .. } => self.set_stage(TeardownStage::Complete),
            EventKind::DiscoveryServers { servers } => {
                self.structured = true;
                let mut changed = self.set_stage(TeardownStage::FoundServers);
                for server in servers {
                    changed |= self.discover(ResourceKind::Server, &server.id, &server.name);
                }
                changed
            }
            EventKind::DiscoveryVolumes { volumes } => {
                self.structured = true;
                let mut changed = self.set_stage(TeardownStage::FoundVolumes);
                for id in volumes {
                    let short = id.chars().take(8).collect::<String>();
                    changed |= self.discover(ResourceKind::Volume, id, &short);
                }
                changed
            }
            EventKind::ResourceDeleted { resource, name } => {
                let changed = self.set_stage(TeardownStage::Deleting(*resource));
                self.update(*resource, name, ResourceStatus::Deleted, None, ts) || changed
            }
            EventKind::ResourceFailed {
                resource,
                name,
                error,
                ignored,
            } => {
                if *ignored {
                    return false;
                }
                let changed = self.set_stage(TeardownStage::Deleting(*resource));
                self.update(
                    *resource,
                    name,
                    ResourceStatus::Failed,
                    error.as_deref(),
                    ts,
                ) || changed
            }
            _ => false,
        }
    }

    /// Registers a resource. An id already present, under either kind, is
    /// left untouched.
    pub fn discover(&mut self, kind: ResourceKind, id: &str, name: &str) -> bool {
        if id.is_empty() || self.resources.contains_key(id) {
            return false;
        }
        if id != name && self.rekey_scraped(kind, id, name) {
            return true;
        }
        tracing::debug!(kind = kind.label(), id, name, "discovered resource");
        self.resources.insert(
            id.to_owned(),
            Resource::new(kind, id, name, ResourceStatus::Pending),
        );
        true
    }

    /// A resource the scraper keyed by its bare name takes over the real id.
    fn rekey_scraped(&mut self, kind: ResourceKind, id: &str, name: &str) -> bool {
        let Some(index) = self.resources.get_index_of(name) else {
            return false;
        };
        let scraped = &self.resources[index];
        if scraped.kind != kind || scraped.id != name {
            return false;
        }
        let Some((_, mut resource)) = self.resources.shift_remove_index(index) else {
            return false;
        };
        tracing::debug!(kind = kind.label(), id, name, "re-keyed scraped resource");
        resource.id = id.to_owned();
        self.resources.shift_insert(index, id.to_owned(), resource);
        true
    }

    /// Moves the resource matching `needle` (id prefix or exact name) to
    /// `status`. Without a match a resource is synthesized in that status.
    pub fn update(
        &mut self,
        kind: ResourceKind,
        needle: &str,
        status: ResourceStatus,
        error: Option<&str>,
        ts: UnixTime,
    ) -> bool {
        let position = self
            .resources
            .values()
            .position(|resource| resource.kind == kind && resource.matches(needle));
        let index = match position {
            Some(index) => index,
            None => {
                if needle.is_empty() || status == ResourceStatus::Deleting {
                    return false;
                }
                tracing::debug!(kind = kind.label(), name = needle, "resource reported without discovery");
                match self.resources.get_index_of(needle) {
                    Some(index) => index,
                    None => {
                        self.resources
                            .insert_full(
                                needle.to_owned(),
                                Resource::new(kind, needle, needle, ResourceStatus::Pending),
                            )
                            .0
                    }
                }
            }
        };
        let Some((_, resource)) = self.resources.get_index_mut(index) else {
            return false;
        };
        if !resource.status.can_become(status) {
            return false;
        }
        resource.status = status;
        if status.is_terminal() {
            resource.finished_at = Some(ts);
        }
        if let Some(error) = error {
            resource.error = Some(truncate_chars(error, MAX_ERROR_CHARS));
        }
        true
    }

    /// Stages only move forward; deletion may switch between kinds.
    fn set_stage(&mut self, stage: TeardownStage) -> bool {
        let switching_kind = matches!(
            (self.stage, stage),
            (TeardownStage::Deleting(current), TeardownStage::Deleting(next)) if current != next
        );
        if stage.rank() <= self.stage.rank() && !switching_kind {
            return false;
        }
        self.stage = stage;
        true
    }
}

#[cfg(test)]
#[path = "../tests/teardown_tests.rs"]
mod tests;
