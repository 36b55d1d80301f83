//! Best-effort resource tracking from the raw orchestration log, for runs
//! whose event stream carries no discovery events.

use regex::Regex;

use crate::events::{ResourceKind, UnixTime};
use crate::fleet::FleetRules;

use super::{ResourceStatus, ResourceTracker};

const UUID_PATTERN: &str =
    r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b";
const TASK_HEADER_PATTERN: &str = r"^TASK \[(?P<task>[^\]]*)\]";
const ITEM_RESULT_PATTERN: &str =
    r"^(?P<status>ok|changed|failed|fatal|skipping): \[(?P<host>[^\]]+)\].*\(item=(?P<item>.*)\)";

#[derive(Debug, Clone)]
pub struct LogScraper {
    task: String,
    uuid: Regex,
    entity: Regex,
    header: Regex,
    item_result: Regex,
}

impl LogScraper {
    pub fn new(rules: &FleetRules) -> Result<Self, regex::Error> {
        Ok(Self {
            task: String::new(),
            uuid: Regex::new(UUID_PATTERN)?,
            entity: rules.entity_regex()?,
            header: Regex::new(TASK_HEADER_PATTERN)?,
            item_result: Regex::new(ITEM_RESULT_PATTERN)?,
        })
    }

    /// Name of the task whose results are currently being printed.
    pub fn current_task(&self) -> &str {
        &self.task
    }

    /// Consumes one raw log line. Returns whether the tracker changed.
    pub fn feed(&mut self, line: &str, tracker: &mut ResourceTracker, now: UnixTime) -> bool {
        let line = line.trim_end();
        if let Some(captures) = self.header.captures(line) {
            self.task = captures["task"].trim().to_ascii_lowercase();
            return false;
        }
        let Some(captures) = self.item_result.captures(line) else {
            return false;
        };
        let item = &captures["item"];
        let succeeded = matches!(&captures["status"], "ok" | "changed");

        let uuid = self.uuid.find(item).map(|found| found.as_str());
        let name = self.entity.find(item).map(|found| found.as_str());
        let (kind, id, display) = match (uuid, name) {
            (_, Some(name)) => (ResourceKind::Server, uuid.unwrap_or(name), name.to_owned()),
            (Some(uuid), None) => {
                let kind = if self.task.contains("volume") {
                    ResourceKind::Volume
                } else {
                    ResourceKind::Server
                };
                (kind, uuid, uuid.chars().take(8).collect())
            }
            (None, None) => return false,
        };

        let mut changed =
            tracker.find(kind, &display).is_none() && tracker.discover(kind, id, &display);
        let deleting_task = self.task.contains("delete");
        if deleting_task && self.task.contains("wait for") && succeeded {
            changed |= tracker.update(kind, &display, ResourceStatus::Deleted, None, now);
        } else if deleting_task && &captures["status"] == "changed" {
            changed |= tracker.update(kind, &display, ResourceStatus::Deleting, None, now);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(lines: &[&str]) -> ResourceTracker {
        let mut scraper = LogScraper::new(&FleetRules::default()).expect("scraper");
        let mut tracker = ResourceTracker::new();
        for line in lines {
            scraper.feed(line, &mut tracker, 50.0);
        }
        tracker
    }

    #[test]
    fn registers_servers_and_marks_them_deleted_after_wait() {
        let tracker = feed_all(&[
            "TASK [Get list of sup servers] ***********************************",
            "ok: [localhost] => (item=0f8e2c1a-1111-2222-3333-444455556666 sup-M1-0)",
            "ok: [localhost] => (item=9a9b9c9d-0000-0000-0000-000000000000 sup-B2-1)",
            "TASK [Delete servers] ********************************************",
            "changed: [localhost] => (item=sup-M1-0)",
            "changed: [localhost] => (item=sup-B2-1)",
            "TASK [Wait for servers to delete] ********************************",
            "ok: [localhost] => (item=sup-M1-0)",
            "FAILED - RETRYING: [localhost]: Wait for servers to delete (9 retries left).",
        ]);

        let deleted = tracker
            .find(ResourceKind::Server, "sup-M1-0")
            .expect("sup-M1-0");
        assert_eq!(deleted.status, ResourceStatus::Deleted);
        assert_eq!(deleted.id, "0f8e2c1a-1111-2222-3333-444455556666");
        assert_eq!(deleted.finished_at, Some(50.0));

        let deleting = tracker
            .find(ResourceKind::Server, "sup-B2-1")
            .expect("sup-B2-1");
        assert_eq!(deleting.status, ResourceStatus::Deleting);
        assert_eq!(tracker.len(), 2);
        assert!(!tracker.has_structured_data());
    }

    #[test]
    fn bare_uuids_in_volume_tasks_become_volumes() {
        let tracker = feed_all(&[
            "TASK [List orphaned volumes] ***",
            "ok: [localhost] => (item=5c5c5c5c-aaaa-bbbb-cccc-dddddddddddd)",
            "TASK [Wait for volumes to delete] ***",
            "ok: [localhost] => (item=5c5c5c5c-aaaa-bbbb-cccc-dddddddddddd)",
        ]);

        let volume = tracker
            .find(ResourceKind::Volume, "5c5c5c5c")
            .expect("volume");
        assert_eq!(volume.name, "5c5c5c5c");
        assert_eq!(volume.status, ResourceStatus::Deleted);
    }

    #[test]
    fn ignores_lines_without_item_results() {
        let tracker = feed_all(&[
            "PLAY [Teardown] ***",
            "TASK [Wait for servers to delete] ***",
            "ok: [localhost]",
            "changed: [localhost] => (item=not-a-vm)",
            "PLAY RECAP *****",
            "localhost : ok=3 changed=1 unreachable=0 failed=0",
        ]);
        assert!(tracker.is_empty());
    }
}
