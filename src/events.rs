use serde::Deserialize;
use serde_json::{Map, Value};

/// Seconds since the unix epoch, as stamped by the event producer.
pub type UnixTime = f64;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub unix_ts: Option<UnixTime>,
    pub task: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Server,
    Volume,
}

impl ResourceKind {
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Server => "server",
            ResourceKind::Volume => "volume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecapCounters {
    pub ok: u64,
    pub changed: u64,
    pub failures: u64,
    pub unreachable: u64,
    pub skipped: u64,
}

impl RecapCounters {
    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.unreachable == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    PlaybookStart {
        playbook: String,
    },
    PlaybookEnd {
        playbook: String,
        elapsed: Option<f64>,
    },
    /// `vm_creating` and `vm_exists`.
    VmCreating {
        vm: String,
    },
    /// `vm_provisioned` and `vm_active`.
    VmProvisioned {
        vm: String,
    },
    VmIp {
        vm: String,
        ip: String,
    },
    VmFailed {
        vm: String,
        error: Option<String>,
    },
    InstallPreparing {
        host: Option<String>,
    },
    InstallStage1 {
        host: Option<String>,
    },
    InstallStage2 {
        host: Option<String>,
    },
    InstallFeedback {
        host: Option<String>,
    },
    InstallComplete {
        host: String,
    },
    RebootStart {
        host: Option<String>,
    },
    RebootComplete {
        host: String,
    },
    InstallFailed {
        host: String,
        stage: Option<String>,
        error: Option<String>,
    },
    TaskFailed {
        host: String,
        error: Option<String>,
        stderr: Option<String>,
        ignored: bool,
    },
    HostUnreachable {
        host: String,
        error: Option<String>,
    },
    Recap {
        host: String,
        counters: RecapCounters,
    },
    Retry {
        host: String,
        target: Option<String>,
        remaining: u64,
    },
    DiscoveryServers {
        servers: Vec<DiscoveredServer>,
    },
    DiscoveryVolumes {
        volumes: Vec<String>,
    },
    ResourceDeleted {
        resource: ResourceKind,
        name: String,
    },
    ResourceFailed {
        resource: ResourceKind,
        name: String,
        error: Option<String>,
        ignored: bool,
    },
    Unknown {
        kind: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    unix_ts: Option<Value>,
    #[serde(default)]
    task: Option<Value>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

/// Decodes one line of the event stream.
///
/// Returns `None` for blank lines, unparsable JSON and known event types
/// missing a required field. Unrecognized types decode to
/// [`EventKind::Unknown`], which every consumer ignores.
pub fn decode_line(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw = match serde_json::from_str::<RawEvent>(line) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::debug!(%error, "skipping undecodable event line");
            return None;
        }
    };
    let data = raw.data.unwrap_or_default();
    let kind = decode_kind(&raw.kind, &data);
    if kind.is_none() {
        tracing::debug!(kind = %raw.kind, "skipping event with missing fields");
    }
    Some(Event {
        kind: kind?,
        unix_ts: raw
            .unix_ts
            .as_ref()
            .and_then(number_value)
            .filter(|ts| ts.is_finite() && *ts > 0.0),
        task: raw.task.as_ref().and_then(scalar_text),
    })
}

fn decode_kind(kind: &str, data: &Map<String, Value>) -> Option<EventKind> {
    let decoded = match kind {
        "playbook_start" => EventKind::PlaybookStart {
            playbook: text(data, "playbook").unwrap_or_default(),
        },
        "playbook_end" => EventKind::PlaybookEnd {
            playbook: text(data, "playbook").unwrap_or_default(),
            elapsed: number(data, "elapsed"),
        },
        "vm_creating" | "vm_exists" => EventKind::VmCreating {
            vm: text(data, "vm_name")?,
        },
        "vm_provisioned" | "vm_active" => EventKind::VmProvisioned {
            vm: target(data)?,
        },
        "vm_ip" => EventKind::VmIp {
            vm: target(data)?,
            ip: text(data, "ip").unwrap_or_default(),
        },
        "vm_failed" => EventKind::VmFailed {
            vm: target(data)?,
            error: text(data, "error"),
        },
        "install_preparing" => EventKind::InstallPreparing {
            host: text(data, "host"),
        },
        "install_stage1" => EventKind::InstallStage1 {
            host: text(data, "host"),
        },
        "install_stage2" => EventKind::InstallStage2 {
            host: text(data, "host"),
        },
        "install_feedback" => EventKind::InstallFeedback {
            host: text(data, "host"),
        },
        "install_complete" => EventKind::InstallComplete {
            host: text(data, "host")?,
        },
        "reboot_start" => EventKind::RebootStart {
            host: text(data, "host"),
        },
        "reboot_complete" => EventKind::RebootComplete {
            host: text(data, "host")?,
        },
        "install_failed" => EventKind::InstallFailed {
            host: text(data, "host")?,
            stage: text(data, "stage"),
            error: text(data, "error"),
        },
        "task_failed" => EventKind::TaskFailed {
            host: text(data, "host")?,
            error: text(data, "error"),
            stderr: text(data, "stderr"),
            ignored: flag(data, "ignored"),
        },
        "host_unreachable" => EventKind::HostUnreachable {
            host: text(data, "host")?,
            error: text(data, "error"),
        },
        "recap" => EventKind::Recap {
            host: text(data, "host")?,
            counters: RecapCounters {
                ok: count(data, "ok"),
                changed: count(data, "changed"),
                failures: count(data, "failures"),
                unreachable: count(data, "unreachable"),
                skipped: count(data, "skipped"),
            },
        },
        "retry" => EventKind::Retry {
            host: text(data, "host").unwrap_or_default(),
            target: text(data, "vm_name"),
            remaining: count(data, "retries_remaining"),
        },
        "discovery_servers" => EventKind::DiscoveryServers {
            servers: list(data, "servers")?
                .iter()
                .filter_map(discovered_server)
                .collect(),
        },
        "discovery_volumes" => EventKind::DiscoveryVolumes {
            volumes: list(data, "volumes")?
                .iter()
                .filter_map(scalar_text)
                .collect(),
        },
        "resource_deleted" => EventKind::ResourceDeleted {
            resource: resource_kind(data),
            name: text(data, "name")?,
        },
        "resource_failed" => EventKind::ResourceFailed {
            resource: resource_kind(data),
            name: text(data, "name")?,
            error: text(data, "error"),
            ignored: flag(data, "ignored"),
        },
        other => EventKind::Unknown {
            kind: other.to_owned(),
        },
    };
    Some(decoded)
}

fn target(data: &Map<String, Value>) -> Option<String> {
    text(data, "vm_name").or_else(|| text(data, "host"))
}

fn resource_kind(data: &Map<String, Value>) -> ResourceKind {
    match text(data, "type").as_deref() {
        Some("volume") => ResourceKind::Volume,
        _ => ResourceKind::Server,
    }
}

fn discovered_server(value: &Value) -> Option<DiscoveredServer> {
    match value {
        Value::Object(fields) => {
            let id = text(fields, "id")?;
            let name = text(fields, "name").unwrap_or_else(|| id.chars().take(8).collect());
            Some(DiscoveredServer { id, name })
        }
        other => {
            let id = scalar_text(other)?;
            Some(DiscoveredServer {
                name: id.chars().take(8).collect(),
                id,
            })
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!rendered.is_empty()).then_some(rendered)
}

fn text(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(scalar_text)
}

fn number(data: &Map<String, Value>, key: &str) -> Option<f64> {
    data.get(key).and_then(number_value)
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn count(data: &Map<String, Value>, key: &str) -> u64 {
    match data.get(key) {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().map(|value| value.max(0.0) as u64))
            .unwrap_or(0),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn flag(data: &Map<String, Value>, key: &str) -> bool {
    match data.get(key) {
        Some(Value::Bool(value)) => *value,
        Some(Value::String(text)) => matches!(text.trim(), "true" | "True" | "yes" | "1"),
        Some(Value::Number(number)) => number.as_u64().is_some_and(|value| value != 0),
        _ => false,
    }
}

/// Lists arrive either as JSON arrays or as JSON-encoded strings.
fn list(data: &Map<String, Value>, key: &str) -> Option<Vec<Value>> {
    match data.get(key)? {
        Value::Array(items) => Some(items.clone()),
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded).ok()? {
            Value::Array(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
