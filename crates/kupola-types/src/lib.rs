//! Shared types for kupola
//!
//! This crate contains the data structures used across the kupola crates:
//! resource summaries produced by snapshot fetchers, the [`Watchable`]
//! trait that change detection is built on, and the identities used by
//! the session and port-forward managers.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Change Detection
// ============================================================================

/// Identity of a namespaced resource within one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceIdentity {
    pub name: String,
    pub namespace: String,
}

impl ResourceIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A resource summary that can participate in snapshot diffing.
///
/// `watched_fingerprint` must cover exactly the fields whose change should
/// trigger a notification. Fields the consumer displays but does not need
/// live-refreshed stay out of the fingerprint, so churn in them is
/// suppressed (at the cost of missed updates to unwatched fields).
pub trait Watchable {
    fn identity(&self) -> ResourceIdentity;
    fn watched_fingerprint(&self) -> u64;
}

/// Hash a tuple of watched fields into a fingerprint.
pub fn fingerprint(fields: impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    fields.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Resource Summaries
// ============================================================================

/// Quantized resource age.
///
/// Ages are bucketed so that per-second timestamp drift between two polls
/// does not register as a change. Resolution is one minute under an hour,
/// one hour under a day, one day beyond that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AgeBucket {
    Unknown,
    Minutes(i64),
    Hours(i64),
    Days(i64),
}

impl AgeBucket {
    /// Bucket the distance between a creation timestamp and `now`.
    pub fn from_creation(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(created) = created else {
            return Self::Unknown;
        };
        let elapsed = now.signed_duration_since(created);
        let minutes = elapsed.num_minutes().max(0);
        if minutes < 60 {
            Self::Minutes(minutes)
        } else if minutes < 24 * 60 {
            Self::Hours(minutes / 60)
        } else {
            Self::Days(minutes / (24 * 60))
        }
    }
}

impl fmt::Display for AgeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "?"),
            Self::Minutes(m) => write!(f, "{}m", m),
            Self::Hours(h) => write!(f, "{}h", h),
            Self::Days(d) => write!(f, "{}d", d),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Pod summary for list views.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub ready_containers: u32,
    pub total_containers: u32,
    pub restart_count: u32,
    pub age: AgeBucket,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
}

impl PodSummary {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            phase: PodPhase::Unknown,
            ready_containers: 0,
            total_containers: 0,
            restart_count: 0,
            age: AgeBucket::Unknown,
            node_name: None,
            pod_ip: None,
        }
    }

    /// Format container readiness as "ready/total".
    pub fn ready_status(&self) -> String {
        format!("{}/{}", self.ready_containers, self.total_containers)
    }
}

impl Watchable for PodSummary {
    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.name.clone(), self.namespace.clone())
    }

    fn watched_fingerprint(&self) -> u64 {
        fingerprint((
            self.phase,
            self.ready_containers,
            self.total_containers,
            self.restart_count,
            self.age,
        ))
    }
}

/// Deployment summary for list views.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub age: AgeBucket,
}

impl DeploymentSummary {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            replicas: 0,
            ready_replicas: 0,
            available_replicas: 0,
            age: AgeBucket::Unknown,
        }
    }

    /// Format replica status as "ready/total".
    pub fn replica_status(&self) -> String {
        format!("{}/{}", self.ready_replicas, self.replicas)
    }
}

impl Watchable for DeploymentSummary {
    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.name.clone(), self.namespace.clone())
    }

    fn watched_fingerprint(&self) -> u64 {
        fingerprint((self.replicas, self.ready_replicas, self.available_replicas))
    }
}

/// CronJob summary for list views.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CronJobSummary {
    pub name: String,
    pub namespace: String,
    pub schedule: String,
    pub suspended: bool,
    pub active_jobs: u32,
    pub last_schedule: Option<DateTime<Utc>>,
    pub age: AgeBucket,
}

impl CronJobSummary {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            schedule: String::new(),
            suspended: false,
            active_jobs: 0,
            last_schedule: None,
            age: AgeBucket::Unknown,
        }
    }
}

impl Watchable for CronJobSummary {
    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.name.clone(), self.namespace.clone())
    }

    fn watched_fingerprint(&self) -> u64 {
        fingerprint((
            self.schedule.as_str(),
            self.suspended,
            self.active_jobs,
            self.age,
        ))
    }
}

/// Namespace summary, used by cluster-scoped list views.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NamespaceSummary {
    pub name: String,
    pub status: String,
}

impl NamespaceSummary {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
        }
    }
}

impl Watchable for NamespaceSummary {
    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.name.clone(), "")
    }

    fn watched_fingerprint(&self) -> u64 {
        fingerprint(self.status.as_str())
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Opaque session identifier, supplied by the caller.
///
/// Callers are expected to derive it from the logical target so that
/// reopening the same target reattaches instead of spawning a second
/// backing process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The pod/container a session is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl SessionTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Interactive remote shell backed by an exec channel.
    Shell,
    /// Followed log tail backed by a log stream.
    Log,
}

/// Terminal size mirrored from the UI into the remote tty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalDimensions {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalDimensions {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalDimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_age_bucket_quantization() {
        let now = Utc::now();
        let at = |secs: i64| Some(now - Duration::seconds(secs));

        assert_eq!(AgeBucket::from_creation(None, now), AgeBucket::Unknown);
        assert_eq!(AgeBucket::from_creation(at(5), now), AgeBucket::Minutes(0));
        assert_eq!(AgeBucket::from_creation(at(59), now), AgeBucket::Minutes(0));
        assert_eq!(AgeBucket::from_creation(at(61), now), AgeBucket::Minutes(1));
        assert_eq!(
            AgeBucket::from_creation(at(3 * 3600), now),
            AgeBucket::Hours(3)
        );
        assert_eq!(
            AgeBucket::from_creation(at(49 * 3600), now),
            AgeBucket::Days(2)
        );
    }

    #[test]
    fn test_age_bucket_stable_within_resolution() {
        let now = Utc::now();
        let created = Some(now - Duration::seconds(90));
        let one_poll_later = now + Duration::seconds(4);
        assert_eq!(
            AgeBucket::from_creation(created, now),
            AgeBucket::from_creation(created, one_poll_later)
        );
    }

    #[test]
    fn test_pod_fingerprint_ignores_unwatched_fields() {
        let mut a = PodSummary::new("web-1", "default");
        a.phase = PodPhase::Running;
        let mut b = a.clone();
        b.node_name = Some("node-7".to_string());
        b.pod_ip = Some("10.0.0.3".to_string());
        assert_eq!(a.watched_fingerprint(), b.watched_fingerprint());

        b.restart_count = 1;
        assert_ne!(a.watched_fingerprint(), b.watched_fingerprint());
    }

    #[test]
    fn test_cronjob_fingerprint_tracks_schedule_and_suspension() {
        let mut a = CronJobSummary::new("backup", "ops");
        a.schedule = "0 3 * * *".to_string();
        let mut b = a.clone();
        assert_eq!(a.watched_fingerprint(), b.watched_fingerprint());

        b.suspended = true;
        assert_ne!(a.watched_fingerprint(), b.watched_fingerprint());
    }
}
