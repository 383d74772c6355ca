//! Conversion from raw API objects to the summaries list views consume.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Pod};

use kupola_types::{AgeBucket, CronJobSummary, DeploymentSummary, NamespaceSummary, PodSummary};

fn creation_time<T: kube::Resource>(obj: &T) -> Option<DateTime<Utc>> {
    obj.meta().creation_timestamp.as_ref().map(|t| t.0)
}

pub fn pod_summary(pod: &Pod, now: DateTime<Utc>) -> PodSummary {
    let meta = &pod.metadata;
    let mut summary = PodSummary::new(
        meta.name.clone().unwrap_or_default(),
        meta.namespace.clone().unwrap_or_default(),
    );
    summary.age = AgeBucket::from_creation(creation_time(pod), now);

    if let Some(spec) = &pod.spec {
        summary.total_containers = spec.containers.len() as u32;
        summary.node_name = spec.node_name.clone();
    }

    if let Some(status) = &pod.status {
        summary.phase = status.phase.as_deref().unwrap_or("Unknown").into();
        summary.pod_ip = status.pod_ip.clone();
        if let Some(statuses) = &status.container_statuses {
            summary.ready_containers = statuses.iter().filter(|c| c.ready).count() as u32;
            summary.restart_count = statuses.iter().map(|c| c.restart_count.max(0) as u32).sum();
        }
    }

    summary
}

pub fn deployment_summary(deployment: &Deployment, now: DateTime<Utc>) -> DeploymentSummary {
    let meta = &deployment.metadata;
    let mut summary = DeploymentSummary::new(
        meta.name.clone().unwrap_or_default(),
        meta.namespace.clone().unwrap_or_default(),
    );
    summary.age = AgeBucket::from_creation(creation_time(deployment), now);

    if let Some(spec) = &deployment.spec {
        summary.replicas = spec.replicas.unwrap_or(0);
    }
    if let Some(status) = &deployment.status {
        summary.ready_replicas = status.ready_replicas.unwrap_or(0);
        summary.available_replicas = status.available_replicas.unwrap_or(0);
    }

    summary
}

pub fn cron_job_summary(cron_job: &CronJob, now: DateTime<Utc>) -> CronJobSummary {
    let meta = &cron_job.metadata;
    let mut summary = CronJobSummary::new(
        meta.name.clone().unwrap_or_default(),
        meta.namespace.clone().unwrap_or_default(),
    );
    summary.age = AgeBucket::from_creation(creation_time(cron_job), now);

    if let Some(spec) = &cron_job.spec {
        summary.schedule = spec.schedule.clone();
        summary.suspended = spec.suspend.unwrap_or(false);
    }
    if let Some(status) = &cron_job.status {
        summary.active_jobs = status.active.as_ref().map(|a| a.len()).unwrap_or(0) as u32;
        summary.last_schedule = status.last_schedule_time.as_ref().map(|t| t.0);
    }

    summary
}

pub fn namespace_summary(namespace: &Namespace) -> NamespaceSummary {
    NamespaceSummary::new(
        namespace.metadata.name.clone().unwrap_or_default(),
        namespace
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kupola_types::PodPhase;

    fn container_status(ready: bool, restarts: i32) -> ContainerStatus {
        ContainerStatus {
            ready,
            restart_count: restarts,
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_summary_counts_ready_and_restarts() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![
                    container_status(true, 2),
                    container_status(false, 1),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let summary = pod_summary(&pod, Utc::now());
        assert_eq!(summary.name, "web-1");
        assert_eq!(summary.phase, PodPhase::Running);
        assert_eq!(summary.ready_containers, 1);
        assert_eq!(summary.restart_count, 3);
    }

    #[test]
    fn test_pod_summary_tolerates_missing_status() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let summary = pod_summary(&pod, Utc::now());
        assert_eq!(summary.phase, PodPhase::Unknown);
        assert_eq!(summary.ready_status(), "0/0");
    }
}
