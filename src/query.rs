use std::future::Future;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::error::ResolveError;
use crate::http_client::Client;
use crate::job_types::{Instance, Job};

/// What one cluster reported for a uuid: a job, or an instance together with
/// its parent job.
#[derive(Debug, Clone)]
pub enum Matched {
    Job(Job),
    Instance { instance: Instance, job: Job },
}

impl Matched {
    pub fn uuid(&self) -> &str {
        match self {
            Self::Job(job) => &job.uuid,
            Self::Instance { instance, .. } => &instance.task_id,
        }
    }
}

/// Defensive re-check of the identifier. clap already delivers a single
/// positional, but fail loudly if a quoted multi-token or non-uuid value
/// slipped through instead of silently querying with garbage.
pub fn validate_uuid(raw: &str) -> Result<String> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(ResolveError::InvalidIdentifier("value is empty".to_string()).into());
    }
    if token
        .split([' ', '\t', '\n', ','])
        .filter(|t| !t.is_empty())
        .count()
        > 1
    {
        return Err(ResolveError::InvalidIdentifier(format!(
            "expected a single uuid, got '{}'",
            raw
        ))
        .into());
    }
    if Uuid::parse_str(token).is_err() {
        return Err(
            ResolveError::InvalidIdentifier(format!("'{}' is not a valid uuid", token)).into(),
        );
    }
    Ok(token.to_string())
}

/// Queries every cluster for the uuid, in order, and runs `action` against
/// the single match.
///
/// Zero matches and multiple matches fail without invoking the action; an
/// ambiguous uuid is never resolved by picking a cluster. Query and action
/// errors propagate unchanged.
pub async fn query_unique_and_run<Q, QFut, A, AFut, T>(
    clusters: &[ClusterConfig],
    uuid: &str,
    query: Q,
    action: A,
) -> Result<T>
where
    Q: Fn(&ClusterConfig, &str) -> QFut,
    QFut: Future<Output = Result<Option<Matched>>>,
    A: FnOnce(&ClusterConfig, Matched) -> AFut,
    AFut: Future<Output = Result<T>>,
{
    let uuid = validate_uuid(uuid)?;

    let mut matches = Vec::new();
    for cluster in clusters {
        debug!("querying cluster {} for {}", cluster.name, uuid);
        if let Some(matched) = query(cluster, &uuid).await? {
            matches.push((cluster, matched));
        }
    }

    if matches.len() > 1 {
        let clusters = matches.iter().map(|(c, _)| c.name.clone()).collect();
        return Err(ResolveError::Ambiguous { uuid, clusters }.into());
    }
    match matches.pop() {
        Some((cluster, matched)) => action(cluster, matched).await,
        None => Err(ResolveError::NotFound(uuid).into()),
    }
}

pub async fn lookup_job(client: &Client, uuid: &str) -> Result<Option<Job>> {
    match client.get_json(&format!("/api/jobs/{}", uuid)).await? {
        Some(v) => {
            let job = serde_json::from_value(v).context("Invalid job document")?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

pub async fn lookup_instance(client: &Client, uuid: &str) -> Result<Option<(Instance, Job)>> {
    #[derive(Deserialize)]
    struct InstanceLookup {
        instance: Instance,
        job: Job,
    }

    match client.get_json(&format!("/api/instances/{}", uuid)).await? {
        Some(v) => {
            let hit: InstanceLookup =
                serde_json::from_value(v).context("Invalid instance document")?;
            Ok(Some((hit.instance, hit.job)))
        }
        None => Ok(None),
    }
}

/// One cluster lookup: job uuid first, then instance uuid. 404s mean no
/// match; anything else is a real failure.
pub async fn query_cluster(
    client: &Client,
    cluster: &ClusterConfig,
    uuid: &str,
) -> Result<Option<Matched>> {
    if let Some(job) = lookup_job(client, uuid)
        .await
        .with_context(|| format!("Job lookup failed on cluster {}", cluster.name))?
    {
        return Ok(Some(Matched::Job(job)));
    }
    if let Some((instance, job)) = lookup_instance(client, uuid)
        .await
        .with_context(|| format!("Instance lookup failed on cluster {}", cluster.name))?
    {
        return Ok(Some(Matched::Instance { instance, job }));
    }
    Ok(None)
}
