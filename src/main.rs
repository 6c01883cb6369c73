mod config;
mod error;
mod http_client;
mod job_types;
mod query;
mod util;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::{builtin_defaults, default_config_path, ClusterConfig, Config};
use crate::error::ResolveError;
use crate::http_client::{client_for, Client};
use crate::job_types::{Instance, Job, RunState};
use crate::query::{lookup_instance, lookup_job, query_cluster, query_unique_and_run, Matched};
use crate::util::{await_until, merge_settings};

const EXIT_GENERIC_FAILURE: i32 = 1;
const EXIT_INVALID_ARGUMENT: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_AMBIGUOUS: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "jobctl")]
#[command(about = "Multi-cluster scheduler CLI", long_about = None)]
struct Args {
    /// Load config from this path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Query only this named cluster from the config
    #[arg(long)]
    cluster: Option<String>,

    /// Query a single ad-hoc cluster at this base URL (bypasses config)
    #[arg(long, env = "JOBCTL_URL")]
    url: Option<String>,

    /// HTTP timeout seconds (overrides config)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Retry count: 429 always retried; 5xx retried for GET (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Output a sandbox file's contents by job or instance uuid
    Cat {
        uuid: String,
        path: String,
        /// Seconds to wait for a sandbox to become available
        #[arg(long, default_value_t = 30)]
        wait_timeout_secs: u64,
        /// Seconds between sandbox checks
        #[arg(long, default_value_t = 5)]
        poll_interval_secs: u64,
    },

    /// Show the resolved job or instance
    Show { uuid: String },

    /// Wait for a job or instance to reach a terminal state
    Wait {
        uuid: String,
        /// Seconds to wait before giving up
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        /// Seconds between state checks
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },

    /// Kill a job or instance by uuid
    Kill { uuid: String },

    /// Inspect or edit the config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the config
    Show,
    /// Add or replace a cluster entry
    AddCluster {
        name: String,
        url: String,
        /// Cluster setting (repeatable), e.g. --setting timeout-secs=30
        #[arg(long)]
        setting: Vec<String>,
    },
    /// Remove a cluster entry
    RemoveCluster { name: String },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("{:#}", err);
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ResolveError>() {
        Some(ResolveError::InvalidIdentifier(_)) => EXIT_INVALID_ARGUMENT,
        Some(ResolveError::NotFound(_)) => EXIT_NOT_FOUND,
        Some(ResolveError::Ambiguous { .. }) => EXIT_AMBIGUOUS,
        None => EXIT_GENERIC_FAILURE,
    }
}

async fn run(args: Args) -> Result<()> {
    // Logging
    let lvl = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(lvl).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cfg_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = Config::load(&cfg_path)?;
    let overrides = cli_settings(&args);

    match args.cmd {
        Command::Config { cmd } => run_config(cfg, &cfg_path, cmd),
        Command::Cat {
            uuid,
            path,
            wait_timeout_secs,
            poll_interval_secs,
        } => {
            let (clusters, clients) =
                cluster_context(&cfg, args.cluster.as_deref(), args.url.as_deref(), &overrides)?;
            run_cat(
                &clusters,
                &clients,
                &uuid,
                &path,
                Duration::from_secs(wait_timeout_secs),
                Duration::from_secs(poll_interval_secs),
            )
            .await
        }
        Command::Show { uuid } => {
            let (clusters, clients) =
                cluster_context(&cfg, args.cluster.as_deref(), args.url.as_deref(), &overrides)?;
            run_show(&clusters, &clients, &uuid).await
        }
        Command::Wait {
            uuid,
            timeout_secs,
            interval_secs,
        } => {
            let (clusters, clients) =
                cluster_context(&cfg, args.cluster.as_deref(), args.url.as_deref(), &overrides)?;
            run_wait(
                &clusters,
                &clients,
                &uuid,
                Duration::from_secs(timeout_secs),
                Duration::from_secs(interval_secs),
            )
            .await
        }
        Command::Kill { uuid } => {
            let (clusters, clients) =
                cluster_context(&cfg, args.cluster.as_deref(), args.url.as_deref(), &overrides)?;
            run_kill(&clusters, &clients, &uuid).await
        }
    }
}

/// CLI flags that override config settings, as a settings map.
fn cli_settings(args: &Args) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(v) = args.timeout_secs {
        out.insert("timeout-secs".to_string(), v.to_string());
    }
    if let Some(v) = args.retries {
        out.insert("retries".to_string(), v.to_string());
    }
    out
}

fn select_clusters(
    cfg: &Config,
    only: Option<&str>,
    url: Option<&str>,
) -> Result<Vec<ClusterConfig>> {
    if let Some(url) = url {
        return Ok(vec![ClusterConfig {
            name: url.trim_end_matches('/').to_string(),
            url: url.to_string(),
            settings: BTreeMap::new(),
        }]);
    }
    if cfg.clusters.is_empty() {
        anyhow::bail!(
            "No clusters configured; add one with `jobctl config add-cluster <name> <url>` or pass --url"
        );
    }
    match only {
        Some(name) => {
            let found: Vec<ClusterConfig> = cfg
                .clusters
                .iter()
                .filter(|c| c.name == name)
                .cloned()
                .collect();
            if found.is_empty() {
                anyhow::bail!("No cluster named '{}' in config", name);
            }
            Ok(found)
        }
        None => Ok(cfg.clusters.clone()),
    }
}

fn cluster_context(
    cfg: &Config,
    only: Option<&str>,
    url: Option<&str>,
    overrides: &BTreeMap<String, String>,
) -> Result<(Vec<ClusterConfig>, BTreeMap<String, Client>)> {
    let clusters = select_clusters(cfg, only, url)?;
    let mut clients = BTreeMap::new();
    for cluster in &clusters {
        let settings = merge_settings(&[
            &builtin_defaults(),
            &cfg.defaults,
            &cluster.settings,
            overrides,
        ]);
        clients.insert(cluster.name.clone(), client_for(&cluster.url, &settings)?);
    }
    Ok((clusters, clients))
}

type QueryFut = Pin<Box<dyn Future<Output = Result<Option<Matched>>>>>;

fn cluster_query<'a>(
    clients: &'a BTreeMap<String, Client>,
) -> impl 'a + Fn(&ClusterConfig, &str) -> QueryFut {
    move |cluster, uuid| {
        let client = clients.get(cluster.name.as_str()).cloned();
        let cluster = cluster.clone();
        let uuid = uuid.to_string();
        Box::pin(async move {
            let client =
                client.with_context(|| format!("No client for cluster {}", cluster.name))?;
            query_cluster(&client, &cluster, &uuid).await
        })
    }
}

async fn run_show(
    clusters: &[ClusterConfig],
    clients: &BTreeMap<String, Client>,
    uuid: &str,
) -> Result<()> {
    query_unique_and_run(clusters, uuid, cluster_query(clients), |cluster, matched| {
        let cluster_name = cluster.name.clone();
        async move {
            let v = match matched {
                Matched::Job(job) => serde_json::json!({
                    "cluster": cluster_name,
                    "type": "job",
                    "job": job,
                }),
                Matched::Instance { instance, job } => serde_json::json!({
                    "cluster": cluster_name,
                    "type": "instance",
                    "instance": instance,
                    "job": job,
                }),
            };
            print_json_value(&v)
        }
    })
    .await
}

async fn run_cat(
    clusters: &[ClusterConfig],
    clients: &BTreeMap<String, Client>,
    uuid: &str,
    path: &str,
    wait_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    query_unique_and_run(clusters, uuid, cluster_query(clients), |cluster, matched| {
        let client = clients.get(cluster.name.as_str()).cloned();
        let cluster_name = cluster.name.clone();
        let path = path.to_string();
        async move {
            let client =
                client.with_context(|| format!("No client for cluster {}", cluster_name))?;
            cat_for_target(&client, &matched, &path, wait_timeout, poll_interval).await
        }
    })
    .await
}

/// Streams the sandbox file at `path` for the resolved target, waiting for a
/// sandbox directory to be assigned if the target has not started yet.
async fn cat_for_target(
    client: &Client,
    matched: &Matched,
    path: &str,
    wait_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let ready = match matched {
        Matched::Instance { instance, .. } if instance.sandbox_dir.is_some() => {
            Some(instance.clone())
        }
        Matched::Job(job) => latest_sandboxed_instance(job),
        _ => None,
    };
    let instance = match ready {
        Some(instance) => instance,
        None => await_until(
            || {
                let client = client.clone();
                let matched = matched.clone();
                async move { poll_sandbox(&client, &matched).await }
            },
            wait_timeout,
            poll_interval,
        )
        .await?
        .with_context(|| format!("Timed out waiting for a sandbox for {}", matched.uuid()))?,
    };

    let file_path = format!(
        "/api/instances/{}/files?path={}",
        instance.task_id,
        encode_query(path)
    );
    client
        .stream_to_stdout(&file_path)
        .await
        .with_context(|| format!("Failed to fetch sandbox file {}", path))
}

/// Re-queries the owning cluster until an instance of the target reports a
/// sandbox directory.
async fn poll_sandbox(client: &Client, matched: &Matched) -> Result<Option<Instance>> {
    match matched {
        Matched::Instance { instance, .. } => {
            let hit = lookup_instance(client, &instance.task_id).await?;
            Ok(hit.map(|(i, _)| i).filter(|i| i.sandbox_dir.is_some()))
        }
        Matched::Job(job) => {
            let current = lookup_job(client, &job.uuid).await?;
            Ok(current.as_ref().and_then(latest_sandboxed_instance))
        }
    }
}

fn latest_sandboxed_instance(job: &Job) -> Option<Instance> {
    job.instances
        .iter()
        .filter(|i| i.sandbox_dir.is_some())
        .max_by(|a, b| a.started_at.cmp(&b.started_at))
        .cloned()
}

async fn run_wait(
    clusters: &[ClusterConfig],
    clients: &BTreeMap<String, Client>,
    uuid: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    query_unique_and_run(clusters, uuid, cluster_query(clients), |cluster, matched| {
        let client = clients.get(cluster.name.as_str()).cloned();
        let cluster_name = cluster.name.clone();
        async move {
            let client =
                client.with_context(|| format!("No client for cluster {}", cluster_name))?;
            let state = await_until(
                || {
                    let client = client.clone();
                    let matched = matched.clone();
                    async move { poll_terminal_state(&client, &matched).await }
                },
                timeout,
                interval,
            )
            .await?;
            match state {
                Some(state) => print_json_value(&serde_json::json!({
                    "uuid": matched.uuid(),
                    "cluster": cluster_name,
                    "state": state.as_str(),
                })),
                None => anyhow::bail!(
                    "Timed out after {}s waiting for {}",
                    timeout.as_secs(),
                    matched.uuid()
                ),
            }
        }
    })
    .await
}

/// Some once the target's current state is terminal; a target that vanished
/// mid-wait is a real error, not a pending state.
async fn poll_terminal_state(client: &Client, matched: &Matched) -> Result<Option<RunState>> {
    match matched {
        Matched::Job(job) => {
            let current = lookup_job(client, &job.uuid)
                .await?
                .with_context(|| format!("Job {} disappeared while waiting", job.uuid))?;
            Ok(current.state.filter(RunState::is_terminal))
        }
        Matched::Instance { instance, .. } => {
            let (current, _job) = lookup_instance(client, &instance.task_id)
                .await?
                .with_context(|| {
                    format!("Instance {} disappeared while waiting", instance.task_id)
                })?;
            Ok(current.state.filter(RunState::is_terminal))
        }
    }
}

async fn run_kill(
    clusters: &[ClusterConfig],
    clients: &BTreeMap<String, Client>,
    uuid: &str,
) -> Result<()> {
    query_unique_and_run(clusters, uuid, cluster_query(clients), |cluster, matched| {
        let client = clients.get(cluster.name.as_str()).cloned();
        let cluster_name = cluster.name.clone();
        async move {
            let client =
                client.with_context(|| format!("No client for cluster {}", cluster_name))?;
            let path = match &matched {
                Matched::Job(job) => format!("/api/jobs/{}/kill", job.uuid),
                Matched::Instance { instance, .. } => {
                    format!("/api/instances/{}/kill", instance.task_id)
                }
            };
            client.post_json(&path, None).await?;
            print_json_value(&serde_json::json!({
                "uuid": matched.uuid(),
                "cluster": cluster_name,
                "status": "killed",
            }))
        }
    })
    .await
}

fn run_config(mut cfg: Config, path: &Path, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Show => print_json_value(&serde_json::to_value(&cfg)?),
        ConfigCmd::AddCluster { name, url, setting } => {
            let settings = parse_settings(&setting)?;
            cfg.clusters.retain(|c| c.name != name);
            cfg.clusters.push(ClusterConfig {
                name,
                url,
                settings,
            });
            cfg.save(path)
        }
        ConfigCmd::RemoveCluster { name } => {
            let before = cfg.clusters.len();
            cfg.clusters.retain(|c| c.name != name);
            if cfg.clusters.len() == before {
                anyhow::bail!("No cluster named '{}' in config", name);
            }
            cfg.save(path)
        }
    }
}

fn parse_settings(settings: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in settings {
        let (k, v) = entry
            .split_once('=')
            .with_context(|| format!("invalid --setting '{}', expected key=value", entry))?;
        if k.trim().is_empty() {
            anyhow::bail!("invalid --setting '{}': key cannot be empty", entry);
        }
        out.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(out)
}

fn print_json_value(v: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn encode_query(value: &str) -> String {
    percent_encode(value.as_bytes(), NON_ALPHANUMERIC).to_string()
}
