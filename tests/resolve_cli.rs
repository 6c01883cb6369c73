use assert_cmd::Command;
use httpmock::prelude::*;
use httpmock::Mock;
use predicates::str::contains;
use std::path::PathBuf;
use tempfile::TempDir;

const UUID: &str = "4f2b1c3d-8a9e-4d6f-b1a2-3c4d5e6f7a8b";

fn jobctl_cmd() -> Command {
    let mut cmd = Command::cargo_bin("jobctl").expect("jobctl binary");
    cmd.env_remove("JOBCTL_URL");
    cmd
}

fn write_config(dir: &TempDir, clusters: &[(&str, String)]) -> PathBuf {
    let clusters: Vec<serde_json::Value> = clusters
        .iter()
        .map(|(name, url)| serde_json::json!({"name": name, "url": url}))
        .collect();
    let cfg = serde_json::json!({"defaults": {}, "clusters": clusters});
    let path = dir.path().join("jobctl.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&cfg).expect("config json"))
        .expect("write config");
    path
}

fn job_body(uuid: &str, state: &str) -> serde_json::Value {
    serde_json::json!({
        "uuid": uuid,
        "name": "render-frames",
        "user": "ada",
        "state": state,
        "instances": []
    })
}

fn mock_no_match<'a>(server: &'a MockServer, uuid: &str) -> (Mock<'a>, Mock<'a>) {
    let job = server.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", uuid));
        then.status(404);
    });
    let instance = server.mock(|when, then| {
        when.method(GET).path(format!("/api/instances/{}", uuid));
        then.status(404);
    });
    (job, instance)
}

#[test]
fn show_resolves_the_single_matching_cluster() {
    let east = MockServer::start();
    let west = MockServer::start();
    let tmp = TempDir::new().expect("tempdir");
    let cfg = write_config(&tmp, &[("east", east.base_url()), ("west", west.base_url())]);

    let (east_job, east_instance) = mock_no_match(&east, UUID);
    let west_job = west.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", UUID));
        then.status(200).json_body_obj(&job_body(UUID, "running"));
    });

    jobctl_cmd()
        .arg("--config")
        .arg(&cfg)
        .args(["show", UUID])
        .assert()
        .success()
        .stdout(contains("\"cluster\": \"west\""))
        .stdout(contains("\"type\": \"job\""))
        .stdout(contains(UUID));

    east_job.assert();
    east_instance.assert();
    west_job.assert();
}

#[test]
fn show_resolves_an_instance_uuid() {
    let east = MockServer::start();

    let job = east.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", UUID));
        then.status(404);
    });
    let instance = east.mock(|when, then| {
        when.method(GET).path(format!("/api/instances/{}", UUID));
        then.status(200).json_body_obj(&serde_json::json!({
            "instance": {
                "task_id": UUID,
                "state": "running",
                "hostname": "node-1",
                "sandbox_dir": "/var/lib/sandboxes/abc",
                "started_at": "2026-01-10T12:00:00Z"
            },
            "job": job_body("9c0a7b66-2f3e-4a1b-8c5d-0e1f2a3b4c5d", "running")
        }));
    });

    jobctl_cmd()
        .arg("--url")
        .arg(east.base_url())
        .args(["show", UUID])
        .assert()
        .success()
        .stdout(contains("\"type\": \"instance\""))
        .stdout(contains("\"hostname\": \"node-1\""));

    job.assert();
    instance.assert();
}

#[test]
fn ambiguous_uuid_names_both_clusters_and_exits_4() {
    let east = MockServer::start();
    let west = MockServer::start();
    let tmp = TempDir::new().expect("tempdir");
    let cfg = write_config(&tmp, &[("east", east.base_url()), ("west", west.base_url())]);

    let east_job = east.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", UUID));
        then.status(200).json_body_obj(&job_body(UUID, "running"));
    });
    let west_job = west.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", UUID));
        then.status(200).json_body_obj(&job_body(UUID, "waiting"));
    });

    jobctl_cmd()
        .arg("--config")
        .arg(&cfg)
        .args(["show", UUID])
        .assert()
        .failure()
        .code(4)
        .stderr(contains(format!(
            "{} matched in multiple clusters: east, west",
            UUID
        )));

    east_job.assert();
    west_job.assert();
}

#[test]
fn unknown_uuid_exits_3() {
    let east = MockServer::start();
    let west = MockServer::start();
    let tmp = TempDir::new().expect("tempdir");
    let cfg = write_config(&tmp, &[("east", east.base_url()), ("west", west.base_url())]);

    let (east_job, east_instance) = mock_no_match(&east, UUID);
    let (west_job, west_instance) = mock_no_match(&west, UUID);

    jobctl_cmd()
        .arg("--config")
        .arg(&cfg)
        .args(["show", UUID])
        .assert()
        .failure()
        .code(3)
        .stderr(contains(format!("no job or instance found matching {}", UUID)));

    east_job.assert();
    east_instance.assert();
    west_job.assert();
    west_instance.assert();
}

#[test]
fn invalid_uuid_is_rejected_before_any_query() {
    let east = MockServer::start();
    let (job, instance) = mock_no_match(&east, "not-a-uuid");

    jobctl_cmd()
        .arg("--url")
        .arg(east.base_url())
        .args(["show", "not-a-uuid"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("is not a valid uuid"));

    assert_eq!(job.hits(), 0, "no cluster should be queried");
    assert_eq!(instance.hits(), 0, "no cluster should be queried");
}

#[test]
fn cluster_flag_restricts_the_search() {
    let east = MockServer::start();
    let west = MockServer::start();
    let tmp = TempDir::new().expect("tempdir");
    let cfg = write_config(&tmp, &[("east", east.base_url()), ("west", west.base_url())]);

    let east_job = east.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", UUID));
        then.status(200).json_body_obj(&job_body(UUID, "running"));
    });
    let (west_job, west_instance) = mock_no_match(&west, UUID);

    jobctl_cmd()
        .arg("--config")
        .arg(&cfg)
        .args(["--cluster", "east", "show", UUID])
        .assert()
        .success()
        .stdout(contains("\"cluster\": \"east\""));

    east_job.assert();
    assert_eq!(west_job.hits(), 0, "west should not be queried");
    assert_eq!(west_instance.hits(), 0, "west should not be queried");
}

#[test]
fn upstream_failures_propagate_instead_of_counting_as_no_match() {
    let east = MockServer::start();
    let job = east.mock(|when, then| {
        when.method(GET).path(format!("/api/jobs/{}", UUID));
        then.status(500).body("scheduler on fire");
    });

    jobctl_cmd()
        .arg("--url")
        .arg(east.base_url())
        .args(["--retries", "0", "show", UUID])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("status=500"));

    job.assert();
}
