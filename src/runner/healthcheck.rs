//! Healthcheck and repair of the runner's singleton infrastructure.
//!
//! Four pieces of long-lived infrastructure are shared by every run: the
//! control network, the outputs directory, the redis rendezvous container
//! and the sidecar container. A healthcheck inspects all four in order;
//! with `fix` enabled it then repairs whatever is unhealthy. Repairs hold
//! the runner state lock exclusively, so they never overlap a run.

use bollard::container::Config;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;

use crate::api::{HealthcheckItem, HealthcheckReport, HealthcheckStatus};
use crate::docker::{self, EnsureContainerOpts};
use crate::error::RunnerError;
use crate::runner::subnets::{CONTROL_GATEWAY, CONTROL_SUBNET};
use crate::runner::{LocalDockerRunner, RunnerState};

/// Name of the long-lived control network.
pub const CONTROL_NETWORK_NAME: &str = "testground-control";

/// Name of the redis rendezvous container.
pub const REDIS_CONTAINER_NAME: &str = "testground-redis";

/// Name of the sidecar container.
pub const SIDECAR_CONTAINER_NAME: &str = "testground-sidecar";

const REDIS_IMAGE: &str = "redis";
const SIDECAR_IMAGE: &str = "ipfs/testground:latest";

/// Report item names, in check order.
pub const CHECK_NAMES: [&str; 4] = [
    "control-network",
    "outputs-dir",
    "redis-container",
    "sidecar-container",
];

/// A repair session may pull images, so it gets a long deadline.
const HEALTHCHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

impl LocalDockerRunner {
    /// Inspect the singleton infrastructure and, when `fix` is set, repair
    /// whatever is unhealthy.
    ///
    /// Holds the runner state exclusively: concurrent runs are blocked for
    /// the duration, and the shared state (control network id, outputs
    /// directory) is reset and repopulated from what the engine reports.
    pub async fn healthcheck(&self, fix: bool) -> Result<HealthcheckReport, RunnerError> {
        let mut state = self.state.write().await;
        state.control_network_id = None;
        state.outputs_dir = None;

        let docker = docker::connect().await?;
        let outputs_dir = self.outputs_root();

        let session = healthcheck_session(&docker, &mut state, &outputs_dir, fix);
        match tokio::time::timeout(HEALTHCHECK_TIMEOUT, session).await {
            Ok(report) => report,
            Err(_) => {
                tracing::warn!("healthcheck session exceeded its deadline");
                Err(RunnerError::Cancelled)
            }
        }
    }
}

async fn healthcheck_session(
    docker: &Docker,
    state: &mut RunnerState,
    outputs_dir: &std::path::Path,
    fix: bool,
) -> Result<HealthcheckReport, RunnerError> {
    let control_check = match docker::check_bridge_network(docker, CONTROL_NETWORK_NAME).await {
        Ok(networks) => match networks.into_iter().next() {
            Some(network) => {
                state.control_network_id = network.id;
                HealthcheckItem::new(
                    CHECK_NAMES[0],
                    HealthcheckStatus::Ok,
                    "control network: exists",
                )
            }
            None => HealthcheckItem::new(
                CHECK_NAMES[0],
                HealthcheckStatus::Failed,
                "control network: not created",
            ),
        },
        Err(e) => HealthcheckItem::new(
            CHECK_NAMES[0],
            HealthcheckStatus::Aborted,
            format!("control network errored: {e}"),
        ),
    };

    let outputs_check = match std::fs::metadata(outputs_dir) {
        Ok(meta) if meta.is_dir() => {
            state.outputs_dir = Some(outputs_dir.to_path_buf());
            HealthcheckItem::new(
                CHECK_NAMES[1],
                HealthcheckStatus::Ok,
                "outputs directory exists",
            )
        }
        Ok(_) => HealthcheckItem::new(
            CHECK_NAMES[1],
            HealthcheckStatus::Failed,
            "outputs path exists but is not a directory",
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HealthcheckItem::new(
            CHECK_NAMES[1],
            HealthcheckStatus::Failed,
            "outputs directory does not exist",
        ),
        Err(e) => HealthcheckItem::new(
            CHECK_NAMES[1],
            HealthcheckStatus::Aborted,
            format!("failed to stat outputs directory: {e}"),
        ),
    };

    let redis_check = container_check(docker, CHECK_NAMES[2], REDIS_CONTAINER_NAME, "redis").await;
    let sidecar_check =
        container_check(docker, CHECK_NAMES[3], SIDECAR_CONTAINER_NAME, "sidecar").await;

    let mut report = HealthcheckReport {
        checks: vec![control_check, outputs_check, redis_check, sidecar_check],
        fixes: Vec::new(),
    };

    if !fix {
        return Ok(report);
    }

    if report.checks[0].status != HealthcheckStatus::Ok {
        let item = match ensure_control_network(docker).await {
            Ok(id) => {
                state.control_network_id = Some(id);
                HealthcheckItem::new(
                    CHECK_NAMES[0],
                    HealthcheckStatus::Ok,
                    "control network created",
                )
            }
            Err(e) => HealthcheckItem::new(
                CHECK_NAMES[0],
                HealthcheckStatus::Failed,
                format!("failed to create control network: {e}"),
            ),
        };
        report.fixes.push(item);
    }

    if report.checks[1].status != HealthcheckStatus::Ok {
        let item = match std::fs::create_dir_all(outputs_dir) {
            Ok(()) => {
                state.outputs_dir = Some(outputs_dir.to_path_buf());
                HealthcheckItem::new(
                    CHECK_NAMES[1],
                    HealthcheckStatus::Ok,
                    "outputs directory created",
                )
            }
            Err(e) => HealthcheckItem::new(
                CHECK_NAMES[1],
                HealthcheckStatus::Failed,
                format!("failed to create outputs directory: {e}"),
            ),
        };
        report.fixes.push(item);
    }

    // Both containers live on the control network; without it their fixes
    // are reported as omitted rather than attempted.
    if report.checks[2].status != HealthcheckStatus::Ok {
        let item = match state.control_network_id.clone() {
            None => HealthcheckItem::new(
                CHECK_NAMES[2],
                HealthcheckStatus::Omitted,
                "skipped redis container fix; no control network",
            ),
            Some(control_id) => match ensure_redis_container(docker, &control_id).await {
                Ok(_) => HealthcheckItem::new(
                    CHECK_NAMES[2],
                    HealthcheckStatus::Ok,
                    "redis container started",
                ),
                Err(e) => HealthcheckItem::new(
                    CHECK_NAMES[2],
                    HealthcheckStatus::Failed,
                    format!("failed to start redis container: {e}"),
                ),
            },
        };
        report.fixes.push(item);
    }

    if report.checks[3].status != HealthcheckStatus::Ok {
        let item = match state.control_network_id.clone() {
            None => HealthcheckItem::new(
                CHECK_NAMES[3],
                HealthcheckStatus::Omitted,
                "skipped sidecar container fix; no control network",
            ),
            Some(control_id) => match ensure_sidecar_container(docker, &control_id).await {
                Ok(_) => HealthcheckItem::new(
                    CHECK_NAMES[3],
                    HealthcheckStatus::Ok,
                    "sidecar container started",
                ),
                Err(e) => HealthcheckItem::new(
                    CHECK_NAMES[3],
                    HealthcheckStatus::Failed,
                    sidecar_fix_message(&e),
                ),
            },
        };
        report.fixes.push(item);
    }

    Ok(report)
}

async fn container_check(
    docker: &Docker,
    item_name: &str,
    container_name: &str,
    label: &str,
) -> HealthcheckItem {
    match docker::check_container(docker, container_name).await {
        Ok(None) => HealthcheckItem::new(
            item_name,
            HealthcheckStatus::Failed,
            format!("{label} container: not created"),
        ),
        Ok(Some(info)) => {
            let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);
            if running {
                HealthcheckItem::new(
                    item_name,
                    HealthcheckStatus::Ok,
                    format!("{label} container: running"),
                )
            } else {
                HealthcheckItem::new(
                    item_name,
                    HealthcheckStatus::Failed,
                    format!("{label} container: not running"),
                )
            }
        }
        Err(e) => HealthcheckItem::new(
            item_name,
            HealthcheckStatus::Aborted,
            format!("{label} container errored: {e}"),
        ),
    }
}

async fn ensure_control_network(docker: &Docker) -> Result<String, RunnerError> {
    docker::ensure_bridge_network(
        docker,
        CONTROL_NETWORK_NAME,
        true,
        &CONTROL_SUBNET.to_string(),
        &CONTROL_GATEWAY.to_string(),
    )
    .await
}

async fn ensure_redis_container(docker: &Docker, control_id: &str) -> Result<String, RunnerError> {
    docker::ensure_container(
        docker,
        EnsureContainerOpts {
            name: REDIS_CONTAINER_NAME.to_string(),
            config: Config {
                image: Some(REDIS_IMAGE.to_string()),
                entrypoint: Some(vec!["redis-server".to_string()]),
                host_config: Some(HostConfig {
                    network_mode: Some(control_id.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            pull_image_if_missing: true,
        },
    )
    .await
}

async fn ensure_sidecar_container(docker: &Docker, control_id: &str) -> Result<String, RunnerError> {
    let socket = engine_socket_path();
    docker::ensure_container(
        docker,
        EnsureContainerOpts {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            config: Config {
                image: Some(SIDECAR_IMAGE.to_string()),
                entrypoint: Some(vec!["testground".to_string()]),
                cmd: Some(vec![
                    "sidecar".to_string(),
                    "--runner".to_string(),
                    "docker".to_string(),
                ]),
                env: Some(vec![format!("REDIS_HOST={REDIS_CONTAINER_NAME}")]),
                host_config: Some(HostConfig {
                    network_mode: Some(control_id.to_string()),
                    // Host PID namespace plus both capabilities are needed
                    // to obtain per-instance network namespace handles.
                    pid_mode: Some("host".to_string()),
                    cap_add: Some(vec!["NET_ADMIN".to_string(), "SYS_ADMIN".to_string()]),
                    mounts: Some(vec![Mount {
                        typ: Some(MountTypeEnum::BIND),
                        source: Some(socket),
                        target: Some("/var/run/docker.sock".to_string()),
                        read_only: Some(false),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            // A missing sidecar image is a deployment error, never pulled.
            pull_image_if_missing: false,
        },
    )
    .await
}

/// Message for a failed sidecar fix; a missing image gets deployment
/// guidance appended.
fn sidecar_fix_message(err: &RunnerError) -> String {
    match err {
        RunnerError::ImageNotFound { image } => format!(
            "failed to start sidecar container: image {image} not found; \
             the sidecar image is never pulled automatically, deploy it locally first"
        ),
        other => format!("failed to start sidecar container: {other}"),
    }
}

/// Host path of the engine socket, for the sidecar's bind mount.
fn engine_socket_path() -> String {
    match std::env::var("DOCKER_HOST") {
        Ok(host) => socket_from_host(Some(&host)),
        Err(_) => socket_from_host(None),
    }
}

fn socket_from_host(host: Option<&str>) -> String {
    const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
    match host {
        Some(host) => match host.strip_prefix("unix://") {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => {
                tracing::warn!(host, "cannot derive socket path, guessing {DEFAULT_SOCKET}");
                DEFAULT_SOCKET.to_string()
            }
        },
        None => DEFAULT_SOCKET.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_from_unix_host() {
        assert_eq!(
            socket_from_host(Some("unix:///run/user/1000/docker.sock")),
            "/run/user/1000/docker.sock"
        );
    }

    #[test]
    fn socket_path_defaults_for_tcp_host() {
        assert_eq!(
            socket_from_host(Some("tcp://127.0.0.1:2375")),
            "/var/run/docker.sock"
        );
        assert_eq!(socket_from_host(None), "/var/run/docker.sock");
    }

    #[test]
    fn check_names_match_contract() {
        assert_eq!(
            CHECK_NAMES,
            [
                "control-network",
                "outputs-dir",
                "redis-container",
                "sidecar-container"
            ]
        );
    }

    #[test]
    fn missing_sidecar_image_gets_deployment_hint() {
        let err = RunnerError::ImageNotFound {
            image: SIDECAR_IMAGE.to_string(),
        };
        let message = sidecar_fix_message(&err);
        assert!(message.contains("ipfs/testground:latest"));
        assert!(message.contains("never pulled automatically"));

        let other = RunnerError::Cancelled;
        assert!(!sidecar_fix_message(&other).contains("never pulled"));
    }
}
