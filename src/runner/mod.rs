//! The local Docker runner.
//!
//! Stands up as many containers as the run's instance count indicates,
//! attached to a long-lived control network for rendezvous traffic and a
//! per-run data network for instance-to-instance traffic, monitors their
//! output, and destroys the per-run setup once the workloads are done.
//!
//! Singleton infrastructure (control network, outputs directory, redis,
//! sidecar) is owned by the healthcheck/repair path and survives across
//! runs; everything created here is removed on every exit path unless
//! `keep_containers` is set.

pub mod healthcheck;
pub mod logs;
pub mod outputs;
pub mod subnets;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use bollard::container::Config;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::{Group, RunInput, RunOutput, RunnerConfigPatch};
use crate::docker;
use crate::error::RunnerError;
use crate::runner::logs::LogMultiplexer;
use crate::runtime::{RunParams, OUTPUTS_MOUNT_PATH};

/// Stable runner identity.
pub const RUNNER_ID: &str = "local:docker";

/// Builders whose artefacts this runner can launch.
pub const COMPATIBLE_BUILDERS: &[&str] = &["docker:go"];

/// Effective runner configuration after merging per-run overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Retain test containers (and the data network) after the run.
    pub keep_containers: bool,
    /// When non-empty, exported to each container as `LOG_LEVEL`.
    pub log_level: String,
    /// Create the containers without starting them.
    pub unstarted: bool,
    /// Do not tail container output.
    pub background: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            keep_containers: false,
            log_level: String::new(),
            unstarted: false,
            background: false,
        }
    }
}

impl RunnerConfig {
    /// Merge a per-run patch over the defaults; set fields override.
    pub fn merged(patch: &RunnerConfigPatch) -> Self {
        let mut cfg = RunnerConfig::default();
        if let Some(keep) = patch.keep_containers {
            cfg.keep_containers = keep;
        }
        if let Some(level) = &patch.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(unstarted) = patch.unstarted {
            cfg.unstarted = unstarted;
        }
        if let Some(background) = patch.background {
            cfg.background = background;
        }
        cfg
    }
}

/// Shared state populated by a successful healthcheck.
#[derive(Debug, Default)]
pub(crate) struct RunnerState {
    pub control_network_id: Option<String>,
    pub outputs_dir: Option<PathBuf>,
}

/// Runner that launches test plans as local Docker containers.
///
/// The state lock makes runs shared and repairs exclusive: any number of
/// runs proceed in parallel, but none overlaps a healthcheck.
pub struct LocalDockerRunner {
    pub(crate) state: RwLock<RunnerState>,
    workdir: PathBuf,
}

impl LocalDockerRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        LocalDockerRunner {
            state: RwLock::new(RunnerState::default()),
            workdir: workdir.into(),
        }
    }

    pub fn id(&self) -> &'static str {
        RUNNER_ID
    }

    pub fn compatible_builders(&self) -> &'static [&'static str] {
        COMPATIBLE_BUILDERS
    }

    /// Root of the outputs tree for this runner.
    pub(crate) fn outputs_root(&self) -> PathBuf {
        self.workdir.join("local_docker").join("outputs")
    }

    /// Execute one run: provision the data network, create and start one
    /// container per instance, stream their logs to `log_writer`, and tear
    /// everything down.
    pub async fn run(
        &self,
        token: CancellationToken,
        input: &RunInput,
        log_writer: Box<dyn Write + Send>,
    ) -> Result<RunOutput, RunnerError> {
        let seq = validate_input(input)?;

        // Shared lock: runs proceed in parallel, repairs are exclusive.
        let state = self.state.read().await;
        let control_network_id = state
            .control_network_id
            .clone()
            .ok_or(RunnerError::Uninitialised)?;
        let outputs_dir = state.outputs_dir.clone().ok_or(RunnerError::Uninitialised)?;

        let cfg = RunnerConfig::merged(&input.runner_config);
        let plan = input.test_plan.name.clone();
        let testcase = input.test_plan.test_cases[seq].name.clone();
        let run_id = input.run_id.clone();

        tracing::info!(
            runner = RUNNER_ID,
            run_id = %run_id,
            plan = %plan,
            testcase = %testcase,
            instances = input.total_instances,
            "starting run"
        );

        let engine = docker::connect().await?;

        // Find a free subnet: the k-th data network ever uses the k-th
        // entry of the allocator's sequence.
        let existing = docker::list_networks(&engine, "testground.name", "default").await?;
        let (subnet, gateway) = subnets::next_data_network(existing.len())?;

        let mut network_labels = run_labels(&plan, &testcase, &run_id);
        network_labels.insert("testground.name".to_string(), "default".to_string());
        let network_name = data_network_name(&plan, &testcase, &run_id);
        let data_network_id = docker::new_bridge_network(
            &engine,
            &network_name,
            true,
            network_labels,
            &subnet.to_string(),
            &gateway.to_string(),
        )
        .await?;
        tracing::info!(network = %network_name, subnet = %subnet, "created data network");

        let template = RunParams {
            test_plan: plan.clone(),
            test_case: testcase.clone(),
            test_run: run_id.clone(),
            test_case_seq: seq,
            test_instance_count: input.total_instances as usize,
            test_sidecar: true,
            test_outputs_path: OUTPUTS_MOUNT_PATH.to_string(),
            test_subnet: Some(subnet),
            ..Default::default()
        };

        let mut created = Vec::new();
        let body = run_body(
            &engine,
            &token,
            input,
            seq,
            &cfg,
            &template,
            &control_network_id,
            &data_network_id,
            &outputs_dir,
            &mut created,
            log_writer,
        )
        .await;

        let output = RunOutput {
            run_id: run_id.clone(),
        };

        if cfg.keep_containers {
            return body.map(|_| output);
        }

        // Teardown runs on every exit path, under its own deadlines, and
        // never masks the primary error.
        match teardown(&engine, &created, &data_network_id).await {
            Ok(()) => {}
            Err(teardown_err) => match &body {
                Ok(()) => return Err(teardown_err),
                Err(primary) => {
                    tracing::warn!(
                        error = %teardown_err,
                        primary = %primary,
                        "teardown failed after run error"
                    );
                }
            },
        }
        body.map(|_| output)
    }

    /// Write a compressed archive of one run's output tree to `writer`.
    pub fn collect_outputs<W: Write>(
        &self,
        plan: &str,
        run_id: &str,
        writer: W,
    ) -> Result<(), RunnerError> {
        outputs::collect_outputs(&self.outputs_root(), plan, run_id, writer)
    }
}

/// Validate the run input; returns the test-case index.
fn validate_input(input: &RunInput) -> Result<usize, RunnerError> {
    let cases = input.test_plan.test_cases.len();
    if input.seq < 0 || input.seq as usize >= cases {
        return Err(RunnerError::InvalidInput(format!(
            "test case seq {} out of range for plan {} with {} case(s)",
            input.seq, input.test_plan.name, cases
        )));
    }
    if input.run_id.is_empty() {
        return Err(RunnerError::InvalidInput(
            "run id must not be empty".to_string(),
        ));
    }
    let mut sum: i64 = 0;
    for group in &input.groups {
        if group.instances <= 0 {
            return Err(RunnerError::InvalidInput(format!(
                "group {} has non-positive instance count {}",
                group.id, group.instances
            )));
        }
        sum += group.instances;
    }
    if sum != input.total_instances {
        return Err(RunnerError::InvalidInput(format!(
            "group instance counts sum to {sum}, expected total {}",
            input.total_instances
        )));
    }
    Ok(input.seq as usize)
}

#[allow(clippy::too_many_arguments)]
async fn run_body(
    engine: &Docker,
    token: &CancellationToken,
    input: &RunInput,
    seq: usize,
    cfg: &RunnerConfig,
    template: &RunParams,
    control_network_id: &str,
    data_network_id: &str,
    outputs_dir: &Path,
    created: &mut Vec<String>,
    log_writer: Box<dyn Write + Send>,
) -> Result<(), RunnerError> {
    let plan = &input.test_plan.name;
    let testcase = &input.test_plan.test_cases[seq].name;
    let run_id = &input.run_id;

    // Creation is sequential: names stay deterministic and the first error
    // surfaces with everything created so far tracked for teardown.
    for group in &input.groups {
        let runenv = group_runenv(template, group);
        let mut env = runenv.to_env_vars();
        if !cfg.log_level.is_empty() {
            env.push(format!("LOG_LEVEL={}", cfg.log_level));
        }

        let mut labels = run_labels(plan, testcase, run_id);
        labels.insert("testground.group_id".to_string(), group.id.clone());

        for index in 0..group.instances as usize {
            if token.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }

            let odir = instance_output_dir(outputs_dir, plan, run_id, &group.id, index);
            std::fs::create_dir_all(&odir).map_err(|e| RunnerError::io(&odir, e))?;

            let name = container_name(plan, testcase, run_id, &group.id, index);
            tracing::info!(container = %name, "creating container");

            let config = Config::<String> {
                image: Some(group.artifact_path.clone()),
                env: Some(env.clone()),
                labels: Some(labels.clone()),
                host_config: Some(HostConfig {
                    network_mode: Some(control_network_id.to_string()),
                    mounts: Some(vec![Mount {
                        typ: Some(MountTypeEnum::BIND),
                        source: Some(odir.to_string_lossy().into_owned()),
                        target: Some(OUTPUTS_MOUNT_PATH.to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let id = docker::create_container(engine, &name, config).await?;
            created.push(id.clone());

            // The sidecar takes over the data interface at runtime; the
            // runner provides it as the container's second interface.
            docker::attach_to_network(engine, &id, data_network_id).await?;
        }
    }

    if !cfg.unstarted {
        tracing::info!(count = created.len(), "starting containers");
        start_all(engine, created, token).await?;
        tracing::info!(count = created.len(), "containers started");
    }

    if !cfg.background {
        let mut mux = LogMultiplexer::new(log_writer, token.child_token());
        for id in created.iter() {
            mux.attach(engine, id);
        }
        mux.wait().await?;
    }

    Ok(())
}

/// Specialise the run-wide template for one group.
fn group_runenv(template: &RunParams, group: &Group) -> RunParams {
    let mut runenv = template.clone();
    runenv.test_group_id = group.id.clone();
    runenv.test_group_instance_count = group.instances as usize;
    runenv.test_instance_params = group.parameters.clone();
    runenv
}

/// Start every created container in parallel; the first failure cancels
/// its siblings and becomes the result.
async fn start_all(
    engine: &Docker,
    ids: &[String],
    token: &CancellationToken,
) -> Result<(), RunnerError> {
    let group_token = token.child_token();
    let mut tasks = JoinSet::new();
    for id in ids {
        let engine = engine.clone();
        let id = id.clone();
        let cancel = group_token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(RunnerError::Cancelled),
                res = docker::start_container(&engine, &id) => {
                    if res.is_ok() {
                        tracing::debug!(container = %id, "started container");
                    }
                    res
                }
            }
        });
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(res) => res,
            Err(e) => {
                if e.is_panic() {
                    tracing::error!(error = %e, "container start task panicked");
                }
                Err(RunnerError::Cancelled)
            }
        };
        if let Err(e) = outcome {
            if first_err.is_none() {
                group_token.cancel();
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Force-remove every created container in parallel, then the data
/// network. Every error is collected; none is dropped.
async fn teardown(
    engine: &Docker,
    containers: &[String],
    data_network_id: &str,
) -> Result<(), RunnerError> {
    tracing::info!(count = containers.len(), "removing containers");

    let mut errors = Vec::new();
    let mut tasks = JoinSet::new();
    for id in containers {
        let engine = engine.clone();
        let id = id.clone();
        tasks.spawn(async move {
            docker::remove_container(&engine, &id, true)
                .await
                .map_err(|e| (id, e))
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err((id, e))) => {
                tracing::error!(container = %id, error = %e, "failed to remove container");
                errors.push(e.to_string());
            }
            Err(e) => errors.push(format!("container removal task failed: {e}")),
        }
    }

    if let Err(e) = docker::remove_network(engine, data_network_id).await {
        tracing::error!(network = %data_network_id, error = %e, "failed to remove data network");
        errors.push(e.to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::PartialFailure(errors))
    }
}

fn run_labels(plan: &str, testcase: &str, run_id: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("testground.plan".to_string(), plan.to_string());
    labels.insert("testground.testcase".to_string(), testcase.to_string());
    labels.insert("testground.run_id".to_string(), run_id.to_string());
    labels
}

fn data_network_name(plan: &str, testcase: &str, run_id: &str) -> String {
    format!("tg-{plan}-{testcase}-{run_id}-default")
}

fn container_name(plan: &str, testcase: &str, run_id: &str, group_id: &str, index: usize) -> String {
    format!("tg-{plan}-{testcase}-{run_id}-{group_id}-{index}")
}

fn instance_output_dir(
    outputs_dir: &Path,
    plan: &str,
    run_id: &str,
    group_id: &str,
    index: usize,
) -> PathBuf {
    outputs_dir
        .join(plan)
        .join(run_id)
        .join(group_id)
        .join(index.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use crate::api::{TestCase, TestPlan};
    use crate::runtime::Subnet;

    fn input(seq: i64, total: i64, groups: Vec<Group>) -> RunInput {
        RunInput {
            test_plan: TestPlan {
                name: "dht".to_string(),
                test_cases: vec![
                    TestCase {
                        name: "find-peers".to_string(),
                    },
                    TestCase {
                        name: "find-providers".to_string(),
                    },
                ],
            },
            seq,
            run_id: "run-1".to_string(),
            total_instances: total,
            groups,
            runner_config: RunnerConfigPatch::default(),
        }
    }

    fn group(id: &str, instances: i64) -> Group {
        Group {
            id: id.to_string(),
            instances,
            artifact_path: "tg-dht:latest".to_string(),
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_input_passes() {
        let input = input(1, 4, vec![group("g1", 2), group("g2", 2)]);
        assert_eq!(validate_input(&input).unwrap(), 1);
    }

    #[test]
    fn negative_seq_is_rejected() {
        let input = input(-1, 2, vec![group("g1", 2)]);
        let err = validate_input(&input).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput(_)));
    }

    #[test]
    fn seq_past_end_is_rejected() {
        let input = input(2, 2, vec![group("g1", 2)]);
        assert!(matches!(
            validate_input(&input),
            Err(RunnerError::InvalidInput(_))
        ));
    }

    #[test]
    fn non_positive_group_count_is_rejected() {
        let input = input(0, 2, vec![group("g1", 2), group("g2", 0)]);
        let err = validate_input(&input).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("g2"), "unexpected message: {msg}");
    }

    #[test]
    fn group_sum_mismatch_is_rejected() {
        let input = input(0, 5, vec![group("g1", 2), group("g2", 2)]);
        let err = validate_input(&input).unwrap_err();
        assert!(err.to_string().contains("sum to 4"));
    }

    #[test]
    fn empty_run_id_is_rejected() {
        let mut input = input(0, 2, vec![group("g1", 2)]);
        input.run_id.clear();
        assert!(matches!(
            validate_input(&input),
            Err(RunnerError::InvalidInput(_))
        ));
    }

    #[test]
    fn config_merge_overrides_only_set_fields() {
        let patch = RunnerConfigPatch {
            keep_containers: Some(true),
            log_level: None,
            unstarted: None,
            background: Some(true),
        };
        let cfg = RunnerConfig::merged(&patch);
        assert!(cfg.keep_containers);
        assert!(cfg.background);
        assert!(!cfg.unstarted);
        assert!(cfg.log_level.is_empty());

        let cfg = RunnerConfig::merged(&RunnerConfigPatch::default());
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn naming_is_deterministic() {
        assert_eq!(
            container_name("dht", "find-peers", "r1", "g1", 0),
            "tg-dht-find-peers-r1-g1-0"
        );
        assert_eq!(
            data_network_name("dht", "find-peers", "r1"),
            "tg-dht-find-peers-r1-default"
        );
    }

    #[test]
    fn output_dir_layout() {
        let dir = instance_output_dir(Path::new("/work/outputs"), "dht", "r1", "g1", 3);
        assert_eq!(dir, PathBuf::from("/work/outputs/dht/r1/g1/3"));
    }

    #[test]
    fn group_runenv_keeps_run_wide_fields() {
        let template = RunParams {
            test_plan: "dht".to_string(),
            test_case: "find-peers".to_string(),
            test_run: "r1".to_string(),
            test_case_seq: 0,
            test_instance_count: 4,
            test_sidecar: true,
            test_outputs_path: OUTPUTS_MOUNT_PATH.to_string(),
            test_subnet: Some(Subnet::new(Ipv4Addr::new(16, 0, 0, 0), 16)),
            ..Default::default()
        };
        let mut params = BTreeMap::new();
        params.insert("k".to_string(), "v".to_string());
        let g = Group {
            id: "g2".to_string(),
            instances: 3,
            artifact_path: "img".to_string(),
            parameters: params,
        };

        let runenv = group_runenv(&template, &g);
        assert_eq!(runenv.test_plan, template.test_plan);
        assert_eq!(runenv.test_run, template.test_run);
        assert_eq!(runenv.test_subnet, template.test_subnet);
        assert_eq!(runenv.test_instance_count, 4);
        assert_eq!(runenv.test_group_id, "g2");
        assert_eq!(runenv.test_group_instance_count, 3);
        assert_eq!(runenv.test_instance_params["k"], "v");
    }

    #[test]
    fn runner_identity() {
        let runner = LocalDockerRunner::new("/tmp/testground");
        assert_eq!(runner.id(), "local:docker");
        assert_eq!(runner.compatible_builders(), &["docker:go"]);
    }

    #[test]
    fn outputs_root_under_workdir() {
        let runner = LocalDockerRunner::new("/work");
        assert_eq!(
            runner.outputs_root(),
            PathBuf::from("/work/local_docker/outputs")
        );
    }
}
