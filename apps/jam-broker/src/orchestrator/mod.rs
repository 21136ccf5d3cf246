//! Session container provisioning.
//!
//! A session container is started detached through the container runtime,
//! then polled for its network address until the runtime reports one or the
//! retry budget runs out. In local mode nothing is spawned: a fixed synthetic
//! id and the loopback address stand in, so the rest of the broker can run
//! against a hand-started container or a test double.

mod process;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sanitize::sanitize_label;

pub use process::{ProcessError, ProcessRunner, TokioProcessRunner};

#[cfg(test)]
pub(crate) use process::scripted;

/// Container ids are truncated to the runtime's short form so durable
/// lookups can match on equality.
pub const CONTAINER_ID_LEN: usize = 12;
pub const LOCAL_CONTAINER_ID: &str = "local-debug0";
pub const DEFAULT_CONTROL_PORT: u16 = 25052;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to provision session container: {0}")]
    Provision(#[source] ProcessError),
    #[error("container runtime returned an invalid container id: {0:?}")]
    InvalidContainerId(String),
    #[error("no address for container {container_id} after {attempts} attempts")]
    AddressResolution { container_id: String, attempts: u32 },
    #[error("failed to tear down session containers: {0}")]
    Teardown(#[source] ProcessError),
}

impl OrchestratorError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            OrchestratorError::Provision(_) => "provision",
            OrchestratorError::InvalidContainerId(_) => "invalid_container_id",
            OrchestratorError::AddressResolution { .. } => "address_resolution",
            OrchestratorError::Teardown(_) => "teardown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    /// Validates the runtime's `run -d` output and keeps the short id.
    pub fn from_runtime_output(stdout: &str) -> Result<Self, OrchestratorError> {
        let trimmed = stdout.trim();
        let short: String = trimmed.chars().take(CONTAINER_ID_LEN).collect();
        let valid = short.len() == CONTAINER_ID_LEN
            && short.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(OrchestratorError::InvalidContainerId(trimmed.to_string()));
        }
        Ok(Self(short))
    }

    pub fn local() -> Self {
        Self(LOCAL_CONTAINER_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Spawn real containers through the runtime binary.
    Container,
    /// Skip the runtime entirely; see [`LOCAL_CONTAINER_ID`].
    Local,
}

/// Bounded polling with exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given zero-based attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: ExecutionMode,
    pub runtime_binary: String,
    pub image: String,
    pub network: String,
    pub control_port: u16,
    /// Off Linux the runtime cannot route to container subnets, so the
    /// control port is published and the address forced to loopback.
    pub host_is_linux: bool,
    pub address_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Container,
            runtime_binary: "docker".to_string(),
            image: "jdam/session".to_string(),
            network: "jdam-net".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            host_is_linux: cfg!(target_os = "linux"),
            address_retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn local(control_port: u16) -> Self {
        Self {
            mode: ExecutionMode::Local,
            control_port,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedContainer {
    pub container_id: ContainerId,
    pub address: IpAddr,
}

#[derive(Clone)]
pub struct ContainerOrchestrator {
    config: OrchestratorConfig,
    runner: Arc<dyn ProcessRunner>,
}

impl ContainerOrchestrator {
    pub fn new(config: OrchestratorConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn control_port(&self) -> u16 {
        self.config.control_port
    }

    pub async fn provision(
        &self,
        title: &str,
        description: &str,
        duration_minutes: u32,
    ) -> Result<ProvisionedContainer, OrchestratorError> {
        let result = self
            .provision_inner(title, description, duration_minutes)
            .await;
        if let Err(err) = &result {
            counter!(
                "jam_broker_provision_failures_total",
                1,
                "reason" => err.metric_label()
            );
        }
        result
    }

    async fn provision_inner(
        &self,
        title: &str,
        description: &str,
        duration_minutes: u32,
    ) -> Result<ProvisionedContainer, OrchestratorError> {
        if self.config.mode == ExecutionMode::Local {
            debug!("local mode; skipping container runtime");
            return Ok(ProvisionedContainer {
                container_id: ContainerId::local(),
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            });
        }

        let args = self.spawn_args(title, description, duration_minutes);
        let stdout = self
            .runner
            .run(&self.config.runtime_binary, &args)
            .await
            .map_err(OrchestratorError::Provision)?;
        let container_id = ContainerId::from_runtime_output(&stdout)?;
        info!(container_id = %container_id, "session container started");

        let address = self.resolve_address(&container_id).await?;
        Ok(ProvisionedContainer {
            container_id,
            address,
        })
    }

    fn spawn_args(&self, title: &str, description: &str, duration_minutes: u32) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            format!("--network={}", self.config.network),
            "-d".to_string(),
        ];
        if self.config.host_is_linux {
            args.push("--add-host=host.docker.internal:host-gateway".to_string());
        } else {
            args.push("-p".to_string());
            args.push(format!(
                "{port}:{port}",
                port = self.config.control_port
            ));
        }
        args.extend([
            "--rm".to_string(),
            "-e".to_string(),
            format!("TITLE={}", sanitize_label(title)),
            "-e".to_string(),
            format!("DESCRIPTION={}", sanitize_label(description)),
            "-e".to_string(),
            format!("SESSION_LENGTH={duration_minutes}"),
            self.config.image.clone(),
        ]);
        args
    }

    /// Polls the runtime for the container's address.
    pub async fn resolve_address(
        &self,
        container_id: &ContainerId,
    ) -> Result<IpAddr, OrchestratorError> {
        if !self.config.host_is_linux || self.config.mode == ExecutionMode::Local {
            return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }

        let policy = &self.config.address_retry;
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}".to_string(),
            container_id.to_string(),
        ];

        for attempt in 0..policy.max_attempts {
            match self.runner.run(&self.config.runtime_binary, &args).await {
                Ok(stdout) => {
                    let candidate = stdout.trim();
                    if !candidate.is_empty() {
                        match candidate.parse::<IpAddr>() {
                            Ok(address) => {
                                debug!(
                                    container_id = %container_id,
                                    %address,
                                    attempt,
                                    "resolved container address"
                                );
                                return Ok(address);
                            }
                            Err(err) => warn!(
                                container_id = %container_id,
                                output = candidate,
                                error = %err,
                                "container runtime returned an unparseable address"
                            ),
                        }
                    }
                }
                Err(err) => debug!(
                    container_id = %container_id,
                    attempt,
                    error = %err,
                    "address lookup failed"
                ),
            }

            if attempt + 1 < policy.max_attempts {
                tokio::time::sleep(policy.delay_after(attempt)).await;
            }
        }

        Err(OrchestratorError::AddressResolution {
            container_id: container_id.to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Force-removes every container built from the session image.
    ///
    /// Returns how many containers the runtime was asked to remove.
    pub async fn teardown_all(&self) -> Result<usize, OrchestratorError> {
        if self.config.mode == ExecutionMode::Local {
            return Ok(0);
        }

        let list_args = vec![
            "ps".to_string(),
            "-aq".to_string(),
            "-f".to_string(),
            format!("ancestor={}", self.config.image),
        ];
        let listed = self
            .runner
            .run(&self.config.runtime_binary, &list_args)
            .await
            .map_err(OrchestratorError::Teardown)?;
        let ids: Vec<String> = listed.split_whitespace().map(str::to_string).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut rm_args = vec!["rm".to_string(), "-f".to_string()];
        rm_args.extend(ids.iter().cloned());
        self.runner
            .run(&self.config.runtime_binary, &rm_args)
            .await
            .map_err(OrchestratorError::Teardown)?;
        info!(count = ids.len(), "removed session containers");
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{failure, ScriptedRunner};
    use super::*;

    fn container_config() -> OrchestratorConfig {
        OrchestratorConfig {
            host_is_linux: true,
            address_retry: RetryPolicy::immediate(10),
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        config: OrchestratorConfig,
        responses: Vec<Result<String, ProcessError>>,
    ) -> (ContainerOrchestrator, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new(responses));
        (ContainerOrchestrator::new(config, runner.clone()), runner)
    }

    #[test_timeout::tokio_timeout_test]
    async fn provisions_and_resolves_address() {
        let (orchestrator, runner) = orchestrator(
            container_config(),
            vec![
                Ok("0123456789abcdef0123\n".into()),
                Ok("\n".into()),
                Err(failure("not running yet")),
                Ok("172.18.0.4\n".into()),
            ],
        );

        let provisioned = orchestrator.provision("Jam #1!", "a-b_c", 2).await.unwrap();
        assert_eq!(provisioned.container_id.as_str(), "0123456789ab");
        assert_eq!(provisioned.address, "172.18.0.4".parse::<IpAddr>().unwrap());

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        let spawn = &calls[0];
        assert_eq!(spawn[0], "docker");
        assert_eq!(spawn[1], "run");
        assert!(spawn.contains(&"--network=jdam-net".to_string()));
        assert!(spawn.contains(&"--add-host=host.docker.internal:host-gateway".to_string()));
        assert!(spawn.contains(&"TITLE=Jam 1".to_string()));
        assert!(spawn.contains(&"DESCRIPTION=a-b_c".to_string()));
        assert!(spawn.contains(&"SESSION_LENGTH=2".to_string()));
        assert_eq!(spawn.last().map(String::as_str), Some("jdam/session"));
        assert_eq!(calls[3].last().map(String::as_str), Some("0123456789ab"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn spawn_failure_is_a_provision_error() {
        let (orchestrator, runner) =
            orchestrator(container_config(), vec![Err(failure("no such image"))]);

        let err = orchestrator.provision("t", "d", 1).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Provision(_)));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn short_container_id_is_rejected() {
        let (orchestrator, _) = orchestrator(container_config(), vec![Ok("abc\n".into())]);

        let err = orchestrator.provision("t", "d", 1).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidContainerId(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn gives_up_after_retry_budget() {
        let mut responses = vec![Ok("0123456789abcdef".to_string())];
        responses.extend((0..10).map(|_| Ok(String::new())));
        let (orchestrator, runner) = orchestrator(container_config(), responses);

        let err = orchestrator.provision("t", "d", 1).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::AddressResolution { attempts: 10, ref container_id }
                if container_id == "0123456789ab"
        ));
        assert_eq!(runner.calls().len(), 11);
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_mode_never_touches_the_runtime() {
        let (orchestrator, runner) = orchestrator(OrchestratorConfig::local(25052), vec![]);

        let provisioned = orchestrator.provision("t", "d", 1).await.unwrap();
        assert_eq!(provisioned.container_id.as_str(), LOCAL_CONTAINER_ID);
        assert_eq!(provisioned.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(orchestrator.teardown_all().await.unwrap(), 0);
        assert!(runner.calls().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn non_linux_hosts_publish_port_and_use_loopback() {
        let config = OrchestratorConfig {
            host_is_linux: false,
            ..container_config()
        };
        let (orchestrator, runner) = orchestrator(config, vec![Ok("fedcba9876543210".into())]);

        let provisioned = orchestrator.provision("t", "d", 1).await.unwrap();
        assert_eq!(provisioned.address, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let publish = calls[0].iter().position(|arg| arg == "-p").unwrap();
        assert_eq!(calls[0][publish + 1], "25052:25052");
    }

    #[test_timeout::tokio_timeout_test]
    async fn teardown_removes_listed_containers() {
        let (orchestrator, runner) = orchestrator(
            container_config(),
            vec![Ok("aaaaaaaaaaaa\nbbbbbbbbbbbb\n".into()), Ok(String::new())],
        );

        assert_eq!(orchestrator.teardown_all().await.unwrap(), 2);
        let calls = runner.calls();
        assert_eq!(calls[0][1..], ["ps", "-aq", "-f", "ancestor=jdam/session"]);
        assert_eq!(calls[1][1..], ["rm", "-f", "aaaaaaaaaaaa", "bbbbbbbbbbbb"]);
    }

    #[test_timeout::timeout]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::from_millis(250));
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.delay_after(40), Duration::from_secs(2));
        assert_eq!(RetryPolicy::immediate(3).delay_after(5), Duration::ZERO);
    }
}
