//! Docker CLI adapter - Drives the `docker` binary as the container runtime

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use super::{AdapterError, AdapterResult, ContainerSpec, ProgressSink, PullProgress, RuntimeAdapter};
use crate::core::{
    ContainerStatus, DaemonInfo, DaemonStatus, HealthStatus, PortMapping, ResourceKind,
    ResourceRecord, ServiceId,
};

/// stderr fragments that mean the daemon itself is unreachable
const TRANSPORT_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "error during connect",
    "Is the docker daemon running",
    "connection refused",
];

const NO_SUCH_MARKERS: &[&str] = &["No such container", "No such object"];

/// Runtime adapter backed by the `docker` command line client
pub struct DockerCli {
    binary: String,
    label_key: String,
    /// Host metrics for `get_daemon_info`
    system: Arc<Mutex<System>>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, label_key: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            label_key: label_key.into(),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Run a docker subcommand to completion and return its stdout
    async fn run(&self, args: &[String]) -> AdapterResult<String> {
        trace!(binary = %self.binary, ?args, "running docker command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                AdapterError::Transport(format!("Failed to run {}: {}", self.binary, e))
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(stderr))
        }
    }

    async fn run_args(&self, args: &[&str]) -> AdapterResult<String> {
        let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&owned).await
    }

    async fn create_volume(&self, name: &str, labels: &[(String, String)]) -> AdapterResult<()> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run(&args).await.map(|_| ())
    }

    /// Named volumes mounted by a container
    async fn container_volumes(&self, name: &str) -> AdapterResult<Vec<String>> {
        let out = self.run_args(&["inspect", "--type", "container", name]).await?;
        let parsed: Value = serde_json::from_str(&out)
            .map_err(|e| AdapterError::Failed(format!("Unexpected inspect output: {}", e)))?;
        Ok(parsed
            .get(0)
            .and_then(|c| c.get("Mounts"))
            .and_then(Value::as_array)
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|m| m.get("Type").and_then(Value::as_str) == Some("volume"))
                    .filter_map(|m| m.get("Name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_kind(&self, kind: ResourceKind) -> AdapterResult<Vec<ResourceRecord>> {
        let filter = format!("label={}", self.label_key);
        let args: Vec<String> = match kind {
            ResourceKind::Container => vec!["ps".into(), "-a".into()],
            ResourceKind::Volume => vec!["volume".into(), "ls".into()],
            ResourceKind::Network => vec!["network".into(), "ls".into()],
        }
        .into_iter()
        .chain([
            "--filter".to_string(),
            filter,
            "--format".to_string(),
            "{{json .}}".to_string(),
        ])
        .collect();

        let out = self.run(&args).await?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<ListedObject>(line) {
                Ok(obj) => Some(obj.into_record(kind, &self.label_key)),
                Err(e) => {
                    warn!("Skipping unparseable docker {} line: {}", kind.label(), e);
                    None
                }
            })
            .collect())
    }
}

/// Map a failed command's stderr to an adapter error
fn classify_failure(stderr: String) -> AdapterError {
    if TRANSPORT_MARKERS.iter().any(|m| stderr.contains(m)) {
        AdapterError::Transport(stderr)
    } else {
        AdapterError::Failed(stderr)
    }
}

fn is_no_such(err: &AdapterError) -> bool {
    matches!(err, AdapterError::Failed(msg) if NO_SUCH_MARKERS.iter().any(|m| msg.contains(m)))
}

/// Arguments for `docker create`
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.external, port.internal));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for volume in &spec.volumes {
        args.push("-v".to_string());
        args.push(format!("{}:{}", volume.name, volume.container_path));
    }
    args.push(spec.image.clone());
    args
}

/// Build a container status from one `docker inspect` entry
fn parse_inspect(entry: &Value) -> Option<ContainerStatus> {
    let container_id = entry.get("Id")?.as_str()?.to_string();
    let state = entry.get("State")?;
    let running = state.get("Running").and_then(Value::as_bool).unwrap_or(false);
    let health = state
        .get("Health")
        .and_then(|h| h.get("Status"))
        .and_then(Value::as_str)
        .map(HealthStatus::parse)
        .unwrap_or_default();

    // Bindings survive a stop, unlike NetworkSettings.Ports
    let mut ports: Vec<PortMapping> = entry
        .get("HostConfig")
        .and_then(|h| h.get("PortBindings"))
        .and_then(Value::as_object)
        .map(|bindings| {
            bindings
                .iter()
                .flat_map(|(container_port, hosts)| {
                    let internal = container_port
                        .split('/')
                        .next()
                        .and_then(|p| p.parse::<u16>().ok());
                    hosts
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(move |host| {
                            let external = host
                                .get("HostPort")
                                .and_then(Value::as_str)
                                .and_then(|p| p.parse::<u16>().ok())?;
                            Some(PortMapping::new(external, internal?))
                        })
                })
                .collect()
        })
        .unwrap_or_default();
    ports.sort_by_key(|p| (p.internal, p.external));
    ports.dedup();

    Some(ContainerStatus {
        running,
        health,
        container_id,
        ports,
    })
}

/// Parse `key=value,key2=value2` label strings from `docker ... --format json`
fn label_value<'a>(labels: &'a str, key: &str) -> Option<&'a str> {
    labels.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Row of `docker ps|volume ls|network ls --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct ListedObject {
    #[serde(rename = "Names", default)]
    names: Option<String>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Image", default)]
    image: Option<String>,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl ListedObject {
    fn into_record(self, kind: ResourceKind, label_key: &str) -> ResourceRecord {
        let bound = label_value(&self.labels, label_key)
            .filter(|v| !v.is_empty())
            .map(ServiceId::from);
        let id = self
            .names
            .or(self.name)
            .or(self.id)
            .unwrap_or_default();
        let record = ResourceRecord::new(kind, id, bound);
        match self.image {
            Some(image) if kind == ResourceKind::Container => record.with_image(image),
            _ => record,
        }
    }
}

/// Tracks layer completion across `docker pull` output lines
#[derive(Debug, Default)]
struct PullTracker {
    layers: BTreeSet<String>,
    done: BTreeSet<String>,
}

impl PullTracker {
    /// Turn one line of non-TTY pull output into a progress event
    fn observe(&mut self, line: &str) -> Option<PullProgress> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some((layer, status)) = line.split_once(": ") else {
            return Some(PullProgress::new(line));
        };
        let is_layer = layer.len() == 12 && layer.chars().all(|c| c.is_ascii_hexdigit());
        if !is_layer {
            return Some(PullProgress::new(line));
        }

        self.layers.insert(layer.to_string());
        if status == "Pull complete" || status == "Already exists" {
            self.done.insert(layer.to_string());
        }
        let percent = self.done.len() * 100 / self.layers.len();
        Some(PullProgress::new(status).with_progress(format!("{}%", percent)))
    }
}

#[async_trait]
impl RuntimeAdapter for DockerCli {
    async fn pull_image(&self, image: &str, progress: ProgressSink<'_>) -> AdapterResult<()> {
        info!("Pulling image {}", image);
        let mut child = Command::new(&self.binary)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdapterError::Transport(format!("Failed to run {}: {}", self.binary, e)))?;

        let mut tracker = PullTracker::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| AdapterError::Failed(format!("Failed to read pull output: {}", e)))?
            {
                if let Some(event) = tracker.observe(&line) {
                    progress(event);
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AdapterError::Failed(format!("docker pull did not finish: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
        start: bool,
    ) -> AdapterResult<String> {
        for volume in &spec.volumes {
            self.create_volume(&volume.name, &spec.labels).await?;
        }
        let id = self.run(&create_args(spec)).await?.trim().to_string();
        info!("Created container {} ({})", spec.name, id);
        if start {
            self.start_container(&spec.name).await?;
        }
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> AdapterResult<()> {
        self.run_args(&["start", name]).await.map(|_| ())
    }

    async fn stop_container(&self, name: &str) -> AdapterResult<()> {
        self.run_args(&["stop", name]).await.map(|_| ())
    }

    async fn restart_container(&self, name: &str) -> AdapterResult<()> {
        self.run_args(&["restart", name]).await.map(|_| ())
    }

    async fn remove_container(&self, name: &str, remove_volumes: bool) -> AdapterResult<()> {
        let volumes = if remove_volumes {
            match self.container_volumes(name).await {
                Ok(volumes) => volumes,
                Err(e) if is_no_such(&e) => Vec::new(),
                Err(e) => return Err(e),
            }
        } else {
            Vec::new()
        };

        match self.run_args(&["rm", "--force", name]).await {
            Ok(_) => {}
            Err(e) if is_no_such(&e) => debug!("Container {} already removed", name),
            Err(e) => return Err(e),
        }

        for volume in volumes {
            self.run_args(&["volume", "rm", &volume]).await?;
        }
        Ok(())
    }

    async fn get_container_status(&self, name: &str) -> AdapterResult<Option<ContainerStatus>> {
        let out = match self.run_args(&["inspect", "--type", "container", name]).await {
            Ok(out) => out,
            Err(e) if is_no_such(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let parsed: Value = serde_json::from_str(&out)
            .map_err(|e| AdapterError::Failed(format!("Unexpected inspect output: {}", e)))?;
        Ok(parsed.get(0).and_then(parse_inspect))
    }

    async fn get_daemon_status(&self) -> AdapterResult<DaemonStatus> {
        match self
            .run_args(&["info", "--format", "{{json .ServerVersion}}"])
            .await
        {
            Ok(_) => Ok(DaemonStatus::running()),
            Err(e) => Ok(DaemonStatus::down(e.message())),
        }
    }

    async fn get_daemon_info(&self) -> AdapterResult<DaemonInfo> {
        let out = self.run_args(&["info", "--format", "{{json .}}"]).await?;
        let parsed: Value = serde_json::from_str(&out)
            .map_err(|e| AdapterError::Failed(format!("Unexpected info output: {}", e)))?;

        let (cpu_usage_percent, host_used, host_total, host_cpus) = {
            let mut system = self
                .system
                .lock()
                .map_err(|e| AdapterError::Failed(format!("Metrics lock poisoned: {}", e)))?;
            system.refresh_cpu_specifics(CpuRefreshKind::everything());
            system.refresh_memory_specifics(MemoryRefreshKind::everything());
            (
                system.global_cpu_usage(),
                system.used_memory(),
                system.total_memory(),
                system.cpus().len(),
            )
        };

        let cpus = parsed
            .get("NCPU")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(host_cpus);
        let mem_total = parsed
            .get("MemTotal")
            .and_then(Value::as_u64)
            .unwrap_or(host_total);

        Ok(DaemonInfo {
            cpus,
            cpu_usage_percent,
            mem_used: host_used.min(mem_total),
            mem_total,
        })
    }

    async fn list_resources(&self) -> AdapterResult<Vec<ResourceRecord>> {
        let mut records = self.list_kind(ResourceKind::Container).await?;
        records.extend(self.list_kind(ResourceKind::Volume).await?);
        records.extend(self.list_kind(ResourceKind::Network).await?);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VolumeMount;

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".into(),
        );
        assert!(err.is_transport());
        let err = classify_failure("Error response from daemon: pull access denied".into());
        assert!(!err.is_transport());
        assert!(is_no_such(&classify_failure(
            "Error: No such container: dockyard-redis".into()
        )));
    }

    #[test]
    fn test_create_args() {
        let spec = ContainerSpec {
            service_id: ServiceId::from("redis"),
            name: "dockyard-redis".into(),
            image: "redis:7.4".into(),
            ports: vec![PortMapping::new(16379, 6379)],
            env: vec![("A".into(), "1".into())],
            volumes: vec![VolumeMount {
                name: "redis-data".into(),
                container_path: "/data".into(),
            }],
            labels: vec![("dockyard.service".into(), "redis".into())],
        };
        let args = create_args(&spec);
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "dockyard-redis",
                "--label",
                "dockyard.service=redis",
                "-p",
                "16379:6379",
                "-e",
                "A=1",
                "-v",
                "redis-data:/data",
                "redis:7.4"
            ]
        );
    }

    #[test]
    fn test_parse_inspect() {
        let entry = serde_json::json!({
            "Id": "4f1c0a",
            "State": { "Running": true, "Health": { "Status": "healthy" } },
            "HostConfig": {
                "PortBindings": {
                    "8025/tcp": [{ "HostIp": "", "HostPort": "8025" }],
                    "1025/tcp": [{ "HostIp": "", "HostPort": "1025" }]
                }
            }
        });
        let status = parse_inspect(&entry).unwrap();
        assert!(status.running);
        assert_eq!(status.health, HealthStatus::Healthy);
        assert_eq!(
            status.ports,
            vec![PortMapping::new(1025, 1025), PortMapping::new(8025, 8025)]
        );
    }

    #[test]
    fn test_parse_inspect_stopped_without_health() {
        let entry = serde_json::json!({
            "Id": "4f1c0a",
            "State": { "Running": false },
            "HostConfig": { "PortBindings": {} }
        });
        let status = parse_inspect(&entry).unwrap();
        assert!(!status.running);
        assert_eq!(status.health, HealthStatus::None);
        assert!(status.ports.is_empty());
    }

    #[test]
    fn test_listed_object_into_record() {
        let line = r#"{"ID":"abc","Image":"redis:7.2","Names":"dockyard-redis","Labels":"com.example=x,dockyard.service=redis"}"#;
        let obj: ListedObject = serde_json::from_str(line).unwrap();
        let record = obj.into_record(ResourceKind::Container, "dockyard.service");
        assert_eq!(record.id, "dockyard-redis");
        assert_eq!(record.bound_service_id, Some(ServiceId::from("redis")));
        assert_eq!(record.image_version(), Some("7.2"));

        let line = r#"{"Driver":"local","Labels":"dockyard.service=","Name":"orphan-1"}"#;
        let obj: ListedObject = serde_json::from_str(line).unwrap();
        let record = obj.into_record(ResourceKind::Volume, "dockyard.service");
        assert_eq!(record.id, "orphan-1");
        assert_eq!(record.bound_service_id, None);
        assert_eq!(record.image, None);
    }

    #[test]
    fn test_pull_tracker() {
        let mut tracker = PullTracker::default();
        let first = tracker.observe("7.4: Pulling from library/redis").unwrap();
        assert_eq!(first.status, "7.4: Pulling from library/redis");
        assert_eq!(first.progress, None);

        tracker.observe("a2abf6c4d29d: Pulling fs layer");
        let half = tracker.observe("c7a4e4382001: Already exists").unwrap();
        assert_eq!(half.progress.as_deref(), Some("50%"));
        let done = tracker.observe("a2abf6c4d29d: Pull complete").unwrap();
        assert_eq!(done.status, "Pull complete");
        assert_eq!(done.progress.as_deref(), Some("100%"));
        assert!(tracker.observe("   ").is_none());
    }
}
