use async_trait::async_trait;
use log::{info, warn};
use serde_json::json;

use crate::adapter::Platform;
use crate::config::{LaunchMethod, LauncherConfig};
use crate::shared::models::Bot;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Worker capacity is exhausted; the dispatcher keeps the bot in READY
    /// and retries with backoff.
    #[error("launch capacity exhausted: {0}")]
    Capacity(String),
    /// The spawn itself failed; fatal for this bot.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
}

/// Starts one isolated worker per bot. Returns once the worker has accepted
/// the bot id; reaching JOINING is the worker's job.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle, LaunchError>;
}

pub fn build_launcher(config: &LauncherConfig) -> Box<dyn Launcher> {
    match config.method {
        LaunchMethod::Process => Box::new(ProcessLauncher),
        LaunchMethod::Container => Box::new(ContainerLauncher::new(config.clone())),
    }
}

/// Forks the current binary with `run-worker --bot-id`. Used for local and
/// single-host deployments.
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle, LaunchError> {
        let exe = std::env::current_exe().map_err(|e| LaunchError::Spawn(e.to_string()))?;
        let child = tokio::process::Command::new(exe)
            .arg("run-worker")
            .arg("--bot-id")
            .arg(bot.id.to_string())
            .env("BOT_ID", bot.id.to_string())
            .spawn()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!("Spawned worker process {} for bot {}", pid, bot.object_id);
        Ok(WorkerHandle {
            worker_id: format!("pid-{}", pid),
        })
    }
}

/// Submits a pod manifest to the container orchestrator. CPU/memory requests
/// are tuned per platform: the Zoom native SDK needs more than a browser.
pub struct ContainerLauncher {
    config: LauncherConfig,
    client: reqwest::Client,
}

impl ContainerLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }

    fn pod_name(bot: &Bot) -> String {
        format!("bot-{}", bot.object_id.to_lowercase().replace('_', "-"))
    }

    fn pod_manifest(&self, bot: &Bot) -> serde_json::Value {
        let platform = Platform::for_bot(bot);
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": Self::pod_name(bot),
                "namespace": self.config.namespace,
                "labels": {
                    "app": "meetserver-worker",
                    "bot-id": bot.object_id,
                    "platform": platform.as_str(),
                }
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "worker",
                    "image": self.config.worker_image,
                    "args": ["run-worker", "--bot-id", bot.id.to_string()],
                    "env": [{"name": "BOT_ID", "value": bot.id.to_string()}],
                    "resources": {
                        "requests": {
                            "cpu": platform.cpu_request(),
                            "memory": platform.memory_request(),
                        }
                    }
                }]
            }
        })
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle, LaunchError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods",
            self.config.orchestrator_url.trim_end_matches('/'),
            self.config.namespace
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.orchestrator_token)
            .json(&self.pod_manifest(bot))
            .send()
            .await
            .map_err(|e| LaunchError::Capacity(format!("orchestrator unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            info!(
                "Submitted pod {} for bot {}",
                Self::pod_name(bot),
                bot.object_id
            );
            return Ok(WorkerHandle {
                worker_id: Self::pod_name(bot),
            });
        }
        let body = response.text().await.unwrap_or_default();
        // Quota exhaustion and throttling are capacity conditions; anything
        // else is a hard spawn failure.
        if status.as_u16() == 403 && body.contains("exceeded quota")
            || status.as_u16() == 429
            || status.as_u16() == 503
        {
            warn!("Capacity refusal for bot {}: {} {}", bot.object_id, status, body);
            Err(LaunchError::Capacity(format!("{}: {}", status, body)))
        } else {
            Err(LaunchError::Spawn(format!("{}: {}", status, body)))
        }
    }
}
