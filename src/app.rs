use crate::config::CamgateConfig;
use crate::enhance::AdaptiveEnhancer;
use crate::error::Result;
use crate::processor::Processor;
use crate::recorder::{RecorderHandle, RecorderService};
use crate::state::{PipelineShared, SharedPipeline};
use crate::streaming::StreamServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Composition root: constructs every component, wires them via explicit
/// channels and shared handles, and owns the shutdown sequence.
pub struct Camgate {
    config: CamgateConfig,
    shared: SharedPipeline,
    recorder: RecorderHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Camgate {
    /// Build and start the pipeline tasks (processor and recorder). The
    /// HTTP surface starts in [`run`](Self::run).
    pub fn new(config: CamgateConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let shared = PipelineShared::new(config.clone());

        let (recorder, recorder_task) =
            RecorderService::spawn(config.recording.clone(), cancel.child_token());

        let enhancer = Arc::new(AdaptiveEnhancer::new(Duration::from_millis(
            config.enhancer.budget_ms,
        )));
        let processor_task = Processor::spawn(
            shared.clone(),
            recorder.clone(),
            enhancer,
            cancel.child_token(),
        );

        Ok(Self {
            config,
            shared,
            recorder,
            cancel,
            tasks: vec![recorder_task, processor_task],
        })
    }

    pub fn shared(&self) -> SharedPipeline {
        self.shared.clone()
    }

    pub fn recorder(&self) -> RecorderHandle {
        self.recorder.clone()
    }

    /// Serve until a shutdown signal arrives or the server fails, then
    /// stop every task in order.
    pub async fn run(mut self) -> Result<()> {
        let server = StreamServer::new(
            self.config.server.clone(),
            self.shared.clone(),
            self.recorder.clone(),
        );

        let outcome = tokio::select! {
            result = server.start(self.cancel.child_token()) => result,
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        info!("Stopping pipeline tasks");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Camgate stopped");

        outcome
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_composition_root_builds_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = CamgateConfig::default();
        config.recording.path = tmp.path().display().to_string();

        let app = Camgate::new(config).unwrap();
        assert_eq!(app.shared().viewer_count(), 0);

        // Cancel and drain without ever binding a socket
        app.cancel.cancel();
        let mut app = app;
        for task in app.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}
