use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use eventpipe_common::{EventValidator, EventWriter};
use eventpipe_config::PipelineConfig;
use eventpipe_kafka::{BrokerConsumer, ConsumerState, KafkaRecordSource, RecordSource};
use eventpipe_metrics::{exporter, ComponentHealth, HealthReport};
use eventpipe_storage::StorageWriter;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};

/// Wires the record source, the storage writer and the consumer together
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    source: Arc<dyn RecordSource>,
    writer: Arc<dyn EventWriter>,
    consumer: Arc<BrokerConsumer>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Running consumer task returned by [`PipelineOrchestrator::start`]
pub struct PipelineHandle {
    consumer_task: JoinHandle<()>,
}

impl PipelineOrchestrator {
    pub fn new(config: Arc<PipelineConfig>, source: Arc<dyn RecordSource>, writer: Arc<dyn EventWriter>) -> Self {
        let consumer = Arc::new(BrokerConsumer::new(
            source.clone(),
            writer.clone(),
            EventValidator::new(&config.validation),
            config.consumer.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            source,
            writer,
            consumer,
            shutdown_tx,
        }
    }

    /// Kafka consumer plus the configured object store
    pub fn from_config(config: Arc<PipelineConfig>) -> Result<Self> {
        let source = Arc::new(KafkaRecordSource::new(&config.kafka, &config.consumer)?);
        let writer = Arc::new(StorageWriter::new(&config.storage)?);
        Ok(Self::new(config, source, writer))
    }

    pub fn consumer(&self) -> &Arc<BrokerConsumer> {
        &self.consumer
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Broker then storage, each bounded by the startup timeout
    pub async fn startup_checks(&self) -> Result<()> {
        let timeout = self.config.pipeline.startup_check_timeout();

        match tokio::time::timeout(timeout, self.source.check_connectivity()).await {
            Ok(Ok(())) => info!("[HEALTH] Broker reachable"),
            Ok(Err(e)) => {
                return Err(PipelineError::FatalStartup {
                    component: "broker",
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PipelineError::FatalStartup {
                    component: "broker",
                    reason: format!("no response within {:?}", timeout),
                })
            }
        }

        match tokio::time::timeout(timeout, self.writer.check_connectivity()).await {
            Ok(Ok(())) => info!("[HEALTH] Storage reachable"),
            Ok(Err(e)) => {
                return Err(PipelineError::FatalStartup {
                    component: "storage",
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PipelineError::FatalStartup {
                    component: "storage",
                    reason: format!("no response within {:?}", timeout),
                })
            }
        }

        Ok(())
    }

    /// Run startup checks, then spawn the consumer poll loop
    pub async fn start(&self) -> Result<PipelineHandle> {
        self.startup_checks().await?;

        let consumer = self.consumer.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let consumer_task = tokio::spawn(async move {
            consumer.run(shutdown_rx).await;
        });
        info!("[PIPELINE] Started");

        Ok(PipelineHandle { consumer_task })
    }

    /// Signal the consumer and wait for its in-flight batch.
    ///
    /// Returns false if the shutdown timeout passed and the task was aborted.
    /// Nothing is committed for aborted work, so it is redelivered.
    pub async fn shutdown(&self, handle: PipelineHandle) -> bool {
        let timeout = self.config.pipeline.shutdown_timeout();
        let _ = self.shutdown_tx.send(());

        let PipelineHandle { mut consumer_task } = handle;
        match tokio::time::timeout(timeout, &mut consumer_task).await {
            Ok(Ok(())) => {
                info!("[PIPELINE] Stopped cleanly");
                true
            }
            Ok(Err(e)) => {
                error!("[PIPELINE] Consumer task failed during shutdown: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "[PIPELINE] Consumer did not stop within {:?}, aborting; uncommitted records will be redelivered",
                    timeout
                );
                consumer_task.abort();
                false
            }
        }
    }

    /// Broker, storage and consumer state; unhealthy if any one is down
    pub async fn health(&self) -> HealthReport {
        let timeout = self.config.pipeline.readiness_timeout();

        let broker = match tokio::time::timeout(timeout, self.source.check_connectivity()).await {
            Ok(Ok(())) => ComponentHealth::healthy("broker"),
            Ok(Err(e)) => ComponentHealth::unhealthy("broker", e.to_string()),
            Err(_) => ComponentHealth::unhealthy("broker", format!("no response within {:?}", timeout)),
        };

        let storage = match tokio::time::timeout(timeout, self.writer.check_connectivity()).await {
            Ok(Ok(())) => ComponentHealth::healthy("storage"),
            Ok(Err(e)) => ComponentHealth::unhealthy("storage", e.to_string()),
            Err(_) => ComponentHealth::unhealthy("storage", format!("no response within {:?}", timeout)),
        };

        let state = self.consumer.state();
        let consumer = match state {
            ConsumerState::Polling | ConsumerState::Committing => ComponentHealth::healthy("consumer"),
            ConsumerState::Starting => ComponentHealth::degraded("consumer", "starting"),
            ConsumerState::Stopping | ConsumerState::Stopped => {
                ComponentHealth::unhealthy("consumer", format!("consumer is {}", state))
            }
        };

        HealthReport::from_components(vec![broker, storage, consumer])
    }

    pub fn health_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health/live", get(liveness))
            .route("/health/ready", get(health))
            .route("/health", get(health))
            .merge(exporter::router())
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Start, serve health until a shutdown signal, then stop
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut signal_rx = self.shutdown_tx.subscribe();
        let handle = self.start().await?;

        let bind = &self.config.pipeline.health_bind;
        let addr: SocketAddr = bind.parse().map_err(|e: std::net::AddrParseError| PipelineError::InvalidAddress {
            addr: bind.clone(),
            reason: e.to_string(),
        })?;
        let listener = TcpListener::bind(addr).await?;
        info!("[HEALTH] Serving health and metrics on {}", addr);

        let router = self.health_router();
        let mut server_shutdown = self.shutdown_tx.subscribe();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.recv().await;
                })
                .await;
            if let Err(e) = served {
                error!("[HEALTH] Health server failed: {}", e);
            }
        });

        let _ = signal_rx.recv().await;

        let clean = self.shutdown(handle).await;
        let _ = server.await;
        if !clean {
            warn!("[PIPELINE] Shutdown was not clean");
        }
        Ok(())
    }
}

async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn health(State(pipeline): State<Arc<PipelineOrchestrator>>) -> HealthReport {
    pipeline.health().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use eventpipe_config::StorageConfig;
    use eventpipe_kafka::MemoryBroker;
    use std::time::Duration;
    use tower::ServiceExt;

    fn orchestrator(broker: Arc<MemoryBroker>) -> Arc<PipelineOrchestrator> {
        let mut config = PipelineConfig::default();
        config.pipeline.startup_check_timeout_secs = 1;
        config.pipeline.shutdown_timeout_secs = 2;
        config.consumer.poll_timeout_ms = 20;
        let writer = StorageWriter::new(&StorageConfig {
            uri: "memory://".to_string(),
            ..StorageConfig::default()
        })
        .unwrap();
        broker.subscribe(&config.kafka.raw_topic);
        Arc::new(PipelineOrchestrator::new(Arc::new(config), broker, Arc::new(writer)))
    }

    #[tokio::test]
    async fn test_startup_fails_when_broker_down() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.set_available(false);
        let pipeline = orchestrator(broker);

        match pipeline.start().await {
            Err(PipelineError::FatalStartup { component, .. }) => assert_eq!(component, "broker"),
            other => panic!("expected fatal startup, got {:?}", other.err()),
        }
        assert_eq!(pipeline.consumer().state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let pipeline = orchestrator(Arc::new(MemoryBroker::new(1)));

        let handle = pipeline.start().await.unwrap();
        for _ in 0..50 {
            if pipeline.consumer().state() == ConsumerState::Polling {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = pipeline.health().await;
        assert!(report.is_ready());

        assert!(pipeline.shutdown(handle).await);
        assert_eq!(pipeline.consumer().state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_stopped_consumer() {
        let pipeline = orchestrator(Arc::new(MemoryBroker::new(1)));
        let app = pipeline.health_router();

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let live = app
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);
    }
}
