use anyhow::{Context, Result};
use eventpipe_common::EventValidator;
use eventpipe_config::PipelineConfig;
use eventpipe_kafka::BrokerPublisher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tonic::transport::Server;
use tracing::info;

use crate::grpc::GrpcIngest;
use crate::http::{create_router, GatewayState};
use crate::service::IngestService;

/// Runs the HTTP and gRPC listeners plus the overflow buffer flusher
pub struct GatewayServer {
    config: Arc<PipelineConfig>,
    publisher: Arc<BrokerPublisher>,
    service: Arc<IngestService>,
}

impl GatewayServer {
    pub fn new(config: Arc<PipelineConfig>, publisher: Arc<BrokerPublisher>) -> Self {
        let service = Arc::new(IngestService::new(
            publisher.clone(),
            EventValidator::new(&config.validation),
            config.gateway.default_source.clone(),
        ));
        Self {
            config,
            publisher,
            service,
        }
    }

    pub fn service(&self) -> Arc<IngestService> {
        self.service.clone()
    }

    /// Serve until a message arrives on `shutdown`
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let gateway = &self.config.gateway;
        let http_addr: SocketAddr = gateway
            .http_bind
            .parse()
            .with_context(|| format!("Invalid HTTP bind address: {}", gateway.http_bind))?;
        let grpc_addr: SocketAddr = gateway
            .grpc_bind
            .parse()
            .with_context(|| format!("Invalid gRPC bind address: {}", gateway.grpc_bind))?;

        let flusher = self.publisher.spawn_flusher(shutdown.subscribe());

        let router = create_router(GatewayState {
            service: self.service.clone(),
            readiness_timeout: gateway.readiness_timeout(),
        });
        let listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;
        let mut http_shutdown = shutdown.subscribe();
        info!("[GATEWAY] HTTP server listening on {}", http_addr);
        let http = async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.recv().await;
                })
                .await
                .context("HTTP server failed")
        };

        let grpc_service = GrpcIngest::new(self.service.clone(), gateway.stream_ack_buffer)
            .into_server(gateway.grpc_max_message_bytes);
        let mut grpc_shutdown = shutdown.subscribe();
        info!("[GATEWAY] gRPC server listening on {}", grpc_addr);
        let grpc = async move {
            Server::builder()
                .trace_fn(|http_request: &tonic::codegen::http::Request<()>| {
                    tracing::info_span!(
                        "Ingest gRPC Request",
                        grpc.method = %http_request.method(),
                        grpc.path = %http_request.uri().path(),
                        grpc.version = ?http_request.version(),
                    )
                })
                .add_service(grpc_service)
                .serve_with_shutdown(grpc_addr, async move {
                    let _ = grpc_shutdown.recv().await;
                })
                .await
                .context("gRPC server failed")
        };

        let served = tokio::try_join!(http, grpc);
        // flusher listens on the same broadcast; a server error must stop it too
        let _ = shutdown.send(());
        let _ = flusher.await;
        served?;

        let (batches, bytes) = self.publisher.buffer_usage().await;
        info!(
            "[GATEWAY] Stopped; {} batches ({} bytes) remain in the overflow buffer",
            batches, bytes
        );
        Ok(())
    }
}
