//! Ingestion gateway: `POST /v1/events` over HTTP and the `EventIngest`
//! gRPC service, both feeding the broker publisher.

pub mod error;
pub mod grpc;
pub mod http;
pub mod server;
pub mod service;

pub use error::GatewayError;
pub use grpc::{event_from_message, proto, GrpcIngest};
pub use http::{create_router, GatewayState};
pub use server::GatewayServer;
pub use service::{BatchResponse, EventOutcome, IngestService};
