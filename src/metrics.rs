//! Gateway Metrics
//!
//! Prometheus collectors for the data plane and the chunk assembler. Each
//! gateway owns its own [`Registry`] so several instances (and tests) can
//! coexist in one process.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Outcome label values
pub mod outcome {
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
    pub const COMPLETED: &str = "completed";
    pub const ABORTED: &str = "aborted";
    pub const EXPIRED: &str = "expired";
    pub const FAILED: &str = "failed";
}

/// Collectors exposed on `/metrics`
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    /// Uploads by backend and outcome
    pub uploads: IntCounterVec,
    /// Downloads by backend
    pub downloads: IntCounterVec,
    /// Bytes published by backend
    pub bytes_uploaded: IntCounterVec,
    /// Uploads rejected for a checksum mismatch, by backend
    pub checksum_failures: IntCounterVec,
    /// Chunk slots accepted
    pub chunks_received: IntCounter,
    /// Chunked transfers by terminal outcome
    pub transfers: IntCounterVec,
    /// Chunked transfers currently tracked
    pub active_transfers: IntGauge,
    /// Facade operation latency by operation name
    pub operation_duration: HistogramVec,
}

fn register_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("sync_gateway".to_string()), None)
            .map_err(register_err)?;

        let uploads = IntCounterVec::new(
            Opts::new("uploads_total", "Uploads by backend and outcome"),
            &["backend", "outcome"],
        )
        .map_err(register_err)?;
        let downloads = IntCounterVec::new(
            Opts::new("downloads_total", "Downloads by backend"),
            &["backend"],
        )
        .map_err(register_err)?;
        let bytes_uploaded = IntCounterVec::new(
            Opts::new("uploaded_bytes_total", "Bytes published by backend"),
            &["backend"],
        )
        .map_err(register_err)?;
        let checksum_failures = IntCounterVec::new(
            Opts::new("checksum_failures_total", "Uploads rejected for checksum mismatch"),
            &["backend"],
        )
        .map_err(register_err)?;
        let chunks_received = IntCounter::new("chunks_received_total", "Chunk slots accepted")
            .map_err(register_err)?;
        let transfers = IntCounterVec::new(
            Opts::new("chunked_transfers_total", "Chunked transfers by outcome"),
            &["outcome"],
        )
        .map_err(register_err)?;
        let active_transfers = IntGauge::new("chunked_transfers_active", "Open chunked transfers")
            .map_err(register_err)?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Storage operation latency"),
            &["operation"],
        )
        .map_err(register_err)?;

        registry.register(Box::new(uploads.clone())).map_err(register_err)?;
        registry.register(Box::new(downloads.clone())).map_err(register_err)?;
        registry.register(Box::new(bytes_uploaded.clone())).map_err(register_err)?;
        registry.register(Box::new(checksum_failures.clone())).map_err(register_err)?;
        registry.register(Box::new(chunks_received.clone())).map_err(register_err)?;
        registry.register(Box::new(transfers.clone())).map_err(register_err)?;
        registry.register(Box::new(active_transfers.clone())).map_err(register_err)?;
        registry.register(Box::new(operation_duration.clone())).map_err(register_err)?;

        Ok(Self {
            registry,
            uploads,
            downloads,
            bytes_uploaded,
            checksum_failures,
            chunks_received,
            transfers,
            active_transfers,
            operation_duration,
        })
    }

    /// Render all collectors in the text exposition format.
    ///
    /// Returns the content type and the encoded body.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}
