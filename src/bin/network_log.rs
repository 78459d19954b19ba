//! Basic L4 network callout server.
//!
//! Passes read-path and write-path frames through unchanged while logging
//! direction, size, and end-of-stream markers. A starting point for custom
//! byte-stream processors.
//!
//! CLI:
//!   cargo run --bin network_log -- --plaintext-address 0.0.0.0:8080

use clap::Parser;
use tonic::Status;
use tracing::info;

use service_callout::cli::{init_logging, ServerArgs};
use service_callout::{CalloutServer, DataFrame, NetworkHandler};

struct NetworkLog;

#[tonic::async_trait]
impl NetworkHandler for NetworkLog {
    async fn on_read_data(&self, data: &[u8], end_of_stream: bool) -> Result<DataFrame, Status> {
        info!(
            "read path: {} bytes{}",
            data.len(),
            if end_of_stream { " (end of stream)" } else { "" }
        );
        Ok(DataFrame::passthrough(data))
    }

    async fn on_write_data(&self, data: &[u8], end_of_stream: bool) -> Result<DataFrame, Status> {
        info!(
            "write path: {} bytes{}",
            data.len(),
            if end_of_stream { " (end of stream)" } else { "" }
        );
        Ok(DataFrame::passthrough(data))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let config = ServerArgs::parse().to_config()?;
    CalloutServer::network(config, NetworkLog).run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_pass_through_unmodified() {
        let frame = NetworkLog.on_read_data(b"payload", false).await.unwrap();
        assert_eq!(frame.data, b"payload");
        assert!(!frame.modified);
        assert!(!NetworkLog.should_close_connection(b"payload", false).await);
    }
}
