//! L4 dispatcher: routes Envoy `NetworkExternalProcessor` byte-stream frames
//! to read-path / write-path hooks with per-frame modification and
//! connection-control signaling.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::warn;

use crate::protos::envoy;

pub type NetworkProcessingRequest = envoy::service::network_ext_proc::v3::ProcessingRequest;
pub type NetworkProcessingResponse = envoy::service::network_ext_proc::v3::ProcessingResponse;
pub type Data = envoy::service::network_ext_proc::v3::Data;

use envoy::service::network_ext_proc::v3::network_external_processor_server::NetworkExternalProcessor;
pub use envoy::service::network_ext_proc::v3::network_external_processor_server::NetworkExternalProcessorServer;
use envoy::service::network_ext_proc::v3::processing_request;
use envoy::service::network_ext_proc::v3::processing_response;
use envoy::service::network_ext_proc::v3::processing_response::{
    ConnectionStatus, DataProcessedStatus,
};

/// Result of processing one data frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub data: Vec<u8>,
    pub modified: bool,
}

impl DataFrame {
    /// Frame returned unchanged.
    pub fn passthrough(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            modified: false,
        }
    }

    /// Frame replaced with new bytes.
    pub fn modified(data: Vec<u8>) -> Self {
        Self {
            data,
            modified: true,
        }
    }
}

/// Per-frame hooks for an L4 session. Defaults pass bytes through unchanged
/// and never close the connection.
#[tonic::async_trait]
pub trait NetworkHandler: Send + Sync + 'static {
    /// Client-to-upstream bytes.
    async fn on_read_data(&self, data: &[u8], _end_of_stream: bool) -> Result<DataFrame, Status> {
        Ok(DataFrame::passthrough(data))
    }

    /// Upstream-to-client bytes.
    async fn on_write_data(&self, data: &[u8], _end_of_stream: bool) -> Result<DataFrame, Status> {
        Ok(DataFrame::passthrough(data))
    }

    /// Decide whether the session should be torn down after this frame.
    async fn should_close_connection(&self, _data: &[u8], _modified: bool) -> bool {
        false
    }
}

async fn process_frame<H: NetworkHandler>(
    handler: &H,
    callout: NetworkProcessingRequest,
) -> Result<NetworkProcessingResponse, Status> {
    use processing_request::Request as Req;
    use processing_response::Response as Resp;

    let (frame, mirror): (&Data, fn(Data) -> Resp) = match &callout.request {
        Some(Req::ReadData(frame)) => (frame, Resp::ReadData),
        Some(Req::WriteData(frame)) => (frame, Resp::WriteData),
        None => {
            warn!("network callout carries no data frame");
            return Ok(NetworkProcessingResponse::default());
        }
    };

    let result = match &callout.request {
        Some(Req::ReadData(_)) => handler.on_read_data(&frame.data, frame.end_of_stream).await?,
        _ => handler.on_write_data(&frame.data, frame.end_of_stream).await?,
    };
    let close = handler
        .should_close_connection(&frame.data, result.modified)
        .await;

    Ok(NetworkProcessingResponse {
        data_processing_status: if result.modified {
            DataProcessedStatus::Modified as i32
        } else {
            DataProcessedStatus::Unmodified as i32
        },
        connection_status: if close {
            ConnectionStatus::Close as i32
        } else {
            ConnectionStatus::Continue as i32
        },
        response: Some(mirror(Data {
            data: result.data,
            end_of_stream: frame.end_of_stream,
        })),
    })
}

/// gRPC service adapter wrapping a [`NetworkHandler`].
pub struct NetworkService<H> {
    handler: Arc<H>,
}

impl<H> NetworkService<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for NetworkService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

#[tonic::async_trait]
impl<H: NetworkHandler> NetworkExternalProcessor for NetworkService<H> {
    type ProcessStream = ReceiverStream<Result<NetworkProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<NetworkProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<NetworkProcessingResponse, Status>>(32);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.message().await.transpose() {
                let callout = match msg {
                    Ok(callout) => callout,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };
                let outcome = AssertUnwindSafe(process_frame(handler.as_ref(), callout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        warn!("network handler panicked, terminating stream");
                        Err(Status::internal("network handler panicked"))
                    });
                match outcome {
                    Ok(response) => {
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;
    impl NetworkHandler for Passthrough {}

    fn read_frame(data: &[u8], end_of_stream: bool) -> NetworkProcessingRequest {
        NetworkProcessingRequest {
            request: Some(processing_request::Request::ReadData(Data {
                data: data.to_vec(),
                end_of_stream,
            })),
        }
    }

    fn write_frame(data: &[u8], end_of_stream: bool) -> NetworkProcessingRequest {
        NetworkProcessingRequest {
            request: Some(processing_request::Request::WriteData(Data {
                data: data.to_vec(),
                end_of_stream,
            })),
        }
    }

    #[tokio::test]
    async fn passthrough_mirrors_direction_and_bytes() {
        let response = process_frame(&Passthrough, read_frame(b"hello", false))
            .await
            .unwrap();
        assert_eq!(
            response.data_processing_status,
            DataProcessedStatus::Unmodified as i32
        );
        assert_eq!(response.connection_status, ConnectionStatus::Continue as i32);
        let Some(processing_response::Response::ReadData(data)) = response.response else {
            panic!("expected read_data mirror");
        };
        assert_eq!(data.data, b"hello");
        assert!(!data.end_of_stream);

        let response = process_frame(&Passthrough, write_frame(b"world", true))
            .await
            .unwrap();
        let Some(processing_response::Response::WriteData(data)) = response.response else {
            panic!("expected write_data mirror");
        };
        assert_eq!(data.data, b"world");
        assert!(data.end_of_stream);
    }

    struct Upcasing;
    #[tonic::async_trait]
    impl NetworkHandler for Upcasing {
        async fn on_read_data(&self, data: &[u8], _: bool) -> Result<DataFrame, Status> {
            Ok(DataFrame::modified(data.to_ascii_uppercase()))
        }

        async fn should_close_connection(&self, data: &[u8], _modified: bool) -> bool {
            data.windows(5).any(|w| w == b"close")
        }
    }

    #[tokio::test]
    async fn modified_frame_is_flagged() {
        let response = process_frame(&Upcasing, read_frame(b"abc", false))
            .await
            .unwrap();
        assert_eq!(
            response.data_processing_status,
            DataProcessedStatus::Modified as i32
        );
        let Some(processing_response::Response::ReadData(data)) = response.response else {
            panic!("expected read_data mirror");
        };
        assert_eq!(data.data, b"ABC");
    }

    #[tokio::test]
    async fn close_signal_is_emitted() {
        let response = process_frame(&Upcasing, read_frame(b"please close now", false))
            .await
            .unwrap();
        assert_eq!(response.connection_status, ConnectionStatus::Close as i32);
    }

    #[tokio::test]
    async fn empty_request_gets_empty_response() {
        let response = process_frame(&Passthrough, NetworkProcessingRequest { request: None })
            .await
            .unwrap();
        assert_eq!(response, NetworkProcessingResponse::default());
    }
}
