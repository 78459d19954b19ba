//! Ext-proc dispatcher: routes each message of an Envoy `ExternalProcessor`
//! bidi stream to a typed hook and assembles the matching response.
//!
//! One response is emitted per request, in arrival order. Messages on a
//! single stream are processed sequentially; separate streams are
//! independent.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::protos::envoy;
use crate::tools::{BodyResponse, HeadersResponse, HttpBody, HttpHeaders, ImmediateResponse};

pub type ProcessingRequest = envoy::service::ext_proc::v3::ProcessingRequest;
pub type ProcessingResponse = envoy::service::ext_proc::v3::ProcessingResponse;
pub type HttpTrailers = envoy::service::ext_proc::v3::HttpTrailers;
pub type TrailersResponse = envoy::service::ext_proc::v3::TrailersResponse;

use envoy::service::ext_proc::v3::external_processor_server::ExternalProcessor;
pub use envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use envoy::service::ext_proc::v3::processing_request;
use envoy::service::ext_proc::v3::processing_response;

/// What a hook wants done with the message it was handed.
#[derive(Debug, Clone)]
pub enum HookResponse {
    /// No mutation; the response carries an empty payload of the matching
    /// variant.
    Continue,
    /// Header mutation; legal from the header hooks.
    Headers(HeadersResponse),
    /// Body mutation; legal from the body hooks.
    Body(BodyResponse),
    /// Trailer mutation; legal from the trailer hooks.
    Trailers(TrailersResponse),
    /// Short-circuit the transaction; legal from the request-headers and
    /// request-body hooks only.
    Immediate(ImmediateResponse),
    /// Fully formed response forwarded unchanged; escape hatch for dynamic
    /// metadata and mode overrides.
    Full(ProcessingResponse),
}

/// Per-service hook set with pass-through defaults. Implementations may be
/// invoked from many streams concurrently and must be re-entrant.
#[tonic::async_trait]
pub trait ExtProcHandler: Send + Sync + 'static {
    async fn on_request_headers(&self, _headers: &HttpHeaders) -> Result<HookResponse, Status> {
        Ok(HookResponse::Continue)
    }

    async fn on_response_headers(&self, _headers: &HttpHeaders) -> Result<HookResponse, Status> {
        Ok(HookResponse::Continue)
    }

    async fn on_request_body(&self, _body: &HttpBody) -> Result<HookResponse, Status> {
        Ok(HookResponse::Continue)
    }

    async fn on_response_body(&self, _body: &HttpBody) -> Result<HookResponse, Status> {
        Ok(HookResponse::Continue)
    }

    async fn on_request_trailers(&self, _trailers: &HttpTrailers) -> Result<HookResponse, Status> {
        Ok(HookResponse::Continue)
    }

    async fn on_response_trailers(&self, _trailers: &HttpTrailers) -> Result<HookResponse, Status> {
        Ok(HookResponse::Continue)
    }
}

/// Kind of payload an inbound message carried; decides which response
/// variants are legal and what the empty fallback looks like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    RequestHeaders,
    ResponseHeaders,
    RequestBody,
    ResponseBody,
    RequestTrailers,
    ResponseTrailers,
}

impl Phase {
    fn allows_immediate(self) -> bool {
        matches!(self, Phase::RequestHeaders | Phase::RequestBody)
    }

    /// Empty response with this phase's variant set to its default.
    fn empty_response(self) -> ProcessingResponse {
        use processing_response::Response;
        let response = match self {
            Phase::RequestHeaders => Response::RequestHeaders(HeadersResponse::default()),
            Phase::ResponseHeaders => Response::ResponseHeaders(HeadersResponse::default()),
            Phase::RequestBody => Response::RequestBody(BodyResponse::default()),
            Phase::ResponseBody => Response::ResponseBody(BodyResponse::default()),
            Phase::RequestTrailers => Response::RequestTrailers(TrailersResponse::default()),
            Phase::ResponseTrailers => Response::ResponseTrailers(TrailersResponse::default()),
        };
        ProcessingResponse {
            response: Some(response),
            ..Default::default()
        }
    }

    fn wrap(self, hook_response: HookResponse) -> ProcessingResponse {
        use processing_response::Response;
        let response = match hook_response {
            HookResponse::Continue => return self.empty_response(),
            HookResponse::Full(full) => return full,
            HookResponse::Immediate(immediate) if self.allows_immediate() => {
                Response::ImmediateResponse(immediate)
            }
            HookResponse::Headers(headers) if self == Phase::RequestHeaders => {
                Response::RequestHeaders(headers)
            }
            HookResponse::Headers(headers) if self == Phase::ResponseHeaders => {
                Response::ResponseHeaders(headers)
            }
            HookResponse::Body(body) if self == Phase::RequestBody => Response::RequestBody(body),
            HookResponse::Body(body) if self == Phase::ResponseBody => Response::ResponseBody(body),
            HookResponse::Trailers(trailers) if self == Phase::RequestTrailers => {
                Response::RequestTrailers(trailers)
            }
            HookResponse::Trailers(trailers) if self == Phase::ResponseTrailers => {
                Response::ResponseTrailers(trailers)
            }
            other => {
                warn!(phase = ?self, "hook returned a response kind not legal here, ignoring: {other:?}");
                return self.empty_response();
            }
        };
        ProcessingResponse {
            response: Some(response),
            ..Default::default()
        }
    }
}

/// Route one inbound message to its hook and build the outbound message.
async fn process_message<H: ExtProcHandler>(
    handler: &H,
    callout: ProcessingRequest,
) -> Result<ProcessingResponse, Status> {
    use processing_request::Request as Req;
    let response = match &callout.request {
        Some(Req::RequestHeaders(headers)) => {
            Phase::RequestHeaders.wrap(handler.on_request_headers(headers).await?)
        }
        Some(Req::ResponseHeaders(headers)) => {
            Phase::ResponseHeaders.wrap(handler.on_response_headers(headers).await?)
        }
        Some(Req::RequestBody(body)) => {
            Phase::RequestBody.wrap(handler.on_request_body(body).await?)
        }
        Some(Req::ResponseBody(body)) => {
            Phase::ResponseBody.wrap(handler.on_response_body(body).await?)
        }
        Some(Req::RequestTrailers(trailers)) => {
            Phase::RequestTrailers.wrap(handler.on_request_trailers(trailers).await?)
        }
        Some(Req::ResponseTrailers(trailers)) => {
            Phase::ResponseTrailers.wrap(handler.on_response_trailers(trailers).await?)
        }
        None => {
            warn!("callout carries no recognized request variant");
            ProcessingResponse::default()
        }
    };
    Ok(response)
}

/// gRPC service adapter wrapping an [`ExtProcHandler`].
pub struct ExtProcService<H> {
    handler: Arc<H>,
}

impl<H> ExtProcService<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for ExtProcService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

#[tonic::async_trait]
impl<H: ExtProcHandler> ExternalProcessor for ExtProcService<H> {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<ProcessingResponse, Status>>(32);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.message().await.transpose() {
                let callout = match msg {
                    Ok(callout) => callout,
                    Err(status) => {
                        debug!("inbound stream error: {status}");
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };
                let outcome = AssertUnwindSafe(process_message(handler.as_ref(), callout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        warn!("callout handler panicked, terminating stream");
                        Err(Status::internal("callout handler panicked"))
                    });
                match outcome {
                    Ok(response) => {
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        // Terminates the RPC; nothing further is read.
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
