//! Basic ext-proc callout server.
//!
//! Provides a non-comprehensive set of responses for each of the possible
//! callout interactions:
//! - request headers: add `header-request: request`, remove `foo`, and clear
//!   the route cache
//! - response headers: add `header-response: response`
//! - request body: replace the body with `-added-body`
//! - response body: replace the body with `new-body` (also demonstrates that
//!   a replacement body takes precedence over `clear_body`)
//!
//! CLI:
//!   cargo run --bin basic_callout -- --plaintext-address 0.0.0.0:8080

use clap::Parser;
use tonic::Status;

use service_callout::cli::{init_logging, ServerArgs};
use service_callout::extproc::HookResponse;
use service_callout::tools::{add_body_mutation, add_header_mutation, HttpBody, HttpHeaders};
use service_callout::{CalloutServer, ExtProcHandler};

struct BasicCallout;

#[tonic::async_trait]
impl ExtProcHandler for BasicCallout {
    async fn on_request_headers(&self, _headers: &HttpHeaders) -> Result<HookResponse, Status> {
        Ok(HookResponse::Headers(add_header_mutation(
            &[("header-request", "request")],
            &["foo"],
            true,
            None,
        )))
    }

    async fn on_response_headers(&self, _headers: &HttpHeaders) -> Result<HookResponse, Status> {
        Ok(HookResponse::Headers(add_header_mutation(
            &[("header-response", "response")],
            &[],
            false,
            None,
        )))
    }

    async fn on_request_body(&self, _body: &HttpBody) -> Result<HookResponse, Status> {
        Ok(HookResponse::Body(add_body_mutation(
            Some("-added-body"),
            false,
            false,
        )))
    }

    async fn on_response_body(&self, _body: &HttpBody) -> Result<HookResponse, Status> {
        Ok(HookResponse::Body(add_body_mutation(
            Some("new-body"),
            true,
            false,
        )))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let config = ServerArgs::parse().to_config()?;
    CalloutServer::ext_proc(config, BasicCallout).run()?;
    Ok(())
}
