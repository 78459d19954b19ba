//! Redirect ext-proc callout server.
//!
//! Answers every request-headers callout with an immediate 301 response
//! pointing at `http://service-extensions.com/redirect`; the proxy stops
//! processing and returns the synthetic redirect to the client.
//!
//! CLI:
//!   cargo run --bin redirect -- --plaintext-address 0.0.0.0:8080

use clap::Parser;
use tonic::Status;

use service_callout::cli::{init_logging, ServerArgs};
use service_callout::extproc::HookResponse;
use service_callout::tools::{header_immediate_response, HttpHeaders, StatusCode};
use service_callout::{CalloutServer, ExtProcHandler};

struct Redirect;

#[tonic::async_trait]
impl ExtProcHandler for Redirect {
    async fn on_request_headers(&self, _headers: &HttpHeaders) -> Result<HookResponse, Status> {
        Ok(HookResponse::Immediate(header_immediate_response(
            StatusCode::MovedPermanently,
            &[("Location", "http://service-extensions.com/redirect")],
            None,
        )))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let config = ServerArgs::parse().to_config()?;
    CalloutServer::ext_proc(config, Redirect).run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redirects_with_location_header() {
        let response = Redirect
            .on_request_headers(&HttpHeaders::default())
            .await
            .unwrap();
        let HookResponse::Immediate(immediate) = response else {
            panic!("expected immediate response");
        };
        assert_eq!(immediate.status.unwrap().code, 301);
        let header = &immediate.headers.unwrap().set_headers[0];
        assert_eq!(header.header.as_ref().unwrap().key, "Location");
        assert_eq!(
            header.header.as_ref().unwrap().raw_value,
            b"http://service-extensions.com/redirect"
        );
    }
}
