//! Ext-authz callout server implementing IP-based access control.
//!
//! The client IP is taken from the first entry of `x-forwarded-for`.
//! Requests from the blocked range (and requests with a missing or invalid
//! client IP) are denied with 403 and an `x-client-ip-allowed: false`
//! header; everything else is allowed.
//!
//! CLI:
//!   cargo run --bin block_ip -- --plaintext-address 0.0.0.0:8080

use std::net::IpAddr;

use clap::Parser;
use ipnet::IpNet;
use tonic::Status;
use tracing::info;

use service_callout::cli::{init_logging, ServerArgs};
use service_callout::extauthz::{allow_request, deny_request, request_header, CheckRequest, CheckResponse};
use service_callout::tools::StatusCode;
use service_callout::{AuthzHandler, CalloutServer};

struct BlockIp {
    blocked_range: IpNet,
}

impl Default for BlockIp {
    fn default() -> Self {
        Self {
            blocked_range: "10.0.0.0/24".parse().unwrap(),
        }
    }
}

impl BlockIp {
    fn client_ip(request: &CheckRequest) -> Option<IpAddr> {
        let forwarded = request_header(request, "x-forwarded-for")?;
        let first = forwarded.split(',').next()?.trim();
        first.parse().ok()
    }

    fn denied() -> CheckResponse {
        deny_request(
            StatusCode::Forbidden,
            None,
            &[("x-client-ip-allowed", "false")],
        )
    }
}

#[tonic::async_trait]
impl AuthzHandler for BlockIp {
    async fn on_check(&self, request: &CheckRequest) -> Result<CheckResponse, Status> {
        let Some(client_ip) = Self::client_ip(request) else {
            info!("request denied: could not extract a valid client IP");
            return Ok(Self::denied());
        };
        if self.blocked_range.contains(&client_ip) {
            info!("request denied for blocked IP: {client_ip}");
            return Ok(Self::denied());
        }
        Ok(allow_request(&[("x-client-ip-allowed", "true")]))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let config = ServerArgs::parse().to_config()?;
    CalloutServer::ext_authz(config, BlockIp::default()).run()?;
    Ok(())
}
