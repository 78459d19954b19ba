//! Ext-authz dispatcher: routes the Envoy `Authorization.Check` unary RPC to
//! a user hook and builds the allow/deny response.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tonic::{Request, Response, Status};
use tracing::error;

use crate::protos::envoy;
use crate::protos::google;
use crate::tools::StatusCode;

pub type CheckRequest = envoy::service::auth::v3::CheckRequest;
pub type CheckResponse = envoy::service::auth::v3::CheckResponse;
pub type OkHttpResponse = envoy::service::auth::v3::OkHttpResponse;
pub type DeniedHttpResponse = envoy::service::auth::v3::DeniedHttpResponse;

use envoy::service::auth::v3::authorization_server::Authorization;
pub use envoy::service::auth::v3::authorization_server::AuthorizationServer;
use envoy::service::auth::v3::check_response::HttpResponse;

/// Authorization hook. The default allows every request.
///
/// Implementations may be invoked from many RPCs concurrently and must be
/// re-entrant.
#[tonic::async_trait]
pub trait AuthzHandler: Send + Sync + 'static {
    async fn on_check(&self, _request: &CheckRequest) -> Result<CheckResponse, Status> {
        Ok(allow_request(&[]))
    }
}

/// Allow the request, optionally adding headers on the upstream request.
pub fn allow_request(headers_to_add: &[(&str, &str)]) -> CheckResponse {
    CheckResponse {
        status: Some(google::rpc::Status::default()),
        http_response: Some(HttpResponse::OkResponse(OkHttpResponse {
            headers: headers_to_add
                .iter()
                .map(|(k, v)| header_option(k, v))
                .collect(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Deny the request with an HTTP status, optional body, and headers on the
/// synthetic response.
pub fn deny_request(
    status_code: StatusCode,
    body: Option<&str>,
    headers: &[(&str, &str)],
) -> CheckResponse {
    CheckResponse {
        http_response: Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: Some(envoy::r#type::v3::HttpStatus {
                code: status_code as i32,
            }),
            body: body.unwrap_or_default().to_string(),
            headers: headers.iter().map(|(k, v)| header_option(k, v)).collect(),
        })),
        ..Default::default()
    }
}

fn header_option(key: &str, value: &str) -> envoy::config::core::v3::HeaderValueOption {
    envoy::config::core::v3::HeaderValueOption {
        header: Some(envoy::config::core::v3::HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            raw_value: Vec::new(),
        }),
        ..Default::default()
    }
}

/// First value of a named request header.
///
/// Envoy populates request headers either as the newer `header_map` list or
/// the historical map form (or both); both representations are accepted.
/// Keys compare ASCII-case-insensitively.
pub fn request_header(request: &CheckRequest, name: &str) -> Option<String> {
    let http = request.attributes.as_ref()?.request.as_ref()?.http.as_ref()?;

    if let Some(header_map) = &http.header_map {
        for header in &header_map.headers {
            if header.key.eq_ignore_ascii_case(name) {
                if !header.raw_value.is_empty() {
                    return Some(String::from_utf8_lossy(&header.raw_value).to_string());
                }
                return Some(header.value.clone());
            }
        }
    }

    http.headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

/// gRPC service adapter wrapping an [`AuthzHandler`].
pub struct AuthzService<H> {
    handler: Arc<H>,
}

impl<H> AuthzService<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for AuthzService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

#[tonic::async_trait]
impl<H: AuthzHandler> Authorization for AuthzService<H> {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let request = request.into_inner();
        let outcome = AssertUnwindSafe(self.handler.on_check(&request))
            .catch_unwind()
            .await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(status)) => {
                // A failing hook denies rather than failing the RPC.
                error!("authorization hook failed: {status}");
                deny_request(StatusCode::InternalServerError, None, &[])
            }
            Err(_) => {
                error!("authorization hook panicked");
                deny_request(StatusCode::InternalServerError, None, &[])
            }
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protos::envoy::config::core::v3::{HeaderMap, HeaderValue};
    use crate::protos::envoy::service::auth::v3::attribute_context;
    use crate::protos::envoy::service::auth::v3::AttributeContext;

    fn check_request_with_headers(
        map_entries: &[(&str, &str)],
        list_entries: &[(&str, &str)],
    ) -> CheckRequest {
        let header_map = (!list_entries.is_empty()).then(|| HeaderMap {
            headers: list_entries
                .iter()
                .map(|(k, v)| HeaderValue {
                    key: k.to_string(),
                    value: String::new(),
                    raw_value: v.as_bytes().to_vec(),
                })
                .collect(),
        });
        CheckRequest {
            attributes: Some(AttributeContext {
                request: Some(attribute_context::Request {
                    http: Some(attribute_context::HttpRequest {
                        headers: map_entries
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                        header_map,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn reads_header_from_list_form() {
        let request = check_request_with_headers(&[], &[("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(
            request_header(&request, "X-Forwarded-For").as_deref(),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn reads_header_from_map_form() {
        let request = check_request_with_headers(&[("x-forwarded-for", "192.168.1.1")], &[]);
        assert_eq!(
            request_header(&request, "x-forwarded-for").as_deref(),
            Some("192.168.1.1")
        );
    }

    #[test]
    fn list_form_wins_when_both_present() {
        let request = check_request_with_headers(
            &[("x-forwarded-for", "from-map")],
            &[("x-forwarded-for", "from-list")],
        );
        assert_eq!(
            request_header(&request, "x-forwarded-for").as_deref(),
            Some("from-list")
        );
    }

    #[test]
    fn missing_header_is_none() {
        let request = check_request_with_headers(&[], &[]);
        assert_eq!(request_header(&request, "authorization"), None);
    }

    #[test]
    fn allow_and_deny_are_mutually_exclusive_variants() {
        let ok = allow_request(&[("x-validated", "true")]);
        let Some(HttpResponse::OkResponse(ok_response)) = ok.http_response else {
            panic!("expected ok response");
        };
        assert_eq!(ok_response.headers[0].header.as_ref().unwrap().key, "x-validated");
        assert_eq!(ok.status.unwrap().code, 0);

        let denied = deny_request(StatusCode::Forbidden, Some("blocked"), &[("x-why", "ip")]);
        let Some(HttpResponse::DeniedResponse(denied_response)) = denied.http_response else {
            panic!("expected denied response");
        };
        assert_eq!(denied_response.status.unwrap().code, 403);
        assert_eq!(denied_response.body, "blocked");
    }

    struct DefaultHandler;
    impl AuthzHandler for DefaultHandler {}

    #[tokio::test]
    async fn default_hook_allows() {
        let service = AuthzService::new(DefaultHandler);
        let response = service
            .check(Request::new(CheckRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(
            response.http_response,
            Some(HttpResponse::OkResponse(_))
        ));
    }

    struct FailingHandler;
    #[tonic::async_trait]
    impl AuthzHandler for FailingHandler {
        async fn on_check(&self, _: &CheckRequest) -> Result<CheckResponse, Status> {
            Err(Status::internal("backend exploded"))
        }
    }

    #[tokio::test]
    async fn hook_failure_becomes_denied_500() {
        let service = AuthzService::new(FailingHandler);
        let response = service
            .check(Request::new(CheckRequest::default()))
            .await
            .unwrap()
            .into_inner();
        let Some(HttpResponse::DeniedResponse(denied)) = response.http_response else {
            panic!("expected denied response");
        };
        assert_eq!(denied.status.unwrap().code, 500);
    }
}
