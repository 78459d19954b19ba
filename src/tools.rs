//! Response-construction helpers shared by the callout dispatchers.
//!
//! These are pure builders over the generated Envoy wire types: header and
//! body mutations, immediate responses, deny statuses, and a couple of
//! predicates for inspecting incoming callouts. Header values are always
//! transmitted as raw bytes.

use tonic::Status;
use tracing::warn;

use crate::protos::envoy;

pub type HeaderValue = envoy::config::core::v3::HeaderValue;
pub type HeaderValueOption = envoy::config::core::v3::HeaderValueOption;
pub type HeaderAppendAction = envoy::config::core::v3::header_value_option::HeaderAppendAction;

pub type HttpHeaders = envoy::service::ext_proc::v3::HttpHeaders;
pub type HttpBody = envoy::service::ext_proc::v3::HttpBody;
pub type HeaderMutation = envoy::service::ext_proc::v3::HeaderMutation;
pub type HeadersResponse = envoy::service::ext_proc::v3::HeadersResponse;
pub type BodyResponse = envoy::service::ext_proc::v3::BodyResponse;
pub type CommonResponse = envoy::service::ext_proc::v3::CommonResponse;
pub type BodyMutation = envoy::service::ext_proc::v3::BodyMutation;
pub type ImmediateResponse = envoy::service::ext_proc::v3::ImmediateResponse;
pub type StatusCode = envoy::r#type::v3::StatusCode;

use envoy::service::ext_proc::v3::body_mutation;

fn header_option(key: &str, value: &str, append_action: Option<HeaderAppendAction>) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value: String::new(),
            raw_value: value.as_bytes().to_vec(),
        }),
        append_action: append_action.map(|a| a as i32).unwrap_or_default(),
        ..Default::default()
    }
}

fn header_mutation(
    add: &[(&str, &str)],
    remove: &[&str],
    append_action: Option<HeaderAppendAction>,
) -> HeaderMutation {
    let mut remove_headers: Vec<String> = Vec::with_capacity(remove.len());
    for key in remove {
        if !remove_headers.iter().any(|k| k == key) {
            remove_headers.push((*key).to_string());
        }
    }
    HeaderMutation {
        set_headers: add
            .iter()
            .map(|(k, v)| header_option(k, v, append_action))
            .collect(),
        remove_headers,
    }
}

/// Build a `HeadersResponse` that adds and removes headers.
///
/// `add` order is preserved on the wire; `remove` entries are de-duplicated.
pub fn add_header_mutation(
    add: &[(&str, &str)],
    remove: &[&str],
    clear_route_cache: bool,
    append_action: Option<HeaderAppendAction>,
) -> HeadersResponse {
    HeadersResponse {
        response: Some(CommonResponse {
            header_mutation: Some(header_mutation(add, remove, append_action)),
            clear_route_cache,
            ..Default::default()
        }),
    }
}

/// Build a `BodyResponse` replacing or clearing the callout body.
///
/// `body` and `clear_body` are mutually exclusive; when both are given the
/// replacement body wins and a warning is logged. With neither, the body
/// passes through unmodified.
pub fn add_body_mutation(
    body: Option<&str>,
    clear_body: bool,
    clear_route_cache: bool,
) -> BodyResponse {
    let mutation = match body {
        Some(body) => {
            if clear_body {
                warn!("body and clear_body are mutually exclusive, body wins");
            }
            Some(body_mutation::Mutation::Body(body.as_bytes().to_vec()))
        }
        None => Some(body_mutation::Mutation::ClearBody(clear_body)),
    };
    BodyResponse {
        response: Some(CommonResponse {
            body_mutation: Some(BodyMutation { mutation }),
            clear_route_cache,
            ..Default::default()
        }),
    }
}

/// Build an `ImmediateResponse` carrying an HTTP status and headers.
///
/// Immediate responses short-circuit the proxied transaction; they are only
/// honored from the request-headers and request-body hooks.
pub fn header_immediate_response(
    code: StatusCode,
    headers: &[(&str, &str)],
    append_action: Option<HeaderAppendAction>,
) -> ImmediateResponse {
    ImmediateResponse {
        status: Some(envoy::r#type::v3::HttpStatus { code: code as i32 }),
        headers: (!headers.is_empty()).then(|| header_mutation(headers, &[], append_action)),
        ..Default::default()
    }
}

/// Status terminating the current RPC with permission-denied.
///
/// Returning this as the `Err` of a hook ends the stream; no further
/// responses are produced on it.
pub fn deny_callout(msg: Option<&str>) -> Status {
    let msg = msg.unwrap_or("Callout DENIED.");
    warn!("{msg}");
    Status::permission_denied(msg)
}

/// Check the headers for a matching key, and optionally a matching value.
pub fn headers_contain(headers: &HttpHeaders, key: &str, value: Option<&str>) -> bool {
    let Some(map) = &headers.headers else {
        return false;
    };
    map.headers.iter().any(|header| {
        header.key == key
            && value.is_none_or(|v| {
                header.value == v || header.raw_value == v.as_bytes()
            })
    })
}

/// First value for `key`, regardless of whether the sender used the string
/// or raw-bytes representation. Keys compare ASCII-case-insensitively.
pub fn header_value(headers: &HttpHeaders, key: &str) -> Option<String> {
    let map = headers.headers.as_ref()?;
    for header in &map.headers {
        if header.key.eq_ignore_ascii_case(key) {
            if !header.value.is_empty() {
                return Some(header.value.clone());
            }
            if !header.raw_value.is_empty() {
                return Some(String::from_utf8_lossy(&header.raw_value).to_string());
            }
            return Some(String::new());
        }
    }
    None
}

/// Check the body for the presence of a substring.
pub fn body_contains(body: &HttpBody, needle: &str) -> bool {
    String::from_utf8_lossy(&body.body).contains(needle)
}

/// Build the dynamic-forwarding metadata struct selecting an upstream
/// endpoint; attached to a `ProcessingResponse.dynamic_metadata` it routes
/// the transaction to `ip:port`.
pub fn build_dynamic_forwarding_metadata(ip_address: &str, port_number: u16) -> prost_types::Struct {
    let endpoint = prost_types::Struct {
        fields: [(
            "primary".to_string(),
            prost_types::Value {
                kind: Some(prost_types::value::Kind::StringValue(format!(
                    "{ip_address}:{port_number}"
                ))),
            },
        )]
        .into_iter()
        .collect(),
    };
    prost_types::Struct {
        fields: [(
            "com.google.envoy.dynamic_forwarding.selected_endpoints".to_string(),
            prost_types::Value {
                kind: Some(prost_types::value::Kind::StructValue(endpoint)),
            },
        )]
        .into_iter()
        .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(entries: &[(&str, &str)]) -> HttpHeaders {
        HttpHeaders {
            headers: Some(envoy::config::core::v3::HeaderMap {
                headers: entries
                    .iter()
                    .map(|(k, v)| HeaderValue {
                        key: k.to_string(),
                        value: String::new(),
                        raw_value: v.as_bytes().to_vec(),
                    })
                    .collect(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn header_mutation_preserves_order_and_raw_values() {
        let resp = add_header_mutation(
            &[("header-request", "request"), ("second", "2")],
            &["foo", "foo", "bar"],
            true,
            None,
        );
        let common = resp.response.unwrap();
        assert!(common.clear_route_cache);
        let mutation = common.header_mutation.unwrap();
        let keys: Vec<_> = mutation
            .set_headers
            .iter()
            .map(|o| o.header.as_ref().unwrap().key.clone())
            .collect();
        assert_eq!(keys, ["header-request", "second"]);
        assert_eq!(
            mutation.set_headers[0].header.as_ref().unwrap().raw_value,
            b"request"
        );
        assert_eq!(mutation.remove_headers, ["foo", "bar"]);
    }

    #[test]
    fn header_mutation_carries_append_action() {
        let resp = add_header_mutation(
            &[("k", "v")],
            &[],
            false,
            Some(HeaderAppendAction::OverwriteIfExistsOrAdd),
        );
        let mutation = resp.response.unwrap().header_mutation.unwrap();
        assert_eq!(
            mutation.set_headers[0].append_action,
            HeaderAppendAction::OverwriteIfExistsOrAdd as i32
        );
    }

    #[test]
    fn body_wins_over_clear_body() {
        let resp = add_body_mutation(Some("new-body"), true, false);
        let mutation = resp.response.unwrap().body_mutation.unwrap();
        match mutation.mutation.unwrap() {
            body_mutation::Mutation::Body(body) => assert_eq!(body, b"new-body"),
            other => panic!("expected body mutation, got {other:?}"),
        }
    }

    #[test]
    fn clear_body_alone_is_preserved() {
        let resp = add_body_mutation(None, true, true);
        let common = resp.response.unwrap();
        assert!(common.clear_route_cache);
        match common.body_mutation.unwrap().mutation.unwrap() {
            body_mutation::Mutation::ClearBody(cleared) => assert!(cleared),
            other => panic!("expected clear_body, got {other:?}"),
        }
    }

    #[test]
    fn immediate_response_has_status_and_headers() {
        let resp = header_immediate_response(
            StatusCode::MovedPermanently,
            &[("Location", "http://service-extensions.com/redirect")],
            None,
        );
        assert_eq!(resp.status.unwrap().code, 301);
        let mutation = resp.headers.unwrap();
        assert_eq!(
            mutation.set_headers[0].header.as_ref().unwrap().key,
            "Location"
        );
    }

    #[test]
    fn deny_callout_is_permission_denied() {
        let status = deny_callout(Some("blocked"));
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(status.message(), "blocked");
    }

    #[test]
    fn header_predicates() {
        let headers = headers_with(&[("foo", "bar"), ("empty", "")]);
        assert!(headers_contain(&headers, "foo", None));
        assert!(headers_contain(&headers, "foo", Some("bar")));
        assert!(!headers_contain(&headers, "foo", Some("baz")));
        assert!(!headers_contain(&headers, "missing", None));
        assert_eq!(header_value(&headers, "FOO").as_deref(), Some("bar"));
        assert_eq!(header_value(&headers, "missing"), None);
    }

    #[test]
    fn body_predicate() {
        let body = HttpBody {
            body: b"initial-body".to_vec(),
            end_of_stream: true,
        };
        assert!(body_contains(&body, "initial"));
        assert!(!body_contains(&body, "other"));
    }

    #[test]
    fn dynamic_forwarding_metadata_shape() {
        let metadata = build_dynamic_forwarding_metadata("10.1.10.2", 80);
        let endpoints = metadata
            .fields
            .get("com.google.envoy.dynamic_forwarding.selected_endpoints")
            .unwrap();
        let Some(prost_types::value::Kind::StructValue(inner)) = &endpoints.kind else {
            panic!("expected struct value");
        };
        let Some(prost_types::value::Kind::StringValue(primary)) =
            &inner.fields.get("primary").unwrap().kind
        else {
            panic!("expected string value");
        };
        assert_eq!(primary, "10.1.10.2:80");
    }
}
