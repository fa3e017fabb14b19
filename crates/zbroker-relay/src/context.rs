//! Correlation context carried in request headers
//!
//! The first hop without a request id mints one; every later hop propagates
//! it unchanged. The context is used for logging only, never for routing.

use http::{HeaderMap, HeaderValue};
use uuid::Uuid;

/// Request id header
pub const REQUEST_ID_HEADER: &str = "snyk-request-id";
/// Acting organization header
pub const ACTING_ORG_HEADER: &str = "snyk-acting-org-public-id";
/// Acting group header
pub const ACTING_GROUP_HEADER: &str = "snyk-acting-group-public-id";
/// Acting user header
pub const ACTING_USER_HEADER: &str = "snyk-acting-user-public-id";
/// Product line header
pub const PRODUCT_LINE_HEADER: &str = "snyk-product-line";
/// Flow name header
pub const FLOW_HEADER: &str = "snyk-flow-name";
/// Project type header
pub const PROJECT_TYPE_HEADER: &str = "snyk-project-type";
/// Integration type header
pub const INTEGRATION_TYPE_HEADER: &str = "snyk-integration-type";

/// Headers dropped from outbound calls; the request id is kept
const ACTING_HEADERS: [&str; 7] = [
    ACTING_ORG_HEADER,
    ACTING_GROUP_HEADER,
    ACTING_USER_HEADER,
    PRODUCT_LINE_HEADER,
    FLOW_HEADER,
    PROJECT_TYPE_HEADER,
    INTEGRATION_TYPE_HEADER,
];

/// Correlation fields of one relayed request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    /// Request id, joined with `,` if the header repeats
    pub request_id: String,
    /// Acting organization
    pub acting_org_id: Option<String>,
    /// Acting group
    pub acting_group_id: Option<String>,
    /// Product line
    pub product_line: Option<String>,
    /// Flow name
    pub flow: Option<String>,
}

impl CorrelationContext {
    /// Read the context, minting and inserting a request id when absent
    #[must_use]
    pub fn ensure(headers: &mut HeaderMap) -> Self {
        if !headers.contains_key(REQUEST_ID_HEADER) {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                headers.insert(REQUEST_ID_HEADER, value);
            }
        }
        Self::from_headers(headers)
    }

    /// Read the context without modifying the headers
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = headers
            .get_all(REQUEST_ID_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");

        Self {
            request_id,
            acting_org_id: header_string(headers, ACTING_ORG_HEADER),
            acting_group_id: header_string(headers, ACTING_GROUP_HEADER),
            product_line: header_string(headers, PRODUCT_LINE_HEADER),
            flow: header_string(headers, FLOW_HEADER),
        }
    }

    /// Remove the acting, product and integration headers, keeping the
    /// request id
    pub fn strip_acting_headers(headers: &mut HeaderMap) {
        for name in ACTING_HEADERS {
            headers.remove(name);
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_mints_request_id_once() {
        let mut headers = HeaderMap::new();
        let first = CorrelationContext::ensure(&mut headers);
        assert_eq!(first.request_id.len(), 36);

        let second = CorrelationContext::ensure(&mut headers);
        assert_eq!(first.request_id, second.request_id);
    }

    #[test]
    fn test_propagates_existing_fields() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));
        headers.append(REQUEST_ID_HEADER, HeaderValue::from_static("req-2"));
        headers.insert(ACTING_ORG_HEADER, HeaderValue::from_static("org"));
        headers.insert(FLOW_HEADER, HeaderValue::from_static("scan"));

        let ctx = CorrelationContext::ensure(&mut headers);
        assert_eq!(ctx.request_id, "req-1,req-2");
        assert_eq!(ctx.acting_org_id.as_deref(), Some("org"));
        assert_eq!(ctx.flow.as_deref(), Some("scan"));
        assert!(ctx.product_line.is_none());

        headers.insert(ACTING_USER_HEADER, HeaderValue::from_static("user"));
        headers.insert(INTEGRATION_TYPE_HEADER, HeaderValue::from_static("github"));
        CorrelationContext::strip_acting_headers(&mut headers);
        assert!(headers.contains_key(REQUEST_ID_HEADER));
        for name in ACTING_HEADERS {
            assert!(!headers.contains_key(name), "{name} kept");
        }
    }
}
