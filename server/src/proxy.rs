use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::Response,
};
use url::Url;

/// Hop-by-hop headers are meaningful for one connection only.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_forwardable(name: &HeaderName) -> bool {
    name != "host" && !HOP_BY_HOP.contains(&name.as_str())
}

#[derive(Clone)]
struct Upstream {
    base: Url,
    client: reqwest::Client,
}

/// Router forwarding every request to `base`.
pub fn router(base: Url, client: reqwest::Client) -> Router {
    Router::new()
        .fallback(proxy)
        .with_state(Upstream { base, client })
}

async fn proxy(
    State(upstream): State<Upstream>,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: Body,
) -> Result<Response, StatusCode> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    let url = format!(
        "{}{}",
        upstream.base.as_str().trim_end_matches('/'),
        path_and_query
    );

    let mut request = upstream.client.request(method.clone(), &url);
    for (name, value) in headers.iter().filter(|(name, _)| is_forwardable(name)) {
        request = request.header(name, value);
    }

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if !body_bytes.is_empty() {
        request = request.body(body_bytes);
    }

    let resp = request.send().await.map_err(|e| {
        tracing::warn!(%method, url = %url, "upstream request failed: {}", e);
        StatusCode::BAD_GATEWAY
    })?;

    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let body_bytes = resp.bytes().await.map_err(|_| StatusCode::BAD_GATEWAY)?;

    let mut response = Response::builder().status(status);
    for (name, value) in resp_headers
        .iter()
        .filter(|(name, _)| is_forwardable(name) && *name != "content-length")
    {
        response = response.header(name, value);
    }
    response
        .body(Body::from(body_bytes))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_stay_behind() {
        assert!(!is_forwardable(&HeaderName::from_static("host")));
        assert!(!is_forwardable(&HeaderName::from_static("connection")));
        assert!(!is_forwardable(&HeaderName::from_static("transfer-encoding")));
        assert!(is_forwardable(&HeaderName::from_static("x-authenticated")));
        assert!(is_forwardable(&HeaderName::from_static("cookie")));
    }
}
