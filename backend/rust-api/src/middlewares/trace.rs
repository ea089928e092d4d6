use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
const MAX_TRACE_ID_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct RequestTraceContext {
    pub trace_id: String,
}

/// Client-supplied IDs end up in logs, so only short printable tokens are kept.
fn accept_trace_id(raw: &str) -> Option<String> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_TRACE_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    valid.then(|| raw.to_string())
}

/// Propagates `x-trace-id` (or mints one) so attempt actions can be correlated
/// across client retries, logs and responses.
pub async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(accept_trace_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestTraceContext {
        trace_id: trace_id.clone(),
    });

    let span = tracing::debug_span!("request", trace_id = %trace_id);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_ID_HEADER), value);
    }

    response
}
