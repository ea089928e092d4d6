use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::metrics::{ATTEMPT_ACTIONS_TOTAL, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

const UNMATCHED_ROUTE: &str = "unmatched";

/// Records request count and latency per route template, plus a per-action
/// counter for the attempt endpoint.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let action = attempt_action_label(&route, req.uri().query());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &route, &status])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &route])
        .observe(start.elapsed().as_secs_f64());

    if let Some(action) = action {
        ATTEMPT_ACTIONS_TOTAL
            .with_label_values(&[action, &status])
            .inc();
    }

    response
}

/// Known action names only; anything else is folded into `other`.
fn attempt_action_label(route: &str, query: Option<&str>) -> Option<&'static str> {
    if !route.starts_with("/api/v1/attempts") {
        return None;
    }
    let raw = query
        .unwrap_or("")
        .split('&')
        .find_map(|pair| pair.strip_prefix("action="))
        .unwrap_or("");

    Some(match raw {
        "" | "state" => "state",
        "save" => "save",
        "optimized_save" => "optimized_save",
        "resolve_conflict" => "resolve_conflict",
        "force_sync" => "force_sync",
        "realtime" => "realtime",
        "batch" => "batch",
        "activity" => "activity",
        "submit" => "submit",
        _ => "other",
    })
}
