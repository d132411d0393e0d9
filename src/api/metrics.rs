//! Prometheus-compatible `/metrics` endpoint.
//!
//! All metrics are derived from the in-memory ring-buffer window. Because the
//! buffer has a fixed capacity, values represent a **sliding window** of recent
//! requests rather than lifetime counters. Use `TYPE gauge` throughout for
//! semantic accuracy — values may decrease as old entries rotate out.
//!
//! Metric families:
//! - `clawroute_window_size`       — entries currently in the ring buffer
//! - `clawroute_requests`          — per-tier/model/outcome request counts
//! - `clawroute_latency_ms_sum`    — sum of latencies per tier/model (for avg)
//! - `clawroute_latency_ms_count`  — denominator matching the sum above
//! - `clawroute_escalations_total` — requests that were escalated
//! - `clawroute_errors_total`      — requests that returned an error
//! - `clawroute_savings_usd_total` — cumulative savings in the window

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::router::RouterState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut escalations: u64 = 0;
    let mut errors: u64 = 0;
    let mut savings_usd = 0.0_f64;

    // (tier, actual_model, success) -> count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (tier, actual_model) -> (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.escalated {
            escalations += 1;
        }
        if !e.success {
            errors += 1;
        }
        savings_usd += e.savings_usd;

        let tier = e.tier.to_string();
        *request_counts.entry((tier.clone(), e.actual_model.clone(), e.success)).or_default() += 1;

        let lat = latency.entry((tier, e.actual_model.clone())).or_default();
        lat.0 += e.response_time_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP clawroute_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE clawroute_window_size gauge\n");
    out.push_str(&format!("clawroute_window_size {window_size}\n\n"));

    out.push_str("# HELP clawroute_requests Request count in the current window, labelled by tier, model, and outcome.\n");
    out.push_str("# TYPE clawroute_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model, success), count) in req_rows {
        out.push_str(&format!("clawroute_requests{{tier=\"{tier}\",model=\"{model}\",success=\"{success}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP clawroute_latency_ms_sum Sum of request latency (ms) in the current window, grouped by tier and model.\n");
    out.push_str("# TYPE clawroute_latency_ms_sum gauge\n");
    out.push_str("# HELP clawroute_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE clawroute_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model), (sum, count)) in lat_rows {
        out.push_str(&format!("clawroute_latency_ms_sum{{tier=\"{tier}\",model=\"{model}\"}} {sum}\n"));
        out.push_str(&format!("clawroute_latency_ms_count{{tier=\"{tier}\",model=\"{model}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP clawroute_escalations_total Requests escalated to a higher tier in the current window.\n");
    out.push_str("# TYPE clawroute_escalations_total gauge\n");
    out.push_str(&format!("clawroute_escalations_total {escalations}\n\n"));

    out.push_str("# HELP clawroute_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE clawroute_errors_total gauge\n");
    out.push_str(&format!("clawroute_errors_total {errors}\n\n"));

    out.push_str("# HELP clawroute_savings_usd_total Cumulative estimated savings (USD) in the current window.\n");
    out.push_str("# TYPE clawroute_savings_usd_total gauge\n");
    out.push_str(&format!("clawroute_savings_usd_total {savings_usd}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::Tier;
    use crate::traffic::{TrafficEntry, TrafficLog};

    fn mock_log() -> Arc<TrafficLog> {
        let log = Arc::new(TrafficLog::new(100));
        let mut a = TrafficEntry::new("gpt-4o".into(), "openai/gpt-4o-mini".into(), Tier::Simple, "simple_pattern", 0.9);
        a.response_time_ms = 120;
        log.push(a);
        let mut b = TrafficEntry::new("gpt-4o".into(), "openai/gpt-4o-mini".into(), Tier::Simple, "simple_pattern", 0.9);
        b.response_time_ms = 95;
        log.push(b);
        let mut c = TrafficEntry::new("gpt-4o".into(), "anthropic/claude-haiku-4-5".into(), Tier::Moderate, "default_moderate", 0.6);
        c.response_time_ms = 430;
        log.push(c);
        let mut d = TrafficEntry::new("gpt-4o".into(), "openai/gpt-4o-mini".into(), Tier::Simple, "simple_pattern", 0.9);
        d.response_time_ms = 80;
        d = d.with_error("upstream 500");
        log.push(d);
        log
    }

    #[tokio::test]
    async fn window_size_equals_entry_count() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        assert_eq!(entries.len(), 4);
    }

    #[tokio::test]
    async fn error_count_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let errors = entries.iter().filter(|e| !e.success).count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn latency_sum_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let sum: u64 = entries
            .iter()
            .filter(|e| e.tier == Tier::Simple && e.actual_model == "openai/gpt-4o-mini")
            .map(|e| e.response_time_ms)
            .sum();
        // 120 + 95 + 80 = 295
        assert_eq!(sum, 295);
    }
}
