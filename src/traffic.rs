//! In-memory traffic log — the in-process metrics sink (§6.6).
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest
//! entry is evicted to make room for the newest. `push` is best-effort and
//! non-blocking, so recording a request never delays the response path.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Tier;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request. Best-effort: if the mutex is contended
    /// the entry is dropped rather than blocking the request path (§5).
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_response_time_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.response_time_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let escalation_count = entries.iter().filter(|e| e.escalated).count();
        let dry_run_count = entries.iter().filter(|e| e.dry_run).count();

        let mut tier_counts: std::collections::HashMap<Tier, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *tier_counts.entry(entry.tier).or_default() += 1;
        }

        let total_actual_cost_usd: f64 = entries.iter().map(|e| e.actual_cost_usd).sum();
        let total_savings_usd: f64 = entries.iter().map(|e| e.savings_usd).sum();

        TrafficStats {
            total_requests: total,
            error_count,
            escalation_count,
            dry_run_count,
            avg_response_time_ms,
            tier_counts,
            total_actual_cost_usd,
            total_savings_usd,
        }
    }
}

/// A single routed request record (§6.6's metrics-sink field list).
#[derive(Debug, Clone, Serialize)]
pub struct TrafficEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,

    pub original_model: String,
    pub routed_model: String,
    pub actual_model: String,

    pub tier: Tier,
    pub classification_reason: &'static str,
    pub classification_confidence: f64,

    pub input_tokens: u64,
    pub output_tokens: u64,

    pub original_cost_usd: f64,
    pub actual_cost_usd: f64,
    pub savings_usd: f64,

    pub escalated: bool,
    pub escalation_chain: Vec<String>,

    pub response_time_ms: u64,
    pub had_tool_calls: bool,
    pub dry_run: bool,
    pub overridden: bool,

    pub success: bool,
    pub error: Option<String>,
}

impl TrafficEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(original_model: String, routed_model: String, tier: Tier, classification_reason: &'static str, classification_confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: None,
            actual_model: routed_model.clone(),
            original_model,
            routed_model,
            tier,
            classification_reason,
            classification_confidence,
            input_tokens: 0,
            output_tokens: 0,
            original_cost_usd: 0.0,
            actual_cost_usd: 0.0,
            savings_usd: 0.0,
            escalated: false,
            escalation_chain: Vec::new(),
            response_time_ms: 0,
            had_tool_calls: false,
            dry_run: false,
            overridden: false,
            success: true,
            error: None,
        }
    }

    pub fn with_session_id(mut self, id: Option<String>) -> Self {
        self.session_id = id;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_overridden(mut self, overridden: bool) -> Self {
        self.overridden = overridden;
        self
    }

    pub fn mark_escalated(mut self, to_model: &str) -> Self {
        self.escalated = true;
        self.escalation_chain.push(to_model.to_string());
        self.actual_model = to_model.to_string();
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.success = false;
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub escalation_count: usize,
    pub dry_run_count: usize,
    pub avg_response_time_ms: f64,
    pub tier_counts: std::collections::HashMap<Tier, usize>,
    pub total_actual_cost_usd: f64,
    pub total_savings_usd: f64,
}
