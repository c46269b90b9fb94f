use std::time::Duration;

use chrono::{DateTime, Utc};
use dealflow_models::config::OptimizerConfig;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadEntry {
    pub agent_type: String,
    /// 0.0 (idle) to 1.0 (saturated).
    pub load: f64,
    pub updated_at: DateTime<Utc>,
}

/// Proposal to move work from a busier agent to a quieter one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecommendation {
    pub from_agent: String,
    pub to_agent: String,
    pub from_load: f64,
    pub to_load: f64,
    /// Share of load to move so both ends meet in the middle.
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoadStatistics {
    pub total_agents: usize,
    pub average_load: f64,
    pub max_load: f64,
    pub min_load: f64,
    pub rebalancing_needed: bool,
}

/// Per-agent load table backed by moka.
///
/// Entries expire after the configured TTL, so agents that stop reporting
/// drop out of rebalancing decisions.
pub struct LoadBalancer {
    loads: Cache<String, LoadEntry>,
    ttl: Duration,
    margin: f64,
}

impl LoadBalancer {
    pub fn new(config: &OptimizerConfig) -> Self {
        let ttl = config.load_entry_ttl();
        Self {
            loads: Cache::builder()
                .max_capacity(config.max_tracked_agents)
                .time_to_live(ttl)
                .build(),
            ttl,
            margin: config.rebalance_margin,
        }
    }

    /// Record an agent's load. Values are clamped to `[0, 1]`; non-finite
    /// readings count as idle.
    pub async fn update_agent_load(&self, agent_type: &str, load: f64) {
        let load = if load.is_finite() {
            load.clamp(0.0, 1.0)
        } else {
            0.0
        };
        debug!(agent = agent_type, load, "Agent load updated");
        self.loads
            .insert(
                agent_type.to_string(),
                LoadEntry {
                    agent_type: agent_type.to_string(),
                    load,
                    updated_at: Utc::now(),
                },
            )
            .await;
    }

    pub async fn get_agent_load(&self, agent_type: &str) -> Option<f64> {
        self.loads.get(agent_type).await.map(|e| e.load)
    }

    pub async fn remove_agent(&self, agent_type: &str) {
        self.loads.invalidate(agent_type).await;
    }

    /// Live entries, busiest first.
    pub fn entries(&self) -> Vec<LoadEntry> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut entries: Vec<LoadEntry> = self
            .loads
            .iter()
            .map(|(_, entry)| entry)
            .filter(|entry| now.signed_duration_since(entry.updated_at) < ttl)
            .collect();
        entries.sort_by(|a, b| {
            b.load
                .total_cmp(&a.load)
                .then_with(|| a.agent_type.cmp(&b.agent_type))
        });
        entries
    }

    pub fn should_rebalance(&self) -> bool {
        let entries = self.entries();
        match (entries.first(), entries.last()) {
            (Some(max), Some(min)) if entries.len() >= 2 => max.load - min.load > self.margin,
            _ => false,
        }
    }

    /// Pair the busiest agents with the quietest ones while their spread
    /// exceeds the margin. Every pair has `from_load > to_load`.
    pub fn get_rebalancing_recommendations(&self) -> Vec<RebalanceRecommendation> {
        let entries = self.entries();
        let mut recommendations = Vec::new();
        if entries.len() < 2 {
            return recommendations;
        }

        let (mut hi, mut lo) = (0, entries.len() - 1);
        while hi < lo {
            let (from, to) = (&entries[hi], &entries[lo]);
            let spread = from.load - to.load;
            if spread <= self.margin {
                break;
            }
            recommendations.push(RebalanceRecommendation {
                from_agent: from.agent_type.clone(),
                to_agent: to.agent_type.clone(),
                from_load: from.load,
                to_load: to.load,
                amount: spread / 2.0,
            });
            hi += 1;
            lo -= 1;
        }
        recommendations
    }

    /// Candidate with the lowest recorded load. Unknown agents count as idle;
    /// ties go to the earlier candidate.
    pub async fn get_least_loaded_agent(&self, candidates: &[String]) -> Option<String> {
        let mut best: Option<(&String, f64)> = None;
        for candidate in candidates {
            let load = self.get_agent_load(candidate).await.unwrap_or(0.0);
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((candidate, load));
            }
        }
        best.map(|(agent, _)| agent.clone())
    }

    pub fn get_load_statistics(&self) -> LoadStatistics {
        let entries = self.entries();
        if entries.is_empty() {
            return LoadStatistics::default();
        }
        let total_agents = entries.len();
        let sum: f64 = entries.iter().map(|e| e.load).sum();
        let max_load = entries[0].load;
        let min_load = entries[total_agents - 1].load;
        LoadStatistics {
            total_agents,
            average_load: sum / total_agents as f64,
            max_load,
            min_load,
            rebalancing_needed: total_agents >= 2 && max_load - min_load > self.margin,
        }
    }
}
