//! Load Balancer (C4, spec.md §4.4): given a set of eligible instances,
//! pick one per request. Two policies, selected per service.

use bridge_registry::InstanceEntry;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

pub trait LoadBalancer: Send + Sync {
    /// `routing_key` is only consulted by policies that use it
    /// (consistent hashing); ignored by P2C.
    fn pick<'a>(
        &self,
        candidates: &'a [Arc<InstanceEntry>],
        routing_key: Option<&str>,
    ) -> Option<&'a Arc<InstanceEntry>>;
}

/// Weighted Power-of-Two-Choices (default policy, spec.md §4.4).
/// Samples two instances with probability proportional to `weight`,
/// picks the lower-scored one. O(1), bounds worst-case load deviation.
pub struct WeightedP2c {
    pub rtt_coefficient: f64,
    pub err_rate_coefficient: f64,
}

impl Default for WeightedP2c {
    fn default() -> Self {
        Self {
            rtt_coefficient: 0.5,
            err_rate_coefficient: 2.0,
        }
    }
}

impl WeightedP2c {
    fn score(&self, entry: &InstanceEntry, max_rtt: f64) -> f64 {
        let normalized_rtt = if max_rtt > 0.0 {
            entry.runtime.rtt_ewma() / max_rtt
        } else {
            0.0
        };
        entry.runtime.inflight() as f64
            + self.rtt_coefficient * normalized_rtt
            + self.err_rate_coefficient * entry.runtime.err_rate_ewma()
    }

    fn weighted_sample(&self, candidates: &[Arc<InstanceEntry>], exclude: Option<usize>) -> Option<usize> {
        let total_weight: f64 = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != exclude)
            .map(|(_, e)| e.instance.weight.max(0.0))
            .sum();
        if total_weight <= 0.0 {
            return candidates
                .iter()
                .enumerate()
                .find(|(i, _)| Some(*i) != exclude)
                .map(|(i, _)| i);
        }
        let mut target = rand::thread_rng().gen_range(0.0..total_weight);
        for (i, entry) in candidates.iter().enumerate() {
            if Some(i) == exclude {
                continue;
            }
            let w = entry.instance.weight.max(0.0);
            if target < w {
                return Some(i);
            }
            target -= w;
        }
        None
    }
}

impl LoadBalancer for WeightedP2c {
    fn pick<'a>(
        &self,
        candidates: &'a [Arc<InstanceEntry>],
        _routing_key: Option<&str>,
    ) -> Option<&'a Arc<InstanceEntry>> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return candidates.first();
        }
        let first = self.weighted_sample(candidates, None)?;
        let second = self
            .weighted_sample(candidates, Some(first))
            .unwrap_or(first);
        if first == second {
            return candidates.get(first);
        }
        let max_rtt = candidates
            .iter()
            .map(|e| e.runtime.rtt_ewma())
            .fold(0.0, f64::max);
        let score_first = self.score(&candidates[first], max_rtt);
        let score_second = self.score(&candidates[second], max_rtt);
        if score_first <= score_second {
            candidates.get(first)
        } else {
            candidates.get(second)
        }
    }
}

/// Consistent hashing with bounded load (spec.md §4.4). Used when the
/// caller requests sticky routing via a routing key.
pub struct ConsistentHashRing {
    pub virtual_nodes: u32,
    /// Overload factor c relative to mean inflight (default 1.25).
    pub overload_factor: f64,
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self {
            virtual_nodes: 160,
            overload_factor: 1.25,
        }
    }
}

fn ring_hash(key: &str, vnode: u32) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = twox_hash::XxHash64::with_seed(vnode as u64);
    key.hash(&mut hasher);
    hasher.finish()
}

impl LoadBalancer for ConsistentHashRing {
    fn pick<'a>(
        &self,
        candidates: &'a [Arc<InstanceEntry>],
        routing_key: Option<&str>,
    ) -> Option<&'a Arc<InstanceEntry>> {
        if candidates.is_empty() {
            return None;
        }
        let key = routing_key.unwrap_or("");
        if key.is_empty() {
            return candidates.choose(&mut rand::thread_rng());
        }

        let key_hash = {
            use std::hash::{Hash, Hasher};
            let mut hasher = twox_hash::XxHash64::with_seed(0);
            key.hash(&mut hasher);
            hasher.finish()
        };

        let mut ring: Vec<(u64, usize)> = Vec::with_capacity(candidates.len() * self.virtual_nodes as usize);
        for (idx, entry) in candidates.iter().enumerate() {
            for v in 0..self.virtual_nodes {
                ring.push((ring_hash(&entry.instance.instance_id, v), idx));
            }
        }
        ring.sort_unstable_by_key(|(h, _)| *h);

        let mean_inflight: f64 = candidates.iter().map(|e| e.runtime.inflight() as f64).sum::<f64>()
            / candidates.len() as f64;
        let overload_cap = (mean_inflight * self.overload_factor).max(1.0);

        let start = ring.partition_point(|(h, _)| *h < key_hash);
        for offset in 0..ring.len() {
            let (_, idx) = ring[(start + offset) % ring.len()];
            let entry = &candidates[idx];
            if (entry.runtime.inflight() as f64) < overload_cap {
                return Some(entry);
            }
        }
        // Every candidate is over the bound; fall back to the first ring hit.
        ring.first().map(|(_, idx)| &candidates[*idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::model::ServiceInstance;
    use bridge_registry::InstanceRuntime;

    fn entry(id: &str, weight: f64) -> Arc<InstanceEntry> {
        Arc::new(InstanceEntry {
            instance: ServiceInstance {
                instance_id: id.to_string(),
                endpoint: format!("127.0.0.1:{id}"),
                weight,
                tls_config: None,
            },
            runtime: InstanceRuntime::default(),
        })
    }

    #[test]
    fn p2c_picks_single_candidate_when_alone() {
        let lb = WeightedP2c::default();
        let candidates = vec![entry("a", 1.0)];
        let picked = lb.pick(&candidates, None).unwrap();
        assert_eq!(picked.instance.instance_id, "a");
    }

    #[test]
    fn p2c_prefers_lower_inflight() {
        let lb = WeightedP2c::default();
        let busy = entry("busy", 1.0);
        let idle = entry("idle", 1.0);
        for _ in 0..10 {
            busy.runtime.inc_inflight();
        }
        let candidates = vec![busy, idle];
        let mut idle_wins = 0;
        for _ in 0..20 {
            if lb.pick(&candidates, None).unwrap().instance.instance_id == "idle" {
                idle_wins += 1;
            }
        }
        assert!(idle_wins > 0);
    }

    #[test]
    fn zero_weight_candidates_still_selectable() {
        let lb = WeightedP2c::default();
        let candidates = vec![entry("a", 0.0), entry("b", 0.0)];
        assert!(lb.pick(&candidates, None).is_some());
    }

    #[test]
    fn consistent_hash_is_stable_for_same_key() {
        let lb = ConsistentHashRing::default();
        let candidates: Vec<_> = (0..5).map(|i| entry(&i.to_string(), 1.0)).collect();
        let first = lb.pick(&candidates, Some("tenant-42")).unwrap().instance.instance_id.clone();
        for _ in 0..10 {
            let again = lb.pick(&candidates, Some("tenant-42")).unwrap();
            assert_eq!(again.instance.instance_id, first);
        }
    }

    #[test]
    fn consistent_hash_respects_overload_bound() {
        let lb = ConsistentHashRing {
            virtual_nodes: 160,
            overload_factor: 1.0,
        };
        let candidates: Vec<_> = (0..3).map(|i| entry(&i.to_string(), 1.0)).collect();
        // Drive one instance's inflight far above the mean.
        for _ in 0..100 {
            candidates[0].runtime.inc_inflight();
        }
        let picked = lb.pick(&candidates, Some("some-key")).unwrap();
        assert_ne!(picked.instance.instance_id, "0");
    }
}
