//! Weighted queue priority table
//!
//! Each poll draws a queue order by sampling without replacement, with
//! probability proportional to weight. Every queue with non-zero weight
//! appears in every order, so lower-weight queues are never starved once the
//! higher ones run dry. Strict mode always returns the weight-descending
//! order.

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePriority {
    /// Sorted by weight descending, then name
    queues: Vec<(String, u32)>,
    strict: bool,
}

impl QueuePriority {
    /// Queues with zero weight are dropped
    pub fn new(queues: impl IntoIterator<Item = (String, u32)>) -> Self {
        let mut queues: Vec<(String, u32)> = queues.into_iter().filter(|(_, w)| *w > 0).collect();
        queues.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Self {
            queues,
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|(name, _)| name.as_str())
    }

    pub fn weight(&self, queue: &str) -> Option<u32> {
        self.queues
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, w)| *w)
    }

    /// Queue order for one poll
    pub fn order(&self, rng: &mut impl Rng) -> Vec<&str> {
        if self.strict {
            return self.queue_names().collect();
        }

        let mut remaining: Vec<&(String, u32)> = self.queues.iter().collect();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
            let mut pick = rng.gen_range(0..total);
            let idx = remaining
                .iter()
                .position(|(_, w)| {
                    let w = u64::from(*w);
                    if pick < w {
                        true
                    } else {
                        pick -= w;
                        false
                    }
                })
                .unwrap_or(remaining.len() - 1);
            order.push(remaining.remove(idx).0.as_str());
        }
        order
    }
}
