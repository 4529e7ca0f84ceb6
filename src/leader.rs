//! Hook for an external leader-election mechanism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::export::health::HealthMetrics;

/// Notified by the election mechanism when this node becomes leader.
pub trait LeadershipListener: Send + Sync {
    fn on_leadership_acquired(&self);
}

/// Tracks leadership and mirrors it into the `is_leader` gauge.
pub struct LeadershipState {
    leader: AtomicBool,
    health: Arc<HealthMetrics>,
}

impl LeadershipState {
    pub fn new(health: Arc<HealthMetrics>) -> Self {
        health.is_leader.set(0.0);
        Self {
            leader: AtomicBool::new(false),
            health,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }
}

impl LeadershipListener for LeadershipState {
    fn on_leadership_acquired(&self) {
        if !self.leader.swap(true, Ordering::AcqRel) {
            info!("leadership acquired");
        }
        self.health.is_leader.set(1.0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_sets_gauge() {
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let state = LeadershipState::new(Arc::clone(&health));
        assert!(!state.is_leader());

        let listener: &dyn LeadershipListener = &state;
        listener.on_leadership_acquired();
        listener.on_leadership_acquired();

        assert!(state.is_leader());
        assert_eq!(health.is_leader.get(), 1.0);
    }
}
