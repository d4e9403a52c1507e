use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the orchestrator picks among equally eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest current load; ties go to the earliest registration.
    LeastLoaded,
    /// Uniformly at random.
    Random,
}

impl SelectionStrategy {
    pub fn from_load_balancing(enabled: bool) -> Self {
        if enabled {
            SelectionStrategy::LeastLoaded
        } else {
            SelectionStrategy::Random
        }
    }
}

/// Pick an index into `loads`, which must be in registration order.
/// Returns `None` only when there are no candidates.
pub fn select_agent(loads: &[f64], strategy: SelectionStrategy) -> Option<usize> {
    if loads.is_empty() {
        return None;
    }
    match strategy {
        SelectionStrategy::LeastLoaded => {
            let mut best = 0;
            for (idx, load) in loads.iter().enumerate().skip(1) {
                if *load < loads[best] {
                    best = idx;
                }
            }
            Some(best)
        }
        SelectionStrategy::Random => Some(rand::thread_rng().gen_range(0..loads.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_has_no_choice() {
        assert_eq!(select_agent(&[], SelectionStrategy::LeastLoaded), None);
        assert_eq!(select_agent(&[], SelectionStrategy::Random), None);
    }

    #[test]
    fn test_least_loaded_wins() {
        for _ in 0..20 {
            assert_eq!(
                select_agent(&[0.5, 0.1, 0.9], SelectionStrategy::LeastLoaded),
                Some(1)
            );
        }
    }

    #[test]
    fn test_ties_go_to_first_registered() {
        assert_eq!(
            select_agent(&[0.4, 0.2, 0.2], SelectionStrategy::LeastLoaded),
            Some(1)
        );
        assert_eq!(
            select_agent(&[0.0, 0.0], SelectionStrategy::LeastLoaded),
            Some(0)
        );
    }

    #[test]
    fn test_random_stays_in_bounds_and_spreads() {
        let mut seen = [false; 3];
        for _ in 0..300 {
            let idx = select_agent(&[0.1, 0.1, 0.1], SelectionStrategy::Random).unwrap_or(99);
            assert!(idx < 3);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_strategy_from_flag() {
        assert_eq!(
            SelectionStrategy::from_load_balancing(true),
            SelectionStrategy::LeastLoaded
        );
        assert_eq!(
            SelectionStrategy::from_load_balancing(false),
            SelectionStrategy::Random
        );
    }
}
