//! Load Shedding Controller (§4.8)
//!
//! Hysteretic state machine over a smoothed load ratio, with an escalation
//! table mapping overshoot to a shed level.

use crate::logging::get_logger;
use crate::types::{SheddingEvent, SheddingState};
use chrono::Utc;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct SheddingStrategy {
    pub priority_at_or_below: u8,
    pub action: ShedAction,
    pub reduction_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedAction {
    Reduce,
    Stop,
}

/// Default strategy table (§4.8).
pub fn default_strategies() -> [SheddingStrategy; 5] {
    [
        SheddingStrategy { priority_at_or_below: 3, action: ShedAction::Reduce, reduction_fraction: 0.20 },
        SheddingStrategy { priority_at_or_below: 5, action: ShedAction::Reduce, reduction_fraction: 0.40 },
        SheddingStrategy { priority_at_or_below: 10, action: ShedAction::Reduce, reduction_fraction: 0.50 },
        SheddingStrategy { priority_at_or_below: 5, action: ShedAction::Stop, reduction_fraction: 1.0 },
        SheddingStrategy { priority_at_or_below: 8, action: ShedAction::Stop, reduction_fraction: 1.0 },
    ]
}

pub struct SheddingController {
    strategies: [SheddingStrategy; 5],
    upper_threshold: f64,
    lower_threshold: f64,
    window: std::sync::Mutex<VecDeque<f64>>,
    window_size: usize,
    last_evaluated_ms: std::sync::Mutex<Option<u64>>,
    min_update_interval_ms: u64,
    logger: crate::logging::StructuredLogger,
}

impl SheddingController {
    pub fn new(
        upper_threshold: f64,
        lower_threshold: f64,
        window_size: usize,
        min_update_interval_ms: u64,
    ) -> Self {
        Self {
            strategies: default_strategies(),
            upper_threshold,
            lower_threshold,
            window: std::sync::Mutex::new(VecDeque::with_capacity(window_size.max(1))),
            window_size: window_size.max(1),
            last_evaluated_ms: std::sync::Mutex::new(None),
            min_update_interval_ms,
            logger: get_logger("shedding"),
        }
    }

    /// Map `overshoot = ratio - upper` to a target level via the escalation
    /// table (§4.8 step 2).
    fn escalation_level(overshoot: f64) -> u8 {
        if overshoot >= 0.15 {
            5
        } else if overshoot >= 0.10 {
            4
        } else if overshoot >= 0.07 {
            3
        } else if overshoot >= 0.04 {
            2
        } else {
            1
        }
    }

    /// Evaluate one tick (§4.8). Returns `Some(new_state)` only when the
    /// level transitions; returns `None` when unchanged or throttled by
    /// `min_update_interval`.
    pub fn evaluate(&self, current_load_kw: f64, capacity_kw: f64, now_ms: u64, current: &SheddingState) -> Option<SheddingState> {
        {
            let mut last = self.last_evaluated_ms.lock().unwrap();
            if let Some(prev) = *last {
                if now_ms.saturating_sub(prev) < self.min_update_interval_ms {
                    return None;
                }
            }
            *last = Some(now_ms);
        }

        let ratio = if capacity_kw > 0.0 {
            current_load_kw / capacity_kw
        } else {
            0.0
        };

        let smoothed = {
            let mut window = self.window.lock().unwrap();
            window.push_back(ratio);
            if window.len() > self.window_size {
                window.pop_front();
            }
            window.iter().sum::<f64>() / window.len() as f64
        };

        let target_level = if smoothed >= self.upper_threshold {
            Self::escalation_level(smoothed - self.upper_threshold)
        } else if smoothed <= self.lower_threshold {
            0
        } else {
            current.level
        };

        if target_level == current.level {
            return Some(SheddingState {
                level: current.level,
                smoothed_ratio: smoothed,
                last_shed_at: current.last_shed_at,
                last_restore_at: current.last_restore_at,
                history: current.history.clone(),
            });
        }

        let now = Utc::now();
        let mut history = current.history.clone();
        history.push(SheddingEvent {
            timestamp: now,
            from_level: current.level,
            to_level: target_level,
            smoothed_ratio: smoothed,
        });
        if history.len() > 1000 {
            history.remove(0);
        }

        self.logger.info(&format!(
            "shedding level transition {} -> {} (smoothed_ratio={smoothed:.3})",
            current.level, target_level
        ));

        Some(SheddingState {
            level: target_level,
            smoothed_ratio: smoothed,
            last_shed_at: if target_level > current.level {
                Some(now)
            } else {
                current.last_shed_at
            },
            last_restore_at: if target_level < current.level {
                Some(now)
            } else {
                current.last_restore_at
            },
            history,
        })
    }

    /// The active strategy for a shed level, if any (levels are 1-indexed
    /// into the strategy table; level 0 means no shedding).
    pub fn strategy_for_level(&self, level: u8) -> Option<SheddingStrategy> {
        if level == 0 {
            None
        } else {
            self.strategies.get((level - 1) as usize).copied()
        }
    }

    /// Whether a station of the given priority is affected at this level.
    pub fn affects_priority(&self, level: u8, priority: u8) -> bool {
        self.strategy_for_level(level)
            .is_some_and(|s| priority <= s.priority_at_or_below)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SheddingController {
        SheddingController::new(0.90, 0.75, 3, 0)
    }

    #[test]
    fn test_escalates_on_overshoot() {
        let controller = controller();
        let mut state = SheddingState::default();
        for t in 0..3 {
            if let Some(next) = controller.evaluate(98.0, 100.0, t * 10, &state) {
                state = next;
            }
        }
        assert!(state.level > 0);
    }

    #[test]
    fn test_restores_below_lower_threshold() {
        let controller = controller();
        let mut state = SheddingState {
            level: 3,
            ..Default::default()
        };
        for t in 0..3 {
            if let Some(next) = controller.evaluate(50.0, 100.0, t * 10, &state) {
                state = next;
            }
        }
        assert_eq!(state.level, 0);
    }

    #[test]
    fn test_hysteresis_no_chatter_in_deadband() {
        let controller = controller();
        let mut state = SheddingState {
            level: 2,
            ..Default::default()
        };
        for t in 0..5 {
            if let Some(next) = controller.evaluate(82.0, 100.0, t * 10, &state) {
                state = next;
            }
        }
        assert_eq!(state.level, 2);
    }

    #[test]
    fn test_affects_priority() {
        let controller = controller();
        assert!(controller.affects_priority(1, 2));
        assert!(!controller.affects_priority(1, 9));
    }
}
