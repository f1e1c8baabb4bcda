//! Moving-window request budgets.
//!
//! Two tiers guard every inbound request: a primary rule applied per client,
//! and a secondary rule applied per client+route (explicit per-route entries
//! with a default fallback). An exemption list (health checks) bypasses both
//! tiers. A breach is tagged with its tier so callers can distinguish global
//! throttling from route-specific throttling.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, LimitTier, Result};

const DEFAULT_PRIMARY_LIMIT: u32 = 120;
const DEFAULT_SECONDARY_LIMIT: u32 = 30;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// A budget: at most `limit` hits within any `window`-long interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub limit: u32,
    pub window: Duration,
}

impl Rule {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Remaining budget and when the oldest hit falls out of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

pub trait RateLimiter: Send + Sync {
    /// Count a hit. Returns false, leaving the window untouched, when the
    /// hit would push the count past the rule's limit.
    fn hit(&self, rule: &Rule, subject: &str, cost: u32) -> bool;

    /// Remaining budget for response metadata.
    fn window_stats(&self, rule: &Rule, subject: &str) -> WindowStats;
}

/// In-process moving-window limiter. Prune, compare, and append happen under
/// one lock per call, so two racing hits cannot both claim the last slot.
#[derive(Default)]
pub struct MovingWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MovingWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn tracked_subjects(&self) -> usize {
        self.windows().len()
    }
}

fn prune(window: &mut VecDeque<Instant>, horizon: Duration, now: Instant) {
    while window
        .front()
        .is_some_and(|hit| now.duration_since(*hit) >= horizon)
    {
        window.pop_front();
    }
}

impl RateLimiter for MovingWindowLimiter {
    fn hit(&self, rule: &Rule, subject: &str, cost: u32) -> bool {
        let now = Instant::now();
        let mut windows = self.windows();
        let window = windows.entry(subject.to_string()).or_default();
        prune(window, rule.window, now);

        let admitted = window.len() as u64 + u64::from(cost) <= u64::from(rule.limit);
        if admitted {
            for _ in 0..cost {
                window.push_back(now);
            }
        }
        // Subjects whose window pruned (or stayed) empty are not tracked.
        if window.is_empty() {
            windows.remove(subject);
        }
        admitted
    }

    fn window_stats(&self, rule: &Rule, subject: &str) -> WindowStats {
        let now = Instant::now();
        let mut windows = self.windows();

        let mut used = 0u32;
        let mut until_reset = Duration::ZERO;
        if let Some(window) = windows.get_mut(subject) {
            prune(window, rule.window, now);
            used = u32::try_from(window.len()).unwrap_or(u32::MAX);
            until_reset = window
                .front()
                .map(|oldest| rule.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or_default();
        }
        if used == 0 {
            windows.remove(subject);
        }

        let reset_at = Utc::now()
            + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());

        WindowStats {
            remaining: rule.limit.saturating_sub(used),
            reset_at,
        }
    }
}

/// Limiter that admits everything; local dev seam.
#[derive(Clone, Debug, Default)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn hit(&self, _rule: &Rule, _subject: &str, _cost: u32) -> bool {
        true
    }

    fn window_stats(&self, rule: &Rule, _subject: &str) -> WindowStats {
        WindowStats {
            remaining: rule.limit,
            reset_at: Utc::now(),
        }
    }
}

/// Maps (method, path) to the two limiter tiers.
pub struct RoutePolicy {
    limiter: Arc<dyn RateLimiter>,
    primary: Rule,
    default_secondary: Rule,
    routes: HashMap<(String, String), Rule>,
    exempt: HashSet<(String, String)>,
}

impl RoutePolicy {
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            primary: Rule::new(DEFAULT_PRIMARY_LIMIT, DEFAULT_WINDOW),
            default_secondary: Rule::new(DEFAULT_SECONDARY_LIMIT, DEFAULT_WINDOW),
            routes: HashMap::new(),
            exempt: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_primary_rule(mut self, rule: Rule) -> Self {
        self.primary = rule;
        self
    }

    #[must_use]
    pub fn with_default_secondary_rule(mut self, rule: Rule) -> Self {
        self.default_secondary = rule;
        self
    }

    #[must_use]
    pub fn with_route_rule(mut self, method: &str, path: &str, rule: Rule) -> Self {
        self.routes
            .insert((method.to_string(), path.to_string()), rule);
        self
    }

    /// Exempt a route from both tiers (health checks).
    #[must_use]
    pub fn with_exempt_route(mut self, method: &str, path: &str) -> Self {
        self.exempt.insert((method.to_string(), path.to_string()));
        self
    }

    fn secondary_rule(&self, method: &str, path: &str) -> Rule {
        self.routes
            .get(&(method.to_string(), path.to_string()))
            .copied()
            .unwrap_or(self.default_secondary)
    }

    /// Admit or reject one request.
    ///
    /// # Errors
    /// Returns `RateLimited` tagged with the tier that tripped.
    pub fn check(&self, method: &str, path: &str, client: &str) -> Result<()> {
        if self.exempt.contains(&(method.to_string(), path.to_string())) {
            return Ok(());
        }

        let primary_subject = format!("{client}|primary");
        if !self.limiter.hit(&self.primary, &primary_subject, 1) {
            return Err(Error::RateLimited {
                tier: LimitTier::Primary,
            });
        }

        let rule = self.secondary_rule(method, path);
        let secondary_subject = format!("{client}|{method} {path}");
        if !self.limiter.hit(&rule, &secondary_subject, 1) {
            return Err(Error::RateLimited {
                tier: LimitTier::Secondary,
            });
        }

        Ok(())
    }

    /// Remaining secondary budget for a route, for response metadata.
    #[must_use]
    pub fn route_stats(&self, method: &str, path: &str, client: &str) -> WindowStats {
        let rule = self.secondary_rule(method, path);
        let subject = format!("{client}|{method} {path}");
        self.limiter.window_stats(&rule, &subject)
    }
}
