//! Plan-based ceilings on delay/digest durations.
//!
//! Free organizations cap total wait at 30 days, Business at 90; Enterprise
//! is unrestricted at this layer. Runs at workflow configuration time and
//! again at trigger time; never mutates state.

use crate::error::Violation;
use crate::types::{DigestPolicy, DigestUnit, ServiceTier, StepControls};
use chrono::Duration;

pub const TIER_LIMIT_EXCEEDED: &str = "tier-limit-exceeded";

const FREE_MAX_DAYS: i64 = 30;
const BUSINESS_MAX_DAYS: i64 = 90;

/// Maximum wait a tier allows, `None` for unrestricted.
pub fn max_wait(tier: ServiceTier) -> Option<Duration> {
    match tier {
        ServiceTier::Free => Some(Duration::days(FREE_MAX_DAYS)),
        ServiceTier::Business => Some(Duration::days(BUSINESS_MAX_DAYS)),
        ServiceTier::Enterprise => None,
    }
}

/// Validate one step's controls against an organization's tier.
///
/// Returns every violation found; an empty list means compliant. Cron
/// schedules get best-effort validation only (parseability), since their
/// actual wait depends on the trigger instant.
pub fn validate_step(tier: ServiceTier, controls: &StepControls) -> Vec<Violation> {
    let Some(limit) = max_wait(tier) else {
        return Vec::new();
    };

    match controls {
        StepControls::Delay { amount, unit } => check_duration(limit, *amount, *unit),
        StepControls::Digest { policy, .. } => match policy {
            DigestPolicy::Regular { amount, unit } | DigestPolicy::LookBack { amount, unit } => {
                check_duration(limit, *amount, *unit)
            }
            DigestPolicy::Timed { cron } => check_cron(cron),
        },
        _ => Vec::new(),
    }
}

/// Validate every delay/digest step of a workflow's step list.
pub fn validate_steps<'a>(
    tier: ServiceTier,
    controls: impl IntoIterator<Item = &'a StepControls>,
) -> Vec<Violation> {
    controls
        .into_iter()
        .flat_map(|c| validate_step(tier, c))
        .collect()
}

fn check_duration(limit: Duration, amount: u64, unit: DigestUnit) -> Vec<Violation> {
    let requested = unit.to_duration(amount);
    if requested > limit {
        vec![Violation::new(
            "amount",
            TIER_LIMIT_EXCEEDED,
            format!(
                "requested wait of {} exceeds the tier limit of {} days",
                format_duration(requested),
                limit.num_days()
            ),
        )]
    } else {
        Vec::new()
    }
}

fn check_cron(expression: &str) -> Vec<Violation> {
    // Best-effort: only reject expressions that cannot fire at all
    match crate::digest::next_cron_occurrence(expression, chrono::Utc::now()) {
        Ok(_) => Vec::new(),
        Err(_) => vec![Violation::new(
            "cron",
            "invalid-cron",
            format!("cron expression '{}' is not valid", expression),
        )],
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.num_days() > 0 {
        format!("{} days", duration.num_days())
    } else if duration.num_hours() > 0 {
        format!("{} hours", duration.num_hours())
    } else {
        format!("{} minutes", duration.num_minutes())
    }
}
