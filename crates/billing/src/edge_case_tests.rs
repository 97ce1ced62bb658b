// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement Engine
//!
//! Tests critical boundary conditions in:
//! - Credit consumption ordering (CRD-01 to CRD-06)
//! - Remaining-balance arithmetic (ENT-01 to ENT-06)
//! - Status derivation (SUB-01 to SUB-05)
//! - Reset-period windows (PER-01 to PER-04)
//! - Next-availability (AVL-01 to AVL-03)

#[cfg(test)]
mod credit_consumption_tests {
    use crate::credits::{plan_consumption, FeatureCredit};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn grant(credits: f64, order: i64) -> FeatureCredit {
        FeatureCredit {
            id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            feature_id: Uuid::nil(),
            credits,
            reason: None,
            granted_by_kind: None,
            granted_by_id: None,
            expires_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::minutes(order),
            updated_at: OffsetDateTime::UNIX_EPOCH + Duration::minutes(order),
        }
    }

    // =========================================================================
    // CRD-01: grant(100) -> consume(30) -> 70 remain in the pool
    // =========================================================================
    #[test]
    fn test_partial_consumption_leaves_balance() {
        let rows = vec![grant(100.0, 0)];
        let (draws, uncovered) = plan_consumption(&rows, 30.0);

        assert_eq!(uncovered, 0.0);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].amount, 30.0);
        assert!(!draws[0].exhausted, "70 must remain on the row");
        assert_eq!(rows[0].credits - draws[0].amount, 70.0);
    }

    // =========================================================================
    // CRD-02: credits granted at T1 < T2, consume <= T1's balance
    //         -> T2's row untouched
    // =========================================================================
    #[test]
    fn test_strictly_oldest_first() {
        let t1 = grant(40.0, 0);
        let t2 = grant(60.0, 30);
        let rows = vec![t1.clone(), t2.clone()];

        let (draws, _) = plan_consumption(&rows, 40.0);
        assert_eq!(draws.len(), 1, "second grant must not be touched");
        assert_eq!(draws[0].id, t1.id);
        assert!(draws[0].exhausted);
    }

    // =========================================================================
    // CRD-03: consumption spanning three grants drains them in grant order
    // =========================================================================
    #[test]
    fn test_fifo_across_three_grants() {
        let rows = vec![grant(10.0, 0), grant(10.0, 1), grant(10.0, 2)];
        let (draws, uncovered) = plan_consumption(&rows, 25.0);

        assert_eq!(uncovered, 0.0);
        assert_eq!(draws.len(), 3);
        assert_eq!(draws[0].amount, 10.0);
        assert_eq!(draws[1].amount, 10.0);
        assert_eq!(draws[2].amount, 5.0);
        assert!(draws[0].exhausted && draws[1].exhausted);
        assert!(!draws[2].exhausted);
    }

    // =========================================================================
    // CRD-04: sum(remaining) == sum(original) - min(amount, sum(original))
    // =========================================================================
    #[test]
    fn test_consumption_conserves_totals() {
        let rows = vec![grant(12.5, 0), grant(7.5, 1), grant(30.0, 2)];
        let total: f64 = rows.iter().map(|r| r.credits).sum();

        for amount in [1.0, 12.5, 20.0, 49.9, 50.0, 75.0] {
            let (draws, uncovered) = plan_consumption(&rows, amount);
            let drawn: f64 = draws.iter().map(|d| d.amount).sum();
            let remaining_pool = total - drawn;

            assert!(
                (remaining_pool - (total - amount.min(total))).abs() < 1e-9,
                "conservation failed for amount {amount}"
            );
            assert!(remaining_pool >= -1e-9, "pool must never go negative");
            assert!((drawn + uncovered - amount).abs() < 1e-9);
        }
    }

    // =========================================================================
    // CRD-05: fractional credits consume exactly
    // =========================================================================
    #[test]
    fn test_fractional_amounts() {
        let rows = vec![grant(0.3, 0), grant(0.7, 1)];
        let (draws, uncovered) = plan_consumption(&rows, 0.5);

        assert_eq!(uncovered, 0.0);
        assert_eq!(draws[0].amount, 0.3);
        assert!(draws[0].exhausted);
        assert!((draws[1].amount - 0.2).abs() < 1e-12);
    }

    // =========================================================================
    // CRD-06: amount exceeding the whole pool reports the overflow
    // =========================================================================
    #[test]
    fn test_pool_overflow_is_reported_not_absorbed() {
        let rows = vec![grant(10.0, 0), grant(5.0, 1)];
        let (draws, uncovered) = plan_consumption(&rows, 100.0);

        assert_eq!(uncovered, 85.0);
        assert!(draws.iter().all(|d| d.exhausted));
    }
}

#[cfg(test)]
mod remaining_balance_tests {
    use crate::entitlement::{compute_remaining, compute_stats, Remaining};
    use submeter_shared::Allowance;

    // =========================================================================
    // ENT-01: allowance "50", usage 20 in window -> remaining 30;
    //         canUse(31) == false, canUse(30) == true
    // =========================================================================
    #[test]
    fn test_window_usage_subtracts_from_allowance() {
        let remaining = compute_remaining(Allowance::Limited(50.0), 0.0, 20.0);
        assert_eq!(remaining, Remaining::Amount(30.0));
        assert!(remaining.allows(30.0));
        assert!(!remaining.allows(31.0));
        assert!(!remaining.allows(40.0));
    }

    // =========================================================================
    // ENT-02: unlimited allowance ignores any usage history
    // =========================================================================
    #[test]
    fn test_unlimited_never_depletes() {
        for used in [0.0, 1.0, 1e12] {
            assert_eq!(
                compute_remaining(Allowance::Unlimited, 0.0, used),
                Remaining::Unlimited
            );
        }
    }

    // =========================================================================
    // ENT-03: credits 10 + allowance 50, usage 55 -> remaining 5
    // =========================================================================
    #[test]
    fn test_credits_cover_overage_past_plan_limit() {
        let remaining = compute_remaining(Allowance::Limited(50.0), 10.0, 55.0);
        assert_eq!(remaining, Remaining::Amount(5.0));
        assert!(remaining.allows(5.0));
        assert!(!remaining.allows(6.0));
    }

    // =========================================================================
    // ENT-04: excluding credits tightens the balance
    // =========================================================================
    #[test]
    fn test_exclude_credits_from_balance() {
        let with = compute_remaining(Allowance::Limited(50.0), 10.0, 45.0);
        let without = compute_remaining(Allowance::Limited(50.0), 0.0, 45.0);
        assert_eq!(with, Remaining::Amount(15.0));
        assert_eq!(without, Remaining::Amount(5.0));
    }

    // =========================================================================
    // ENT-05: stats floor remaining at zero even when over-consumed
    // =========================================================================
    #[test]
    fn test_stats_never_report_negative_remaining() {
        let stats = compute_stats(Allowance::Limited(50.0), 0.0, 200.0);
        assert_eq!(stats.remaining, Allowance::Limited(0.0));
    }

    // =========================================================================
    // ENT-06: exact-boundary consumption is allowed, one past is not
    // =========================================================================
    #[test]
    fn test_exact_boundary() {
        let remaining = compute_remaining(Allowance::Limited(50.0), 0.0, 0.0);
        assert!(remaining.allows(50.0));
        assert!(!remaining.allows(50.000001));
    }
}

#[cfg(test)]
mod status_tests {
    use crate::subscriptions::status_at;
    use submeter_shared::SubscriptionStatus;
    use time::macros::datetime;

    // =========================================================================
    // SUB-01: cancelled-and-ended is never active (usage must be rejected)
    // =========================================================================
    #[test]
    fn test_cancelled_and_ended_is_not_active() {
        let status = status_at(
            Some(datetime!(2025-01-01 00:00 UTC)),
            Some(datetime!(2025-02-01 00:00 UTC)),
            Some(datetime!(2025-01-15 00:00 UTC)),
            datetime!(2025-03-01 00:00 UTC),
        );
        assert_ne!(status, SubscriptionStatus::Active);
        assert_eq!(status, SubscriptionStatus::Cancelled);
    }

    // =========================================================================
    // SUB-02: cancel-at-period-end is already non-active under the redesign
    // =========================================================================
    #[test]
    fn test_cancelled_inside_window_is_cancelled() {
        let status = status_at(
            Some(datetime!(2025-01-01 00:00 UTC)),
            Some(datetime!(2025-12-01 00:00 UTC)),
            Some(datetime!(2025-01-15 00:00 UTC)),
            datetime!(2025-02-01 00:00 UTC),
        );
        assert_eq!(status, SubscriptionStatus::Cancelled);
    }

    // =========================================================================
    // SUB-03: expiry without cancellation
    // =========================================================================
    #[test]
    fn test_expired_without_cancellation() {
        let status = status_at(
            Some(datetime!(2025-01-01 00:00 UTC)),
            Some(datetime!(2025-02-01 00:00 UTC)),
            None,
            datetime!(2025-03-01 00:00 UTC),
        );
        assert_eq!(status, SubscriptionStatus::Expired);
    }

    // =========================================================================
    // SUB-04: pending until activated
    // =========================================================================
    #[test]
    fn test_pending_has_no_start() {
        let status = status_at(None, None, None, datetime!(2025-03-01 00:00 UTC));
        assert_eq!(status, SubscriptionStatus::Pending);
    }

    // =========================================================================
    // SUB-05: scheduled start in the future
    // =========================================================================
    #[test]
    fn test_future_start() {
        let status = status_at(
            Some(datetime!(2025-06-01 00:00 UTC)),
            None,
            None,
            datetime!(2025-03-01 00:00 UTC),
        );
        assert_eq!(status, SubscriptionStatus::Future);
    }
}

#[cfg(test)]
mod period_window_tests {
    use crate::period::{Period, ResetPeriod};
    use crate::usage::window_cutoff;
    use time::macros::datetime;

    // =========================================================================
    // PER-01: one-month window reaches back exactly 30 days
    // =========================================================================
    #[test]
    fn test_month_window_is_thirty_days() {
        let now = datetime!(2025-03-31 00:00 UTC);
        let cutoff = window_cutoff(Some(ResetPeriod::new(1, Period::Month)), now);
        assert_eq!(cutoff, Some(datetime!(2025-03-01 00:00 UTC)));
    }

    // =========================================================================
    // PER-02: no reset period means lifetime usage (no cutoff)
    // =========================================================================
    #[test]
    fn test_lifetime_window() {
        assert_eq!(window_cutoff(None, datetime!(2025-03-31 00:00 UTC)), None);
    }

    // =========================================================================
    // PER-03: sub-day units work in minutes
    // =========================================================================
    #[test]
    fn test_hourly_window() {
        let now = datetime!(2025-03-31 12:00 UTC);
        let cutoff = window_cutoff(Some(ResetPeriod::new(6, Period::Hour)), now);
        assert_eq!(cutoff, Some(datetime!(2025-03-31 06:00 UTC)));
    }

    // =========================================================================
    // PER-04: year approximation is 365 days, not calendar-aware
    // =========================================================================
    #[test]
    fn test_year_window_fixed_365() {
        let now = datetime!(2025-01-01 00:00 UTC);
        let cutoff = window_cutoff(Some(ResetPeriod::new(1, Period::Year)), now);
        // 2024 is a leap year; a calendar-aware window would land on Jan 1
        assert_eq!(cutoff, Some(datetime!(2024-01-02 00:00 UTC)));
    }
}

#[cfg(test)]
mod availability_tests {
    use crate::period::{Period, ResetPeriod};
    use crate::usage::{next_available_from, NextAvailability};
    use time::macros::datetime;

    // =========================================================================
    // AVL-01: consumable without reset period -> Never (not Unlimited)
    // =========================================================================
    #[test]
    fn test_non_resettable_is_never_not_unlimited() {
        let next = next_available_from(false, None, None, datetime!(2025-06-01 00:00 UTC));
        assert_eq!(next, NextAvailability::Never);
        assert_ne!(next, NextAvailability::Unlimited);
    }

    // =========================================================================
    // AVL-02: with usage, availability is oldest event + period
    // =========================================================================
    #[test]
    fn test_oldest_usage_plus_period() {
        let next = next_available_from(
            false,
            Some(ResetPeriod::new(1, Period::Week)),
            Some(datetime!(2025-06-01 08:00 UTC)),
            datetime!(2025-06-03 00:00 UTC),
        );
        assert_eq!(next, NextAvailability::At(datetime!(2025-06-08 08:00 UTC)));
    }

    // =========================================================================
    // AVL-03: no usage yet -> immediately available
    // =========================================================================
    #[test]
    fn test_fresh_feature_is_available_now() {
        let now = datetime!(2025-06-03 00:00 UTC);
        let next = next_available_from(false, Some(ResetPeriod::new(1, Period::Week)), None, now);
        assert_eq!(next, NextAvailability::At(now));
    }
}
