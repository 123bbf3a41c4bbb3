//! Pure segment-reconstruction math (spec §4.4 steps 3-5). No I/O: every
//! function here takes the resource's full event log and returns a charge,
//! so the billing engine can be tested without a database.

use chrono::{DateTime, Utc};
use cloudbill_models::{ComputeResource, DiskResource, EventEntry, FloatingIpResource, PriceCatalogEntry};
use rust_decimal::Decimal;

/// `deleted_at`/`released_at` strictly before `period_end` truncates billing
/// to that instant; otherwise the resource is billed through `period_end`.
pub fn billing_end(deleted_at: Option<DateTime<Utc>>, period_end: DateTime<Utc>) -> DateTime<Utc> {
    match deleted_at {
        Some(d) if d < period_end => d,
        _ => period_end,
    }
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Decimal {
    let millis = (end - start).num_milliseconds().max(0);
    Decimal::from(millis) / Decimal::from(3_600_000i64)
}

/// Events strictly after `after` and up through (inclusive of) `through`,
/// sorted by time with insertion order as the tiebreak.
fn segment_boundaries(events: &[EventEntry], after: DateTime<Utc>, through: DateTime<Utc>) -> Vec<&EventEntry> {
    let mut boundaries: Vec<&EventEntry> = events
        .iter()
        .filter(|e| e.time > after && e.time <= through)
        .collect();
    boundaries.sort_by_key(|e| e.time);
    boundaries
}

/// Replays events with `time <= last_billed_until` to find the
/// `(flavor, state)` the resource was in when its last billing cycle ended.
fn compute_initial_state(resource: &ComputeResource) -> (Option<String>, String) {
    let mut flavor: Option<String> = None;
    let mut state: Option<String> = None;

    let mut prior: Vec<&EventEntry> = resource
        .events
        .iter()
        .filter(|e| e.time <= resource.last_billed_until)
        .collect();
    prior.sort_by_key(|e| e.time);

    for event in prior {
        match event.event_type.as_str() {
            "create" => {
                if let Some(f) = event.meta.get("flavor").and_then(|v| v.as_str()) {
                    flavor = Some(f.to_string());
                }
                state = Some("running".to_string());
            }
            "resize" => {
                if let Some(f) = event.meta.get("flavor").and_then(|v| v.as_str()) {
                    flavor = Some(f.to_string());
                }
            }
            "deleted" => state = Some("deleted".to_string()),
            other => state = Some(other.to_string()),
        }
    }

    (
        flavor.or_else(|| Some(resource.current_flavor.clone())),
        state.unwrap_or_else(|| "running".to_string()),
    )
}

/// Charge for one compute resource's `[last_billed_until, billing_end]`
/// window. Walks the segment boundaries, charging only while `state =
/// running`, and stops accumulating once a `deleted` boundary is crossed.
pub fn compute_charge(resource: &ComputeResource, end: DateTime<Utc>, pricing: &PriceCatalogEntry) -> Decimal {
    if resource.last_billed_until >= end {
        return Decimal::ZERO;
    }

    let (mut flavor, mut state) = compute_initial_state(resource);
    let boundaries = segment_boundaries(&resource.events, resource.last_billed_until, end);

    let mut charge = Decimal::ZERO;
    let mut current_time = resource.last_billed_until;
    let mut deleted = false;

    for boundary in &boundaries {
        if state == "running" {
            if let Some(f) = &flavor {
                charge += hours_between(current_time, boundary.time) * pricing.compute_rate(f);
            }
        }

        match boundary.event_type.as_str() {
            "resize" => {
                if let Some(f) = boundary.meta.get("flavor").and_then(|v| v.as_str()) {
                    flavor = Some(f.to_string());
                }
            }
            "deleted" => deleted = true,
            other => state = other.to_string(),
        }
        current_time = boundary.time;

        if deleted {
            break;
        }
    }

    if !deleted && state == "running" {
        if let Some(f) = &flavor {
            charge += hours_between(current_time, end) * pricing.compute_rate(f);
        }
    }

    charge
}

/// Replays events with `time <= last_billed_until` to find the `size_gb`
/// the disk was at when its last billing cycle ended.
fn disk_initial_size(resource: &DiskResource) -> i64 {
    let mut size_gb = resource.size_gb;
    let mut prior: Vec<&EventEntry> = resource
        .events
        .iter()
        .filter(|e| e.time <= resource.last_billed_until)
        .collect();
    prior.sort_by_key(|e| e.time);

    for event in prior {
        if matches!(event.event_type.as_str(), "create" | "resize") {
            if let Some(size) = event.meta.get("size_gb").and_then(|v| v.as_i64()) {
                size_gb = size;
            }
        }
    }
    size_gb
}

/// Charge for one disk's billing window. Size changes take effect at their
/// `resize` boundary; attach/detach events are not rate-relevant (spec §4.2,
/// §9) so they're walked but never gate the charge.
pub fn disk_charge(resource: &DiskResource, end: DateTime<Utc>, pricing: &PriceCatalogEntry) -> Decimal {
    if resource.last_billed_until >= end {
        return Decimal::ZERO;
    }

    let mut size_gb = disk_initial_size(resource);
    let boundaries = segment_boundaries(&resource.events, resource.last_billed_until, end);

    let mut charge = Decimal::ZERO;
    let mut current_time = resource.last_billed_until;
    let mut deleted = false;

    for boundary in &boundaries {
        charge += hours_between(current_time, boundary.time) * Decimal::from(size_gb) * pricing.disk_per_gb_hour;

        match boundary.event_type.as_str() {
            "resize" => {
                if let Some(size) = boundary.meta.get("size_gb").and_then(|v| v.as_i64()) {
                    size_gb = size;
                }
            }
            "deleted" => deleted = true,
            _ => {}
        }
        current_time = boundary.time;

        if deleted {
            break;
        }
    }

    if !deleted {
        charge += hours_between(current_time, end) * Decimal::from(size_gb) * pricing.disk_per_gb_hour;
    }

    charge
}

/// Floating IPs have no mid-period rate changes (spec §4.4 step 5): a flat
/// rate across `[last_billed_until, end]`.
pub fn floating_ip_charge(resource: &FloatingIpResource, end: DateTime<Utc>, pricing: &PriceCatalogEntry) -> Decimal {
    if resource.last_billed_until >= end {
        return Decimal::ZERO;
    }
    hours_between(resource.last_billed_until, end) * pricing.floating_ip_per_hour
}

/// Trims trailing zeros and normalizes `-0` to `0` for canonical rendering
/// (spec §4.4 "Numeric semantics", §9).
pub fn canonicalize(amount: Decimal) -> Decimal {
    let amount = amount.normalize();
    if amount.is_zero() {
        Decimal::ZERO
    } else {
        amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cloudbill_models::{ComputeRate, EventEntry};
    use std::collections::HashMap;

    fn pricing() -> PriceCatalogEntry {
        let mut compute = HashMap::new();
        compute.insert("small".to_string(), ComputeRate { per_hour: Decimal::new(5, 1) });
        compute.insert("medium".to_string(), ComputeRate { per_hour: Decimal::ONE });
        PriceCatalogEntry {
            currency: "USD".to_string(),
            compute,
            disk_per_gb_hour: Decimal::new(1, 2),
            floating_ip_per_hour: Decimal::new(1, 2),
            price_version: "2026-01-01_v1".to_string(),
        }
    }

    fn event(time: DateTime<Utc>, event_type: &str, meta: &[(&str, serde_json::Value)]) -> EventEntry {
        EventEntry {
            event_id: format!("evt_{}", time.timestamp_millis()),
            time,
            event_type: event_type.to_string(),
            meta: meta.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn flat_compute_two_hours() {
        let t = Utc::now();
        let resource = ComputeResource {
            resource_id: "c1".to_string(),
            user_id: "u1".to_string(),
            state: "running".to_string(),
            current_flavor: "small".to_string(),
            created_at: t,
            deleted_at: None,
            last_billed_until: t,
            events: vec![event(t, "create", &[("flavor", serde_json::json!("small"))])],
        };
        let charge = compute_charge(&resource, t + Duration::hours(2), &pricing());
        assert_eq!(canonicalize(charge), Decimal::new(10, 1));
    }

    #[test]
    fn mid_period_resize() {
        let t = Utc::now();
        let resource = ComputeResource {
            resource_id: "c1".to_string(),
            user_id: "u1".to_string(),
            state: "running".to_string(),
            current_flavor: "medium".to_string(),
            created_at: t,
            deleted_at: None,
            last_billed_until: t,
            events: vec![
                event(t, "create", &[("flavor", serde_json::json!("small"))]),
                event(t + Duration::hours(1), "resize", &[("flavor", serde_json::json!("medium"))]),
            ],
        };
        let charge = compute_charge(&resource, t + Duration::hours(2), &pricing());
        assert_eq!(canonicalize(charge), Decimal::new(15, 1));
    }

    #[test]
    fn deletion_truncates_and_breaks_walk() {
        let t = Utc::now();
        let deleted_at = t + Duration::minutes(30);
        let resource = ComputeResource {
            resource_id: "c1".to_string(),
            user_id: "u1".to_string(),
            state: "deleted".to_string(),
            current_flavor: "small".to_string(),
            created_at: t,
            deleted_at: Some(deleted_at),
            last_billed_until: t,
            events: vec![
                event(t, "create", &[("flavor", serde_json::json!("small"))]),
                event(deleted_at, "deleted", &[]),
            ],
        };
        let end = billing_end(resource.deleted_at, t + Duration::hours(2));
        let charge = compute_charge(&resource, end, &pricing());
        assert_eq!(canonicalize(charge), Decimal::new(25, 2));
    }

    #[test]
    fn stopped_segment_is_not_charged() {
        let t = Utc::now();
        let resource = ComputeResource {
            resource_id: "c1".to_string(),
            user_id: "u1".to_string(),
            state: "stopped".to_string(),
            current_flavor: "small".to_string(),
            created_at: t,
            deleted_at: None,
            last_billed_until: t,
            events: vec![
                event(t, "create", &[("flavor", serde_json::json!("small"))]),
                event(t + Duration::hours(1), "stopped", &[]),
            ],
        };
        let charge = compute_charge(&resource, t + Duration::hours(2), &pricing());
        assert_eq!(canonicalize(charge), Decimal::new(5, 1));
    }

    #[test]
    fn disk_resize_changes_rate_mid_period() {
        let t = Utc::now();
        let resource = DiskResource {
            resource_id: "d1".to_string(),
            user_id: "u1".to_string(),
            size_gb: 100,
            state: "detached".to_string(),
            created_at: t,
            deleted_at: None,
            last_billed_until: t,
            events: vec![
                event(t, "create", &[("size_gb", serde_json::json!(50))]),
                event(t + Duration::hours(1), "resize", &[("size_gb", serde_json::json!(100))]),
            ],
        };
        let charge = disk_charge(&resource, t + Duration::hours(2), &pricing());
        // 1h * 50gb * 0.01 + 1h * 100gb * 0.01 = 0.5 + 1.0
        assert_eq!(canonicalize(charge), Decimal::new(15, 1));
    }

    #[test]
    fn floating_ip_flat_rate() {
        let t = Utc::now();
        let resource = FloatingIpResource {
            resource_id: "f1".to_string(),
            user_id: "u1".to_string(),
            ip_address: "203.0.113.1".to_string(),
            created_at: t,
            released_at: None,
            last_billed_until: t,
            events: vec![event(t, "create", &[])],
        };
        let charge = floating_ip_charge(&resource, t + Duration::hours(2), &pricing());
        assert_eq!(canonicalize(charge), Decimal::new(2, 2));
    }

    #[test]
    fn canonicalize_trims_trailing_zeros_and_negative_zero() {
        assert_eq!(canonicalize(Decimal::new(1000, 3)), Decimal::ONE);
        assert_eq!(canonicalize(-Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn already_billed_window_yields_zero() {
        let t = Utc::now();
        let resource = FloatingIpResource {
            resource_id: "f1".to_string(),
            user_id: "u1".to_string(),
            ip_address: "203.0.113.1".to_string(),
            created_at: t,
            released_at: None,
            last_billed_until: t + Duration::hours(2),
            events: vec![event(t, "create", &[])],
        };
        let charge = floating_ip_charge(&resource, t + Duration::hours(2), &pricing());
        assert_eq!(charge, Decimal::ZERO);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use cloudbill_models::{ComputeRate, EventEntry};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn pricing_with_rates(compute_rate: Decimal, disk_rate: Decimal, fip_rate: Decimal) -> PriceCatalogEntry {
        let mut compute = HashMap::new();
        compute.insert("small".to_string(), ComputeRate { per_hour: compute_rate });
        PriceCatalogEntry {
            currency: "USD".to_string(),
            compute,
            disk_per_gb_hour: disk_rate,
            floating_ip_per_hour: fip_rate,
            price_version: "2026-01-01_v1".to_string(),
        }
    }

    /// Rates expressed in whole cents, so every product with a whole-hour
    /// duration below divides evenly and avoids decimal-rounding noise.
    fn arb_rate() -> impl Strategy<Value = Decimal> {
        (0i64..10_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    fn arb_size_gb() -> impl Strategy<Value = i64> {
        0i64..5_000
    }

    proptest! {
        /// `canonicalize` only changes how a decimal is represented
        /// (trimmed trailing zeros, `-0` -> `0`), never what it represents —
        /// `rust_decimal`'s `PartialEq` compares by value, so this must hold
        /// for every scale/mantissa combination.
        #[test]
        fn canonicalize_preserves_numeric_value(mantissa in -1_000_000_000i64..1_000_000_000, scale in 0u32..6) {
            let d = Decimal::new(mantissa, scale);
            prop_assert_eq!(canonicalize(d), d);
        }

        /// Never truncates past `period_end`, and truncates exactly at
        /// `deleted_at` whenever that falls strictly before it (spec §4.4
        /// step 2).
        #[test]
        fn billing_end_never_exceeds_period_end(period_offset_secs in 0i64..1_000_000, delta_secs in -500_000i64..500_000) {
            let base = base_time();
            let period_end = base + Duration::seconds(period_offset_secs);
            let deleted_at = base + Duration::seconds(period_offset_secs + delta_secs);

            let end = billing_end(Some(deleted_at), period_end);
            prop_assert!(end <= period_end);
            if deleted_at < period_end {
                prop_assert_eq!(end, deleted_at);
            } else {
                prop_assert_eq!(end, period_end);
            }
        }

        /// A running compute resource with a single flavor and no
        /// intervening events charges non-negatively and scales linearly
        /// with the number of whole hours billed.
        #[test]
        fn compute_charge_scales_linearly_with_hours(rate in arb_rate(), hours in 1i64..200) {
            let t = base_time();
            let pricing = pricing_with_rates(rate, Decimal::ZERO, Decimal::ZERO);
            let resource = ComputeResource {
                resource_id: "c1".to_string(),
                user_id: "u1".to_string(),
                state: "running".to_string(),
                current_flavor: "small".to_string(),
                created_at: t,
                deleted_at: None,
                last_billed_until: t,
                events: vec![EventEntry {
                    event_id: "evt_1".to_string(),
                    time: t,
                    event_type: "create".to_string(),
                    meta: [("flavor".to_string(), serde_json::json!("small"))].into_iter().collect(),
                }],
            };

            let one = compute_charge(&resource, t + Duration::hours(hours), &pricing);
            let double = compute_charge(&resource, t + Duration::hours(hours * 2), &pricing);

            prop_assert!(one >= Decimal::ZERO);
            prop_assert_eq!(double, one * Decimal::from(2));
        }

        /// Disk charges are never negative and scale with size for a fixed
        /// duration, mirroring compute's linearity property for the other
        /// rate-relevant dimension.
        #[test]
        fn disk_charge_scales_linearly_with_size(rate in arb_rate(), size_gb in arb_size_gb(), hours in 1i64..200) {
            let t = base_time();
            let pricing = pricing_with_rates(Decimal::ZERO, rate, Decimal::ZERO);
            let make_resource = |size: i64| DiskResource {
                resource_id: "d1".to_string(),
                user_id: "u1".to_string(),
                size_gb: size,
                state: "detached".to_string(),
                created_at: t,
                deleted_at: None,
                last_billed_until: t,
                events: vec![EventEntry {
                    event_id: "evt_d_1".to_string(),
                    time: t,
                    event_type: "create".to_string(),
                    meta: [("size_gb".to_string(), serde_json::json!(size))].into_iter().collect(),
                }],
            };

            let end = t + Duration::hours(hours);
            let single = disk_charge(&make_resource(size_gb), end, &pricing);
            let doubled = disk_charge(&make_resource(size_gb * 2), end, &pricing);

            prop_assert!(single >= Decimal::ZERO);
            prop_assert_eq!(doubled, single * Decimal::from(2));
        }

        /// Floating IPs have no mid-period rate changes (spec §4.4 step 5):
        /// the charge is exactly proportional to elapsed whole hours.
        #[test]
        fn floating_ip_charge_scales_linearly_with_hours(rate in arb_rate(), hours in 1i64..200) {
            let t = base_time();
            let pricing = pricing_with_rates(Decimal::ZERO, Decimal::ZERO, rate);
            let resource = FloatingIpResource {
                resource_id: "f1".to_string(),
                user_id: "u1".to_string(),
                ip_address: "203.0.113.1".to_string(),
                created_at: t,
                released_at: None,
                last_billed_until: t,
                events: vec![EventEntry {
                    event_id: "evt_ip_1".to_string(),
                    time: t,
                    event_type: "create".to_string(),
                    meta: Default::default(),
                }],
            };

            let one = floating_ip_charge(&resource, t + Duration::hours(hours), &pricing);
            let double = floating_ip_charge(&resource, t + Duration::hours(hours * 2), &pricing);

            prop_assert_eq!(one, Decimal::from(hours) * rate);
            prop_assert_eq!(double, one * Decimal::from(2));
        }

        /// A `deleted` boundary strictly inside the window truncates the
        /// charge to the pre-deletion segment regardless of what rate would
        /// otherwise apply afterward (spec §4.4 step 3.3 / Scenario C).
        #[test]
        fn compute_charge_truncates_at_deletion(rate in arb_rate(), hours_before in 0i64..50, hours_after in 1i64..50) {
            let t = base_time();
            let deleted_at = t + Duration::hours(hours_before);
            let pricing = pricing_with_rates(rate, Decimal::ZERO, Decimal::ZERO);
            let resource = ComputeResource {
                resource_id: "c1".to_string(),
                user_id: "u1".to_string(),
                state: "deleted".to_string(),
                current_flavor: "small".to_string(),
                created_at: t,
                deleted_at: Some(deleted_at),
                last_billed_until: t,
                events: vec![
                    EventEntry {
                        event_id: "evt_1".to_string(),
                        time: t,
                        event_type: "create".to_string(),
                        meta: [("flavor".to_string(), serde_json::json!("small"))].into_iter().collect(),
                    },
                    EventEntry {
                        event_id: "evt_2".to_string(),
                        time: deleted_at,
                        event_type: "deleted".to_string(),
                        meta: Default::default(),
                    },
                ],
            };

            let period_end = deleted_at + Duration::hours(hours_after);
            let end = billing_end(resource.deleted_at, period_end);
            let charge = compute_charge(&resource, end, &pricing);

            prop_assert_eq!(charge, Decimal::from(hours_before) * rate);
        }
    }
}
