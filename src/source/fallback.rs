//! Deterministic substitute records for segments whose fetch failed.
//!
//! The batch for a segment depends only on the segment's configuration: a
//! ChaCha8 stream is seeded from the segment id and code prefix, so every
//! cycle that falls back produces the same codes and metrics (only
//! `last_updated` moves). ChaCha8 output is fixed for a given seed; the
//! range sampling on top of it is fixed within a `rand` minor release.
//! Metrics are bounded to plausible ranges and always finite, which keeps
//! aggregate arithmetic downstream free of special cases.

use crate::market::{MarketRecord, Provenance, RecordStatus, Segment};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Classification codes assigned to synthetic instruments.
const CLASSIFICATIONS: &[(&str, &str)] = &[
    ("C39", "Computer & Electronics"),
    ("C35", "Specialized Machinery"),
    ("I65", "Software & IT Services"),
    ("C27", "Pharmaceuticals"),
    ("C26", "Chemical Products"),
    ("C38", "Electrical Equipment"),
    ("M74", "Engineering Services"),
    ("F51", "Wholesale Trade"),
];

/// Every n-th synthetic instrument is marked suspended.
const SUSPENDED_EVERY: usize = 17;

/// Generate the fallback batch for `segment`. Always at least one record.
pub fn synthesize(segment: &Segment, generated_at: DateTime<Utc>) -> Vec<MarketRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(segment_seed(segment));
    let size = segment.fallback_size.max(1);
    (1..=size)
        .map(|ordinal| synthetic_record(segment, ordinal, &mut rng, generated_at))
        .collect()
}

fn synthetic_record(
    segment: &Segment,
    ordinal: usize,
    rng: &mut ChaCha8Rng,
    generated_at: DateTime<Utc>,
) -> MarketRecord {
    let (classification_code, classification_name) =
        CLASSIFICATIONS[rng.random_range(0..CLASSIFICATIONS.len())];

    let total_value = round2(rng.random_range(2.0e8..8.0e10));
    let ratio = rng.random_range(-3.0..3.0);
    let daily_net_inflow = round2(total_value * ratio / 100.0);
    let weekly_factor = rng.random_range(2.0..6.0);
    let weekly_drift = total_value * rng.random_range(-0.01..0.01);
    let latest_7d_inflow = round2(daily_net_inflow * weekly_factor + weekly_drift);
    let recent_volatility = round2(rng.random_range(0.5..9.0));

    let status = if ordinal % SUSPENDED_EVERY == 0 {
        RecordStatus::Suspended
    } else {
        RecordStatus::Normal
    };

    MarketRecord {
        code: format!("{}{ordinal:04}", segment.code_prefix),
        name: format!("{} Sample {ordinal:03}", segment.name),
        segment: segment.id.clone(),
        classification_code: classification_code.to_owned(),
        classification_name: classification_name.to_owned(),
        total_value,
        daily_net_inflow,
        net_inflow_ratio: round2(daily_net_inflow / total_value * 100.0),
        recent_volatility,
        latest_7d_inflow,
        last_updated: generated_at,
        status,
        provenance: Provenance::Synthetic,
    }
}

/// FNV-1a over the segment id and prefix, independent of process and platform.
fn segment_seed(segment: &Segment) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    segment
        .id
        .bytes()
        .chain([0u8])
        .chain(segment.code_prefix.bytes())
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
