//! Knowledge selector
//!
//! Reads the discovered knowledge back out as probe specs: top group stats
//! bias the opening probe and guided ingestion cycles; related
//! constellations bias the next question inside a session.

use sqlx::SqlitePool;

use crate::db::features::descriptor_for_value_type;
use crate::db::knowledge::{related_constellations, top_group_stats};
use crate::error::Result;
use crate::sample::{spec_for_descriptor, ProbeSpec};

/// Group stats below this sample size are not trusted for guidance.
pub const MIN_GUIDED_SAMPLE_SIZE: i64 = 8;

/// The most-sampled group stats hydrated back into probe specs. Stats whose
/// value type has since been pruned are silently skipped.
pub async fn select_top_descriptors(
    pool: &SqlitePool,
    limit: i64,
    min_sample_size: i64,
) -> Result<Vec<ProbeSpec>> {
    let stats = top_group_stats(pool, limit, min_sample_size).await?;
    let mut specs = Vec::with_capacity(stats.len());
    for stat in stats {
        if let Some(descriptor) = descriptor_for_value_type(pool, stat.value_type).await? {
            specs.push(spec_for_descriptor(&descriptor));
        }
    }
    Ok(specs)
}

/// GROUP-node companions of an anchor value type as ready-to-ask probe
/// specs, best-first, each paired with its backing node id so the caller
/// can account hits and misses.
pub async fn related_probe_specs(
    pool: &SqlitePool,
    anchor_value_type: i64,
    limit: i64,
) -> Result<Vec<(ProbeSpec, i64)>> {
    let related = related_constellations(pool, anchor_value_type, limit).await?;
    Ok(related
        .into_iter()
        .map(|r| (spec_for_descriptor(&r.descriptor), r.node_id))
        .collect())
}
