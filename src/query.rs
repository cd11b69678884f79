//! Local probing loop
//!
//! The client half of the probing protocol, run in-process: measure the
//! proposed descriptor on the query image, hand the probe to the session
//! engine, follow next questions until a decision. The CLI `find` command
//! and train-time self-evaluation both drive this loop.

use std::path::Path;

use sqlx::SqlitePool;
use tracing::debug;

use crate::config::Settings;
use crate::db::features::record_skip;
use crate::error::Result;
use crate::extract::extract_measurement;
use crate::matcher::Probe;
use crate::sample::ProbeSpec;
use crate::session::{self, ProbeOutcome, SessionStore};

/// How many fresh opening probes to try before concluding the image cannot
/// be probed at all (for instance, too small for any sampled span).
const MAX_OPENING_ATTEMPTS: u32 = 8;

/// Outcome of a full local probing dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Match { image_id: i64, probes: u32 },
    NoMatch { probes: u32 },
    /// The dialog ran out of questions while candidates still disagreed.
    Undecided { candidates: Vec<i64>, probes: u32 },
}

fn probe_from_spec(
    img: &image::DynamicImage,
    spec: &ProbeSpec,
    path: &str,
) -> Result<Option<Probe>> {
    let Some(m) = extract_measurement(img, &spec.descriptor, path)? else {
        return Ok(None);
    };
    Ok(Some(Probe {
        descriptor: m.descriptor,
        value: m.value,
        size: m.size,
        rel_x: m.rel_x,
        rel_y: m.rel_y,
        resolution_level: None,
    }))
}

/// Identify an image file against the corpus through a probing dialog.
pub async fn identify_file(
    pool: &SqlitePool,
    settings: &Settings,
    path: &Path,
) -> Result<QueryOutcome> {
    let img = image::open(path)?;
    let path_str = path.to_string_lossy().to_string();
    let store = SessionStore::from_settings(settings);
    let mut probes = 0u32;

    // Opening probe: keep requesting descriptors until one is measurable.
    let mut opening = None;
    for _ in 0..MAX_OPENING_ATTEMPTS {
        let spec = session::request_probe(pool, settings).await?;
        match probe_from_spec(&img, &spec, &path_str)? {
            Some(probe) => {
                opening = Some(probe);
                break;
            }
            None => {
                // The descriptor cannot be realized here; count the skip.
                record_skip(pool, &spec.descriptor_key).await.ok();
            }
        }
    }
    let Some(probe) = opening else {
        return Ok(QueryOutcome::NoMatch { probes });
    };
    probes += 1;

    let mut outcome = session::start_with_probe(pool, &store, settings, &probe).await?;
    loop {
        match outcome {
            ProbeOutcome::MatchFound { image_id, .. } => {
                debug!("identified image {image_id} after {probes} probe(s)");
                return Ok(QueryOutcome::Match { image_id, probes });
            }
            ProbeOutcome::NoMatch { .. } => return Ok(QueryOutcome::NoMatch { probes }),
            ProbeOutcome::RequestProbe { .. } => {
                // The engine only emits this before the first probe.
                return Ok(QueryOutcome::NoMatch { probes });
            }
            ProbeOutcome::Candidates {
                session_id,
                candidates,
                next_question,
                ..
            } => {
                let Some(question) = next_question else {
                    return Ok(QueryOutcome::Undecided { candidates, probes });
                };
                match probe_from_spec(&img, &question, &path_str)? {
                    Some(next) => {
                        probes += 1;
                        outcome =
                            session::refine(pool, &store, settings, &session_id, &next).await?;
                    }
                    None => {
                        // Unmeasurable question: reject it and end the dialog
                        // rather than guessing.
                        record_skip(pool, &question.descriptor_key).await.ok();
                        store.remove(&session_id);
                        return Ok(QueryOutcome::Undecided { candidates, probes });
                    }
                }
            }
        }
    }
}
