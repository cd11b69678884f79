//! Session engine
//!
//! The interactive probing protocol. A session exists only while at least
//! two candidates disagree; it lives in a process-local concurrent map
//! keyed by a random id and expires on idle TTL. Within a session,
//! refinements only ever intersect; an empty intersection surfaces
//! NO_MATCH and ends the session rather than backtracking.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::features::{record_skip, record_usage};
use crate::db::knowledge::record_node_miss;
use crate::descriptor::{Descriptor, CHANNEL_DIMENSIONS};
use crate::error::{EngineError, Result};
use crate::matcher::{find_candidates, find_candidates_strict, resolve_probe, Probe};
use crate::sample::{descriptor_for_sample, spec_for_descriptor, ProbeSpec, SAMPLES_PER_AUGMENTATION};
use crate::selector;

// ============================================================================
// Session State
// ============================================================================

/// One step of the constellation path, returned with every response for
/// client telemetry. `accuracy_score` never drives control flow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstellationStep {
    pub descriptor_hash: String,
    pub candidate_count: usize,
    pub rel_x: f64,
    pub rel_y: f64,
    pub size: f64,
    pub accuracy_score: f64,
    pub cumulative_accuracy: f64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    /// Ordered candidate set; refinements preserve rank order.
    pub candidates: Vec<i64>,
    pub asked: HashSet<String>,
    /// Value type of the last probe, the anchor for constellation lookups.
    pub last_value_type: Option<i64>,
    pub last_descriptor: Option<Descriptor>,
    /// Knowledge node behind the outstanding guided question, if any.
    pub pending_guided_node: Option<i64>,
    pub constellation: Vec<ConstellationStep>,
    touched_at: Instant,
}

impl Session {
    fn new() -> Self {
        Session {
            session_id: Uuid::new_v4().to_string(),
            candidates: Vec::new(),
            asked: HashSet::new(),
            last_value_type: None,
            last_descriptor: None,
            pending_guided_node: None,
            constellation: Vec::new(),
            touched_at: Instant::now(),
        }
    }

    fn push_step(&mut self, descriptor_hash: String, candidate_count: usize, probe: &Probe) {
        let accuracy = if candidate_count > 0 {
            1.0 / candidate_count as f64
        } else {
            0.0
        };
        let cumulative = self
            .constellation
            .last()
            .map(|s| s.cumulative_accuracy)
            .unwrap_or(1.0)
            * accuracy;
        self.constellation.push(ConstellationStep {
            descriptor_hash,
            candidate_count,
            rel_x: probe.rel_x,
            rel_y: probe.rel_y,
            size: probe.size,
            accuracy_score: accuracy,
            cumulative_accuracy: cumulative,
        });
    }
}

/// Process-local session map with idle-TTL expiry. Reads are cheap and
/// concurrent; the sweeper holds the write lock only to evict.
pub struct SessionStore {
    inner: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(Duration::from_secs(settings.session_ttl_secs))
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner
            .read()
            .expect("session map poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn insert(&self, mut session: Session) {
        session.touched_at = Instant::now();
        self.inner
            .write()
            .expect("session map poisoned")
            .insert(session.session_id.clone(), session);
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.inner
            .write()
            .expect("session map poisoned")
            .remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("session map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict sessions idle past the TTL. Returns evicted count.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.write().expect("session map poisoned");
        let before = map.len();
        map.retain(|_, s| now.duration_since(s.touched_at) < self.ttl);
        before - map.len()
    }

    /// Background expiry task; checks at a fraction of the TTL.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let period = store.ttl.div_f64(4.0).max(Duration::from_secs(5));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = store.sweep();
                if evicted > 0 {
                    info!("expired {evicted} idle session(s)");
                }
            }
        })
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of one protocol step.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Server proposes a descriptor; the client measures and calls back.
    RequestProbe { probe_spec: ProbeSpec },
    NoMatch {
        constellation: Vec<ConstellationStep>,
    },
    MatchFound {
        image_id: i64,
        constellation: Vec<ConstellationStep>,
    },
    Candidates {
        session_id: String,
        candidates: Vec<i64>,
        next_question: Option<ProbeSpec>,
        constellation: Vec<ConstellationStep>,
    },
}

// ============================================================================
// Engine
// ============================================================================

/// Propose the opening probe: knowledge-biased when the store has learned
/// enough, else a random stored descriptor, else (empty store) a fresh
/// sample.
pub async fn request_probe(pool: &SqlitePool, settings: &Settings) -> Result<ProbeSpec> {
    let guided = selector::select_top_descriptors(pool, 1, selector::MIN_GUIDED_SAMPLE_SIZE).await;
    match guided {
        Ok(mut specs) if !specs.is_empty() => return Ok(specs.remove(0)),
        Ok(_) => {}
        Err(e) => warn!("knowledge-guided probe selection failed: {e}"),
    }

    if let Some(descriptor) = crate::db::features::random_stored_descriptor(pool).await? {
        return Ok(spec_for_descriptor(&descriptor));
    }

    let total = SAMPLES_PER_AUGMENTATION
        * crate::augment::augmentation_names(settings.combo_augmentations).len() as u64;
    let sample_id = rand::thread_rng().gen_range(0..total);
    Ok(spec_for_descriptor(&descriptor_for_sample(
        sample_id,
        settings.combo_augmentations,
    )))
}

/// First probe of a dialog. A session is allocated only when at least two
/// candidates survive; zero candidates never allocates anything.
pub async fn start_with_probe(
    pool: &SqlitePool,
    store: &SessionStore,
    settings: &Settings,
    probe: &Probe,
) -> Result<ProbeOutcome> {
    let Some(resolved) = resolve_probe(pool, probe).await? else {
        return Ok(ProbeOutcome::NoMatch {
            constellation: Vec::new(),
        });
    };

    let set = find_candidates(pool, &resolved, settings).await?;
    for c in &set.candidates {
        record_usage(pool, c.best_vector_id, Some(c.score)).await?;
    }

    match set.candidates.len() {
        0 => Ok(ProbeOutcome::NoMatch {
            constellation: Vec::new(),
        }),
        1 => Ok(ProbeOutcome::MatchFound {
            image_id: set.candidates[0].image_id,
            constellation: Vec::new(),
        }),
        _ => {
            let mut session = Session::new();
            session.candidates = set.image_ids();
            session.asked.insert(resolved.descriptor_hash.clone());
            session.last_value_type = Some(resolved.value_type);
            session.last_descriptor = Some(probe.descriptor.canonicalize());
            session.push_step(resolved.descriptor_hash.clone(), set.candidates.len(), probe);

            let question = next_question(pool, settings, &mut session).await?;
            let out = ProbeOutcome::Candidates {
                session_id: session.session_id.clone(),
                candidates: session.candidates.clone(),
                next_question: question,
                constellation: session.constellation.clone(),
            };
            debug!(
                "session {} opened with {} candidates",
                session.session_id,
                session.candidates.len()
            );
            store.insert(session);
            Ok(out)
        }
    }
}

/// Refine an existing session with another probe. The candidate set only
/// ever shrinks; disagreement ends the dialog.
pub async fn refine(
    pool: &SqlitePool,
    store: &SessionStore,
    settings: &Settings,
    session_id: &str,
    probe: &Probe,
) -> Result<ProbeOutcome> {
    let mut session = store
        .get(session_id)
        .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
    let guided_node = session.pending_guided_node.take();

    let resolved = resolve_probe(pool, probe).await?;
    let matched: Vec<i64> = match &resolved {
        Some(r) => {
            let set = find_candidates_strict(pool, r, settings).await?;
            for c in &set.candidates {
                record_usage(pool, c.best_vector_id, Some(c.score)).await?;
            }
            set.image_ids()
        }
        None => Vec::new(),
    };

    let before = session.candidates.len();
    let matched_set: HashSet<i64> = matched.iter().copied().collect();
    let intersection: Vec<i64> = session
        .candidates
        .iter()
        .copied()
        .filter(|id| matched_set.contains(id))
        .collect();

    let hash = resolved
        .as_ref()
        .map(|r| r.descriptor_hash.clone())
        .unwrap_or_else(|| probe.descriptor.canonicalize().hash());
    session.asked.insert(hash.clone());
    session.push_step(hash.clone(), intersection.len(), probe);

    // A probe that failed to narrow anything was unhelpful.
    if intersection.len() == before {
        record_skip(pool, &hash).await.ok();
    }

    match intersection.len() {
        0 => {
            if let Some(node_id) = guided_node {
                record_node_miss(pool, node_id).await.ok();
            }
            let constellation = session.constellation.clone();
            store.remove(session_id);
            Ok(ProbeOutcome::NoMatch { constellation })
        }
        1 => {
            let constellation = session.constellation.clone();
            store.remove(session_id);
            Ok(ProbeOutcome::MatchFound {
                image_id: intersection[0],
                constellation,
            })
        }
        _ => {
            session.candidates = intersection;
            if let Some(r) = &resolved {
                session.last_value_type = Some(r.value_type);
                session.last_descriptor = Some(probe.descriptor.canonicalize());
            }
            let question = next_question(pool, settings, &mut session).await?;
            let out = ProbeOutcome::Candidates {
                session_id: session.session_id.clone(),
                candidates: session.candidates.clone(),
                next_question: question,
                constellation: session.constellation.clone(),
            };
            store.insert(session);
            Ok(out)
        }
    }
}

/// Propose the next descriptor to ask, never repeating one. Priority:
/// knowledge-guided constellation companion, then channel variation of the
/// last descriptor, then (only when the session has no usable last spec) a
/// fresh sample. Exhausted channels end the dialog.
pub async fn next_question(
    pool: &SqlitePool,
    settings: &Settings,
    session: &mut Session,
) -> Result<Option<ProbeSpec>> {
    if let Some(value_type) = session.last_value_type {
        match selector::related_probe_specs(pool, value_type, 16).await {
            Ok(related) => {
                for (spec, node_id) in related {
                    if !session.asked.contains(&spec.descriptor_key) {
                        session.pending_guided_node = Some(node_id);
                        return Ok(Some(spec));
                    }
                }
            }
            Err(e) => warn!("constellation lookup failed: {e}"),
        }
    }

    if let Some(last) = session.last_descriptor.clone() {
        for channel in CHANNEL_DIMENSIONS {
            let varied = last.with_channel(channel);
            let spec = spec_for_descriptor(&varied);
            if !session.asked.contains(&spec.descriptor_key) {
                return Ok(Some(spec));
            }
        }
        // Every channel of this geometry has been asked.
        return Ok(None);
    }

    let total = SAMPLES_PER_AUGMENTATION
        * crate::augment::augmentation_names(settings.combo_augmentations).len() as u64;
    let sample_id = rand::thread_rng().gen_range(0..total);
    Ok(Some(spec_for_descriptor(&descriptor_for_sample(
        sample_id,
        settings.combo_augmentations,
    ))))
}
