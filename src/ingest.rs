//! Ingest orchestrator
//!
//! Walks a directory, feeds images to an adaptively-sized worker pool, and
//! runs progressive ingestion cycles per image: a random sampling cycle
//! first, then knowledge-guided cycles that append the descriptors the
//! store has learned to trust. A supervisor task samples system resources
//! and grows or shrinks the pool between jobs; workers never share mutable
//! state beyond counters.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::augment;
use crate::config::Settings;
use crate::db::features::{
    insert_feature_batch, resolve_value_type, NewFeature, ValueTypeCache,
};
use crate::db::images::{create_image, get_image, mark_ingestion_complete};
use crate::discovery::run_discovery;
use crate::error::Result;
use crate::extract::{extract_measurement, measure_channels_on_raster, Measurement};
use crate::governor::Governor;
use crate::query::{identify_file, QueryOutcome};
use crate::sample::{spec_for_descriptor, SAMPLES_PER_AUGMENTATION};
use crate::selector;

pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff"];

/// Discovery batch run when `--bootstrap` is requested.
const BOOTSTRAP_ITERATIONS: u32 = 100;

// ============================================================================
// Single-Image Ingestion
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub image_id: i64,
    pub feature_count: u64,
    pub cycles: u32,
    pub elapsed_ms: u64,
}

/// Ingest one image end-to-end: decode once, run every augmentation, write
/// feature batches, then flip the completion fence. Decode failures fail
/// the job and are never retried.
pub async fn ingest_image(
    pool: &SqlitePool,
    cache: &ValueTypeCache,
    settings: &Settings,
    path: &Path,
) -> Result<IngestReport> {
    let started = Instant::now();
    let img = image::open(path)?;
    let path_str = path.to_string_lossy().to_string();

    let record = create_image(pool, &path_str).await?;
    let names = augment::augmentation_names(settings.combo_augmentations);
    let mut feature_count = 0u64;
    let mut cycles = 1u32;

    // Cycle 1: random ordinals per augmentation. Each sampled geometry is
    // stored across every channel dimension from one statistics pass.
    for (aug_index, name) in names.iter().enumerate() {
        let raster = augment::apply_augmentation(&img, name, &path_str)?.to_rgb8();
        let ordinals: Vec<u64> = {
            let mut rng = rand::thread_rng();
            (0..settings.random_per_aug)
                .map(|_| rng.gen_range(0..SAMPLES_PER_AUGMENTATION))
                .collect()
        };

        let mut measurements = Vec::new();
        for ordinal in ordinals {
            let sample_id = aug_index as u64 * SAMPLES_PER_AUGMENTATION + ordinal;
            let descriptor =
                crate::sample::descriptor_for_sample(sample_id, settings.combo_augmentations);
            measurements.extend(measure_channels_on_raster(&raster, &descriptor));
        }
        feature_count += write_measurements(pool, cache, settings, record.image_id, &measurements)
            .await?;
    }

    // Later cycles: append what the knowledge graph considers the best
    // discriminators, realized on this image.
    for _ in 1..settings.progressive_cycles {
        let specs = selector::select_top_descriptors(
            pool,
            settings.guided_per_cycle as i64,
            selector::MIN_GUIDED_SAMPLE_SIZE,
        )
        .await?;
        if specs.is_empty() {
            break;
        }
        let mut measurements = Vec::new();
        for spec in specs {
            if let Some(m) = extract_measurement(&img, &spec.descriptor, &path_str)? {
                measurements.push(m);
            }
        }
        feature_count += write_measurements(pool, cache, settings, record.image_id, &measurements)
            .await?;
        cycles += 1;
    }

    mark_ingestion_complete(pool, record.image_id).await?;
    let report = IngestReport {
        image_id: record.image_id,
        feature_count,
        cycles,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    debug!(
        "ingested {} as image {} ({} features, {} cycle(s))",
        path_str, report.image_id, report.feature_count, report.cycles
    );
    Ok(report)
}

async fn write_measurements(
    pool: &SqlitePool,
    cache: &ValueTypeCache,
    settings: &Settings,
    image_id: i64,
    measurements: &[Measurement],
) -> Result<u64> {
    let mut batch = Vec::with_capacity(measurements.len());
    for m in measurements {
        let value_type =
            resolve_value_type(pool, cache, &m.descriptor, settings.db_retry_attempts).await?;
        let spec = spec_for_descriptor(&m.descriptor);
        batch.push(NewFeature {
            image_id,
            value_type,
            resolution_level: spec.resolution_level,
            pos_x: spec.pos_x,
            pos_y: spec.pos_y,
            rel_x: m.rel_x,
            rel_y: m.rel_y,
            value: m.value,
            size: m.size,
        });
    }
    insert_feature_batch(pool, &batch).await
}

// ============================================================================
// Resource Sampling
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    /// 1-minute loadavg divided by logical cpu count.
    pub load_ratio: f64,
    /// MemAvailable / MemTotal.
    pub free_mem_ratio: f64,
}

impl ResourceSample {
    pub fn is_healthy(&self) -> bool {
        self.load_ratio < 0.85 && self.free_mem_ratio > 0.15
    }
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Sample load and memory pressure. Platforms without /proc report healthy
/// so the pool simply runs at its cap.
pub fn sample_resources() -> ResourceSample {
    let load_ratio = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()))
        .map(|load| load / cpu_count() as f64)
        .unwrap_or(0.0);

    let free_mem_ratio = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| {
            let find = |key: &str| {
                s.lines()
                    .find(|l| l.starts_with(key))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse::<f64>().ok())
            };
            match (find("MemTotal:"), find("MemAvailable:")) {
                (Some(total), Some(avail)) if total > 0.0 => Some(avail / total),
                _ => None,
            }
        })
        .unwrap_or(1.0);

    ResourceSample {
        load_ratio,
        free_mem_ratio,
    }
}

fn pool_cap(user_cap: usize) -> usize {
    cpu_count().min(8).min(user_cap).max(1)
}

// ============================================================================
// Directory Training
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    pub discover: bool,
    pub bootstrap: bool,
    pub reprobe: bool,
    pub threads: Option<usize>,
    pub shuffle: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reprobe_matched: Option<usize>,
    pub reprobe_total: Option<usize>,
}

/// Image files under a directory, filtered by extension.
pub fn collect_image_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect()
}

/// Train the corpus from a directory with an adaptively-sized worker pool.
pub async fn train_directory(
    pool: &SqlitePool,
    settings: &Settings,
    dir: &Path,
    opts: &TrainOptions,
) -> Result<TrainReport> {
    let mut files = collect_image_files(dir);
    if opts.shuffle {
        files.shuffle(&mut rand::thread_rng());
    }
    let total = files.len();
    info!("training on {total} file(s) from {}", dir.display());
    if total == 0 {
        return Ok(TrainReport::default());
    }

    let max_workers = pool_cap(opts.threads.unwrap_or(settings.ingest_thread_cap));
    let (tx, rx) = mpsc::channel::<PathBuf>(total);
    for file in &files {
        tx.send(file.clone()).await.ok();
    }
    drop(tx);

    let rx = Arc::new(Mutex::new(rx));
    let target = Arc::new(AtomicUsize::new(1));
    let active = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(ValueTypeCache::new());
    let governor = Arc::new(Governor::new());
    let mut workers: JoinSet<()> = JoinSet::new();

    // Supervisor: keep the pool at target size, resample resources between
    // ticks, stop once every job has been accounted for.
    loop {
        while active.load(Ordering::SeqCst) < target.load(Ordering::SeqCst)
            && completed.load(Ordering::SeqCst) < total
        {
            active.fetch_add(1, Ordering::SeqCst);
            workers.spawn(worker_loop(
                pool.clone(),
                Arc::clone(&rx),
                Arc::clone(&cache),
                Arc::clone(&governor),
                settings.clone(),
                opts.discover,
                Arc::clone(&target),
                Arc::clone(&active),
                Arc::clone(&completed),
                Arc::clone(&succeeded),
            ));
        }

        if completed.load(Ordering::SeqCst) >= total {
            break;
        }
        tokio::time::sleep(Duration::from_millis(settings.resource_sample_interval_ms)).await;

        let sample = sample_resources();
        let current = target.load(Ordering::SeqCst);
        let next = if sample.is_healthy() {
            (current + 1).min(max_workers)
        } else {
            current.saturating_sub(1).max(1)
        };
        if next != current {
            debug!(
                "worker pool target {current} -> {next} (load {:.2}, mem {:.2})",
                sample.load_ratio, sample.free_mem_ratio
            );
            target.store(next, Ordering::SeqCst);
        }
    }
    while workers.join_next().await.is_some() {}

    let succeeded = succeeded.load(Ordering::SeqCst);
    let mut report = TrainReport {
        total,
        succeeded,
        failed: total - succeeded,
        ..TrainReport::default()
    };

    if opts.bootstrap {
        let discovery = run_discovery(pool, settings, BOOTSTRAP_ITERATIONS, None).await?;
        info!(
            "bootstrap discovery: {} iteration(s), {} pair(s)",
            discovery.iterations_run, discovery.pairs_written
        );
    }

    if opts.reprobe {
        let (matched, probed) = reprobe_files(pool, settings, &files).await;
        report.reprobe_matched = Some(matched);
        report.reprobe_total = Some(probed);
        info!("reprobe self-evaluation: {matched}/{probed} identified correctly");
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    pool: SqlitePool,
    rx: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
    cache: Arc<ValueTypeCache>,
    governor: Arc<Governor>,
    settings: Settings,
    discover: bool,
    target: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    succeeded: Arc<AtomicUsize>,
) {
    loop {
        // Shrink request: surplus workers exit between jobs.
        if active.load(Ordering::SeqCst) > target.load(Ordering::SeqCst) {
            break;
        }
        let job = { rx.lock().await.recv().await };
        let Some(path) = job else {
            break;
        };

        match ingest_image(&pool, &cache, &settings, &path).await {
            Ok(report) => {
                succeeded.fetch_add(1, Ordering::SeqCst);
                info!(
                    "ingested {} ({} features in {} ms)",
                    path.display(),
                    report.feature_count,
                    report.elapsed_ms
                );
                if discover {
                    if let Err(e) =
                        run_discovery(&pool, &settings, settings.discover_iterations, None).await
                    {
                        warn!("post-ingest discovery failed: {e}");
                    }
                }
                governor.after_ingest(&pool, &settings).await;
            }
            Err(e) => {
                warn!("ingest failed for {}: {e}", path.display());
            }
        }
        completed.fetch_add(1, Ordering::SeqCst);
    }
    active.fetch_sub(1, Ordering::SeqCst);
}

/// Post-train self-evaluation: re-identify each ingested file and count
/// the dialogs that land on the right image.
async fn reprobe_files(
    pool: &SqlitePool,
    settings: &Settings,
    files: &[PathBuf],
) -> (usize, usize) {
    let mut matched = 0;
    let mut probed = 0;
    for path in files {
        probed += 1;
        match identify_file(pool, settings, path).await {
            Ok(QueryOutcome::Match { image_id, .. }) => {
                let expected = path.to_string_lossy();
                match get_image(pool, image_id).await {
                    Ok(row) if row.filename == expected.as_ref() => matched += 1,
                    _ => {}
                }
            }
            Ok(_) => {}
            Err(e) => warn!("reprobe failed for {}: {e}", path.display()),
        }
    }
    (matched, probed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use image::{Rgb, RgbImage};

    fn noise_image(seed: u32, w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = (x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17)).wrapping_add(seed * 97))
                % 256;
            Rgb([v as u8, (v * 3 % 256) as u8, (v * 7 % 256) as u8])
        })
    }

    fn fast_settings() -> Settings {
        Settings {
            random_per_aug: 6,
            combo_augmentations: 1,
            progressive_cycles: 1,
            resource_sample_interval_ms: 20,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_image_end_to_end() {
        let pool = init_memory_pool().await.unwrap();
        let settings = fast_settings();
        let cache = ValueTypeCache::new();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        noise_image(1, 220, 180).save(&path).unwrap();

        let report = ingest_image(&pool, &cache, &settings, &path).await.unwrap();
        assert!(report.feature_count > 0);
        assert_eq!(report.cycles, 1);

        let img = get_image(&pool, report.image_id).await.unwrap();
        assert!(img.ingestion_complete);
        assert_eq!(
            crate::db::features::features_for_image(&pool, report.image_id)
                .await
                .unwrap()
                .len() as u64,
            report.feature_count
        );
    }

    #[tokio::test]
    async fn test_ingest_missing_file_fails_cleanly() {
        let pool = init_memory_pool().await.unwrap();
        let settings = fast_settings();
        let cache = ValueTypeCache::new();
        let err = ingest_image(&pool, &cache, &settings, Path::new("/nope/missing.png")).await;
        assert!(err.is_err());
        // No half-created image row is left complete.
        assert_eq!(crate::db::images::count_complete_images(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_collect_image_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        noise_image(1, 32, 32).save(dir.path().join("a.png")).unwrap();
        noise_image(2, 32, 32).save(dir.path().join("b.jpg")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = collect_image_files(dir.path());
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_train_directory_counts() {
        let pool = init_memory_pool().await.unwrap();
        let settings = fast_settings();
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            noise_image(i, 200, 160)
                .save(dir.path().join(format!("{i}.png")))
                .unwrap();
        }
        // A corrupt file exercises the reject-and-continue path.
        std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();

        let opts = TrainOptions {
            threads: Some(2),
            ..TrainOptions::default()
        };
        let report = train_directory(&pool, &settings, dir.path(), &opts)
            .await
            .unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(crate::db::images::count_complete_images(&pool).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_train_empty_directory() {
        let pool = init_memory_pool().await.unwrap();
        let settings = fast_settings();
        let dir = tempfile::tempdir().unwrap();
        let report = train_directory(&pool, &settings, dir.path(), &TrainOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total, 0);
    }

    #[test]
    fn test_pool_cap_bounds() {
        assert!(pool_cap(100) <= 8);
        assert_eq!(pool_cap(0), 1);
        assert!(pool_cap(1) == 1);
    }

    #[test]
    fn test_resource_sample_shape() {
        let s = sample_resources();
        assert!(s.load_ratio >= 0.0);
        assert!(s.free_mem_ratio >= 0.0 && s.free_mem_ratio <= 1.0);
    }
}
