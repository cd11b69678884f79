//! Imprint CLI
//!
//! Corpus management and local identification: `add`, `remove`,
//! `bootstrap`, `train`, `server`, `find`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;

use imprint::config::Settings;
use imprint::db::{self, features::ValueTypeCache};
use imprint::discovery::run_discovery;
use imprint::ingest::{ingest_image, train_directory, TrainOptions};
use imprint::query::{identify_file, QueryOutcome};

#[derive(Parser)]
#[command(name = "imprint", version, about = "Content-based image retrieval through geometric probes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a single image into the corpus
    Add {
        /// Image file to ingest
        path: PathBuf,

        /// Discovery iterations to run after ingesting
        #[arg(long, default_value = "0")]
        discover: u32,
    },

    /// Remove an image by id or original filename
    Remove {
        /// Image id or filename
        identifier: String,
    },

    /// Run a correlation-discovery batch over the existing corpus
    Bootstrap {
        /// Iterations to run
        #[arg(default_value = "100")]
        iterations: u32,
    },

    /// Ingest every image under a directory with the adaptive worker pool
    Train {
        /// Directory to walk
        dir: PathBuf,

        /// Run online discovery after each ingest
        #[arg(long)]
        discover: bool,

        /// Run a discovery batch after training
        #[arg(long)]
        bootstrap: bool,

        /// Re-identify every trained file afterwards and report accuracy
        #[arg(long)]
        reprobe: bool,

        /// Worker cap (further bounded by cpu count)
        #[arg(long)]
        threads: Option<usize>,

        /// Shuffle the file order before training
        #[arg(long)]
        shuffle: bool,
    },

    /// Run the HTTP server
    Server,

    /// Identify an image against the corpus
    Find {
        /// Query image file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,imprint=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let pool = db::init_pool(&settings).await?;

    match cli.command {
        Commands::Add { path, discover } => {
            let cache = Arc::new(ValueTypeCache::new());
            let report = ingest_image(&pool, &cache, &settings, &path)
                .await
                .with_context(|| format!("failed to ingest {}", path.display()))?;
            println!(
                "{} image {} ({} features in {} ms)",
                "Ingested".green().bold(),
                report.image_id,
                report.feature_count,
                report.elapsed_ms
            );
            if discover > 0 {
                let d = run_discovery(&pool, &settings, discover, None).await?;
                println!(
                    "{} {} iteration(s), {} pair(s) written",
                    "Discovery:".cyan(),
                    d.iterations_run,
                    d.pairs_written
                );
            }
        }

        Commands::Remove { identifier } => {
            let image = match identifier.parse::<i64>() {
                Ok(id) => db::get_image(&pool, id).await?,
                Err(_) => db::get_image_by_filename(&pool, &identifier).await?,
            };
            db::delete_image(&pool, image.image_id).await?;
            println!("{} image {}", "Removed".green().bold(), image.image_id);
        }

        Commands::Bootstrap { iterations } => {
            let report = run_discovery(&pool, &settings, iterations, None).await?;
            println!(
                "{} {} iteration(s), {} pair(s), {} without ambiguity",
                "Discovery:".cyan().bold(),
                report.iterations_run,
                report.pairs_written,
                report.empty_ambiguity
            );
        }

        Commands::Train {
            dir,
            discover,
            bootstrap,
            reprobe,
            threads,
            shuffle,
        } => {
            let opts = TrainOptions {
                discover,
                bootstrap,
                reprobe,
                threads,
                shuffle,
            };
            let report = train_directory(&pool, &settings, &dir, &opts).await?;
            println!(
                "{} {}/{} ingested, {} failed",
                "Training:".green().bold(),
                report.succeeded,
                report.total,
                report.failed
            );
            if let (Some(matched), Some(total)) = (report.reprobe_matched, report.reprobe_total) {
                println!("{} {matched}/{total} identified correctly", "Reprobe:".cyan());
            }
            let stats = db::corpus_stats(&pool).await?;
            println!(
                "{} {} image(s), {} feature(s), {} value type(s), {} knowledge node(s)",
                "Corpus:".cyan(),
                stats.complete_images,
                stats.feature_vectors,
                stats.value_types,
                stats.knowledge_nodes
            );
            if report.failed > 0 && report.succeeded == 0 {
                bail!("every ingest failed");
            }
        }

        Commands::Server => {
            imprint::run_server(pool, settings).await?;
        }

        Commands::Find { path } => match identify_file(&pool, &settings, &path).await? {
            QueryOutcome::Match { image_id, probes } => {
                let image = db::get_image(&pool, image_id).await?;
                println!(
                    "{} image {} ({}) after {} probe(s)",
                    "Match:".green().bold(),
                    image_id,
                    image.filename,
                    probes
                );
            }
            QueryOutcome::NoMatch { probes } => {
                println!("{} after {} probe(s)", "No match".yellow().bold(), probes);
                bail!("no match");
            }
            QueryOutcome::Undecided { candidates, probes } => {
                println!(
                    "{} {} candidate(s) remain after {} probe(s): {:?}",
                    "Undecided:".yellow().bold(),
                    candidates.len(),
                    probes,
                    candidates
                );
                bail!("undecided");
            }
        },
    }

    Ok(())
}
