use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use eikon_qc_core::{
    QcError,
    cleanup,
    config::{QcSettings, RunConfig, SidecarMode, default_operator, default_workers},
    fakeseq::{self, FrameRange, FrameTemplate},
    mutation::MutationConfig,
    run::RunCoordinator,
    sidecar::SidecarStore,
    summary,
    tracker::tracker_from_settings,
};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::{CleanArgs, Cli, Command, CrawlArgs, FakeSeqArgs, LoggingArgs, SummaryArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.logging);

    if let Ok(path) = dotenvy::dotenv() {
        debug!("loaded environment from {}", path.display());
    }
    let (settings, source) = QcSettings::load_from_env()?;
    debug!(?source, policy_version = %settings.policy_version, "QC settings loaded");

    match cli.command {
        Command::Crawl(args) => crawl(settings, args).await,
        Command::Summary(args) => summarize(settings, args),
        Command::Clean(args) => clean(settings, args),
        Command::FakeSeq(args) => fake_seq(args),
    }
}

fn init_tracing(logging: &LoggingArgs) {
    let fallback = if logging.quiet { "warn" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into());

    let (plain, json) = if logging.json_logs {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
}

async fn crawl(settings: QcSettings, args: CrawlArgs) -> Result<ExitCode> {
    let workers = args.workers.unwrap_or_else(default_workers);
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    let mutation = if args.enable_mutation_detection {
        let config = MutationConfig {
            threshold_frames: Some(args.mutation_threshold_frames.unwrap_or(1)),
            threshold_percent: args.mutation_threshold_percent,
            count_removed_frames: args.mutation_count_removed,
            ..MutationConfig::default()
        };
        config.validate()?;
        Some(config)
    } else {
        None
    };

    let tracker = tracker_from_settings(&settings.tracker)?;
    let operator = args.operator.unwrap_or_else(default_operator);

    let mut config = RunConfig::new(settings, operator);
    config.sidecar_mode = args.sidecar_mode;
    config.forced_result = args.result;
    config.note = args.note;
    config.mutation = mutation;
    config.show_mutation_diff = args.show_diff;
    config.workers = workers;
    config.min_sequence_len = args.min_seq;

    info!(
        roots = args.roots.len(),
        workers,
        mode = %config.sidecar_mode,
        forced = ?config.forced_result,
        "starting crawl"
    );

    let coordinator = RunCoordinator::new(Arc::new(config), tracker);
    let summaries = match coordinator.run_many(&args.roots, &args.asset_ids).await {
        Ok(summaries) => summaries,
        Err(QcError::Config(message)) => {
            error!("{message}");
            eprintln!("error: {message}");
            return Ok(ExitCode::from(1));
        }
        Err(err) => return Err(err.into()),
    };

    for summary in &summaries {
        println!(
            "{}: {} media files ({} sequences, {} files), {} marked, {} skipped, {} missing, {} errors",
            summary.root.display(),
            summary.media_files,
            summary.sequences,
            summary.singles,
            summary.marked.len(),
            summary.skipped.len(),
            summary.missing_marked,
            summary.worker_errors,
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn summarize(settings: QcSettings, args: SummaryArgs) -> Result<ExitCode> {
    // Readers accept sidecars in any placement, so the mode is irrelevant here.
    let store = SidecarStore::new(&settings, SidecarMode::default());
    let max_note_len = (args.max_note_len > 0).then_some(args.max_note_len);

    match summary::summarize(&store, &args.paths, max_note_len, args.by_dir) {
        Some(report) => {
            println!("{}", report.text);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("No QC sidecar files found.");
            Ok(ExitCode::from(1))
        }
    }
}

fn clean(settings: QcSettings, args: CleanArgs) -> Result<ExitCode> {
    if !args.root.is_dir() {
        bail!("{} is not a directory", args.root.display());
    }
    let store = SidecarStore::new(&settings, SidecarMode::default());
    let report = cleanup::clean(&store, &settings.hash_cache_name, &args.root, args.dry_run);

    if args.dry_run {
        for artifact in &report.removed {
            println!("[DRY-RUN] Would remove: {}", artifact.path().display());
        }
        println!("Done. Would remove {} items.", report.removed.len());
    } else {
        println!("Done. Removed {} items.", report.removed.len());
    }

    if report.failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Failed to remove {} items.", report.failed.len());
        Ok(ExitCode::from(1))
    }
}

fn fake_seq(args: FakeSeqArgs) -> Result<ExitCode> {
    let template = match (&args.like, &args.base) {
        (Some(sample), _) => FrameTemplate::from_sample(sample)?,
        (None, Some(base)) => FrameTemplate {
            base: base.clone(),
            pad: args.pad,
            ext: args.ext.trim_start_matches('.').to_string(),
        },
        (None, None) => bail!("either --like or --base is required"),
    };
    let range = FrameRange {
        start: args.start,
        end: args.end,
        step: args.step,
    };

    let report =
        fakeseq::make_sequence(&args.out, &template, range, args.dry_run, args.touch_existing)
            .with_context(|| format!("failed to create frames in {}", args.out.display()))?;

    if args.dry_run {
        for path in &report.planned {
            println!("[DRY] {}", path.display());
        }
    } else {
        println!(
            "Created {} frames in {} ({} already existed).",
            report.created,
            args.out.display(),
            report.skipped
        );
    }
    Ok(ExitCode::SUCCESS)
}
