use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::info;

use phptags::config::Config;
use phptags::indexer::walker::{CancelFlag, IndexReport};
use phptags::indexer::watcher::start_watcher;
use phptags::indexer::Indexer;

pub async fn index_project(project: String, rebuild: bool, prune: bool, watch: bool) -> Result<()> {
    info!("Indexing project: {}", project);

    let config = Config::from_project_dir(&project);
    let should_watch = watch || config.indexing.watch;

    println!("phptags indexer v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", project);
    println!("Database: {}", config.db_path(&project).display());

    let indexer = Arc::new(
        Indexer::open(&project, config).with_context(|| format!("failed to open tag store for {}", project))?,
    );

    if rebuild {
        indexer.rebuild().context("failed to clear tag store")?;
    }
    if prune {
        let removed = indexer.prune_missing().context("failed to prune missing files")?;
        println!("Pruned {} missing files", removed);
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let report = {
        let indexer = Arc::clone(&indexer);
        let project = project.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || walk_with_progress(&indexer, &project, &cancel)).await??
    };

    println!("\nIndexing {}!", if report.cancelled { "cancelled" } else { "complete" });
    println!("  Indexed:   {} files ({} tags)", report.indexed, report.tags);
    println!("  Unchanged: {} files", report.unchanged);
    if report.skipped > 0 {
        println!("  Skipped:   {} files over the size limit", report.skipped);
    }
    if report.failed > 0 {
        println!("  Failed:    {} files (run with --debug for details)", report.failed);
    }

    if should_watch && !cancel.is_cancelled() {
        println!("\nWatching for file changes. Press Ctrl+C to stop.");
        start_watcher(indexer, &project, cancel).await?;
    }

    Ok(())
}

fn walk_with_progress(indexer: &Indexer, project: &str, cancel: &CancelFlag) -> Result<IndexReport> {
    let mut run = indexer
        .begin_search(project)
        .with_context(|| format!("cannot scan {}", project))?;
    let files = run.files().to_vec();

    let bar = ProgressBar::new(files.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {wide_msg}")?.progress_chars("=> "),
    );

    for path in &files {
        if cancel.is_cancelled() {
            run.mark_cancelled();
            break;
        }
        let shown = path.strip_prefix(run.base_dir()).unwrap_or(path);
        bar.set_message(shown.display().to_string());
        run.walk(path);
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(run.end_search())
}
