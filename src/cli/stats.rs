use anyhow::{Context, Result};
use std::path::Path;

use phptags::config::Config;
use phptags::index::db::TagStore;
use phptags::index::native::NativeStore;

pub async fn show_stats(project: String, verbose: bool) -> Result<()> {
    let config = Config::from_project_dir(&project);
    let db_path = config.db_path(&project);

    println!("phptags statistics v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", project);
    println!("Config: {}", if config.project.name != "unnamed-project" { "loaded" } else { "default" });

    let store = TagStore::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    let stats = store.get_stats()?;

    println!("\nIndex Statistics:");
    println!("  Total files: {}", stats.total_files);
    println!("  Total tags: {}", stats.total_tags);
    println!("  Classes using traits: {}", stats.classes_with_traits);
    println!("  Index size: {:.2} MB", db_size_mb(&db_path)?);

    if verbose {
        println!("\nDetailed Statistics:");

        let by_kind = store.tag_counts_by_kind()?;
        if !by_kind.is_empty() {
            println!("  Tags by kind:");
            for (kind, count) in by_kind {
                println!("    {}: {}", kind, count);
            }
        }

        let unsaved = store.all_file_tags()?.iter().filter(|f| f.is_new).count();
        if unsaved > 0 {
            println!("  Unsaved buffers: {}", unsaved);
        }

        if config.storage.use_native_tags {
            let natives = NativeStore::load()?;
            println!("  Native tags: {}", natives.len());
        }
    }

    Ok(())
}

fn db_size_mb(db_path: &Path) -> Result<f64> {
    let metadata = std::fs::metadata(db_path)?;
    Ok(metadata.len() as f64 / (1024.0 * 1024.0))
}
