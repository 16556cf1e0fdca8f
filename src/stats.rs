//! Processing history and database overview.
//!
//! [`HistoricalStats`] feeds the pipeline's completion estimate: a weighted
//! average of seconds per page over every succeeded task. [`run_stats`]
//! prints the `docchunk stats` summary.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::store::{Store, StoreCounts};

/// Source of the historical processing rate.
#[async_trait]
pub trait HistoricalStats: Send + Sync {
    /// `None` when no succeeded task with page data exists yet.
    async fn average_seconds_per_page(&self) -> Result<Option<f64>>;
}

/// [`HistoricalStats`] computed from a [`Store`].
pub struct StoreHistoricalStats {
    store: Arc<dyn Store>,
}

impl StoreHistoricalStats {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HistoricalStats for StoreHistoricalStats {
    async fn average_seconds_per_page(&self) -> Result<Option<f64>> {
        Ok(self.store.processing_totals().await?.seconds_per_page())
    }
}

/// Fixed rate, mostly for tests.
pub struct FixedRate(pub Option<f64>);

#[async_trait]
impl HistoricalStats for FixedRate {
    async fn average_seconds_per_page(&self) -> Result<Option<f64>> {
        Ok(self.0)
    }
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = db::open_store(config).await?;
    let counts = store.counts().await?;
    let rate = store.processing_totals().await?.seconds_per_page();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docchunk: database stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Tasks:");
    for (status, n) in &counts.tasks_by_status {
        println!("    {:<12} {:>6}", status.as_str(), n);
    }
    println!();
    println!("  Documents:   {}", counts.documents);
    println!("  Chunks:      {}", counts.chunks);
    print_coverage("Derived:", counts.chunks_with_derivatives, &counts);
    println!("  Derivatives: {}", counts.derivatives);
    print_coverage("Embedded:", counts.chunks_with_embeddings, &counts);
    println!();
    match rate {
        Some(secs) => println!("  Avg time:    {:.1} s/page", secs),
        None => println!("  Avg time:    no history yet"),
    }
    println!();

    store.pool().close().await;
    Ok(())
}

fn print_coverage(label: &str, covered: i64, counts: &StoreCounts) {
    println!(
        "  {:<12} {} / {} ({}%)",
        label,
        covered,
        counts.chunks,
        percent(covered, counts.chunks)
    );
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
