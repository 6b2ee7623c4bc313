//! Knowledge base statistics overview.
//!
//! A quick summary of what the index holds: source, chunk, and code
//! example counts plus a per-source breakdown with crawl status and
//! freshness. Used by `quarry stats` to confirm ingestion runs landed.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-source breakdown of stored rows.
struct SourceStats {
    title: String,
    crawl_status: String,
    chunk_count: i64,
    example_count: i64,
    word_count: i64,
    updated_at: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_sources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
        .fetch_one(&pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;

    let total_examples: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM code_examples")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Quarry — Knowledge Base Stats");
    println!("=============================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Sources:        {}", total_sources);
    println!("  Chunks:         {}", total_chunks);
    println!("  Code examples:  {}", total_examples);

    let source_rows = sqlx::query(
        r#"
        SELECT
            s.title,
            s.crawl_status,
            s.word_count,
            s.updated_at,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT e.id) AS example_count
        FROM sources s
        LEFT JOIN chunks c ON c.source_id = s.id
        LEFT JOIN code_examples e ON e.source_id = s.id
        GROUP BY s.id
        ORDER BY chunk_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let source_stats: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| SourceStats {
            title: row.get("title"),
            crawl_status: row.get("crawl_status"),
            chunk_count: row.get("chunk_count"),
            example_count: row.get("example_count"),
            word_count: row.get("word_count"),
            updated_at: row.get("updated_at"),
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<32} {:<12} {:>7} {:>9} {:>9}   {}",
            "SOURCE", "STATUS", "CHUNKS", "EXAMPLES", "WORDS", "UPDATED"
        );
        println!("  {}", "-".repeat(88));

        for s in &source_stats {
            println!(
                "  {:<32} {:<12} {:>7} {:>9} {:>9}   {}",
                truncate(&s.title, 32),
                s.crawl_status,
                s.chunk_count,
                s.example_count,
                s.word_count,
                format_ts_relative(s.updated_at)
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative_buckets() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 3 * 86400), "3 days ago");
    }
}
