//! Age histogram of the queue.

use crate::queue::Queue;
use serde::Serialize;

/// Default age thresholds in seconds with their labels.
pub const DEFAULT_INTERVALS: [(&str, i64); 6] = [
    ("Older than 10 minutes", 600),
    ("Older than 30 minutes", 1800),
    ("Older than one hour", 3600),
    ("Older than three hours", 3600 * 3),
    ("Older than a day", 3600 * 24),
    ("Older than a week", 3600 * 24 * 7),
];

/// One row of the histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgeBucket {
    /// Human readable threshold
    pub label: String,
    /// Threshold in seconds, `None` for the whole queue
    pub age: Option<i64>,
    /// Rows waiting at least `age` seconds
    pub count: i64,
}

/// The thresholds to report: `custom` seconds if given, the defaults otherwise.
/// The whole queue is always reported last.
pub fn intervals(custom: &[i64]) -> Vec<(String, Option<i64>)> {
    let mut intervals: Vec<_> = if custom.is_empty() {
        DEFAULT_INTERVALS
            .iter()
            .map(|(label, age)| (label.to_string(), Some(*age)))
            .collect()
    } else {
        custom
            .iter()
            .map(|age| (format!("Older than {age} seconds"), Some(*age)))
            .collect()
    };
    intervals.push(("All".to_string(), None));
    intervals
}

/// Count the queue rows per threshold at `now`.
pub async fn collect(queue: &Queue, now: i64, custom: &[i64]) -> Result<Vec<AgeBucket>, sqlx::Error> {
    let mut buckets = Vec::new();
    for (label, age) in intervals(custom) {
        let count = queue.count_older_than(now, age).await?;
        buckets.push(AgeBucket { label, age, count });
    }
    Ok(buckets)
}

/// Render the buckets as a two column text table.
pub fn render_table(buckets: &[AgeBucket]) -> String {
    const HEADERS: [&str; 2] = ["Age", "Queued previews"];

    let rows: Vec<[String; 2]> = buckets
        .iter()
        .map(|bucket| [bucket.label.clone(), bucket.count.to_string()])
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let separator = format!("+-{}-+-{}-+\n", "-".repeat(widths[0]), "-".repeat(widths[1]));
    let line = |cells: [&str; 2]| {
        format!(
            "| {:<w0$} | {:<w1$} |\n",
            cells[0],
            cells[1],
            w0 = widths[0],
            w1 = widths[1]
        )
    };

    let mut table = separator.clone();
    table.push_str(&line(HEADERS));
    table.push_str(&separator);
    for row in &rows {
        table.push_str(&line([row[0].as_str(), row[1].as_str()]));
    }
    table.push_str(&separator);
    table
}
