//! Output formatting utilities.

use colored::Colorize;

use duplex_tensor::{LedgerSnapshot, PlacementReport};

/// Format a table.
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let header = join_cells(headers.iter().copied(), &widths);
    output.push_str(&format!("{}\n", header.bright_cyan().bold()));

    let sep = widths
        .iter()
        .map(|w| "─".repeat(*w))
        .collect::<Vec<_>>()
        .join("─┼─");
    output.push_str(&format!("{}\n", sep));

    for row in rows {
        output.push_str(&join_cells(row.iter().map(String::as_str), &widths));
        output.push('\n');
    }
    output
}

fn join_cells<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, &width)| format!("{:width$}", cell, width = width))
        .collect::<Vec<_>>()
        .join(" │ ")
}

/// Format a key-value list.
pub fn format_kv_list(items: &[(&str, String)]) -> String {
    let max_key_len = items.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

    items
        .iter()
        .map(|(k, v)| {
            format!(
                "  {}: {}",
                format!("{:width$}", k, width = max_key_len).bright_cyan(),
                v
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.001 {
        format!("{:.2} µs", seconds * 1_000_000.0)
    } else if seconds < 1.0 {
        format!("{:.2} ms", seconds * 1000.0)
    } else {
        format!("{:.2} s", seconds)
    }
}

/// Ledger fields for [`format_kv_list`].
pub fn ledger_items(snapshot: &LedgerSnapshot) -> Vec<(&'static str, String)> {
    vec![
        ("Total", format_bytes(snapshot.total)),
        ("Free at refresh", format_bytes(snapshot.baseline_free)),
        ("Reserved since", format_bytes(snapshot.allocated)),
        ("Available", format_bytes(snapshot.available())),
        ("Refresh interval", snapshot.refresh_interval.to_string()),
        ("Releases pending", snapshot.release_count.to_string()),
        ("Refreshes", snapshot.refreshes.to_string()),
    ]
}

/// Placement rows for [`format_table`].
pub fn placement_rows(report: &PlacementReport) -> Vec<Vec<String>> {
    report
        .entries
        .iter()
        .map(|(ptr, status)| {
            vec![
                status.label.clone(),
                format!("{ptr}"),
                format!("{:?}", status.placement),
                format!("{} ({})", status.uploads, format_bytes(status.upload_bytes)),
                format!("{} ({})", status.downloads, format_bytes(status.download_bytes)),
            ]
        })
        .collect()
}

/// Column headers matching [`placement_rows`].
pub const PLACEMENT_HEADERS: [&str; 5] = ["Label", "Pointer", "Placement", "Uploads", "Downloads"];

/// Print a section header.
pub fn print_section(title: &str) {
    println!("\n{}", title.bright_green().bold());
    println!("{}", "─".repeat(title.chars().count()).bright_green());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".bright_green(), message);
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".bright_red(), message);
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".bright_yellow(), message);
}
