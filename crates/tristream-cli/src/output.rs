//! Terminal formatting helpers.

use colored::Colorize;

/// Render `rows` under `headers` with columns padded to the widest cell.
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

    let line = |cells: Vec<String>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join(" │ ")
    };

    let mut output = String::new();
    let header = line(headers.iter().map(|h| h.to_string()).collect());
    output.push_str(&format!("{}\n", header.bright_cyan().bold()));
    output.push_str(&format!(
        "{}\n",
        widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("─┼─")
    ));
    for row in rows {
        output.push_str(&line(row.clone()));
        output.push('\n');
    }
    output
}

/// Render aligned `key: value` lines.
pub fn format_kv_list(items: &[(&str, String)]) -> String {
    let key_width = items.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    items
        .iter()
        .map(|(k, v)| format!("  {}: {}", format!("{:key_width$}", k).bright_cyan(), v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Human-readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Human-readable duration from seconds.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.001 {
        format!("{:.2} µs", seconds * 1_000_000.0)
    } else if seconds < 1.0 {
        format!("{:.2} ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{:.2} s", seconds)
    } else {
        format!("{:.1} min", seconds / 60.0)
    }
}

/// Integer with thousands separators.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print an underlined section title.
pub fn print_section(title: &str) {
    println!("\n{}", title.bright_green().bold());
    println!("{}", "─".repeat(title.chars().count()).bright_green());
}

/// Print a success line.
pub fn print_success(message: &str) {
    println!("  {} {}", "✓".bright_green(), message);
}

/// Print an error line.
pub fn print_error(message: &str) {
    println!("  {} {}", "✗".bright_red(), message);
}

/// Print a warning line.
pub fn print_warning(message: &str) {
    println!("  {} {}", "⚠".bright_yellow(), message);
}

/// Print an informational line.
pub fn print_info(message: &str) {
    println!("  {} {}", "ℹ".bright_blue(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn test_format_table_pads_columns() {
        colored::control::set_override(false);
        let table = format_table(
            &["Stream", "Tokens"],
            &[vec!["alpha".into(), "12".into()], vec!["gamma".into(), "1024".into()]],
        );
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "alpha  │ 12    ");
        assert!(format_table(&["A"], &[]).is_empty());
    }
}
