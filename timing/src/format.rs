//! Text formatting for status reports: register values, timestamps and boxed tables

use crate::definitions::Command;
use chrono::{
    DateTime,
    Utc,
};
use std::fmt::Write;

/// Frequency of the timing system's timestamp counter
pub const CLOCK_HZ: u64 = 50_000_000;

/// Register values are always shown in hex
#[must_use]
pub fn format_reg_value(value: u32) -> String {
    format!("{value:#x}")
}

/// Combine a two-word (low word first) timestamp block into a single counter value
#[must_use]
pub fn tstamp2int(words: &[u32]) -> u64 {
    let lo = words.first().copied().unwrap_or_default();
    let hi = words.get(1).copied().unwrap_or_default();
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Render a timestamp counter (in ticks of [`CLOCK_HZ`] since the epoch) as a UTC date
#[must_use]
pub fn format_timestamp(tstamp: u64) -> String {
    let secs = i64::try_from(tstamp / CLOCK_HZ).unwrap_or(i64::MAX);
    // Sub-second ticks are 20 ns each
    let nanos = u32::try_from((tstamp % CLOCK_HZ) * 20).unwrap_or_default();
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(dt) => dt.format("%a, %d %b %Y %H:%M:%S +0000").to_string(),
        None => format!("{tstamp:#x} (out of range)"),
    }
}

/// Anything that can sit in a table cell
pub trait Cell {
    fn cell(&self) -> String;
}

impl Cell for u32 {
    fn cell(&self) -> String {
        format_reg_value(*self)
    }
}

impl Cell for String {
    fn cell(&self) -> String {
        self.clone()
    }
}

impl Cell for &str {
    fn cell(&self) -> String {
        (*self).to_owned()
    }
}

impl Cell for f64 {
    fn cell(&self) -> String {
        if self.is_nan() {
            "NaN".to_owned()
        } else {
            format!("{self:.3}")
        }
    }
}

fn rule(out: &mut String, widths: &[usize]) {
    out.push('+');
    for w in widths {
        out.push_str(&"-".repeat(w + 2));
        out.push('+');
    }
    out.push('\n');
}

fn row(out: &mut String, widths: &[usize], cells: &[String]) {
    out.push('|');
    for (w, c) in widths.iter().zip(cells) {
        let _ = write!(out, " {c:<w$} |");
    }
    out.push('\n');
}

/// Lay out a boxed table of `rows`, with an optional spanning title and column header
fn format_table(title: Option<&str>, header: Option<&[String]>, rows: &[Vec<String>]) -> String {
    let ncols = rows
        .iter()
        .map(Vec::len)
        .chain(header.map(<[String]>::len))
        .max()
        .unwrap_or(1)
        .max(1);
    let mut widths = vec![0usize; ncols];
    for r in rows.iter().map(Vec::as_slice).chain(header) {
        for (w, c) in widths.iter_mut().zip(r) {
            *w = (*w).max(c.len());
        }
    }
    // Widen the last column if the title needs the room
    if let Some(title) = title {
        let inner: usize = widths.iter().sum::<usize>() + 3 * (ncols - 1);
        if title.len() > inner {
            widths[ncols - 1] += title.len() - inner;
        }
    }
    let inner: usize = widths.iter().sum::<usize>() + 3 * (ncols - 1);
    let mut out = String::new();
    if let Some(title) = title {
        let _ = writeln!(out, "+{}+", "-".repeat(inner + 2));
        let _ = writeln!(out, "| {title:<inner$} |");
    }
    rule(&mut out, &widths);
    if let Some(header) = header {
        row(&mut out, &widths, header);
        rule(&mut out, &widths);
    }
    for r in rows {
        row(&mut out, &widths, r);
    }
    if !rows.is_empty() {
        rule(&mut out, &widths);
    }
    out
}

/// Format name/value pairs as a two column table
pub fn format_reg_table<K, V, I>(rows: I, title: &str, header: Option<(&str, &str)>) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Cell,
{
    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .map(|(k, v)| vec![k.as_ref().to_owned(), v.cell()])
        .collect();
    let header = header.map(|(a, b)| vec![a.to_owned(), b.to_owned()]);
    let title = (!title.is_empty()).then_some(title);
    format_table(title, header.as_deref(), &rows)
}

/// Format per-command counter blocks side by side, one column per block
#[must_use]
pub fn format_counters_table(counters: &[Vec<u32>], headers: &[&str]) -> String {
    let nrows = counters.iter().map(Vec::len).max().unwrap_or_default();
    let rows: Vec<Vec<String>> = (0..nrows)
        .map(|i| {
            let name = u32::try_from(i)
                .ok()
                .and_then(Command::from_code)
                .map_or_else(|| format!("{i:#x}"), |c| c.to_string());
            std::iter::once(name)
                .chain(
                    counters
                        .iter()
                        .map(|c| c.get(i).map_or_else(String::new, ToString::to_string)),
                )
                .collect()
        })
        .collect();
    let header: Vec<String> = std::iter::once("Cmd".to_owned())
        .chain(headers.iter().map(|h| (*h).to_owned()))
        .collect();
    format_table(None, Some(&header), &rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_value() {
        assert_eq!(format_reg_value(0), "0x0");
        assert_eq!(format_reg_value(0xdead), "0xdead");
    }

    #[test]
    fn test_tstamp2int() {
        assert_eq!(tstamp2int(&[0x1, 0x2]), 0x2_0000_0001);
        assert_eq!(tstamp2int(&[0x5]), 5);
        assert_eq!(tstamp2int(&[]), 0);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "Thu, 01 Jan 1970 00:00:00 +0000");
        // One day and one second in
        assert_eq!(
            format_timestamp(86_401 * CLOCK_HZ),
            "Fri, 02 Jan 1970 00:00:01 +0000"
        );
    }

    #[test]
    fn test_reg_table() {
        let table = format_reg_table([("a", 1u32), ("bbb", 0x10)], "State", None);
        let expected = "\
+------------+
| State      |
+-----+------+
| a   | 0x1  |
| bbb | 0x10 |
+-----+------+
";
        assert_eq!(table, expected);
    }

    #[test]
    fn test_reg_table_header() {
        let table = format_reg_table(
            [("State", "Ready".to_owned())],
            "",
            Some(("Name", "Value")),
        );
        let expected = "\
+-------+-------+
| Name  | Value |
+-------+-------+
| State | Ready |
+-------+-------+
";
        assert_eq!(table, expected);
    }

    #[test]
    fn test_wide_title() {
        let table = format_reg_table([("a", 1u32)], "A long title", None);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }

    #[test]
    fn test_counters_table() {
        let table = format_counters_table(&[vec![1, 2], vec![3, 4]], &["Accept", "Reject"]);
        assert!(table.contains("| Cmd      | Accept | Reject |"));
        assert!(table.contains("| TimeSync | 1      | 3      |"));
        assert!(table.contains("| Echo     | 2      | 4      |"));
    }
}
