use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::error::AppError;
use crate::app::models::{MemoryBreakdown, MemoryCategory, MemoryExportRow, TOTAL_PSS_LABEL};

const SECTION_MARKER: &str = "** MEMINFO";
const NO_PROCESS_MARKER: &str = "No Process";

pub fn meminfo_command(package: &str) -> String {
    format!("dumpsys meminfo --local -s --package {package}")
}

pub fn resident_command(pid: u32) -> String {
    format!("top -n 1 -p {pid} -o RES -b -q")
}

/// Half-to-even at one decimal, applied to every megabyte figure.
pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}

pub fn kb_to_mb(kilobytes: f64) -> f64 {
    round_one_decimal(kilobytes / 1024.0)
}

/// Parses a detailed multi-process dump into per-label breakdowns with derived totals.
pub fn parse_meminfo_dump(output: &str) -> BTreeMap<String, MemoryBreakdown> {
    let mut processes = BTreeMap::new();
    if output.trim_start().starts_with(NO_PROCESS_MARKER) {
        return processes;
    }
    let label_re = Regex::new(r"\[(.*)\]").ok();
    let mut current: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(SECTION_MARKER) {
            current = label_re
                .as_ref()
                .and_then(|re| re.captures(trimmed))
                .map(|caps| caps[1].to_string());
            match &current {
                Some(label) => {
                    processes.insert(label.clone(), MemoryBreakdown::default());
                }
                None => warn!(line = %trimmed, "memory section without a process label"),
            }
            continue;
        }
        let Some(label) = current.as_ref() else {
            continue;
        };
        let Some(category) = MemoryCategory::ALL
            .into_iter()
            .find(|category| trimmed.starts_with(category.label()))
        else {
            continue;
        };
        match parse_category_kb(trimmed) {
            Some(kilobytes) => {
                if let Some(breakdown) = processes.get_mut(label) {
                    breakdown.set(category, kb_to_mb(kilobytes));
                }
            }
            None => warn!(line = %trimmed, category = category.label(), "skipping unparseable memory line"),
        }
    }

    for breakdown in processes.values_mut() {
        recompute_total(breakdown);
    }
    debug!(processes = processes.len(), "parsed memory dump");
    processes
}

fn parse_category_kb(line: &str) -> Option<f64> {
    let (_, value) = line.split_once(':')?;
    let token = value.split_whitespace().next()?;
    token.parse::<u64>().ok().map(|kb| kb as f64)
}

/// Any total already present is discarded.
pub fn recompute_total(breakdown: &mut MemoryBreakdown) {
    let sum: f64 = MemoryCategory::ALL
        .iter()
        .map(|category| breakdown.get(*category))
        .sum();
    breakdown.total_pss = round_one_decimal(sum);
}

/// Converts a `top` RES cell (`150M`, `80000K`, `1.2G`, bare kilobytes) to megabytes.
pub fn parse_resident_mb(raw: &str) -> Option<f64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    let (number, unit) = match value.char_indices().last() {
        Some((index, unit)) if unit.is_ascii_alphabetic() => (&value[..index], Some(unit)),
        _ => (value, None),
    };
    let number = number.parse::<f64>().ok()?;
    let kilobytes = match unit.map(|unit| unit.to_ascii_uppercase()) {
        None | Some('K') => number,
        Some('M') => number * 1024.0,
        Some('G') => number * 1024.0 * 1024.0,
        Some(_) => return None,
    };
    Some(kb_to_mb(kilobytes))
}

pub const CSV_HEADERS: [&str; 9] = [
    "Time",
    "Java Heap",
    "Native Heap",
    "Code",
    "Stack",
    "Graphics",
    "Private Other",
    "System",
    TOTAL_PSS_LABEL,
];

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_memory_csv(rows: &[MemoryExportRow]) -> String {
    let mut out = CSV_HEADERS.join(",");
    out.push_str("\r\n");
    for row in rows {
        let mut cells = vec![csv_cell(&row.time)];
        cells.extend(
            MemoryCategory::ALL
                .iter()
                .map(|category| format!("{:.1}", row.breakdown.get(*category))),
        );
        cells.push(format!("{:.1}", row.breakdown.total_pss));
        out.push_str(&cells.join(","));
        out.push_str("\r\n");
    }
    out
}

pub fn export_memory_csv(path: &Path, rows: &[MemoryExportRow], trace_id: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::system(format!("Failed to create export directory: {err}"), trace_id)
        })?;
    }
    fs::write(path, render_memory_csv(rows))
        .map_err(|err| AppError::system(format!("Failed to write memory export: {err}"), trace_id))?;
    info!(trace_id = %trace_id, path = %path.display(), rows = rows.len(), "memory export written");
    Ok(())
}

pub fn memory_export_filename(process: &str) -> String {
    memory_export_filename_at(process, Local::now().naive_local())
}

pub fn memory_export_filename_at(process: &str, at: NaiveDateTime) -> String {
    format!(
        "memory_data_{}_{}.csv",
        sanitize_filename_component(process),
        at.format("%Y%m%d_%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn single_section_yields_converted_category_and_total() {
        let dump = "** MEMINFO in pid 123 [com.foo] **\nNative Heap:     12345 kB\n";
        let parsed = parse_meminfo_dump(dump);
        let breakdown = parsed.get("com.foo").expect("label");
        assert_eq!(breakdown.native_heap, 12.1);
        assert_eq!(breakdown.total_pss, 12.1);
        assert_eq!(breakdown.java_heap, 0.0);
    }

    #[test]
    fn raw_total_is_replaced_by_sum() {
        let dump = "\
** MEMINFO in pid 123 [com.foo] **
 App Summary
                       Pss(KB)
                        ------
           Java Heap:     2048
         Native Heap:     1024
                Code:      512
               Stack:      102
            Graphics:        0
       Private Other:      307
              System:     4096
           TOTAL PSS:    99999            TOTAL RSS:   100000
";
        let parsed = parse_meminfo_dump(dump);
        let breakdown = parsed["com.foo"];
        assert_eq!(breakdown.java_heap, 2.0);
        assert_eq!(breakdown.code, 0.5);
        assert_eq!(breakdown.stack, 0.1);
        assert_eq!(breakdown.private_other, 0.3);
        let sum: f64 = MemoryCategory::ALL.iter().map(|c| breakdown.get(*c)).sum();
        assert_eq!(breakdown.total_pss, round_one_decimal(sum));
        assert_ne!(breakdown.total_pss, kb_to_mb(99999.0));
    }

    #[test]
    fn keeps_sections_separate() {
        let dump = "\
** MEMINFO in pid 1 [com.foo] **
Java Heap: 1024
** MEMINFO in pid 2 [com.foo:remote] **
Java Heap: 2048
";
        let parsed = parse_meminfo_dump(dump);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["com.foo"].java_heap, 1.0);
        assert_eq!(parsed["com.foo:remote"].java_heap, 2.0);
    }

    #[test]
    fn bad_line_is_skipped_not_fatal() {
        let dump = "\
** MEMINFO in pid 1 [com.foo] **
Java Heap: lots
Native Heap: 2048
";
        let parsed = parse_meminfo_dump(dump);
        assert_eq!(parsed["com.foo"].java_heap, 0.0);
        assert_eq!(parsed["com.foo"].native_heap, 2.0);
        assert_eq!(parsed["com.foo"].total_pss, 2.0);
    }

    #[test]
    fn no_process_output_is_empty() {
        assert!(parse_meminfo_dump("No Process found for: com.foo\n").is_empty());
    }

    #[test]
    fn rounding_is_half_to_even() {
        assert_eq!(round_one_decimal(0.25), 0.2);
        assert_eq!(round_one_decimal(0.75), 0.8);
        assert_eq!(kb_to_mb(1024.0), 1.0);
    }

    #[test]
    fn resident_cells_convert_to_megabytes() {
        assert_eq!(parse_resident_mb("150M"), Some(150.0));
        assert_eq!(parse_resident_mb("80000K"), Some(78.1));
        assert_eq!(parse_resident_mb("1.5G"), Some(1536.0));
        assert_eq!(parse_resident_mb("2048"), Some(2.0));
        assert_eq!(parse_resident_mb(""), None);
        assert_eq!(parse_resident_mb("n/a"), None);
    }

    #[test]
    fn csv_has_fixed_header_and_one_row_per_sample() {
        let mut breakdown = MemoryBreakdown::default();
        breakdown.java_heap = 1.5;
        recompute_total(&mut breakdown);
        let rows = vec![
            MemoryExportRow {
                time: "12:00:01".to_string(),
                breakdown,
            },
            MemoryExportRow {
                time: "12:00:02".to_string(),
                breakdown,
            },
        ];
        let csv = render_memory_csv(&rows);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "Time,Java Heap,Native Heap,Code,Stack,Graphics,Private Other,System,TOTAL PSS"
        );
        assert_eq!(lines[1], "12:00:01,1.5,0.0,0.0,0.0,0.0,0.0,0.0,1.5");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn export_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("memory.csv");
        export_memory_csv(&path, &[], "trace").expect("export");
        let written = std::fs::read_to_string(&path).expect("read");
        assert!(written.starts_with("Time,"));
    }

    #[test]
    fn export_filename_is_sanitized_and_timestamped() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|date| date.and_hms_opt(7, 5, 1))
            .expect("timestamp");
        assert_eq!(
            memory_export_filename_at("com.foo:remote", at),
            "memory_data_com.foo_remote_20240309_070501.csv"
        );
    }
}
