use chrono::DateTime;
use tracing::{debug, warn};

use crate::app::adb::paths::join_device_path;
use crate::app::models::{FileEntry, ProcessRecord, SyncDirEntry};

pub const PROCESS_COLUMNS: [&str; 7] = ["pid", "%cpu", "time+", "res", "user", "name", "args"];
pub const FALLBACK_PROCESS_COMMAND: &str = "top -b -n 1";
pub const HEADER_MARKER: &str = "PID";
pub const HEADER_SCAN_LINES: usize = 32;

const UNKNOWN_OWNER: &str = "unknown";

/// `top` invocation that requests the fixed column order.
pub fn process_list_command() -> String {
    let columns: String = PROCESS_COLUMNS
        .iter()
        .map(|column| format!(" -o {column}"))
        .collect();
    format!("{FALLBACK_PROCESS_COMMAND}{columns}")
}

/// Splits on whitespace runs into at most `max_fields` fields; the last field keeps the rest of
/// the line verbatim (inner whitespace included).
pub fn split_fields(line: &str, max_fields: usize) -> Vec<&str> {
    if max_fields == 0 {
        return line.split_whitespace().collect();
    }
    let mut fields = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        if fields.len() + 1 == max_fields {
            fields.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }
    fields
}

/// One data row, columns in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub fields: Vec<(String, String)>,
}

impl TableRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn last(&self) -> Option<&str> {
        self.fields.last().map(|(_, value)| value.as_str())
    }
}

pub fn find_header(lines: &[&str], marker: &str, scan_limit: usize) -> Option<usize> {
    lines
        .iter()
        .take(scan_limit)
        .position(|line| line.trim().starts_with(marker))
}

pub fn normalize_column(column: &str) -> String {
    let lowered = column
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();
    match lowered.as_str() {
        "cpu%" => "%cpu".to_string(),
        "uid" => "user".to_string(),
        "rss" => "res".to_string(),
        _ => lowered,
    }
}

pub fn detect_columns(header: &str) -> Vec<String> {
    header.split_whitespace().map(normalize_column).collect()
}

/// Rows after the header. Blank lines are skipped, short rows are padded with empty strings, and
/// a row whose trailing field equals `self_command` is dropped.
pub fn parse_table_rows(
    lines: &[&str],
    columns: &[String],
    self_command: Option<&str>,
) -> Vec<TableRow> {
    let mut rows = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parts = split_fields(trimmed, columns.len());
        let fields: Vec<(String, String)> = columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                let value = parts.get(index).copied().unwrap_or_default();
                (column.clone(), value.to_string())
            })
            .collect();
        let row = TableRow { fields };
        if let (Some(command), Some(last)) = (self_command, row.last()) {
            if last == command {
                debug!(command = %command, "dropping the listing command's own row");
                continue;
            }
        }
        rows.push(row);
    }
    rows
}

/// Parses output of the fixed-column `top` call. `None` when the header never appears, which
/// means the device's `top` ignored `-o` and the caller should fall back to detection.
pub fn parse_fixed_process_table(output: &str, self_command: Option<&str>) -> Option<Vec<TableRow>> {
    let lines: Vec<&str> = output.lines().collect();
    let header = find_header(&lines, HEADER_MARKER, HEADER_SCAN_LINES)?;
    let columns: Vec<String> = PROCESS_COLUMNS.iter().map(|c| c.to_string()).collect();
    Some(parse_table_rows(&lines[header + 1..], &columns, self_command))
}

/// Parses plain `top` output, taking the column layout from its own header line.
pub fn parse_detected_process_table(
    output: &str,
    self_command: Option<&str>,
) -> Option<Vec<TableRow>> {
    let lines: Vec<&str> = output.lines().collect();
    let header = find_header(&lines, HEADER_MARKER, HEADER_SCAN_LINES)?;
    let columns = detect_columns(lines[header]);
    if columns.is_empty() {
        return None;
    }
    Some(parse_table_rows(&lines[header + 1..], &columns, self_command))
}

pub fn process_record_from_row(row: &TableRow) -> Option<ProcessRecord> {
    let pid = match row.get("pid").map(str::parse::<u32>) {
        Some(Ok(pid)) => pid,
        _ => {
            debug!(row = ?row.fields, "skipping process row without a numeric pid");
            return None;
        }
    };
    let text = |column: &str| row.get(column).unwrap_or_default().to_string();
    let cpu_percent = row
        .get("%cpu")
        .map(|value| value.trim_end_matches('%'))
        .and_then(|value| value.parse::<f32>().ok());
    let name = text("name");
    let args = row
        .get("args")
        .map(str::to_string)
        .unwrap_or_else(|| name.clone());
    let elapsed = row.get("time+").or_else(|| row.get("time")).unwrap_or_default();
    Some(ProcessRecord {
        pid,
        cpu_percent,
        elapsed: elapsed.to_string(),
        resident: text("res"),
        user: text("user"),
        name,
        args,
    })
}

pub fn process_records(rows: &[TableRow]) -> Vec<ProcessRecord> {
    rows.iter().filter_map(process_record_from_row).collect()
}

/// `ls -l` rows: `permissions links owner group size date time name`.
pub fn parse_ls_long(parent: &str, output: &str) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("total ") || trimmed == "total" {
            continue;
        }
        let parts = split_fields(trimmed, 8);
        if parts.len() < 8 {
            warn!(line = %trimmed, fields = parts.len(), "skipping unparseable ls row");
            continue;
        }
        let size_bytes = match parts[4].parse::<u64>() {
            Ok(size) => size,
            Err(err) => {
                warn!(line = %trimmed, error = %err, "skipping ls row with invalid size");
                continue;
            }
        };
        let permissions = parts[0];
        let name = match permissions.starts_with('l') {
            true => parts[7].split(" -> ").next().unwrap_or(parts[7]),
            false => parts[7],
        };
        if name == "." || name == ".." {
            continue;
        }
        entries.push(FileEntry {
            name: name.to_string(),
            path: join_device_path(parent, name),
            size_bytes,
            // Same rule as the stat listing: links are navigable.
            is_dir: permissions.starts_with(['d', 'l']),
            permissions: permissions.to_string(),
            owner: parts[2].to_string(),
            group: parts[3].to_string(),
            modified: format!("{} {}", parts[5], parts[6]),
        });
    }
    entries
}

/// Rows produced by `stat -c '%f|%s|%Y|%n'` (hex mode, size, epoch mtime, name).
pub fn parse_stat_listing(output: &str) -> Vec<SyncDirEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.trim_end_matches('\r').splitn(4, '|');
            let mode = u32::from_str_radix(parts.next()?.trim(), 16).ok();
            let size = parts.next()?.trim().parse::<u64>().ok();
            let mtime = parts.next()?.trim().parse::<i64>().ok();
            let name = parts.next()?.trim_start_matches("./");
            match (mode, size, mtime) {
                (Some(mode), Some(size), Some(mtime)) if !name.is_empty() => Some(SyncDirEntry {
                    name: name.to_string(),
                    mode,
                    size,
                    mtime,
                }),
                _ => {
                    debug!(line = %line, "skipping malformed stat row");
                    None
                }
            }
        })
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Directories and symlinks are both navigable (`/sdcard` is a link on most devices).
pub fn mode_is_navigable(mode: u32) -> bool {
    matches!(mode & S_IFMT, S_IFDIR | S_IFLNK)
}

pub fn format_mode_permissions(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

pub fn sync_entry_to_file_entry(parent: &str, entry: &SyncDirEntry) -> FileEntry {
    let modified = DateTime::from_timestamp(entry.mtime, 0)
        .map(|stamp| stamp.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    FileEntry {
        name: entry.name.clone(),
        path: join_device_path(parent, &entry.name),
        size_bytes: entry.size,
        is_dir: mode_is_navigable(entry.mode),
        permissions: format_mode_permissions(entry.mode),
        owner: UNKNOWN_OWNER.to_string(),
        group: UNKNOWN_OWNER.to_string(),
        modified,
    }
}

/// Directories first, then case-insensitive name; stable for equal keys.
pub fn sort_directories_first(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
