use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub model: Option<String>,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn from_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            model: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceOverview {
    pub serial: String,
    pub kernel_version: Option<String>,
    pub font_scale: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub brand: Option<String>,
    pub serial_number: Option<String>,
    pub android_version: Option<String>,
    pub sdk_level: u32,
    pub processor: Option<String>,
    pub abi: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub mem_total: Option<String>,
    pub mem_free: Option<String>,
    pub physical_resolution: Option<String>,
    pub resolution: Option<String>,
}

/// One row of a `top` sample. Only `pid` identifies the process across polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub cpu_percent: Option<f32>,
    pub elapsed: String,
    pub resident: String,
    pub user: String,
    pub name: String,
    pub args: String,
}

/// `id` is the position in one listing, not a durable key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageEntry {
    pub id: usize,
    pub package_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub is_dir: bool,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub modified: String,
}

/// Raw directory entry as reported by a structured listing (`mode` carries the file type bits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDirEntry {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryCategory {
    JavaHeap,
    NativeHeap,
    Code,
    Stack,
    Graphics,
    PrivateOther,
    System,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 7] = [
        MemoryCategory::JavaHeap,
        MemoryCategory::NativeHeap,
        MemoryCategory::Code,
        MemoryCategory::Stack,
        MemoryCategory::Graphics,
        MemoryCategory::PrivateOther,
        MemoryCategory::System,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MemoryCategory::JavaHeap => "Java Heap",
            MemoryCategory::NativeHeap => "Native Heap",
            MemoryCategory::Code => "Code",
            MemoryCategory::Stack => "Stack",
            MemoryCategory::Graphics => "Graphics",
            MemoryCategory::PrivateOther => "Private Other",
            MemoryCategory::System => "System",
        }
    }
}

pub const TOTAL_PSS_LABEL: &str = "TOTAL PSS";

/// Per-category megabytes for one process. `total_pss` is derived, never read from input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct MemoryBreakdown {
    #[serde(rename = "Java Heap")]
    pub java_heap: f64,
    #[serde(rename = "Native Heap")]
    pub native_heap: f64,
    #[serde(rename = "Code")]
    pub code: f64,
    #[serde(rename = "Stack")]
    pub stack: f64,
    #[serde(rename = "Graphics")]
    pub graphics: f64,
    #[serde(rename = "Private Other")]
    pub private_other: f64,
    #[serde(rename = "System")]
    pub system: f64,
    #[serde(rename = "TOTAL PSS")]
    pub total_pss: f64,
}

impl MemoryBreakdown {
    pub fn get(&self, category: MemoryCategory) -> f64 {
        match category {
            MemoryCategory::JavaHeap => self.java_heap,
            MemoryCategory::NativeHeap => self.native_heap,
            MemoryCategory::Code => self.code,
            MemoryCategory::Stack => self.stack,
            MemoryCategory::Graphics => self.graphics,
            MemoryCategory::PrivateOther => self.private_other,
            MemoryCategory::System => self.system,
        }
    }

    pub fn set(&mut self, category: MemoryCategory, megabytes: f64) {
        let slot = match category {
            MemoryCategory::JavaHeap => &mut self.java_heap,
            MemoryCategory::NativeHeap => &mut self.native_heap,
            MemoryCategory::Code => &mut self.code,
            MemoryCategory::Stack => &mut self.stack,
            MemoryCategory::Graphics => &mut self.graphics,
            MemoryCategory::PrivateOther => &mut self.private_other,
            MemoryCategory::System => &mut self.system,
        };
        *slot = megabytes;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryReading {
    /// Coarse RES column from a per-process `top` sample.
    Resident {
        raw: String,
        megabytes: Option<f64>,
    },
    /// Detailed dump keyed by process label.
    Breakdown {
        processes: BTreeMap<String, MemoryBreakdown>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryExportRow {
    pub time: String,
    pub breakdown: MemoryBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: String,
    pub package: String,
    pub pid: Option<u32>,
    pub cpu: Option<String>,
    pub memory: Option<MemoryReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: String,
    pub process_id: String,
    pub level: char,
    pub message: String,
    pub component: String,
    pub package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenCapture {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
    pub size_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingExport {
    pub remote_path: String,
    pub size_bytes: u64,
    pub local_path: Option<String>,
    pub data_url: Option<String>,
}
