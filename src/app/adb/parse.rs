use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use crate::app::models::{DeviceIdentity, DeviceOverview, PackageEntry};

/// `adb devices -l`, keeping only rows in the `device` state.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceIdentity> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 || tokens[1] != "device" {
                return None;
            }
            let mut identity = DeviceIdentity::from_serial(tokens[0]);
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    identity.model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    identity.name = Some(value.to_string());
                }
            }
            Some(identity)
        })
        .collect()
}

pub fn parse_sdk_version(output: &str) -> Option<u32> {
    output.trim().parse::<u32>().ok()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// `pm list packages` rows; ids are listing positions.
pub fn parse_pm_list_packages(output: &str) -> Vec<PackageEntry> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .enumerate()
        .map(|(id, name)| PackageEntry {
            id,
            package_name: name.to_string(),
            display_name: name.to_string(),
        })
        .collect()
}

/// Value of a `/proc/meminfo` field with its label trimmed, e.g. `"3867148 kB"`.
pub fn parse_meminfo_value(output: &str, label: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != label {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// IPv4 address and MAC from `ip addr show wlan0`.
pub fn parse_wlan_addresses(output: &str) -> (Option<String>, Option<String>) {
    let ip = Regex::new(r"inet\s+(\d{1,3}(?:\.\d{1,3}){3})")
        .ok()
        .and_then(|re| re.captures(output).map(|caps| caps[1].to_string()));
    let mac = Regex::new(r"link/ether\s+([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})")
        .ok()
        .and_then(|re| re.captures(output).map(|caps| caps[1].to_string()));
    (ip, mac)
}

/// Picks the override value of `wm size` / `wm density` when present, else the physical one.
pub fn parse_wm_value(output: &str) -> (Option<String>, Option<String>) {
    let mut physical = None;
    let mut current = None;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        if label.trim().starts_with("Physical") {
            physical = Some(value);
        } else if label.trim().starts_with("Override") {
            current = Some(value);
        }
    }
    let effective = current.or_else(|| physical.clone());
    (physical, effective)
}

/// `ps -A | grep <package>` rows: field 9 is the process name, field 2 the pid.
pub fn parse_ps_pid(output: &str, package: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 || parts[8] != package {
            return None;
        }
        match parts[1].parse::<u32>() {
            Ok(pid) => Some(pid),
            Err(_) => {
                debug!(line = %line, "ps row has a non-numeric pid");
                None
            }
        }
    })
}

/// `pm path` rows, e.g. `package:/data/app/com.foo-1/base.apk`.
pub fn parse_pm_path(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

/// `pm`/`am`/installer replies count as success only when they say so.
pub fn output_reports_success(output: &str) -> bool {
    output.lines().any(|line| line.trim() == "Success")
}

pub struct OverviewSources<'a> {
    pub kernel: &'a str,
    pub font_scale: &'a str,
    pub getprop: &'a str,
    pub wlan: &'a str,
    pub meminfo: &'a str,
    pub wm_size: &'a str,
    pub wm_density: &'a str,
}

pub fn build_device_overview(serial: &str, sdk_level: u32, sources: &OverviewSources<'_>) -> DeviceOverview {
    let props = parse_getprop_map(sources.getprop);
    let prop = |key: &str| props.get(key).filter(|value| !value.is_empty()).cloned();
    let text = |value: &str| {
        let trimmed = value.trim();
        (!trimmed.is_empty() && trimmed != "null").then(|| trimmed.to_string())
    };
    let (ip_address, mac_address) = parse_wlan_addresses(sources.wlan);
    let (physical_size, size) = parse_wm_value(sources.wm_size);
    let (physical_density, density) = parse_wm_value(sources.wm_density);
    let with_density = |size: Option<String>, density: Option<String>| match (size, density) {
        (Some(size), Some(density)) => Some(format!("{size} ({density}dpi)")),
        (Some(size), None) => Some(size),
        _ => None,
    };
    DeviceOverview {
        serial: serial.to_string(),
        kernel_version: text(sources.kernel),
        font_scale: text(sources.font_scale),
        name: prop("ro.product.name"),
        model: prop("ro.product.model"),
        brand: prop("ro.product.brand"),
        serial_number: prop("ro.serialno"),
        android_version: prop("ro.build.version.release"),
        sdk_level,
        processor: prop("ro.product.board").or_else(|| prop("ro.board.platform")),
        abi: prop("ro.product.cpu.abi"),
        ip_address,
        mac_address,
        mem_total: parse_meminfo_value(sources.meminfo, "MemTotal"),
        mem_free: parse_meminfo_value(sources.meminfo, "MemAvailable"),
        physical_resolution: with_density(physical_size, physical_density),
        resolution: with_density(size, density),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_in_device_state_only() {
        let output = "List of devices attached\n\
ABC123 device usb:1-1 product:sunfish model:Pixel_4a device:sunfish transport_id:1\n\
XYZ offline\n\
emulator-5554 unauthorized\n";
        let devices = parse_adb_devices(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "ABC123");
        assert_eq!(devices[0].model.as_deref(), Some("Pixel_4a"));
        assert_eq!(devices[0].name.as_deref(), Some("sunfish"));
    }

    #[test]
    fn parses_sdk_version_with_newline() {
        assert_eq!(parse_sdk_version("29\n"), Some(29));
        assert_eq!(parse_sdk_version("error: closed"), None);
    }

    #[test]
    fn parses_package_listing_with_positional_ids() {
        let entries = parse_pm_list_packages("package:com.foo\npackage:com.bar\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].package_name, "com.foo");
        assert_eq!(entries[0].id, 0);
        assert_eq!(entries[1].package_name, "com.bar");
        assert_eq!(entries[1].id, 1);
    }

    #[test]
    fn trims_meminfo_label() {
        let output = "MemTotal:        3867148 kB\nMemFree:          120000 kB\n";
        assert_eq!(
            parse_meminfo_value(output, "MemTotal").as_deref(),
            Some("3867148 kB")
        );
        assert_eq!(parse_meminfo_value(output, "MemAvailable"), None);
    }

    #[test]
    fn extracts_wlan_addresses() {
        let output = "\
3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc mq state UP group default qlen 3000
    link/ether 02:00:00:44:55:66 brd ff:ff:ff:ff:ff:ff
    inet 192.168.1.23/24 brd 192.168.1.255 scope global wlan0
";
        let (ip, mac) = parse_wlan_addresses(output);
        assert_eq!(ip.as_deref(), Some("192.168.1.23"));
        assert_eq!(mac.as_deref(), Some("02:00:00:44:55:66"));
        assert_eq!(parse_wlan_addresses("Device \"wlan0\" does not exist."), (None, None));
    }

    #[test]
    fn prefers_override_wm_values() {
        let (physical, current) = parse_wm_value("Physical size: 1080x2340\nOverride size: 720x1560\n");
        assert_eq!(physical.as_deref(), Some("1080x2340"));
        assert_eq!(current.as_deref(), Some("720x1560"));
        let (physical, current) = parse_wm_value("Physical density: 440\n");
        assert_eq!(physical.as_deref(), Some("440"));
        assert_eq!(current.as_deref(), Some("440"));
    }

    #[test]
    fn finds_pid_by_exact_process_name() {
        let output = "\
u0_a123  4321  600 1000 2000 0 0 S com.foo.bar
u0_a124  1234  600 1000 2000 0 0 S com.foo
";
        assert_eq!(parse_ps_pid(output, "com.foo"), Some(1234));
        assert_eq!(parse_ps_pid(output, "com.missing"), None);
    }

    #[test]
    fn detects_success_replies() {
        assert!(output_reports_success("Performing Streamed Install\nSuccess\n"));
        assert!(!output_reports_success("Failure [DELETE_FAILED_INTERNAL_ERROR]"));
    }

    #[test]
    fn builds_overview_from_sources() {
        let sources = OverviewSources {
            kernel: "4.14.190\n",
            font_scale: "1.0\n",
            getprop: "[ro.product.model]: [Pixel 4a]\n[ro.product.brand]: [google]\n[ro.build.version.release]: [13]\n[ro.product.board]: [sunfish]\n",
            wlan: "inet 10.0.0.5/24",
            meminfo: "MemTotal:        3867148 kB\nMemAvailable:    1200000 kB\n",
            wm_size: "Physical size: 1080x2340\n",
            wm_density: "Physical density: 440\n",
        };
        let overview = build_device_overview("ABC", 33, &sources);
        assert_eq!(overview.model.as_deref(), Some("Pixel 4a"));
        assert_eq!(overview.kernel_version.as_deref(), Some("4.14.190"));
        assert_eq!(overview.processor.as_deref(), Some("sunfish"));
        assert_eq!(overview.mem_free.as_deref(), Some("1200000 kB"));
        assert_eq!(overview.resolution.as_deref(), Some("1080x2340 (440dpi)"));
        assert_eq!(overview.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(overview.mac_address, None);
        assert_eq!(overview.sdk_level, 33);
    }
}
