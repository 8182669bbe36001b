pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device_path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device_path must be an absolute device path starting with '/'".to_string());
    }
    if trimmed.contains('\0') || trimmed.contains('\n') {
        return Err("device_path contains invalid characters".to_string());
    }
    if trimmed.trim_end_matches('/').is_empty() {
        return Err("device_path must not be root".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err("device_path must not contain '..' segments".to_string());
    }
    Ok(())
}

/// Joins with `/` whatever the host separator is; backslashes from host-side input are folded.
pub fn join_device_path(parent: &str, name: &str) -> String {
    let parent = parent.trim().replace('\\', "/");
    let name = name.trim().replace('\\', "/");
    let name = name.trim_start_matches('/');
    let base = parent.trim_end_matches('/');
    if name.is_empty() {
        return if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        };
    }
    format!("{base}/{name}")
}

pub fn device_basename(device_path: &str) -> String {
    device_path
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Single-quotes a value for the device shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn sanitize_filename_component(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    if sanitized.trim().is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

/// Package names are interpolated into device commands, so only the Java identifier alphabet passes.
pub fn validate_package_name(package: &str) -> Result<(), String> {
    let trimmed = package.trim();
    if trimmed.is_empty() {
        return Err("package_name is required".to_string());
    }
    let valid = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == ':');
    if !valid {
        return Err(format!("package_name contains invalid characters: {trimmed}"));
    }
    Ok(())
}
