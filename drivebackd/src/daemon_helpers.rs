fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("driveback-scratch")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// `aws_s3` -> `AWS_S3`, `b2-eu` -> `B2_EU`.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn destination_settings<F>(keys: &[String], home: &Path, lookup: F) -> Vec<DestinationSettings>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .map(|key| {
            let prefix = format!("DRIVEBACK_DEST_{}", env_key(key));
            DestinationSettings {
                key: key.clone(),
                enabled: lookup(&format!("{prefix}_ENABLED"))
                    .map(|value| parse_bool(&value))
                    .unwrap_or(true),
                bucket: lookup(&format!("{prefix}_BUCKET")),
                root: lookup(&format!("{prefix}_ROOT")).map(|value| expand_with_home(&value, home)),
            }
        })
        .collect()
}
