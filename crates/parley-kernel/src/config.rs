//! Configuration loading from `~/.parley/config.toml` with defaults.
//!
//! A config file may list other TOML files under `include = [...]`. Includes
//! are merged first, in order, and the including file overrides them. Only
//! relative paths inside the config directory are accepted.

use parley_types::capability::Version;
use parley_types::config::CoordinatorConfig;
use parley_types::error::{ParleyError, ParleyResult};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 8;

/// Load configuration, falling back to defaults on any problem.
///
/// Problems are logged; the server still starts. Use [`read_config`] when a
/// broken file must be reported instead.
pub fn load_config(path: Option<&Path>) -> CoordinatorConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return CoordinatorConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            CoordinatorConfig::default()
        }
    }
}

/// Read, merge and validate a config file strictly.
pub fn read_config(path: &Path) -> ParleyResult<CoordinatorConfig> {
    let mut value = read_toml(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    merge_includes(&mut value, &dir, &mut visited, 0)?;

    let config: CoordinatorConfig = value
        .try_into()
        .map_err(|e: toml::de::Error| ParleyError::Config(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn read_toml(path: &Path) -> ParleyResult<toml::Value> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ParleyError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| ParleyError::Config(format!("cannot parse {}: {e}", path.display())))
}

/// Replace `value` with `includes ⊕ value`, recursively.
fn merge_includes(
    value: &mut toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> ParleyResult<()> {
    let includes: Vec<String> = match value.as_table_mut().and_then(|t| t.remove("include")) {
        Some(toml::Value::Array(arr)) => arr
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(_) => {
            return Err(ParleyError::Config(
                "`include` must be an array of paths".to_string(),
            ))
        }
        None => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(ParleyError::Config(format!(
            "include depth exceeds {MAX_INCLUDE_DEPTH}"
        )));
    }

    let canonical_dir = std::fs::canonicalize(dir)
        .map_err(|e| ParleyError::Config(format!("config dir cannot be resolved: {e}")))?;
    let mut base = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let rel = Path::new(include);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ParleyError::Config(format!(
                "include '{include}' must be a relative path inside the config directory"
            )));
        }
        let resolved = std::fs::canonicalize(dir.join(rel))
            .map_err(|e| ParleyError::Config(format!("include '{include}': {e}")))?;
        if !resolved.starts_with(&canonical_dir) {
            return Err(ParleyError::Config(format!(
                "include '{include}' escapes the config directory"
            )));
        }
        if !visited.insert(resolved.clone()) {
            return Err(ParleyError::Config(format!(
                "circular include detected at '{include}'"
            )));
        }

        info!(include = %include, "Loading config include");
        let mut included = read_toml(&resolved)?;
        let include_dir = resolved.parent().unwrap_or(dir).to_path_buf();
        merge_includes(&mut included, &include_dir, visited, depth + 1)?;
        deep_merge_toml(&mut base, &included);
    }

    deep_merge_toml(&mut base, value);
    *value = base;
    Ok(())
}

/// Deep-merge two TOML values. Tables merge recursively; anything else in
/// `overlay` replaces `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Semantic checks serde cannot express.
pub fn validate_config(config: &CoordinatorConfig) -> ParleyResult<()> {
    if config.protocols.is_empty() {
        return Err(ParleyError::Config(
            "at least one protocol must be configured".to_string(),
        ));
    }
    for p in &config.protocols {
        Version::parse(&p.version)
            .map_err(|e| ParleyError::Config(format!("protocol {p}: {e}")))?;
    }
    for cap in &config.capabilities {
        cap.validate()
            .map_err(|e| ParleyError::Config(e.to_string()))?;
    }
    let s = &config.session;
    if s.token_ttl_secs == 0 || s.idle_timeout_secs == 0 || s.sweep_interval_secs == 0 {
        return Err(ParleyError::Config(
            "session durations must be greater than zero".to_string(),
        ));
    }
    if config.router.default_request_timeout_ms > config.router.max_request_timeout_ms {
        return Err(ParleyError::Config(
            "router.default_request_timeout_ms exceeds max_request_timeout_ms".to_string(),
        ));
    }
    if config.stream.heartbeat_timeout_secs <= config.stream.heartbeat_interval_secs {
        return Err(ParleyError::Config(
            "stream.heartbeat_timeout_secs must exceed heartbeat_interval_secs".to_string(),
        ));
    }
    config
        .notifications
        .default_retry
        .validate()
        .map_err(|e| ParleyError::Config(format!("notifications.default_retry: {e}")))?;
    let mut names = HashSet::new();
    for server in &config.tools.servers {
        if !names.insert(server.name.as_str()) {
            return Err(ParleyError::Config(format!(
                "duplicate tool server '{}'",
                server.name
            )));
        }
    }
    Ok(())
}

/// Get the parley home directory.
pub fn parley_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".parley")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    parley_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{body}").unwrap();
        path
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/parley.toml")));
        assert_eq!(config.listen_addr.port(), 4100);
    }

    #[test]
    fn test_include_merged_under_root() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "base.toml",
            "listen_addr = \"0.0.0.0:9999\"\n[session]\nidle_timeout_secs = 42\ntoken_ttl_secs = 100\n",
        );
        let root = write(
            dir.path(),
            "config.toml",
            "include = [\"base.toml\"]\n[session]\ntoken_ttl_secs = 7200\n",
        );
        let config = read_config(&root).unwrap();
        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.session.idle_timeout_secs, 42);
        // Root wins over include
        assert_eq!(config.session.token_ttl_secs, 7200);
    }

    #[test]
    fn test_nested_include() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "leaf.toml", "[agent]\nname = \"leaf\"\n");
        write(
            dir.path(),
            "mid.toml",
            "include = [\"leaf.toml\"]\n[agent]\nid = \"mid-id\"\n",
        );
        let root = write(dir.path(), "config.toml", "include = [\"mid.toml\"]\n");
        let config = read_config(&root).unwrap();
        assert_eq!(config.agent.name, "leaf");
        assert_eq!(config.agent.id, "mid-id");
    }

    #[test]
    fn test_circular_include_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "include = [\"b.toml\"]\n");
        write(dir.path(), "b.toml", "include = [\"a.toml\"]\n");
        assert!(matches!(read_config(&a), Err(ParleyError::Config(_))));
        // Lenient loader falls back instead of failing
        assert_eq!(load_config(Some(&a)).listen_addr.port(), 4100);
    }

    #[test]
    fn test_traversal_and_absolute_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let up = write(dir.path(), "up.toml", "include = [\"../secrets.toml\"]\n");
        assert!(read_config(&up).is_err());
        let abs = write(dir.path(), "abs.toml", "include = [\"/etc/passwd\"]\n");
        assert!(read_config(&abs).is_err());
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let mut config = CoordinatorConfig::default();
        assert!(validate_config(&config).is_ok());

        config.router.default_request_timeout_ms = config.router.max_request_timeout_ms + 1;
        assert!(validate_config(&config).is_err());

        let mut config = CoordinatorConfig::default();
        config.protocols[0].version = "one.zero".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = CoordinatorConfig::default();
        config.stream.heartbeat_timeout_secs = config.stream.heartbeat_interval_secs;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value =
            toml::from_str("[stream]\nbuffer_capacity = 10\nresume_window_secs = 5\n").unwrap();
        let overlay: toml::Value = toml::from_str("[stream]\nbuffer_capacity = 99\n").unwrap();
        deep_merge_toml(&mut base, &overlay);
        let stream = base["stream"].as_table().unwrap();
        assert_eq!(stream["buffer_capacity"].as_integer(), Some(99));
        assert_eq!(stream["resume_window_secs"].as_integer(), Some(5));
    }
}
