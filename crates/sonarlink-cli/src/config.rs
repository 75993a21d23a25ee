//! Configuration Vault – reads/writes `~/.sonarlink/config.toml`.
//!
//! The file holds a [`MonitorConfig`]; every key is optional and falls back
//! to the built-in default (the original four-sensor installation talking
//! to a broker on `localhost`).

use std::fs;
use std::path::{Path, PathBuf};

use sonarlink_types::MonitorConfig;

/// Return the path to `~/.sonarlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".sonarlink").join("config.toml")
}

/// Configuration for this run: the file at `path` (or the defaults when it
/// does not exist) with `SONARLINK_*` overrides applied.
pub fn resolve(path: &Path) -> Result<MonitorConfig, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config file at `path`.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<MonitorConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: MonitorConfig =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SONARLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SONARLINK_BROKER_HOST` | `broker.host` |
/// | `SONARLINK_BROKER_PORT` | `broker.port` (ignored unless a valid port) |
/// | `SONARLINK_BASE_TOPIC` | `base_topic` |
/// | `SONARLINK_SERIAL_PORT` | `bridge.serial_port` |
pub fn apply_env_overrides(cfg: &mut MonitorConfig) {
    if let Ok(v) = std::env::var("SONARLINK_BROKER_HOST") {
        cfg.broker.host = v;
    }
    if let Ok(v) = std::env::var("SONARLINK_BROKER_PORT")
        && let Ok(port) = v.trim().parse::<u16>()
    {
        cfg.broker.port = port;
    }
    if let Ok(v) = std::env::var("SONARLINK_BASE_TOPIC") {
        cfg.base_topic = v;
    }
    if let Ok(v) = std::env::var("SONARLINK_SERIAL_PORT")
        && !v.trim().is_empty()
    {
        cfg.bridge.serial_port = Some(v);
    }
}

/// Save `cfg` to `path`, creating the parent directory if necessary.  On
/// Unix the directory is owner-only (0700) and the file 0600.
pub fn save_to(cfg: &MonitorConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarlink_types::SensorConfig;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&MonitorConfig::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&MonitorConfig::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, MonitorConfig::default());
    }

    #[test]
    fn custom_sensor_table_survives_roundtrip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("custom.toml");

        let mut cfg = MonitorConfig::default();
        cfg.sensors = vec![SensorConfig::new(7, 12, 13)];
        cfg.bridge.serial_port = Some("/dev/ttyACM1".to_string());
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.sensors, cfg.sensors);
        assert_eq!(loaded.bridge.serial_port.as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn config_path_points_to_sonarlink_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".sonarlink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "base_topic = \"garage/sonar\"\n\n[broker]\nhost = \"broker.lan\"\n",
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.base_topic, "garage/sonar");
        assert_eq!(cfg.broker.host, "broker.lan");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.sensors.len(), 4);
        assert_eq!(cfg.poll_interval_secs, 0.5);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "poll_interval_secs = \"fast\"\n").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.starts_with("Failed to parse config"));
    }

    #[test]
    fn apply_env_overrides_changes_broker_host() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SONARLINK_BROKER_HOST", "mqtt.example.net") };
        let mut cfg = MonitorConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker.host, "mqtt.example.net");
        unsafe { std::env::remove_var("SONARLINK_BROKER_HOST") };
    }

    #[test]
    fn apply_env_overrides_handles_broker_port() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SONARLINK_BROKER_PORT", "8883") };
        let mut cfg = MonitorConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker.port, 8883);

        unsafe { std::env::set_var("SONARLINK_BROKER_PORT", "not-a-port") };
        let mut cfg = MonitorConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker.port, 1883);
        unsafe { std::env::remove_var("SONARLINK_BROKER_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_base_topic() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SONARLINK_BASE_TOPIC", "lab/range") };
        let mut cfg = MonitorConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.base_topic, "lab/range");
        unsafe { std::env::remove_var("SONARLINK_BASE_TOPIC") };
    }

    #[test]
    fn apply_env_overrides_sets_serial_port() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SONARLINK_SERIAL_PORT", "COM4") };
        let mut cfg = MonitorConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bridge.serial_port.as_deref(), Some("COM4"));
        unsafe { std::env::remove_var("SONARLINK_SERIAL_PORT") };
    }
}
