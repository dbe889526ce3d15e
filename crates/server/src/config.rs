use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Fixed UTC offset of the school's local timezone, in hours.
    pub tz_offset_hours: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/attendance.db".into(),
            tz_offset_hours: 7,
        }
    }
}

/// The `server.toml` shape. Every key is optional so a partial file only
/// overrides what it names, and `tz_offset_hours` is a plain TOML integer.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    tz_offset_hours: Option<i32>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            apply_file_settings(&mut settings, file_cfg);
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("TZ_OFFSET_HOURS") {
        if let Ok(parsed) = v.parse::<i32>() {
            settings.tz_offset_hours = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__TZ_OFFSET_HOURS") {
        if let Ok(parsed) = v.parse::<i32>() {
            settings.tz_offset_hours = parsed;
        }
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.tz_offset_hours {
        settings.tz_offset_hours = v;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn file_settings_accept_integer_tz_offset() {
        let file_cfg: FileSettings =
            toml::from_str("bind_addr = \"0.0.0.0:9090\"\ntz_offset_hours = 8\n")
                .expect("parse");

        let mut settings = Settings::default();
        apply_file_settings(&mut settings, file_cfg);
        assert_eq!(settings.server_bind, "0.0.0.0:9090");
        assert_eq!(settings.tz_offset_hours, 8);
        // Keys the file omits keep their defaults.
        assert_eq!(settings.database_url, Settings::default().database_url);
    }

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn leaves_memory_and_full_urls_alone() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://./data/app.db"),
            "sqlite://./data/app.db"
        );
    }

    #[test]
    fn creates_parent_dir_for_relative_sqlite_url() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();

        let temp_root = env::temp_dir().join(format!("attendance_server_test_{suffix}"));
        fs::create_dir_all(&temp_root).expect("temp root");

        let original_dir = env::current_dir().expect("cwd");
        env::set_current_dir(&temp_root).expect("set cwd");

        prepare_database_url("./data/test.db").expect("prepare db url");
        assert!(temp_root.join("data").exists());

        env::set_current_dir(original_dir).expect("restore cwd");
        fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
