//! Settings infrastructure for cdatals.
//!
//! This module provides support for loading and parsing settings.toml files
//! to configure how CDATA regions are materialized and synchronized.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Root settings structure loaded from settings.toml.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    /// Sync configuration.
    pub sync: Option<SyncSettings>,
}

/// Raw sync settings as they appear in settings.toml. Every field is
/// optional; [`SyncConfig::from_settings`] fills in the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct SyncSettings {
    /// Language tag applied to region documents.
    pub language: Option<String>,

    /// File extension for materialized region files.
    pub extension: Option<String>,

    /// Where the host view should sit relative to region views:
    /// "left" (default) or "last".
    pub host_position: Option<String>,

    /// Debounce delay in milliseconds for region -> host write-back.
    pub update_delay_ms: Option<u64>,

    /// Delay in milliseconds before repositioning the host view.
    pub open_delay_ms: Option<u64>,
}

/// Where the host document view should be placed relative to region views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPosition {
    /// Host stays in the leftmost group; no repositioning.
    Left,
    /// Host is re-shown after the region documents, moving it to the last
    /// group in clients that honor the hint.
    Last,
}

/// Resolved sync configuration with all defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Language the region documents are presented as. Client language
    /// detection is driven by `extension` on the materialized files; this
    /// name is what the server reports in its logs.
    pub language: String,
    pub extension: String,
    pub host_position: HostPosition,
    pub update_delay: Duration,
    pub open_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            language: "javascript".to_string(),
            extension: "js".to_string(),
            host_position: HostPosition::Left,
            update_delay: Duration::from_millis(1500),
            open_delay: Duration::from_millis(500),
        }
    }
}

impl SyncConfig {
    /// Resolve raw settings into a full configuration.
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = Self::default();
        let Some(sync) = settings.sync.as_ref() else {
            return defaults;
        };

        Self {
            language: sync.language.clone().unwrap_or(defaults.language),
            extension: sync.extension.clone().unwrap_or(defaults.extension),
            host_position: match sync.host_position.as_deref() {
                Some("last") => HostPosition::Last,
                _ => HostPosition::Left,
            },
            update_delay: sync
                .update_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.update_delay),
            open_delay: sync
                .open_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.open_delay),
        }
    }
}

/// Load settings from a settings.toml file.
///
/// Returns default settings if the file doesn't exist or can't be parsed.
pub fn load_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Warning: failed to parse settings.toml: {}", e);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

/// Discover settings.toml by searching up the directory tree, then direct children.
///
/// Search order:
/// 1. Walk up from `start_dir` to filesystem root
/// 2. If not found, check immediate child directories of `start_dir`
///
/// Returns `(settings, settings_dir)` where `settings_dir` is the directory
/// containing the found settings.toml.
/// If not found, returns `(Settings::default(), start_dir)`.
pub fn discover_settings(start_dir: &Path) -> (Settings, PathBuf) {
    // Phase 1: Walk up from start_dir
    let mut current = Some(start_dir);
    while let Some(dir) = current {
        let candidate = dir.join("settings.toml");
        if candidate.is_file() {
            return (load_settings(&candidate), dir.to_path_buf());
        }
        current = dir.parent();
    }

    // Phase 2: Check immediate child directories
    if let Ok(entries) = std::fs::read_dir(start_dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                let candidate = entry.path().join("settings.toml");
                if candidate.is_file() {
                    return (load_settings(&candidate), entry.path());
                }
            }
        }
    }

    (Settings::default(), start_dir.to_path_buf())
}

/// Discover and resolve the sync configuration for a workspace root.
pub fn discover_config(workspace_root: &Path) -> SyncConfig {
    let (settings, _) = discover_settings(workspace_root);
    SyncConfig::from_settings(&settings)
}
