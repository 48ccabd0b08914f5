//! Where the engine keeps its state and finds its web UI.
//!
//! The environment variable names are wire-compatible with the wider
//! Transmission ecosystem so existing deployments keep working.

use std::path::PathBuf;

use anyhow::Context;

/// Configuration directory: `TRANSMISSION_HOME` wins, then
/// `$XDG_CONFIG_HOME/transmission`, then the platform default.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(home) = std::env::var_os("TRANSMISSION_HOME") {
        return Ok(PathBuf::from(home));
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        let p = PathBuf::from(xdg);
        if p.is_absolute() {
            return Ok(p.join("transmission"));
        }
    }
    let dirs = directories::BaseDirs::new().context("cannot determine home directory")?;
    Ok(dirs.config_dir().join("transmission"))
}

/// Candidate directories for the bundled web UI, most specific first:
/// `TRANSMISSION_WEB_HOME`, legacy `CLUTCH_HOME`, then
/// `$XDG_DATA_HOME` and each of `$XDG_DATA_DIRS`.
pub fn web_ui_dir_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    for var in ["TRANSMISSION_WEB_HOME", "CLUTCH_HOME"] {
        if let Some(v) = std::env::var_os(var) {
            out.push(PathBuf::from(v));
        }
    }
    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME") {
        out.push(PathBuf::from(data_home).join("transmission/public_html"));
    } else if let Some(home) = std::env::var_os("HOME") {
        out.push(PathBuf::from(home).join(".local/share/transmission/public_html"));
    }
    if let Some(data_dirs) = std::env::var_os("XDG_DATA_DIRS") {
        for dir in std::env::split_paths(&data_dirs) {
            out.push(dir.join("transmission/public_html"));
        }
    }
    out
}

/// First web UI candidate that exists on disk.
pub fn find_web_ui_dir() -> Option<PathBuf> {
    web_ui_dir_candidates().into_iter().find(|p| p.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_home_wins() {
        // Env mutation is process-global; keep it inside one test.
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("TRANSMISSION_HOME", tmp.path());
        assert_eq!(config_dir().unwrap(), tmp.path());
        std::env::remove_var("TRANSMISSION_HOME");
    }

    #[test]
    fn test_web_candidates_include_override() {
        std::env::set_var("TRANSMISSION_WEB_HOME", "/nonexistent/webui");
        let candidates = web_ui_dir_candidates();
        assert!(candidates.contains(&PathBuf::from("/nonexistent/webui")));
        std::env::remove_var("TRANSMISSION_WEB_HOME");
    }
}
