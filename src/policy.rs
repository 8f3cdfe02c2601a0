//! Decides whether an uploaded path requires a backend restart

use regex::Regex;
use tracing::{debug, warn};

/// Ignore and restart patterns, compiled once at start-up.
///
/// A pattern that fails to compile is logged and treated as absent, so it
/// never matches.
#[derive(Debug, Clone, Default)]
pub struct RestartPolicy {
    ignore: Option<Regex>,
    restart: Option<Regex>,
}

impl RestartPolicy {
    pub fn new(ignore: Option<&str>, restart: Option<&str>) -> Self {
        Self {
            ignore: compile("ignore", ignore),
            restart: compile("restart", restart),
        }
    }

    /// Policy that never requests a restart
    pub fn never() -> Self {
        Self::default()
    }

    /// Ignore matches win over restart matches; no match means no restart.
    /// Paths are matched exactly as given.
    pub fn needs_restart(&self, path: &str) -> bool {
        if let Some(ref ignore) = self.ignore {
            if ignore.is_match(path) {
                debug!(path, "Skipping restart for ignored path");
                return false;
            }
        }

        if let Some(ref restart) = self.restart {
            if restart.is_match(path) {
                debug!(path, "Path requires restart");
                return true;
            }
        }

        false
    }
}

fn compile(kind: &'static str, pattern: Option<&str>) -> Option<Regex> {
    let pattern = pattern.filter(|p| !p.is_empty())?;
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(kind, pattern, error = %e, "Invalid pattern, it will never match");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_pattern_matches() {
        let policy = RestartPolicy::new(None, Some(r".*\.py$"));

        assert!(policy.needs_restart("app.py"));
        assert!(policy.needs_restart("pkg/module.py"));
        assert!(!policy.needs_restart("static/style.css"));
    }

    #[test]
    fn test_ignore_takes_precedence() {
        let policy = RestartPolicy::new(Some("^tests/"), Some(r"\.py$"));

        assert!(!policy.needs_restart("tests/test_app.py"));
        assert!(policy.needs_restart("app.py"));
    }

    #[test]
    fn test_ignore_wins_even_when_restart_matches_everything() {
        let policy = RestartPolicy::new(Some(r"\.html$"), Some(".*"));

        for path in ["index.html", "templates/base.html", "./x.html"] {
            assert!(!policy.needs_restart(path), "{path} should be ignored");
        }
        assert!(policy.needs_restart("main.go"));
    }

    #[test]
    fn test_no_patterns_never_restarts() {
        let policy = RestartPolicy::never();

        assert!(!policy.needs_restart("app.py"));
        assert!(!policy.needs_restart(""));
    }

    #[test]
    fn test_empty_patterns_are_unset() {
        let policy = RestartPolicy::new(Some(""), Some(""));

        assert!(!policy.needs_restart("app.py"));
    }

    #[test]
    fn test_malformed_pattern_never_matches() {
        let policy = RestartPolicy::new(None, Some("(unclosed"));
        assert!(!policy.needs_restart("(unclosed"));

        let policy = RestartPolicy::new(Some("[bad"), Some(r"\.py$"));
        assert!(policy.needs_restart("[bad.py"));
    }

    #[test]
    fn test_paths_are_not_normalized() {
        let policy = RestartPolicy::new(None, Some("^src/"));

        assert!(policy.needs_restart("src/app.py"));
        assert!(!policy.needs_restart("./src/app.py"));
    }
}
