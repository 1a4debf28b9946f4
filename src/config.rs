use std::borrow::Cow;

use camino::Utf8PathBuf;

/// Environment variable holding the path prefix stripped from node names in
/// log output.
pub const ENV_ROOT: &str = "LAZYGRAPH_ROOT";

/// Settings affecting how nodes are displayed in diagnostics. Nothing in here
/// changes what gets computed or stored.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix removed from node names before they are logged.
    pub root: Option<Utf8PathBuf>,
    /// Longer names are cut down to their last `name_width` characters.
    pub name_width: usize,
}

impl Config {
    pub fn new() -> Self {
        Self {
            root: None,
            name_width: 50,
        }
    }

    /// Reads [`ENV_ROOT`] from the process environment.
    pub fn from_env() -> Self {
        let root = std::env::var(ENV_ROOT)
            .ok()
            .filter(|root| !root.is_empty())
            .map(Utf8PathBuf::from);

        Self {
            root,
            ..Self::new()
        }
    }

    pub fn with_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Short form of a node name, suitable for log lines.
    pub fn display_name<'a>(&self, name: &'a str) -> Cow<'a, str> {
        let name = match &self.root {
            Some(root) => name
                .strip_prefix(root.as_str().trim_end_matches('/'))
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .map(|rest| rest.trim_start_matches('/'))
                .filter(|rest| !rest.is_empty())
                .unwrap_or(name),
            None => name,
        };

        let count = name.chars().count();
        if count <= self.name_width {
            return Cow::Borrowed(name);
        }

        let tail: String = name.chars().skip(count - self.name_width).collect();
        Cow::Owned(format!("...{tail}"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_untouched() {
        let config = Config::new();
        assert_eq!(config.display_name("load"), "load");
    }

    #[test]
    fn test_long_names_truncated() {
        let config = Config {
            name_width: 4,
            ..Config::new()
        };
        assert_eq!(config.display_name("abcdefgh"), "...efgh");
    }

    #[test]
    fn test_root_stripped() {
        let config = Config::new().with_root("/data/build");
        assert_eq!(config.display_name("/data/build/models/a"), "models/a");
        assert_eq!(config.display_name("/elsewhere/a"), "/elsewhere/a");
        assert_eq!(config.display_name("/data/build"), "/data/build");
    }
}
