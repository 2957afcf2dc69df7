// Configuration management for phptags

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".phptags.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub indexing: IndexingConfig,
    pub storage: StorageConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// File extensions parsed as PHP, without the dot
    pub extensions: Vec<String>,
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    /// Files above this many bytes are skipped
    pub max_file_size: u64,
    pub watch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Relative to the project root unless absolute
    pub db_file: String,
    pub use_native_tags: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Rows fetched per store round trip by result iterators
    pub page_size: usize,
    pub default_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "unnamed-project".to_string(),
            root: ".".to_string(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["php".to_string()],
            exclude: vec![
                ".git/".to_string(),
                "node_modules/".to_string(),
                ".phptags.db".to_string(),
            ],
            include: vec![],
            max_file_size: 1024 * 1024,
            watch: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: ".phptags.db".to_string(),
            use_native_tags: true,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            default_limit: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            indexing: IndexingConfig::default(),
            storage: StorageConfig::default(),
            search: SearchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from project directory
    /// Looks for .phptags.toml in the project root
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Self {
        let config_path = project_dir.as_ref().join(CONFIG_FILE);

        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::debug!("Could not load config from {}: {}", config_path.display(), e);
                tracing::info!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Tag store location for a project
    pub fn db_path<P: AsRef<Path>>(&self, project_dir: P) -> PathBuf {
        let db_file = Path::new(&self.storage.db_file);
        if db_file.is_absolute() {
            db_file.to_path_buf()
        } else {
            project_dir.as_ref().join(db_file)
        }
    }

    /// Check if a file path should be indexed based on include/exclude patterns
    pub fn should_index_file(&self, file_path: &str) -> bool {
        self.path_filter_or_default().should_index(file_path)
    }

    /// Compile the include/exclude patterns
    pub fn path_filter(&self) -> anyhow::Result<PathFilter> {
        let exclude = build_glob_set(&self.indexing.exclude)?;
        let include = if self.indexing.include.is_empty() {
            None
        } else {
            Some(build_glob_set(&self.indexing.include)?)
        };
        Ok(PathFilter { exclude, include })
    }

    /// [`Config::path_filter`], letting every path through when a pattern
    /// does not compile
    pub fn path_filter_or_default(&self) -> PathFilter {
        self.path_filter().unwrap_or_else(|e| {
            tracing::warn!("Ignoring include/exclude patterns: {}", e);
            PathFilter::default()
        })
    }

    /// True when the extension is one of the configured PHP extensions
    pub fn is_php_file(&self, file_path: &str) -> bool {
        Path::new(file_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                self.indexing
                    .extensions
                    .iter()
                    .any(|x| x.trim_start_matches('.').eq_ignore_ascii_case(e))
            })
            .unwrap_or(false)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.name.is_empty() {
            return Err(anyhow::anyhow!("Project name cannot be empty"));
        }

        if self.indexing.extensions.is_empty() {
            return Err(anyhow::anyhow!("At least one PHP file extension is required"));
        }
        if self.indexing.max_file_size == 0 {
            return Err(anyhow::anyhow!("Max file size must be greater than 0"));
        }

        if self.storage.db_file.is_empty() {
            return Err(anyhow::anyhow!("Database file cannot be empty"));
        }

        if self.search.page_size == 0 {
            return Err(anyhow::anyhow!("Search page size must be greater than 0"));
        }
        if self.search.default_limit == 0 {
            return Err(anyhow::anyhow!("Search default limit must be greater than 0"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }
        let valid_formats = ["compact", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        self.path_filter()?;

        Ok(())
    }
}

/// Compiled include/exclude patterns of [`IndexingConfig`]
#[derive(Debug, Clone)]
pub struct PathFilter {
    exclude: GlobSet,
    include: Option<GlobSet>,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self {
            exclude: GlobSet::empty(),
            include: None,
        }
    }
}

impl PathFilter {
    /// True when a project-relative path passes both pattern lists
    pub fn should_index(&self, file_path: &str) -> bool {
        let file_path = file_path.replace('\\', "/");
        if self.exclude.is_match(&file_path) {
            return false;
        }
        // with include patterns a file must match at least one
        self.include.as_ref().map_or(true, |set| set.is_match(&file_path))
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        for glob in expand_pattern(pattern) {
            builder.add(GlobBuilder::new(&glob).literal_separator(true).build()?);
        }
    }
    builder.build()
}

/// Gitignore-style reading of a config pattern: `dir/` matches that
/// directory at any depth, a pattern without `/` matches a file or
/// directory name at any depth, anything else is anchored at the root.
fn expand_pattern(pattern: &str) -> Vec<String> {
    let pattern = pattern.trim_start_matches("./");
    if let Some(dir) = pattern.strip_suffix('/') {
        let dir = dir.trim_end_matches('/');
        return if dir.contains('/') {
            vec![format!("{}/**", dir)]
        } else {
            vec![format!("**/{}/**", dir)]
        };
    }

    let glob = if pattern.contains('/') {
        pattern.to_string()
    } else {
        format!("**/{}", pattern)
    };
    if glob.ends_with("/**") {
        vec![glob]
    } else {
        vec![format!("{}/**", glob), glob]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.project.name, "unnamed-project");
        assert_eq!(config.indexing.extensions, vec!["php".to_string()]);
        assert!(config.storage.use_native_tags);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_should_index_file() {
        let config = Config::default();

        assert!(config.should_index_file("src/User.php"));
        assert!(config.should_index_file("vendor/lib/Thing.php"));

        assert!(!config.should_index_file(".git/hooks/pre-commit.php"));
        assert!(!config.should_index_file("web/node_modules/pkg/x.php"));
        assert!(!config.should_index_file(".phptags.db"));
    }

    #[test]
    fn test_include_patterns_restrict() {
        let mut config = Config::default();
        config.indexing.include = vec!["src/".to_string()];

        assert!(config.should_index_file("src/User.php"));
        assert!(!config.should_index_file("lib/User.php"));
    }

    fn matches_pattern(file_path: &str, pattern: &str) -> bool {
        build_glob_set(&[pattern.to_string()]).unwrap().is_match(file_path)
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("cache/views/a.php", "cache/"));
        assert!(matches_pattern("app/cache/a.php", "cache/"));
        assert!(!matches_pattern("app/cachex/a.php", "cache/"));

        assert!(matches_pattern("views/a.tpl.php", "*.tpl.php"));
        assert!(!matches_pattern("views/a.php", "*.tpl.php"));
        assert!(matches_pattern("a.test.php", "*.test.*"));

        assert!(matches_pattern("src/tests/a.php", "**/tests/**"));
        assert!(matches_pattern("tests/a.php", "**/tests/**"));
        assert!(matches_pattern("src/a.tpl.php", "**/*.tpl.php"));
    }

    #[test]
    fn test_glob_patterns_respect_path_segments() {
        assert!(matches_pattern("src/a.php", "src/*.php"));
        assert!(!matches_pattern("src/sub/a.php", "src/*.php"));
        assert!(!matches_pattern("lib/src/a.php", "src/*.php"));
        assert!(matches_pattern("src/sub/a.php", "src/**/*.php"));

        assert!(matches_pattern("a1.php", "a?.php"));
        assert!(matches_pattern("lib/b.php", "[ab].php"));
        assert!(!matches_pattern("lib/c.php", "[ab].php"));

        // a plain name no longer matches as a substring
        assert!(matches_pattern("lib/vendor/x.php", "vendor"));
        assert!(!matches_pattern("lib/vendored/x.php", "vendor"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut config = Config::default();
        config.indexing.exclude.push("src/[".to_string());
        assert!(config.path_filter().is_err());
        assert!(config.validate().is_err());
        // the lenient filter lets everything through
        assert!(config.should_index_file(".git/config.php"));
    }

    #[test]
    fn test_php_extensions() {
        let mut config = Config::default();
        assert!(config.is_php_file("a/B.php"));
        assert!(!config.is_php_file("a/B.inc"));

        config.indexing.extensions.push(".inc".to_string());
        assert!(config.is_php_file("a/B.INC"));
    }

    #[test]
    fn test_db_path() {
        let mut config = Config::default();
        assert_eq!(config.db_path("/proj"), PathBuf::from("/proj/.phptags.db"));

        config.storage.db_file = "/var/cache/tags.db".to_string();
        assert_eq!(config.db_path("/proj"), PathBuf::from("/var/cache/tags.db"));
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[project]\nname = \"shop\"\n\n[search]\npage_size = 25\n",
        )
        .unwrap();

        let config = Config::from_project_dir(dir.path());
        assert_eq!(config.project.name, "shop");
        assert_eq!(config.search.page_size, 25);
        assert_eq!(config.search.default_limit, 50);
        assert_eq!(config.storage.db_file, ".phptags.db");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.project.name = "".to_string();
        assert!(config.validate().is_err());
        config.project.name = "test".to_string();

        config.indexing.extensions.clear();
        assert!(config.validate().is_err());
        config.indexing.extensions = vec!["php".to_string()];

        config.search.page_size = 0;
        assert!(config.validate().is_err());
        config.search.page_size = 10;

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "info".to_string();

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
