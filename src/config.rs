use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Optional YAML settings file. Every field may be omitted; CLI flags win
/// over anything set here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub label: Option<String>,
    pub max_messages: Option<usize>,
    pub threshold: Option<f64>,
    pub virus_total_api_key: Option<String>,
    pub hybrid_analysis_api_key: Option<String>,
    pub gmail_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub success_words_path: Option<PathBuf>,
    pub intent_words_path: Option<PathBuf>,
    pub enforce_quota: Option<bool>,
    pub empty_body_is_success: Option<bool>,
    pub enable_mailto: Option<bool>,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }
}

/// CLI-supplied values, all optional so the settings file can fill gaps.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub label: Option<String>,
    pub max_messages: Option<usize>,
    pub no_limit: bool,
    pub threshold: Option<f64>,
    pub virus_total_api_key: Option<String>,
    pub hybrid_analysis_api_key: Option<String>,
    pub gmail_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub success_words_path: Option<PathBuf>,
    pub intent_words_path: Option<PathBuf>,
    pub ignore_quota: bool,
    pub force_yes: bool,
    pub enable_mailto: bool,
    pub dry_run_report: Option<PathBuf>,
}

/// The one resolved configuration value the pipeline runs on.
#[derive(Debug, Clone)]
pub struct Config {
    pub label: String,
    pub max_messages: usize,
    pub threshold: f64,
    pub virus_total_api_key: Option<String>,
    pub hybrid_analysis_api_key: Option<String>,
    pub gmail_token: Option<String>,
    pub data_dir: PathBuf,
    pub success_words_path: Option<PathBuf>,
    pub intent_words_path: Option<PathBuf>,
    pub enforce_quota: bool,
    pub empty_body_is_success: bool,
    pub force_yes: bool,
    pub enable_mailto: bool,
    pub dry_run_report: Option<PathBuf>,
}

pub const DEFAULT_LABEL: &str = "Unsubscribe";
pub const DEFAULT_MAX_MESSAGES: usize = 50;
pub const DEFAULT_THRESHOLD: f64 = 5.0;

impl Config {
    /// Merge CLI flags over the settings file over built-in defaults.
    pub fn resolve(cli: CliOverrides, settings: Settings) -> Self {
        let max_messages = if cli.no_limit {
            usize::MAX
        } else {
            cli.max_messages
                .or(settings.max_messages)
                .unwrap_or(DEFAULT_MAX_MESSAGES)
        };

        Self {
            label: cli
                .label
                .or(settings.label)
                .unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            max_messages,
            threshold: cli
                .threshold
                .or(settings.threshold)
                .unwrap_or(DEFAULT_THRESHOLD),
            virus_total_api_key: cli.virus_total_api_key.or(settings.virus_total_api_key),
            hybrid_analysis_api_key: cli
                .hybrid_analysis_api_key
                .or(settings.hybrid_analysis_api_key),
            gmail_token: cli.gmail_token.or(settings.gmail_token),
            data_dir: cli
                .data_dir
                .or(settings.data_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            success_words_path: cli.success_words_path.or(settings.success_words_path),
            intent_words_path: cli.intent_words_path.or(settings.intent_words_path),
            enforce_quota: !cli.ignore_quota && settings.enforce_quota.unwrap_or(true),
            empty_body_is_success: settings.empty_body_is_success.unwrap_or(true),
            force_yes: cli.force_yes,
            enable_mailto: cli.enable_mailto || settings.enable_mailto.unwrap_or(false),
            dry_run_report: cli.dry_run_report,
        }
    }

    pub fn visited_cache_path(&self) -> PathBuf {
        self.data_dir.join("visited_links.txt")
    }

    pub fn quota_path(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    pub fn report_path(&self) -> PathBuf {
        self.data_dir.join("unsubscribe_links.html")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn issues_path(&self) -> PathBuf {
        self.log_dir().join("unsubscribe_issues.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_nothing_supplied() {
        let config = Config::resolve(CliOverrides::default(), Settings::default());
        assert_eq!(config.label, DEFAULT_LABEL);
        assert_eq!(config.max_messages, DEFAULT_MAX_MESSAGES);
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
        assert!(config.enforce_quota);
        assert!(config.empty_body_is_success);
        assert!(!config.enable_mailto);
        assert!(config.virus_total_api_key.is_none());
    }

    #[test]
    fn test_cli_overrides_settings() {
        let settings: Settings =
            serde_yaml::from_str("label: Junk\nthreshold: 2.5\nvirus_total_api_key: from-file\n")
                .unwrap();
        let cli = CliOverrides {
            label: Some("Newsletters".to_string()),
            virus_total_api_key: Some("from-cli".to_string()),
            ..Default::default()
        };

        let config = Config::resolve(cli, settings);
        assert_eq!(config.label, "Newsletters");
        assert_eq!(config.threshold, 2.5);
        assert_eq!(config.virus_total_api_key.as_deref(), Some("from-cli"));
    }

    #[test]
    fn test_no_limit_beats_max_messages() {
        let cli = CliOverrides {
            max_messages: Some(10),
            no_limit: true,
            ..Default::default()
        };
        let config = Config::resolve(cli, Settings::default());
        assert_eq!(config.max_messages, usize::MAX);
    }

    #[test]
    fn test_ignore_quota_flag() {
        let cli = CliOverrides {
            ignore_quota: true,
            ..Default::default()
        };
        let config = Config::resolve(cli, Settings::default());
        assert!(!config.enforce_quota);
    }

    #[test]
    fn test_settings_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "max_messages: 200\nenable_mailto: true\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        let config = Config::resolve(CliOverrides::default(), settings);
        assert_eq!(config.max_messages, 200);
        assert!(config.enable_mailto);

        assert!(Settings::load(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_derived_paths() {
        let cli = CliOverrides {
            data_dir: Some(PathBuf::from("/var/lib/unsub")),
            ..Default::default()
        };
        let config = Config::resolve(cli, Settings::default());
        assert_eq!(
            config.visited_cache_path(),
            PathBuf::from("/var/lib/unsub/visited_links.txt")
        );
        assert_eq!(
            config.quota_path("vt_requests.json"),
            PathBuf::from("/var/lib/unsub/vt_requests.json")
        );
        assert_eq!(
            config.issues_path(),
            PathBuf::from("/var/lib/unsub/logs/unsubscribe_issues.json")
        );
    }
}
