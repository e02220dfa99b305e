use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ReaderError, Result};
use crate::reconciler::PollPolicy;
use crate::trigger::{DEFAULT_SUMMARY_URL, DEFAULT_TRIGGER_URL};

/// 应用配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ReaderConfig {
    pub store: StoreConfig,
    pub ingestion: IngestionConfig,
    pub polling: PollingConfig,
}

/// 内容库后端
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Rest {
        #[serde(default)]
        url: String,
        #[serde(default)]
        api_key: String,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Rest {
            url: String::new(),
            api_key: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
    pub trigger_url: String,
    pub summary_url: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            trigger_url: DEFAULT_TRIGGER_URL.to_string(),
            summary_url: DEFAULT_SUMMARY_URL.to_string(),
        }
    }
}

/// 轮询参数（秒）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    /// 0 表示不限时
    pub max_duration_secs: u64,
    pub backoff_multiplier: f64,
    pub max_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_duration_secs: 30 * 60,
            backoff_multiplier: 1.0,
            max_interval_secs: 60,
        }
    }
}

impl PollingConfig {
    pub fn to_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.interval_secs),
            max_duration: (self.max_duration_secs > 0)
                .then(|| Duration::from_secs(self.max_duration_secs)),
            backoff_multiplier: self.backoff_multiplier,
            max_interval: Duration::from_secs(self.max_interval_secs),
        }
    }
}

impl ReaderConfig {
    /// 加载配置
    ///
    /// 未指定文件时使用默认值；随后应用环境变量覆盖并校验
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml(&fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// 环境变量覆盖
    ///
    /// `READER_SQLITE_PATH` 优先于 REST 设置
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("READER_SQLITE_PATH") {
            self.store = StoreConfig::Sqlite { path: path.into() };
        } else if let StoreConfig::Rest { url, api_key } = &mut self.store {
            if let Some(v) = lookup("READER_STORE_URL") {
                *url = v;
            }
            if let Some(v) = lookup("READER_STORE_KEY") {
                *api_key = v;
            }
        }
        if let Some(v) = lookup("READER_TRIGGER_URL") {
            self.ingestion.trigger_url = v;
        }
        if let Some(v) = lookup("READER_SUMMARY_URL") {
            self.ingestion.summary_url = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.polling;
        if p.interval_secs == 0 {
            return Err(ReaderError::Config("polling.interval_secs 必须大于 0".to_string()));
        }
        if !p.backoff_multiplier.is_finite() || p.backoff_multiplier < 1.0 {
            return Err(ReaderError::Config(
                "polling.backoff_multiplier 必须是不小于 1.0 的有限数".to_string(),
            ));
        }
        if p.max_interval_secs < p.interval_secs {
            return Err(ReaderError::Config(
                "polling.max_interval_secs 不能小于 interval_secs".to_string(),
            ));
        }
        if let StoreConfig::Rest { url, .. } = &self.store {
            if url.trim().is_empty() {
                return Err(ReaderError::Config(
                    "缺少内容库地址（store.url 或 READER_STORE_URL）".to_string(),
                ));
            }
        }
        if self.ingestion.trigger_url.trim().is_empty() {
            return Err(ReaderError::Config("缺少 ingestion.trigger_url".to_string()));
        }
        if self.ingestion.summary_url.trim().is_empty() {
            return Err(ReaderError::Config("缺少 ingestion.summary_url".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.polling.interval_secs, 5);
        assert_eq!(config.ingestion.trigger_url, DEFAULT_TRIGGER_URL);
        assert_eq!(config.ingestion.summary_url, DEFAULT_SUMMARY_URL);

        let policy = config.polling.to_policy();
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.max_duration, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_parse_sqlite_backend() {
        let config = ReaderConfig::from_toml(
            r#"
            [store]
            backend = "sqlite"
            path = "library.db"

            [polling]
            interval_secs = 2
            max_duration_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("library.db")
            }
        );
        assert_eq!(config.polling.interval_secs, 2);
        assert_eq!(config.polling.max_interval_secs, 60);
        assert_eq!(config.polling.to_policy().max_duration, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_rest() {
        let mut config = ReaderConfig::default();
        config.apply_env(env(&[
            ("READER_STORE_URL", "https://xyz.supabase.co"),
            ("READER_STORE_KEY", "anon"),
            ("READER_TRIGGER_URL", "http://localhost:9000/store"),
            ("READER_SUMMARY_URL", "http://localhost:9000/summary"),
        ]));

        assert_eq!(
            config.store,
            StoreConfig::Rest {
                url: "https://xyz.supabase.co".to_string(),
                api_key: "anon".to_string()
            }
        );
        assert_eq!(config.ingestion.trigger_url, "http://localhost:9000/store");
        assert_eq!(config.ingestion.summary_url, "http://localhost:9000/summary");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_sqlite_path_wins() {
        let mut config = ReaderConfig::default();
        config.apply_env(env(&[
            ("READER_STORE_URL", "https://xyz.supabase.co"),
            ("READER_SQLITE_PATH", "/tmp/reader.db"),
        ]));
        assert!(matches!(config.store, StoreConfig::Sqlite { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_polling() {
        let mut config = ReaderConfig::default();
        config.store = StoreConfig::Sqlite {
            path: "x.db".into(),
        };

        config.polling.interval_secs = 0;
        assert!(config.validate().is_err());

        config.polling = PollingConfig {
            backoff_multiplier: 0.5,
            ..PollingConfig::default()
        };
        assert!(config.validate().is_err());

        config.polling = PollingConfig {
            interval_secs: 10,
            max_interval_secs: 5,
            ..PollingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_multiplier() {
        for raw in ["inf", "nan", "-inf"] {
            let config = ReaderConfig::from_toml(&format!(
                "[store]\nbackend = \"sqlite\"\npath = \"x.db\"\n[polling]\nbackoff_multiplier = {}\n",
                raw
            ))
            .unwrap();
            assert!(
                matches!(config.validate(), Err(ReaderError::Config(_))),
                "backoff_multiplier = {}",
                raw
            );
        }
    }

    #[test]
    fn test_validate_requires_rest_url() {
        let config = ReaderConfig::default();
        assert!(matches!(config.validate(), Err(ReaderError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.toml");
        fs::write(
            &path,
            "[store]\nbackend = \"sqlite\"\npath = \"library.db\"\n[polling]\ninterval_secs = 3\n",
        )
        .unwrap();

        let config = ReaderConfig::load(Some(&path)).unwrap();
        assert_eq!(config.polling.interval_secs, 3);
    }
}
