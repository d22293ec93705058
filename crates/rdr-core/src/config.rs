use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, Result};

/// Typed configuration for both services.
#[derive(Clone, Debug)]
pub struct Config {
    // Batching
    pub batch_size: usize,
    pub batch_time: Duration,

    // Matching
    pub similarity_threshold: f32,
    pub embedding_model_dir: Option<PathBuf>,
    pub embedding_dimensions: usize,

    // Supervision
    pub watchdog_interval: Duration,
    pub chat_refresh_interval: Duration,

    // Registration
    pub auth_ttl: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let batch_size = env_usize("BATCH_SIZE").unwrap_or(20);
        if batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be at least 1".to_string()));
        }
        let batch_time = Duration::from_secs(env_u64("BATCH_TIME").unwrap_or(60));

        let similarity_threshold = env_f32("SIMILARITY_THRESHOLD").unwrap_or(0.5);
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(Error::Config(format!(
                "SIMILARITY_THRESHOLD must be within [0, 1], got {similarity_threshold}"
            )));
        }

        let embedding_model_dir = env_path("EMBEDDING_MODEL_DIR");
        let embedding_dimensions = env_usize("EMBEDDING_DIMENSIONS").unwrap_or(384);

        let watchdog_interval = Duration::from_secs(env_u64("WATCHDOG_INTERVAL").unwrap_or(10));
        let chat_refresh_interval =
            Duration::from_secs(env_u64("CHAT_REFRESH_INTERVAL").unwrap_or(60));

        let auth_ttl = Duration::from_secs(env_u64("AUTH_TTL").unwrap_or(300));

        Ok(Self {
            batch_size,
            batch_time,
            similarity_threshold,
            embedding_model_dir,
            embedding_dimensions,
            watchdog_interval,
            chat_refresh_interval,
            auth_ttl,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_time: Duration::from_secs(60),
            similarity_threshold: 0.5,
            embedding_model_dir: None,
            embedding_dimensions: 384,
            watchdog_interval: Duration::from_secs(10),
            chat_refresh_interval: Duration::from_secs(60),
            auth_ttl: Duration::from_secs(300),
        }
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_f32(key: &str) -> Option<f32> {
    env_str(key).and_then(|s| s.trim().parse::<f32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}
