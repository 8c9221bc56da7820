// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static CONFIG: OnceCell<RwLock<Arc<Config>>> = OnceCell::new();

static FALLBACK_STORAGE_ROOT: &str = "/tmp/cloudfs";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Storage {
    /// Directory holding the inode database and the content cache
    pub root: PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .map(|d| d.join("cloudfs"))
                .unwrap_or_else(|| PathBuf::from(FALLBACK_STORAGE_ROOT)),
        }
    }
}

impl Storage {
    /// The directory that holds cached file content.
    pub fn cache_root(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// The path of the inode database.
    pub fn database_path(&self) -> PathBuf {
        self.root.join("inodes.db")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Cache {
    /// Smallest number of bytes to fetch when filling a gap
    ///
    /// Gaps smaller than this are extended (read-ahead) up to the
    /// next cached range or the end of the file. Zero disables
    /// read-ahead so that exactly the missing bytes are fetched.
    pub minimum_range_size: u64,

    /// Number of times a failed range fetch is retried before
    /// the reads that depend on it fail
    pub max_retries: u32,

    /// Initial delay between fetch retries, in milliseconds
    pub retry_base_ms: u64,

    /// Largest delay between fetch retries, in milliseconds
    pub retry_max_ms: u64,

    /// Seconds to wait after a modification before uploading a file
    ///
    /// Zero disables delayed uploads, files are then only
    /// uploaded when they are released or synced.
    pub flush_delay_secs: u64,

    /// How long shutdown waits for open files to close, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            minimum_range_size: 0,
            max_retries: 3,
            retry_base_ms: 100,
            retry_max_ms: 5000,
            flush_delay_secs: 0,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl Cache {
    pub fn flush_delay(&self) -> Option<Duration> {
        (self.flush_delay_secs > 0).then(|| Duration::from_secs(self.flush_delay_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Inodes {
    /// Attempts made by move, replace and unlink before giving
    /// up when the tree keeps changing underneath them
    pub max_move_attempts: usize,

    /// How long shutdown waits for inodes to be released, in milliseconds
    pub shutdown_timeout_ms: u64,

    /// Unreferenced inodes kept resident before the oldest are evicted
    pub cache_max_size: usize,

    /// Minimum time an unreferenced inode stays resident, in seconds,
    /// zero evicts as soon as the limit is exceeded
    pub cache_max_age_secs: u64,
}

impl Default for Inodes {
    fn default() -> Self {
        Self {
            max_move_attempts: 16,
            shutdown_timeout_ms: 5000,
            cache_max_size: 16384,
            cache_max_age_secs: 300,
        }
    }
}

impl Inodes {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn cache_max_age(&self) -> Option<Duration> {
        (self.cache_max_age_secs > 0).then(|| Duration::from_secs(self.cache_max_age_secs))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Fuse {
    /// How long the kernel may cache attributes and entries, in milliseconds
    pub ttl_ms: u64,
}

impl Default for Fuse {
    fn default() -> Self {
        Self { ttl_ms: 1000 }
    }
}

/// Configuration values for cloudfs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should aim to only have one level of
    // values within them, otherwise they become impossible to address
    // with environment variables.
    pub storage: Storage,
    pub cache: Cache,
    pub inodes: Inodes,
    pub fuse: Fuse,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        // Note we don't know if we won the race to set the value here,
        // so we still need to try to update it.
        let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
            Ok(RwLock::new(Arc::new(self.clone())))
        })?;

        let mut lock = config
            .write()
            .map_err(|err| Error::LockPoisonedWrite(err.to_string()))?;
        *Arc::make_mut(&mut lock) = self;
        Ok(Arc::clone(&lock))
    }
}

/// Get the current cloudfs config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
        Ok(RwLock::new(Arc::new(load_config()?)))
    })?;
    let lock = config
        .read()
        .map_err(|err| Error::LockPoisonedRead(err.to_string()))?;
    Ok(Arc::clone(&*lock))
}

/// Load the cloudfs configuration from disk, even if it has already been loaded.
///
/// This includes the default, user, and system configurations (if they exist),
/// followed by any `CLOUDFS_<SECTION>_<NAME>` environment variables.
pub fn load_config() -> Result<Config> {
    load_config_from(std::env::vars())
}

pub(crate) fn load_config_from<I>(vars: I) -> Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder()
        // the system config can also be in any support format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/cloudfs").required(false));
    if let Some(user_config) = dirs::config_dir().map(|d| d.join("cloudfs").join("cloudfs")) {
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (var, value) in vars {
        let Some(tail) = var.strip_prefix("CLOUDFS_") else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: CLOUDFS_LOG)
            continue;
        };

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        config_builder = config_builder.set_override(key, value)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}
