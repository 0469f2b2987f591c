//! Durable persistence of synthesized service types.
//!
//! The catalog writer is the only component that rewrites the user's
//! `config.json`. Every mutation follows the same transactional discipline:
//! exclusive advisory lock, timestamped backup of the current contents,
//! write to a sibling temporary file, fsync, atomic rename. A failure at any
//! point leaves the live file untouched.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;

use crate::config::{ConfigFile, ServiceTypeSpec};
use crate::error::{Error, Result};

/// Writes service-type entries to the user config file.
pub struct CatalogWriter {
    config_path: PathBuf,
    backups_dir: PathBuf,
}

impl CatalogWriter {
    /// Create a writer for the given config file and backup directory.
    #[must_use]
    pub fn new(config_path: PathBuf, backups_dir: PathBuf) -> Self {
        Self {
            config_path,
            backups_dir,
        }
    }

    /// Persist a new or replacement service-type entry.
    ///
    /// # Errors
    ///
    /// Returns an I/O error kind if the lock, backup, or atomic rename fails.
    pub fn add_service_type(&self, name: &str, spec: &ServiceTypeSpec) -> Result<()> {
        let _lock = self.acquire_lock()?;
        self.backup_current()?;

        let mut config = ConfigFile::load(&self.config_path)?;
        config.service_types.insert(name.to_string(), spec.clone());
        self.write_atomic(&config)
    }

    /// Remove a service-type entry previously created by auto-allocation.
    ///
    /// Returns the removed spec.
    ///
    /// # Errors
    ///
    /// Refuses entries not flagged `auto_allocated` with a validation error;
    /// unknown names produce a validation error as well.
    pub fn remove_service_type(&self, name: &str) -> Result<ServiceTypeSpec> {
        let _lock = self.acquire_lock()?;

        let mut config = ConfigFile::load(&self.config_path)?;
        let Some(spec) = config.service_types.get(name).cloned() else {
            return Err(Error::Validation {
                field: "service_type".into(),
                message: format!("'{name}' is not in the user config"),
            });
        };
        if !spec.auto_allocated {
            return Err(Error::Validation {
                field: "service_type".into(),
                message: format!("'{name}' was not auto-allocated; refusing to remove"),
            });
        }

        self.backup_current()?;
        config.service_types.remove(name);
        self.write_atomic(&config)?;
        Ok(spec)
    }

    /// All auto-allocated entries in the user config, name-sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read.
    pub fn list_auto_allocated(&self) -> Result<Vec<(String, ServiceTypeSpec)>> {
        let config = ConfigFile::load(&self.config_path)?;
        Ok(config
            .service_types
            .into_iter()
            .filter(|(_, spec)| spec.auto_allocated)
            .collect())
    }

    /// Take the exclusive advisory lock guarding config rewrites.
    ///
    /// The lock lives on a sibling file so it also covers the case where
    /// `config.json` does not exist yet. Released on drop.
    fn acquire_lock(&self) -> Result<File> {
        let lock_path = self.config_path.with_extension("json.lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }

    /// Copy the current config into the backup directory.
    fn backup_current(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.backups_dir)?;

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let mut backup_path = self.backups_dir.join(format!("config-{stamp}.json"));
        let mut suffix = 1;
        while backup_path.exists() {
            backup_path = self
                .backups_dir
                .join(format!("config-{stamp}-{suffix}.json"));
            suffix += 1;
        }
        fs::copy(&self.config_path, &backup_path)?;
        Ok(())
    }

    /// Write the config to a temp file, fsync, and rename over the live one.
    fn write_atomic(&self, config: &ConfigFile) -> Result<()> {
        let tmp_path = self.config_path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(serde_json::to_string_pretty(config)?.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.config_path)?;
        Ok(())
    }
}

/// List backup files for a config path, newest last.
///
/// # Errors
///
/// Returns an error if the backup directory exists but cannot be read.
pub fn list_backups(backups_dir: &Path) -> Result<Vec<PathBuf>> {
    if !backups_dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups: Vec<PathBuf> = fs::read_dir(backups_dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("config-") && n.ends_with(".json"))
        })
        .collect();
    backups.sort();
    Ok(backups)
}
