//! Per-instance config disk.
//!
//! A small read-only ext4 image containing one `config.json` the in-guest
//! init reads at boot: what to exec (from the image config, merged with
//! per-instance env) and how to bring up networking. Populated with
//! `mkfs.ext4 -d`, so nothing is loop-mounted on the host.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::ImageMetadata;

/// The config disk is tiny; one megabyte fits the JSON with room to spare.
const CONFIG_DISK_BYTES: u64 = 1024 * 1024;

/// Errors from config disk creation.
#[derive(Debug, Error)]
pub enum ConfigDiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("mkfs.ext4 failed: {0}")]
    Mkfs(String),
}

/// Network parameters handed to the in-guest init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestNetwork {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac: String,
}

/// The document the in-guest init consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestBootConfig {
    pub hostname: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs, image env first, instance overrides applied.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<GuestNetwork>,
}

impl GuestBootConfig {
    /// Assembles the boot config from image metadata plus instance
    /// overrides.
    pub fn assemble(
        hostname: String,
        image: &ImageMetadata,
        overrides: &HashMap<String, String>,
        network: Option<GuestNetwork>,
    ) -> Self {
        Self {
            hostname,
            entrypoint: image.entrypoint.clone(),
            cmd: image.cmd.clone(),
            env: merge_env(&image.env, overrides),
            working_dir: image.working_dir.clone(),
            user: image.user.clone(),
            network,
        }
    }
}

/// Merges instance env over image env. Order is image-first so the guest
/// sees overrides last, and an override replaces the image's value for the
/// same key rather than duplicating it.
pub fn merge_env(image_env: &[String], overrides: &HashMap<String, String>) -> Vec<String> {
    let mut merged: Vec<String> = image_env
        .iter()
        .filter(|pair| {
            pair.split_once('=')
                .map_or(true, |(key, _)| !overrides.contains_key(key))
        })
        .cloned()
        .collect();

    let mut added: Vec<_> = overrides.iter().collect();
    added.sort_by_key(|(key, _)| key.clone());
    merged.extend(added.into_iter().map(|(key, value)| format!("{key}={value}")));
    merged
}

/// Builds the config disk at `disk_path`.
pub fn build_config_disk(
    disk_path: &Path,
    config: &GuestBootConfig,
) -> Result<(), ConfigDiskError> {
    let staging = disk_path.with_extension("ext4.d");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    fs::write(staging.join("config.json"), serde_json::to_vec_pretty(config)?)?;

    let result = (|| {
        let file = fs::File::create(disk_path)?;
        file.set_len(CONFIG_DISK_BYTES)?;
        drop(file);

        let status = Command::new("mkfs.ext4")
            .args(["-F", "-q", "-d"])
            .arg(&staging)
            .arg(disk_path)
            .status()
            .map_err(|e| ConfigDiskError::Mkfs(e.to_string()))?;
        if !status.success() {
            return Err(ConfigDiskError::Mkfs("non-zero exit".to_string()));
        }
        Ok(())
    })();

    fs::remove_dir_all(&staging).ok();
    if result.is_err() {
        fs::remove_file(disk_path).ok();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_env_overrides_and_appends() {
        let image_env = vec![
            "PATH=/usr/local/bin:/usr/bin".to_string(),
            "LANG=C.UTF-8".to_string(),
        ];
        let mut overrides = HashMap::new();
        overrides.insert("LANG".to_string(), "en_US.UTF-8".to_string());
        overrides.insert("APP_MODE".to_string(), "prod".to_string());

        let merged = merge_env(&image_env, &overrides);
        assert_eq!(
            merged,
            vec![
                "PATH=/usr/local/bin:/usr/bin".to_string(),
                "APP_MODE=prod".to_string(),
                "LANG=en_US.UTF-8".to_string(),
            ]
        );
    }

    #[test]
    fn merge_env_with_no_overrides_is_identity() {
        let image_env = vec!["A=1".to_string(), "B=2".to_string()];
        assert_eq!(merge_env(&image_env, &HashMap::new()), image_env);
    }

    #[test]
    fn boot_config_serializes_for_guest_init() {
        let config = GuestBootConfig {
            hostname: "hype-9f8a3c21".to_string(),
            entrypoint: vec!["/bin/sh".to_string()],
            cmd: vec!["-c".to_string(), "sleep infinity".to_string()],
            env: vec!["PATH=/usr/bin".to_string()],
            working_dir: "/app".to_string(),
            user: Some("root".to_string()),
            network: Some(GuestNetwork {
                ip: Ipv4Addr::new(10, 230, 0, 17),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(10, 230, 0, 1),
                mac: "02:00:00:aa:bb:cc".to_string(),
            }),
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["hostname"], "hype-9f8a3c21");
        assert_eq!(json["network"]["ip"], "10.230.0.17");
        assert_eq!(json["network"]["gateway"], "10.230.0.1");

        let back: GuestBootConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.entrypoint, config.entrypoint);
    }

    #[test]
    fn network_none_is_omitted() {
        let config = GuestBootConfig {
            hostname: "h".to_string(),
            entrypoint: vec![],
            cmd: vec![],
            env: vec![],
            working_dir: String::new(),
            user: None,
            network: None,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("network").is_none());
        assert!(json.get("user").is_none());
    }
}
