//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Host command execution settings
    #[serde(default)]
    pub host: HostConfig,

    /// Guest login settings
    #[serde(default)]
    pub guest: GuestConfig,

    /// VM definitions shared by every scenario
    #[serde(default)]
    pub vms: HashMap<String, VmSpec>,
}

/// How host commands are executed
#[derive(Debug, Deserialize)]
pub struct HostConfig {
    /// Shell used to run host commands (`<shell> -c <command>`)
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Guest login settings
#[derive(Debug, Deserialize, Clone)]
pub struct GuestConfig {
    /// Command sent through the login prefix to test that the guest answers
    #[serde(default = "default_login_check")]
    pub login_check: String,

    /// Delay between login attempts in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            login_check: default_login_check(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_login_check() -> String {
    "true".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

/// How to reach and manage one VM from the host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VmSpec {
    /// Host command prefix that runs one guest command, e.g. `ssh -p 2222 root@127.0.0.1`
    pub login: String,

    /// Host command that exits 0 while the VM process is running
    #[serde(default)]
    pub alive_check: Option<String>,

    /// Monitor socket path
    #[serde(default)]
    pub monitor: Option<PathBuf>,

    /// Host command that boots the VM; `${key}` expands from scenario params
    #[serde(default)]
    pub create: Option<String>,

    /// Host command that stops the VM
    #[serde(default)]
    pub destroy: Option<String>,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
                path: path.display().to_string(),
                error: e.to_string(),
            })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Resolve the host shell to an executable path
    ///
    /// Falls back to the configured name when it is not found in PATH.
    pub fn shell_path(&self) -> PathBuf {
        which::which(&self.host.shell).unwrap_or_else(|_| PathBuf::from(&self.host.shell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.host.shell, "sh");
        assert_eq!(config.guest.login_check, "true");
        assert_eq!(config.guest.poll_interval_ms, 1000);
        assert!(config.vms.is_empty());
    }

    #[test]
    fn test_vm_definitions() {
        let config: Config = toml::from_str(
            r#"
[guest]
poll_interval_ms = 250

[vms.vm1]
login = "ssh -p 2222 root@127.0.0.1"
monitor = "/run/vm1.qmp"
create = "qemu-kvm -object sev-guest,dh-cert-file=${vm_sev_dh_cert_file}"
"#,
        )
        .unwrap();

        assert_eq!(config.guest.poll_interval_ms, 250);
        let vm = &config.vms["vm1"];
        assert_eq!(vm.login, "ssh -p 2222 root@127.0.0.1");
        assert_eq!(vm.monitor.as_deref(), Some(Path::new("/run/vm1.qmp")));
        assert!(vm.alive_check.is_none());
        assert!(vm.create.as_deref().unwrap().contains("${vm_sev_dh_cert_file}"));
    }

    #[test]
    fn test_load_from_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[host\nshell=").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(super::super::Error::ConfigParse(_))
        ));
    }
}
