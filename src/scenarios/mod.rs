//! Scenario registry
//!
//! Each scenario is an async function over a `ScenarioContext`. The
//! context carries everything a scenario may touch, so nothing is reached
//! through globals.

pub mod block_reconnect;
pub mod cygwin;
pub mod sev;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::common::Result;
use crate::guest::{GuestSession, TestEnv, Vm};
use crate::host::{Clock, HostExecutor};
use crate::params::Params;

/// Everything a scenario runs against
pub struct ScenarioContext<'a> {
    /// Scenario parameters; scenarios may add derived values
    pub params: Params,
    pub env: &'a TestEnv,
    pub host: &'a dyn HostExecutor,
    pub clock: &'a dyn Clock,
}

impl<'a> ScenarioContext<'a> {
    pub fn new(
        params: Params,
        env: &'a TestEnv,
        host: &'a dyn HostExecutor,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            params,
            env,
            host,
            clock,
        }
    }

    /// VM named by a parameter, e.g. `main_vm`
    pub fn vm_from_param(&self, key: &str) -> Result<Arc<dyn Vm>> {
        self.env.get_vm(&self.params.require(key)?)
    }
}

/// Parse a duration given in (possibly fractional) seconds
pub(crate) fn secs_param(params: &Params, key: &str, default: f64) -> Result<Duration> {
    secs_value(key, params.parse_or(key, default)?)
}

/// Like `secs_param`, but the key must be present
pub(crate) fn required_secs_param(params: &Params, key: &str) -> Result<Duration> {
    secs_value(key, params.parse(key)?)
}

fn secs_value(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| crate::common::Error::invalid_param(key, &secs.to_string(), e))
}

/// Log in, run `f` with the session, and close the session whatever `f` returned
pub(crate) async fn with_session<T, F>(vm: &dyn Vm, login_timeout: Duration, f: F) -> Result<T>
where
    F: AsyncFnOnce(&mut dyn GuestSession) -> Result<T>,
{
    let mut session = vm.wait_for_login(login_timeout).await?;
    let result = f(session.as_mut()).await;
    if let Err(e) = session.close().await {
        tracing::debug!("Closing guest session failed: {}", e);
    }
    result
}

/// Known scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Kill and reconnect an NBD-backed data disk
    #[serde(alias = "block_kill_reconnect_with_remote_storage")]
    BlockKillReconnect,
    /// Install cygwin in a Windows guest
    #[serde(alias = "cyginstall")]
    CygwinInstall,
    /// Verify SEV capability and policy of running guests
    SevBasicConfig,
    /// Boot an SEV guest with a generated DH certificate
    SevDhcertBoot,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 4] = [
        ScenarioKind::BlockKillReconnect,
        ScenarioKind::CygwinInstall,
        ScenarioKind::SevBasicConfig,
        ScenarioKind::SevDhcertBoot,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::BlockKillReconnect => "block_kill_reconnect",
            ScenarioKind::CygwinInstall => "cygwin_install",
            ScenarioKind::SevBasicConfig => "sev_basic_config",
            ScenarioKind::SevDhcertBoot => "sev_dhcert_boot",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioKind::BlockKillReconnect => {
                "Kill an NBD export, block its port, check the system disk, then restore and check the data disk"
            }
            ScenarioKind::CygwinInstall => "Install cygwin from the tools ISO and verify its shell",
            ScenarioKind::SevBasicConfig => "Check host SEV support and each guest's SEV policy",
            ScenarioKind::SevDhcertBoot => "Generate SEV DH certificate and session blobs, boot and measure a guest",
        }
    }

    /// Check the parameters without touching any VM or host
    pub fn validate(&self, params: &Params) -> Result<()> {
        match self {
            ScenarioKind::BlockKillReconnect => {
                block_reconnect::BlockReconnectConfig::from_params(params).map(|_| ())
            }
            ScenarioKind::CygwinInstall => cygwin::CygwinConfig::from_params(params).map(|_| ()),
            ScenarioKind::SevBasicConfig => sev::validate_basic(params),
            ScenarioKind::SevDhcertBoot => sev::validate_dhcert(params),
        }
    }

    /// Run the scenario
    pub async fn run(&self, ctx: &mut ScenarioContext<'_>) -> Result<()> {
        match self {
            ScenarioKind::BlockKillReconnect => block_reconnect::run(ctx).await,
            ScenarioKind::CygwinInstall => cygwin::run(ctx).await,
            ScenarioKind::SevBasicConfig => sev::run_basic_config(ctx).await,
            ScenarioKind::SevDhcertBoot => sev::run_dhcert_boot(ctx).await,
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip_through_serde() {
        for kind in ScenarioKind::ALL {
            let parsed: ScenarioKind = serde_yaml::from_str(kind.name()).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_kind_aliases() {
        let kind: ScenarioKind =
            serde_yaml::from_str("block_kill_reconnect_with_remote_storage").unwrap();
        assert_eq!(kind, ScenarioKind::BlockKillReconnect);
        let kind: ScenarioKind = serde_yaml::from_str("cyginstall").unwrap();
        assert_eq!(kind, ScenarioKind::CygwinInstall);
    }

    #[test]
    fn test_secs_param() {
        let params: Params = [("reconnect_time_wait", "1.5")].into_iter().collect();
        assert_eq!(
            secs_param(&params, "reconnect_time_wait", 0.0).unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(secs_param(&params, "login_timeout", 360.0).unwrap(), Duration::from_secs(360));

        let params: Params = [("login_timeout", "-1")].into_iter().collect();
        assert!(secs_param(&params, "login_timeout", 360.0).unwrap_err().is_config());
        assert!(matches!(
            required_secs_param(&params, "reconnect_time_wait"),
            Err(crate::common::Error::MissingParam(k)) if k == "reconnect_time_wait"
        ));
    }
}
