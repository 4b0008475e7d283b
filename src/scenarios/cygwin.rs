//! Install cygwin in a Windows guest from the tools ISO

use std::time::Duration;

use regex::Regex;

use super::{secs_param, ScenarioContext};
use crate::common::{Error, Result};
use crate::guest::DEFAULT_CMD_TIMEOUT;
use crate::params::Params;

/// Placeholder in the install command replaced by the tools drive
const DRIVE_TOKEN: &str = "WINUTILS";

#[derive(Debug, Clone)]
pub struct CygwinConfig {
    pub main_vm: String,
    pub login_timeout: Duration,
    pub cdrom_check: String,
    pub cdrom_filter: Regex,
    pub install_cmd: String,
    pub install_timeout: Duration,
    pub prompt: String,
    pub start_cmd: String,
    pub verify_cmd: String,
}

impl CygwinConfig {
    pub fn from_params(params: &Params) -> Result<Self> {
        let prompt = params.get_or("cygwin_prompt", r"\$\s+$")?;
        Regex::new(&prompt)?;

        Ok(Self {
            main_vm: params.require("main_vm")?,
            login_timeout: secs_param(params, "login_timeout", 240.0)?,
            cdrom_check: params.require("cdrom_check")?,
            cdrom_filter: Regex::new(&params.require("cdrom_filter")?)?,
            install_cmd: params.require("cygwin_install_cmd")?,
            install_timeout: secs_param(params, "cygwin_install_timeout", 2400.0)?,
            prompt,
            start_cmd: params.require("cygwin_start")?,
            verify_cmd: params.get_or("cygwin_verify_cmd", "ls")?,
        })
    }

    /// Install command with the tools drive filled in, from `cdrom_check` output
    pub fn install_command_for(&self, cdrom_listing: &str) -> Result<String> {
        let drive = self
            .cdrom_filter
            .find_iter(cdrom_listing)
            .next()
            .map(|m| m.as_str())
            .ok_or_else(|| Error::TestError("Can not find tools iso in guest".to_string()))?;
        Ok(self.install_cmd.replace(DRIVE_TOKEN, drive))
    }
}

pub async fn run(ctx: &mut ScenarioContext<'_>) -> Result<()> {
    let cfg = CygwinConfig::from_params(&ctx.params)?;
    let vm = ctx.env.get_vm(&cfg.main_vm)?;
    vm.verify_alive().await?;

    tracing::info!("Install cygwin in guest");
    let mut session = vm.wait_for_login(cfg.login_timeout).await?;
    let listing = session.cmd_output(&cfg.cdrom_check, cfg.login_timeout).await?;
    let install = cfg.install_command_for(&listing)?;
    session.cmd(&install, cfg.install_timeout).await?;

    tracing::info!("Verify cygwin install");
    let old_prompt = session.prompt().to_string();
    session.set_prompt(&cfg.prompt)?;
    session.enter_shell(&cfg.start_cmd).await?;
    let listing = session.cmd_output(&cfg.verify_cmd, DEFAULT_CMD_TIMEOUT).await?;
    tracing::debug!(output = %listing.trim_end(), "cygwin verify output");

    session.set_prompt(&old_prompt)?;
    session.cmd_output("exit", DEFAULT_CMD_TIMEOUT).await?;
    session.leave_shell().await?;
    session.close().await
}
