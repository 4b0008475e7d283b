//! Kill and reconnect an NBD-backed data disk
//!
//! The guest has a system disk and a data disk served over NBD by a host
//! process. The scenario kills that export, blocks its port, and checks
//! that the guest's system disk keeps working while the data disk is
//! unreachable. It then restarts the export with the command line captured
//! before the kill, reopens the port, and checks the data disk again.
//!
//! Phases 1-5 run unprotected: nothing disruptive exists yet except the
//! kill, which the recovery phase itself undoes. Phases 6-8 run inside
//! [`protect`], so a failure there removes the firewall rule before the
//! error is returned.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};

use regex::Regex;

use super::{required_secs_param, secs_param, with_session, ScenarioContext};
use crate::common::{Error, Result};
use crate::guest::{GuestSession, Vm};
use crate::host::{run_checked, run_logged, Clock, HostExecutor};
use crate::outcome::{protect, Outcome};
use crate::params::{Params, Template};

static TIME_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}:\d{2}:\d{2} ").expect("static regex"));

/// Resolved configuration
///
/// Every template that depends only on configuration is rendered here, so a
/// scenario never starts with a command it cannot build.
#[derive(Debug, Clone)]
pub struct BlockReconnectConfig {
    pub main_vm: String,
    pub find_system_disk_cmd: String,
    /// One slot: the system disk
    pub find_data_disk_cmd: Template,
    /// One or two slots, each filled with the disk under test
    pub disk_op_cmd: Option<Template>,
    pub disk_op_timeout: Duration,
    pub login_timeout: Duration,
    pub save_export_cmd: String,
    pub kill_export_cmd: String,
    pub net_break_cmd: String,
    pub net_resume_cmd: String,
    pub nbd_port: u16,
    pub repeat_times: u32,
    pub reconnect_wait: Duration,
}

impl BlockReconnectConfig {
    pub fn from_params(params: &Params) -> Result<Self> {
        let nbd_port: u16 = params.parse("nbd_port_data1")?;
        let port = nbd_port.to_string();
        let with_port = |key: &str, allowed: &[usize]| -> Result<String> {
            let t = params.template(key)?.expect_arity_in(allowed)?;
            let args = vec![port.as_str(); t.arity()];
            t.render(&args)
        };

        Ok(Self {
            main_vm: params.require("main_vm")?,
            find_system_disk_cmd: params.template("find_system_disk_cmd")?.expect_arity(0)?.render(&[])?,
            find_data_disk_cmd: params.template("find_data_disk_cmd")?.expect_arity(1)?,
            disk_op_cmd: params
                .optional_template("disk_op_cmd")?
                .map(|t| t.expect_arity_in(&[2, 1]))
                .transpose()?,
            disk_op_timeout: secs_param(params, "disk_op_timeout", 360.0)?,
            login_timeout: secs_param(params, "login_timeout", 360.0)?,
            save_export_cmd: with_port("save_export_data_img_cmd", &[1])?,
            kill_export_cmd: with_port("find_data_disk_pid_cmd", &[1])?,
            net_break_cmd: with_port("net_break_cmd", &[0, 1])?,
            net_resume_cmd: with_port("net_resume_cmd", &[0, 1])?,
            nbd_port,
            repeat_times: params.parse("repeat_times")?,
            reconnect_wait: required_secs_param(params, "reconnect_time_wait")?,
        })
    }
}

/// Device paths discovered at the start of the scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disks {
    pub system: String,
    pub data: String,
}

/// Command line of the export process, captured before it is killed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportCapture {
    command_line: String,
    captured_at: SystemTime,
}

impl ExportCapture {
    /// Extract the command line from a process listing
    ///
    /// The command follows the first `HH:MM:SS` CPU-time column, as in
    /// `ps -ef` output. Only the remainder of that line is kept.
    pub fn parse(listing: &str) -> Result<Self> {
        let command_line = TIME_COLUMN
            .splitn(listing, 2)
            .nth(1)
            .and_then(|rest| rest.lines().next())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| {
                Error::TestError(format!(
                    "Cannot find the export command line in process listing: '{}'",
                    listing.trim()
                ))
            })?;

        Ok(Self {
            command_line: command_line.to_string(),
            captured_at: SystemTime::now(),
        })
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }
}

/// Whether the firewall rule on the export port is in place
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NetworkBlock {
    active: bool,
}

impl NetworkBlock {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Install the rule; a failing command is only logged
    pub async fn block(&mut self, host: &dyn HostExecutor, command: &str) {
        tracing::info!("Blocking NBD export port");
        run_firewall(host, command).await;
        self.active = true;
    }

    /// Remove the rule; a failing command is only logged
    pub async fn unblock(&mut self, host: &dyn HostExecutor, command: &str) {
        tracing::info!("Unblocking NBD export port");
        run_firewall(host, command).await;
        self.active = false;
    }
}

async fn run_firewall(host: &dyn HostExecutor, command: &str) {
    match run_logged(host, command).await {
        Outcome::Done(_) => {}
        Outcome::Logged(e) | Outcome::Recoverable(e) | Outcome::Fatal(e) => {
            tracing::error!("Firewall command error: {}", e);
        }
    }
}

/// Drives the kill/reconnect phases against one VM
pub struct FaultInjectionSequencer<'a> {
    config: BlockReconnectConfig,
    vm: Arc<dyn Vm>,
    host: &'a dyn HostExecutor,
    clock: &'a dyn Clock,
}

impl<'a> FaultInjectionSequencer<'a> {
    pub fn new(
        config: BlockReconnectConfig,
        vm: Arc<dyn Vm>,
        host: &'a dyn HostExecutor,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            vm,
            host,
            clock,
        }
    }

    pub fn config(&self) -> &BlockReconnectConfig {
        &self.config
    }

    #[tracing::instrument(name = "block_kill_reconnect", skip_all, fields(vm = %self.config.main_vm))]
    pub async fn run(&self) -> Result<()> {
        self.vm.verify_alive().await?;

        let disks = self.discover_disks().await?;
        if self.config.disk_op_cmd.is_some() {
            self.exercise_io(&disks.data).await?;
        }
        let capture = self.capture_export().await?;
        self.kill_export().await?;

        let mut net = NetworkBlock::default();
        net.block(self.host, &self.config.net_break_cmd).await;

        protect(
            &mut net,
            async |net: &mut NetworkBlock| {
                Outcome::from(self.disrupted_phases(&disks, &capture, net).await)
            },
            async |net: &mut NetworkBlock| {
                self.cleanup(net).await;
                Ok(())
            },
        )
        .await
    }

    /// Phase 1: name the system disk, then the data disk derived from it
    pub async fn discover_disks(&self) -> Result<Disks> {
        tracing::info!("Identify data disk");
        let cfg = &self.config;
        let timeout = cfg.disk_op_timeout;

        let disks = with_session(
            self.vm.as_ref(),
            cfg.login_timeout,
            async |session: &mut dyn GuestSession| {
                let system = session
                    .cmd(&cfg.find_system_disk_cmd, timeout)
                    .await?
                    .trim()
                    .to_string();
                let data_cmd = cfg.find_data_disk_cmd.render(&[system.as_str()])?;
                let data = session.cmd(&data_cmd, timeout).await?.trim().to_string();
                Ok(Disks { system, data })
            },
        )
        .await?;

        tracing::info!(system = %disks.system, data = %disks.data, "The data disk is {}", disks.data);
        Ok(disks)
    }

    /// Open a session, run the I/O workload on `disk` when one is configured, close
    pub async fn exercise_io(&self, disk: &str) -> Result<()> {
        tracing::info!("Run io test on {}", disk);
        let command = self
            .config
            .disk_op_cmd
            .as_ref()
            .map(|t| t.render_repeated(disk));
        let timeout = self.config.disk_op_timeout;

        with_session(
            self.vm.as_ref(),
            self.config.login_timeout,
            async |session: &mut dyn GuestSession| {
                if let Some(command) = &command {
                    session.cmd(command, timeout).await?;
                }
                Ok(())
            },
        )
        .await
    }

    /// Phase 3: record how the export was started
    pub async fn capture_export(&self) -> Result<ExportCapture> {
        let command = &self.config.save_export_cmd;
        let result = run_checked(self.host, command).await?;
        tracing::info!("{}", result.stdout.trim_end());
        let capture = ExportCapture::parse(&result.stdout)?;
        tracing::debug!(command_line = %capture.command_line(), "Captured export command line");
        Ok(capture)
    }

    /// Phase 4: kill the export process serving the data disk
    pub async fn kill_export(&self) -> Result<()> {
        tracing::info!("Kill nbd data disks {}", self.config.nbd_port);
        run_checked(self.host, &self.config.kill_export_cmd).await?;
        Ok(())
    }

    /// Phases 6-8
    async fn disrupted_phases(
        &self,
        disks: &Disks,
        capture: &ExportCapture,
        net: &mut NetworkBlock,
    ) -> Result<()> {
        tracing::info!("Run IO test when in reconnecting loop");
        self.io_loop(&disks.system).await?;

        self.recover(capture, net).await?;

        tracing::info!("Check data disk resumed");
        self.io_loop(&disks.data).await
    }

    /// `repeat_times` cycles of wait-then-I/O on `disk`
    pub async fn io_loop(&self, disk: &str) -> Result<()> {
        for iteration in 0..self.config.repeat_times {
            tracing::info!(iteration, "Wait {:?}", self.config.reconnect_wait);
            self.clock.sleep(self.config.reconnect_wait).await;
            self.exercise_io(disk).await?;
        }
        Ok(())
    }

    /// Phase 7: restart the export, let the client reconnect, reopen the port
    pub async fn recover(&self, capture: &ExportCapture, net: &mut NetworkBlock) -> Result<()> {
        tracing::info!("Resume to export nbd data disks");
        tracing::info!("Run command: {}", capture.command_line());
        run_checked(self.host, capture.command_line()).await?;

        tracing::info!("Wait {:?}", self.config.reconnect_wait);
        self.clock.sleep(self.config.reconnect_wait).await;

        net.unblock(self.host, &self.config.net_resume_cmd).await;
        Ok(())
    }

    /// Remove the firewall rule if it is still in place
    pub async fn cleanup(&self, net: &mut NetworkBlock) {
        if net.is_active() {
            net.unblock(self.host, &self.config.net_resume_cmd).await;
        }
    }
}

/// Scenario entry point
pub async fn run(ctx: &mut ScenarioContext<'_>) -> Result<()> {
    let config = BlockReconnectConfig::from_params(&ctx.params)?;
    let vm = ctx.env.get_vm(&config.main_vm)?;
    FaultInjectionSequencer::new(config, vm, ctx.host, ctx.clock)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> Params {
        [
            ("main_vm", "vm1"),
            ("find_system_disk_cmd", "lsblk -no pkname $(findmnt -no source /)"),
            ("find_data_disk_cmd", "lsblk -dno name | grep -v %s | head -1"),
            ("disk_op_cmd", "dd if=/dev/zero of=/dev/%s bs=1M count=10 oflag=direct && dd if=/dev/%s of=/dev/null"),
            ("save_export_data_img_cmd", "ps -ef | grep 'qemu-nbd -p %s' | grep -v grep"),
            ("find_data_disk_pid_cmd", "fuser -k %s/tcp"),
            ("net_break_cmd", "iptables -I INPUT -p tcp --dport %s -j REJECT"),
            ("net_resume_cmd", "iptables -D INPUT -p tcp --dport ${nbd_port_data1} -j REJECT"),
            ("nbd_port_data1", "10809"),
            ("repeat_times", "2"),
            ("reconnect_time_wait", "1"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_config_renders_port_templates() {
        let cfg = BlockReconnectConfig::from_params(&base_params()).unwrap();
        assert_eq!(cfg.nbd_port, 10809);
        assert_eq!(cfg.kill_export_cmd, "fuser -k 10809/tcp");
        assert_eq!(cfg.net_break_cmd, "iptables -I INPUT -p tcp --dport 10809 -j REJECT");
        assert_eq!(cfg.net_resume_cmd, "iptables -D INPUT -p tcp --dport 10809 -j REJECT");
        assert_eq!(cfg.save_export_cmd, "ps -ef | grep 'qemu-nbd -p 10809' | grep -v grep");
        assert_eq!(cfg.repeat_times, 2);
        assert_eq!(cfg.reconnect_wait, Duration::from_secs(1));
        assert_eq!(cfg.disk_op_timeout, Duration::from_secs(360));
        assert_eq!(cfg.login_timeout, Duration::from_secs(360));
    }

    #[test]
    fn test_config_rejects_bad_arity_before_running() {
        let mut params = base_params();
        params.set("find_data_disk_cmd", "lsblk -dno name | head -1");
        assert!(matches!(
            BlockReconnectConfig::from_params(&params),
            Err(Error::TemplateArity { ref key, expected: 1, got: 0 }) if key == "find_data_disk_cmd"
        ));

        let mut params = base_params();
        params.set("disk_op_cmd", "dd if=%s of=%s bs=%s");
        assert!(BlockReconnectConfig::from_params(&params).unwrap_err().is_config());
    }

    #[test]
    fn test_config_missing_keys() {
        let mut params = base_params();
        params.set("repeat_times", "many");
        assert!(BlockReconnectConfig::from_params(&params).unwrap_err().is_config());

        let params: Params = [("main_vm", "vm1")].into_iter().collect();
        assert!(matches!(
            BlockReconnectConfig::from_params(&params),
            Err(Error::MissingParam(_))
        ));
    }

    #[test]
    fn test_config_requires_reconnect_wait() {
        let mut params = base_params();
        params.remove("reconnect_time_wait");
        assert!(matches!(
            BlockReconnectConfig::from_params(&params),
            Err(Error::MissingParam(ref k)) if k == "reconnect_time_wait"
        ));
        assert!(crate::scenarios::ScenarioKind::BlockKillReconnect
            .validate(&params)
            .unwrap_err()
            .is_config());

        params.set("reconnect_time_wait", "0.5");
        let cfg = BlockReconnectConfig::from_params(&params).unwrap();
        assert_eq!(cfg.reconnect_wait, Duration::from_millis(500));
    }

    #[test]
    fn test_config_disk_op_is_optional() {
        let mut params = base_params();
        params.set("disk_op_cmd", "");
        let cfg = BlockReconnectConfig::from_params(&params).unwrap();
        assert!(cfg.disk_op_cmd.is_none());
    }

    #[test]
    fn test_capture_parses_ps_line() {
        let listing =
            "root     41230     1  0 10:02 ?        00:00:00 qemu-nbd -p 10809 -e /data.img\n";
        let capture = ExportCapture::parse(listing).unwrap();
        assert_eq!(capture.command_line(), "qemu-nbd -p 10809 -e /data.img");
        assert!(capture.captured_at() <= SystemTime::now());
    }

    #[test]
    fn test_capture_keeps_first_process_only() {
        let listing = concat!(
            "root 1 1 0 10:02 ? 00:00:01 qemu-nbd -p 10809 -e /data.img\n",
            "root 2 1 0 10:03 ? 00:00:00 qemu-nbd -p 10809 -e /other.img\n",
        );
        let capture = ExportCapture::parse(listing).unwrap();
        assert_eq!(capture.command_line(), "qemu-nbd -p 10809 -e /data.img");
    }

    #[test]
    fn test_capture_without_time_column_is_error() {
        assert!(matches!(
            ExportCapture::parse("qemu-nbd -p 10809"),
            Err(Error::TestError(_))
        ));
        assert!(matches!(ExportCapture::parse("00:00:00 \n"), Err(Error::TestError(_))));
    }
}
