//! AMD SEV guest scenarios
//!
//! Both scenarios start by asking the host whether SEV is usable at all.
//! A host (or guest) that cannot run SEV cancels the test rather than
//! failing it.

use std::time::Duration;

use super::{secs_param, with_session, ScenarioContext};
use crate::common::{Error, Result};
use crate::guest::GuestSession;
use crate::host::{run_checked, HostExecutor};
use crate::outcome::Outcome;
use crate::params::{Params, Template};

/// Timeout for the SEV check inside the guest
const GUEST_CHECK_TIMEOUT: Duration = Duration::from_secs(240);

const DEFAULT_DMESG_CHECK: &str = "dmesg -l emerg,alert,crit,err";
const DEFAULT_PKG_CHECK: &str = "rpm -qa | grep %s";
const DEFAULT_PKG_INSTALL: &str = "yum -y install %s";
const DEFAULT_CERT_EXPORT: &str = "sevctl export --full vm.chain";
const DEFAULT_SESSION_CMD: &str = "sevctl session --name %s vm.chain %s";

/// Policies up to this value are plain SEV (no SEV-ES)
const PLAIN_SEV_MAX_POLICY: u32 = 3;

fn template_or(params: &Params, key: &str, default: &str, arity: usize) -> Result<Template> {
    Template::new(key, params.get_or(key, default)?).expect_arity(arity)
}

/// Check the basic-config parameters
pub fn validate_basic(params: &Params) -> Result<()> {
    secs_param(params, "login_timeout", 240.0)?;
    if !params.contains("sev_enable_check") {
        return Err(Error::MissingParam("sev_enable_check".to_string()));
    }
    let vms = params.objects("vms")?;
    if vms.is_empty() {
        return Err(Error::MissingParam("vms".to_string()));
    }
    for vm in vms {
        params.parse::<u32>(&format!("vm_sev_policy_{}", vm))?;
    }
    Ok(())
}

/// Check the DH-certificate boot parameters
pub fn validate_dhcert(params: &Params) -> Result<()> {
    secs_param(params, "login_timeout", 240.0)?;
    for key in ["sev_enable_check", "sev_tool_pkg", "main_vm", "vm_sev_policy"] {
        if !params.contains(key) {
            return Err(Error::MissingParam(key.to_string()));
        }
    }
    template_or(params, "sev_pkg_check_cmd", DEFAULT_PKG_CHECK, 1)?;
    template_or(params, "sev_pkg_install_cmd", DEFAULT_PKG_INSTALL, 1)?;
    template_or(params, "sev_cert_export_cmd", DEFAULT_CERT_EXPORT, 0)?;
    template_or(params, "sev_session_cmd", DEFAULT_SESSION_CMD, 2)?;
    Ok(())
}

/// Cancel unless the host reports SEV support
async fn check_host_capability(host: &dyn HostExecutor, params: &Params) -> Result<()> {
    let check = params.require("sev_enable_check")?;
    match run_checked(host, &check).await {
        Ok(result) => {
            tracing::info!("Host sev capabilities: {}", result.stdout.trim());
            Ok(())
        }
        Err(e) => Err(Error::TestCancel(format!(
            "Host sev capability check fail: {}",
            e
        ))),
    }
}

/// Fail if the host kernel log holds error-level messages
async fn verify_dmesg(host: &dyn HostExecutor, command: &str) -> Result<()> {
    let result = run_checked(host, command).await?;
    let found = result.stdout.trim();
    if found.is_empty() {
        Ok(())
    } else {
        Err(Error::TestFail(format!("Found failures in dmesg: {}", found)))
    }
}

pub async fn run_basic_config(ctx: &mut ScenarioContext<'_>) -> Result<()> {
    tracing::info!("Start sev test");
    let login_timeout = secs_param(&ctx.params, "login_timeout", 240.0)?;
    let dmesg_check = ctx.params.get_or("dmesg_check_cmd", DEFAULT_DMESG_CHECK)?;
    let host = ctx.host;

    check_host_capability(host, &ctx.params).await?;

    for vm_name in ctx.params.objects("vms")? {
        let vm = ctx.env.get_vm(&vm_name)?;
        vm.verify_alive().await?;

        let policy: u32 = ctx.params.parse(&format!("vm_sev_policy_{}", vm_name))?;
        if policy <= PLAIN_SEV_MAX_POLICY {
            ctx.params.set("sev_keyword", "sev");
        }
        let guest_check = ctx.params.require("sev_enable_check")?;

        with_session(
            vm.as_ref(),
            login_timeout,
            async |session: &mut dyn GuestSession| {
                verify_dmesg(host, &dmesg_check).await?;
                verify_guest(session, &guest_check).await?;

                let info = vm.monitor()?.query_sev().await?;
                if info.policy != policy {
                    return Err(Error::TestFail("QMP sev policy doesn't match.".to_string()));
                }
                tracing::info!(vm = %vm_name, policy, "QMP sev policy matches");
                Ok(())
            },
        )
        .await?;
    }
    Ok(())
}

/// Cancel unless the guest confirms SEV is active
async fn verify_guest(session: &mut dyn GuestSession, check: &str) -> Result<()> {
    session
        .cmd(check, GUEST_CHECK_TIMEOUT)
        .await
        .map(|_| ())
        .map_err(|e| Error::TestCancel(format!("Guest sev verify fail: {}", e)))
}

/// Whether the SEV tooling package is installed; absence is recoverable
async fn package_status(host: &dyn HostExecutor, check: &str) -> Outcome<()> {
    match host.run(check).await {
        Ok(result) if result.success() => Outcome::Done(()),
        Ok(result) => Outcome::Recoverable(Error::host_command(
            check,
            result.exit_status,
            &result.stderr,
        )),
        Err(e) => Outcome::Fatal(e),
    }
}

async fn ensure_package(host: &dyn HostExecutor, params: &Params, package: &str) -> Result<()> {
    let check = template_or(params, "sev_pkg_check_cmd", DEFAULT_PKG_CHECK, 1)?.render(&[package])?;
    let install =
        template_or(params, "sev_pkg_install_cmd", DEFAULT_PKG_INSTALL, 1)?.render(&[package])?;

    match package_status(host, &check).await {
        Outcome::Done(()) => Ok(()),
        Outcome::Recoverable(_) => {
            tracing::info!("Package {} not found, installing", package);
            run_checked(host, &install).await.map(|_| ()).map_err(|e| {
                Error::TestCancel(format!("Fail to install package {}: {}", package, e))
            })
        }
        Outcome::Logged(e) => {
            tracing::warn!("{}", e);
            Ok(())
        }
        Outcome::Fatal(e) => Err(e),
    }
}

/// Export the certificate chain and generate the launch blobs for `vm_name`
///
/// Records the blob paths in the parameters for the VM definition to use.
async fn generate_launch_blobs(
    host: &dyn HostExecutor,
    params: &mut Params,
    vm_name: &str,
) -> Result<()> {
    let export = template_or(params, "sev_cert_export_cmd", DEFAULT_CERT_EXPORT, 0)?.render(&[])?;
    let policy = params.require("vm_sev_policy")?;
    let session = template_or(params, "sev_session_cmd", DEFAULT_SESSION_CMD, 2)?
        .render(&[vm_name, policy.as_str()])?;

    let generated: Result<()> = async {
        run_checked(host, &export).await?;
        run_checked(host, &session).await?;
        Ok(())
    }
    .await;
    if let Err(e) = generated {
        return Err(Error::TestFail(format!(
            "Insert guest dhcert and session blob failed, {}",
            e
        )));
    }

    let cwd = std::env::current_dir()?;
    params.set(
        "vm_sev_dh_cert_file",
        cwd.join(format!("{}_godh.b64", vm_name)).display().to_string(),
    );
    params.set(
        "vm_sev_session_file",
        cwd.join(format!("{}_session.b64", vm_name)).display().to_string(),
    );
    Ok(())
}

pub async fn run_dhcert_boot(ctx: &mut ScenarioContext<'_>) -> Result<()> {
    tracing::info!("Start sev test");
    let login_timeout = secs_param(&ctx.params, "login_timeout", 240.0)?;

    check_host_capability(ctx.host, &ctx.params).await?;

    let package = ctx.params.require("sev_tool_pkg")?;
    ensure_package(ctx.host, &ctx.params, &package).await?;

    let vm_name = ctx.params.require("main_vm")?;
    generate_launch_blobs(ctx.host, &mut ctx.params, &vm_name).await?;

    let vm = ctx.vm_from_param("main_vm")?;
    vm.create(&ctx.params).await?;
    vm.verify_alive().await?;

    let guest_check = ctx.params.require("sev_enable_check")?;
    with_session(
        vm.as_ref(),
        login_timeout,
        async |session: &mut dyn GuestSession| {
            let measure = vm.monitor()?.query_sev_launch_measure().await?;
            tracing::info!(vm = %vm_name, %measure, "SEV launch measurement");
            verify_guest(session, &guest_check).await
        },
    )
    .await?;
    vm.destroy().await
}
