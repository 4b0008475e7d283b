//! Scenario runner implementation
//!
//! Loads a YAML scenario file, wires the default collaborators from the
//! harness configuration, runs the scenario and reports a verdict.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::guest::{ShellVm, TestEnv};
use crate::host::{Clock, HostExecutor, ShellHost, TokioClock};
use crate::outcome::Verdict;
use crate::scenarios::{ScenarioContext, ScenarioKind};

use super::config::ScenarioFile;

/// Result of a scenario run
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub kind: ScenarioKind,
    pub verdict: Verdict,
    pub duration: Duration,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.verdict.is_success()
    }
}

/// Load and parse a scenario file
pub fn load_scenario(path: &Path) -> Result<ScenarioFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read scenario '{}': {}",
            path.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse scenario: {}", e)))
}

/// Validate a scenario file without touching any host or VM
pub fn check_scenario(path: &Path) -> Result<ScenarioFile> {
    let scenario = load_scenario(path)?;
    scenario.kind.validate(&scenario.params())?;
    Ok(scenario)
}

/// Build the VM registry: config VMs first, scenario VMs override them
pub fn build_env(scenario: &ScenarioFile, config: &Config, host: Arc<dyn HostExecutor>) -> TestEnv {
    let mut specs = config.vms.clone();
    specs.extend(scenario.vms.clone());

    let mut env = TestEnv::new();
    for (name, spec) in specs {
        env.insert(Arc::new(ShellVm::new(
            name,
            spec,
            config.guest.clone(),
            host.clone(),
        )));
    }
    env
}

/// Run a loaded scenario against the given collaborators
pub async fn execute(
    scenario: &ScenarioFile,
    env: &TestEnv,
    host: &dyn HostExecutor,
    clock: &dyn Clock,
    verbose: bool,
) -> TestResult {
    println!(
        "\n{} {} {}",
        "Running Scenario:".blue().bold(),
        scenario.name.white().bold(),
        format!("({})", scenario.kind).dimmed()
    );

    if let Some(desc) = &scenario.description {
        println!("  {}", desc.dimmed());
    }

    let params = scenario.params();
    if verbose {
        println!("\n{}", "Parameters:".cyan());
        for (key, value) in &scenario.params {
            println!("  {} = {}", key, value.to_string().dimmed());
        }
        println!("\n{}", "VMs:".cyan());
        for name in env.names() {
            println!("  {}", name);
        }
    }

    let start = Instant::now();
    let result = match scenario.kind.validate(&params) {
        Ok(()) => {
            let mut ctx = ScenarioContext::new(params, env, host, clock);
            scenario.kind.run(&mut ctx).await
        }
        Err(e) => {
            println!("  {} Invalid parameters: {}", "✗".red(), e);
            Err(e)
        }
    };
    let duration = start.elapsed();

    if let Err(e) = &result {
        tracing::error!("Scenario {} ended with: {}", scenario.name, e);
    }
    let verdict = Verdict::from_result(&result);

    let mark = match &verdict {
        Verdict::Pass => "✓".green(),
        Verdict::Cancel(_) => "-".yellow(),
        Verdict::Fail(_) | Verdict::Error(_) => "✗".red(),
    };
    let label = match &verdict {
        Verdict::Pass => verdict.label().green().bold(),
        Verdict::Cancel(_) => verdict.label().yellow().bold(),
        Verdict::Fail(_) | Verdict::Error(_) => verdict.label().red().bold(),
    };
    println!(
        "\n{} {} {} {}",
        mark,
        label,
        scenario.name,
        format!("({:.1}s)", duration.as_secs_f64()).dimmed()
    );
    match &verdict {
        Verdict::Pass => {}
        Verdict::Fail(m) | Verdict::Error(m) | Verdict::Cancel(m) => {
            println!("  {}", m);
        }
    }

    TestResult {
        name: scenario.name.clone(),
        kind: scenario.kind,
        verdict,
        duration,
    }
}

/// Run a scenario file with the default shell collaborators
pub async fn run_scenario(path: &Path, config: &Config, verbose: bool) -> Result<TestResult> {
    let scenario = load_scenario(path)?;

    let host: Arc<dyn HostExecutor> = Arc::new(ShellHost::new(config.shell_path()));
    let env = build_env(&scenario, config, host.clone());

    Ok(execute(&scenario, &env, host.as_ref(), &TokioClock, verbose).await)
}
