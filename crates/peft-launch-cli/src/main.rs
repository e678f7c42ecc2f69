//! PEFT Launch - distributed fine-tuning launcher CLI
//!
//! The `peft-launch` command resolves a run configuration and drives the
//! launch sequence.
//!
//! ## Commands
//!
//! - `resolve`: Compose, override and resolve the config tree
//! - `plan`: Show rank, model source, adapter and precision without building
//! - `dry-run`: Run the whole launch sequence against in-memory collaborators

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

use peft_launch_core::config::{apply_overrides, compose};
use peft_launch_core::fakes::{dry_run_collaborators, FakeModelFactory, FakeTrainerBuilder};
use peft_launch_core::identity::{LOAD_CKPT_DEFAULT, LOAD_CKPT_ENV};
use peft_launch_core::{
    load_run_config, parse_bool, LaunchOptions, LaunchSpan, Launcher, Rank, RuntimeContext,
    BASE_CONFIG_PATH,
};

#[derive(Parser)]
#[command(name = "peft-launch")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Launch orchestrator for PEFT fine-tuning runs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fully resolved configuration
    Resolve {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },

    /// Show what a launch would do, without building anything
    Plan {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Run the launch sequence against in-memory collaborators
    DryRun {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        launch: LaunchArgs,

        /// Number of processes the simulated trainer reports
        #[arg(long, default_value = "1")]
        world_size: u32,

        /// Make the simulated training loop fail at this step
        #[arg(long)]
        fail_at_step: Option<u64>,
    },
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Directory holding the config tree
    #[arg(long, default_value = "conf")]
    config_path: PathBuf,

    /// Primary config file name, without extension
    #[arg(long, default_value = "megatron_gpt_peft_tuning_config")]
    config_name: String,

    /// Overrides in `dotted.key=value` form
    #[arg(trailing_var_arg = true)]
    overrides: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct LaunchArgs {
    /// Restore weights from `model.restore_from_path` ("true"/"false")
    #[arg(long, env = LOAD_CKPT_ENV, default_value = LOAD_CKPT_DEFAULT)]
    load_ckpt: String,

    /// Process rank (default: read from the environment)
    #[arg(long, allow_negative_numbers = true)]
    rank: Option<i64>,

    /// Base model config used when no checkpoint is restored
    #[arg(long, default_value = BASE_CONFIG_PATH)]
    base_config_path: PathBuf,

    /// Do not print the resolved config on rank 0
    #[arg(long)]
    no_echo: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Serialize)]
struct ResolveOutput<'a> {
    digest: String,
    config: &'a Value,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    peft_launch_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Resolve { config, format } => cmd_resolve(&config, format),
        Commands::Plan { config, launch } => cmd_plan(&config, &launch),
        Commands::DryRun {
            config,
            launch,
            world_size,
            fail_at_step,
        } => cmd_dry_run(&config, &launch, world_size, fail_at_step).await,
    }
}

/// Compose the config tree and apply overrides, leaving interpolations unresolved.
fn load_raw(config: &ConfigArgs) -> Result<Value> {
    let mut raw = compose(&config.config_path, &config.config_name).with_context(|| {
        format!(
            "Failed to load config '{}' from {}",
            config.config_name,
            config.config_path.display()
        )
    })?;
    apply_overrides(&mut raw, &config.overrides).context("Invalid config override")?;
    Ok(raw)
}

fn launch_options(launch: &LaunchArgs) -> Result<LaunchOptions> {
    let load_checkpoint = parse_bool(&launch.load_ckpt)
        .with_context(|| format!("Invalid value for {LOAD_CKPT_ENV}"))?;
    let mut options = LaunchOptions::default()
        .with_load_checkpoint(load_checkpoint)
        .with_base_config_path(launch.base_config_path.clone())
        .with_echo_config(!launch.no_echo);
    if let Some(rank) = launch.rank {
        options = options.with_rank(Rank(rank));
    }
    Ok(options)
}

fn cmd_resolve(config: &ConfigArgs, format: OutputFormat) -> Result<()> {
    let cfg = load_run_config(&config.config_path, &config.config_name, &config.overrides)
        .context("Failed to resolve config")?;

    match format {
        OutputFormat::Yaml => print!("{}", cfg.to_yaml()?),
        OutputFormat::Json => {
            let output = ResolveOutput {
                digest: cfg.digest(),
                config: cfg.as_value(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn cmd_plan(config: &ConfigArgs, launch: &LaunchArgs) -> Result<()> {
    let raw = load_raw(config)?;
    let options = launch_options(launch)?;
    let plan = peft_launch_core::plan(&options, &raw).context("Failed to plan launch")?;

    let _span = LaunchSpan::enter(&plan.config_digest, Rank(plan.rank));
    info!(source = %plan.model_source.label(), "launch planned");

    println!("Rank:           {}", plan.rank);
    println!("Model source:   {}", plan.model_source.label());
    println!("Config source:  {}", plan.config_source.display());
    println!("Adapter:        {}", plan.adapter.scheme().name());
    println!(
        "Precision:      {}",
        plan.precision
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unset".to_string())
    );
    println!("Start method:   {:?}", plan.start_method);
    println!("Config digest:  {}", plan.config_digest);
    println!();
    println!("{}", serde_json::to_string_pretty(&plan.adapter)?);
    Ok(())
}

async fn cmd_dry_run(
    config: &ConfigArgs,
    launch: &LaunchArgs,
    world_size: u32,
    fail_at_step: Option<u64>,
) -> Result<()> {
    let raw = load_raw(config)?;
    let options = launch_options(launch)?;

    let mut builder = FakeTrainerBuilder::new().with_world_size(world_size);
    if let Some(step) = fail_at_step {
        builder = builder.training_fails_at(step);
    }
    let collaborators = dry_run_collaborators(builder, FakeModelFactory::new());
    let ctx = Arc::new(RuntimeContext::detached());
    let mut launcher = Launcher::new(options, collaborators, ctx.clone());

    let result = launcher.run(&raw).await;

    let states: Vec<&str> = launcher.states().iter().map(|s| s.as_str()).collect();
    println!("States: {}", states.join(" -> "));

    for (hook, err) in ctx.exit_hooks().run_pending() {
        warn!(hook = %hook, error = %err, "exit hook failed");
    }

    let report = result.context("Launch failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_conf(dir: &std::path::Path) {
        fs::write(
            dir.join("run.yaml"),
            r#"
trainer:
  precision: bf16
  max_steps: 4
  val_check_interval: 2
model:
  restore_from_path: /ckpt/llama
  global_batch_size: 8
  half_batch: ${floor_div:${model.global_batch_size},2}
  peft:
    peft_scheme: lora
    lora_tuning:
      adapter_dim: 8
"#,
        )
        .unwrap();
    }

    fn config_args(dir: &std::path::Path, overrides: &[&str]) -> ConfigArgs {
        ConfigArgs {
            config_path: dir.to_path_buf(),
            config_name: "run".to_string(),
            overrides: overrides.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn launch_args(load_ckpt: &str) -> LaunchArgs {
        LaunchArgs {
            load_ckpt: load_ckpt.to_string(),
            rank: Some(1),
            base_config_path: PathBuf::from(BASE_CONFIG_PATH),
            no_echo: true,
        }
    }

    #[test]
    fn test_cli_parses_dry_run() {
        let cli = Cli::try_parse_from([
            "peft-launch",
            "--json",
            "dry-run",
            "--config-path",
            "conf",
            "--load-ckpt",
            "false",
            "trainer.max_steps=8",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::DryRun {
            config, launch, ..
        } = cli.command
        else {
            panic!("expected dry-run");
        };
        assert_eq!(config.overrides, vec!["trainer.max_steps=8".to_string()]);
        assert_eq!(launch.load_ckpt, "false");
    }

    #[test]
    fn test_cli_accepts_negative_rank() {
        let cli = Cli::try_parse_from(["peft-launch", "plan", "--rank", "-1"]).unwrap();
        let Commands::Plan { launch, .. } = cli.command else {
            panic!("expected plan");
        };
        let options = launch_options(&launch).unwrap();
        assert_eq!(options.rank, Some(Rank(-1)));
        assert!(!Rank(-1).is_primary());
    }

    #[test]
    fn test_load_raw_keeps_interpolations_and_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path());
        let raw = load_raw(&config_args(dir.path(), &["model.global_batch_size=16"])).unwrap();
        assert_eq!(raw["model"]["global_batch_size"], serde_json::json!(16));
        assert_eq!(
            raw["model"]["half_batch"],
            serde_json::json!("${floor_div:${model.global_batch_size},2}")
        );
    }

    #[test]
    fn test_launch_options_rejects_bad_toggle() {
        assert!(launch_options(&launch_args("maybe")).is_err());
        let options = launch_options(&launch_args("FALSE")).unwrap();
        assert_eq!(options.load_checkpoint, Some(false));
        assert_eq!(options.rank, Some(Rank(1)));
    }

    #[test]
    fn test_cmd_plan_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path());
        cmd_plan(&config_args(dir.path(), &[]), &launch_args("true")).unwrap();
    }

    #[tokio::test]
    async fn test_cmd_dry_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path());
        cmd_dry_run(&config_args(dir.path(), &[]), &launch_args("false"), 2, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cmd_dry_run_reports_training_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path());
        let result =
            cmd_dry_run(&config_args(dir.path(), &[]), &launch_args("false"), 1, Some(3)).await;
        assert!(result.is_err());
    }
}
