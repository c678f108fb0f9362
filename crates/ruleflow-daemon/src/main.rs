use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ruleflow_core::RuleId;
use ruleflow_daemon::{
    check_rule, init_logging, load_config, read_rule_dir, read_rule_file, run_http, run_memory,
    LogFormat, Overrides, Shutdown,
};
use tracing::{error, info, warn};

fn cli() -> Command {
    Command::new("ruleflow")
        .version(ruleflow_core::VERSION)
        .about("Rule-driven change propagation over a hypermedia resource store")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("run")
                .about("Follow the rules collection and apply rules until interrupted")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .env("RULEFLOW_CONFIG")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML or YAML configuration file"),
                )
                .arg(
                    Arg::new("api-url")
                        .long("api-url")
                        .env("RULEFLOW_API_URL")
                        .help("Base URL of the resource store"),
                )
                .arg(
                    Arg::new("token")
                        .long("token")
                        .env("RULEFLOW_TOKEN")
                        .value_delimiter(',')
                        .action(ArgAction::Append)
                        .help("Access token; one instance runs per token"),
                )
                .arg(
                    Arg::new("poll-interval-ms")
                        .long("poll-interval-ms")
                        .value_parser(value_parser!(u64))
                        .help("Polling interval of the change feed"),
                )
                .arg(
                    Arg::new("memory")
                        .long("memory")
                        .action(ArgAction::SetTrue)
                        .help("Run against an in-memory store instead of the API"),
                )
                .arg(
                    Arg::new("rules")
                        .long("rules")
                        .value_parser(value_parser!(PathBuf))
                        .requires("memory")
                        .help("Directory of rule files seeded into the in-memory store"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Decode and compile rule files without running them")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf))
                        .help("Rule documents (.json, .yaml, .yml)"),
                ),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_logging(if matches.get_flag("log-json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    ruleflow_engine::metrics::register_metrics();

    let result = match matches.subcommand() {
        Some(("check", args)) => check(args),
        Some(("run", args)) => run(args).await,
        _ => {
            let _ = cli().print_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "ruleflow failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &ArgMatches) -> Result<()> {
    let overrides = Overrides {
        api_url: args.get_one::<String>("api-url").cloned(),
        tokens: args
            .get_many::<String>("token")
            .map(|tokens| tokens.cloned().collect())
            .unwrap_or_default(),
        poll_interval_ms: args.get_one::<u64>("poll-interval-ms").copied(),
    };
    let config = load_config(
        args.get_one::<PathBuf>("config").map(PathBuf::as_path),
        overrides,
    )?;

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, stopping"),
            Err(err) => warn!(error = %err, "Cannot listen for interrupts, stopping"),
        }
        let _ = trigger.send(true);
    });

    if args.get_flag("memory") {
        let rules = match args.get_one::<PathBuf>("rules") {
            Some(dir) => read_rule_dir(dir)?,
            None => Vec::new(),
        };
        run_memory(&config, rules, shutdown).await
    } else {
        run_http(&config, shutdown).await
    }
}

fn check(args: &ArgMatches) -> Result<()> {
    let mut failed = 0usize;
    for path in args.get_many::<PathBuf>("files").into_iter().flatten() {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("rule")
            .to_string();
        let outcome = read_rule_file(path).and_then(|doc| check_rule(RuleId::new(id), &doc));
        match outcome {
            Ok(rule) => info!(
                file = %path.display(),
                list = %rule.list(),
                action = rule.rule().action.kind(),
                "Rule is valid"
            ),
            Err(err) => {
                failed += 1;
                error!(file = %path.display(), error = ?err, "Rule is invalid");
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} rule file(s) invalid");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn tokens_split_on_commas() {
        let matches = cli()
            .try_get_matches_from(["ruleflow", "run", "--token", "a,b", "--token", "c"])
            .unwrap();
        let (_, run) = matches.subcommand().unwrap();
        let tokens: Vec<&String> = run.get_many::<String>("token").unwrap().collect();
        assert_eq!(tokens, ["a", "b", "c"]);
    }

    #[test]
    fn rules_dir_requires_memory() {
        let result = cli().try_get_matches_from(["ruleflow", "run", "--rules", "/tmp"]);
        assert!(result.is_err());
    }
}
