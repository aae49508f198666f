//! Vera CLI
//!
//! # Commands
//!
//! - `verify`: start a project, run generated tests against it, report
//! - `exec`: run one command through the sandboxed executor
//! - `probe`: wait for an HTTP endpoint to become ready

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

fn cli() -> Command {
    Command::new("vera")
        .version(vera_core::VERSION)
        .about("Functional verification of arbitrary projects in isolation")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Settings file (TOML)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("verify")
                .about("Start a project and verify it with generated tests")
                .arg(
                    Arg::new("project")
                        .long("project")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Extracted project directory"),
                )
                .arg(
                    Arg::new("plan")
                        .long("plan")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Startup plan (TOML or JSON)"),
                )
                .arg(
                    Arg::new("tests")
                        .long("tests")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Test source to execute"),
                )
                .arg(
                    Arg::new("description")
                        .long("description")
                        .default_value("")
                        .help("Feature requirements"),
                )
                .arg(
                    Arg::new("features")
                        .long("features")
                        .value_parser(value_parser!(PathBuf))
                        .help("Feature analysis (JSON list)"),
                )
                .arg(
                    Arg::new("backend")
                        .long("backend")
                        .default_value("docker")
                        .value_parser(["docker", "host"])
                        .help("Isolation backend"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the outcome as JSON"),
                ),
        )
        .subcommand(
            Command::new("exec")
                .about("Run a command with timeout and process-tree kill")
                .arg(
                    Arg::new("cwd")
                        .long("cwd")
                        .default_value(".")
                        .value_parser(value_parser!(PathBuf))
                        .help("Working directory"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("60")
                        .value_parser(value_parser!(u64))
                        .help("Timeout in seconds"),
                )
                .arg(
                    Arg::new("command")
                        .required(true)
                        .num_args(1..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true)
                        .help("Command to run"),
                ),
        )
        .subcommand(
            Command::new("probe")
                .about("Wait until an endpoint answers below 500")
                .arg(Arg::new("url").required(true).help("Endpoint to probe"))
                .arg(
                    Arg::new("deadline")
                        .long("deadline")
                        .default_value("30")
                        .value_parser(value_parser!(u64))
                        .help("Deadline in seconds"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

async fn dispatch(matches: &ArgMatches) -> anyhow::Result<ExitCode> {
    let settings = commands::load_settings(matches.get_one::<PathBuf>("config"))?;

    match matches.subcommand() {
        Some(("verify", args)) => commands::verify(args, &settings).await,
        Some(("exec", args)) => commands::exec(args).await,
        Some(("probe", args)) => commands::probe(args, &settings).await,
        _ => anyhow::bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match dispatch(&matches).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
