//! Batch Stack Deployer CLI

use batchstack_deployer::{aws, stack};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing::error;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

fn config_arg(required: bool) -> Arg {
    Arg::new("config")
        .long("config")
        .required(required)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

/// Entrypoint for the Batch Stack Deployer CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("deployer")
        .version(crate_version())
        .about("Synthesize, audit, and deploy a Fargate batch job over a shared EFS volume.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(stack::SYNTH_CMD)
                .about("Render the CloudFormation template for a YAML configuration file.")
                .arg(config_arg(true))
                .arg(
                    Arg::new("output")
                        .long("output")
                        .help("File to write the template to (defaults to stdout)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .default_value("json")
                        .help("Template format")
                        .value_parser(["json", "yaml"]),
                ),
        )
        .subcommand(
            Command::new(stack::VERIFY_CMD)
                .about("Audit a rendered template (JSON or YAML) for broken references and unsafe access.")
                .arg(
                    Arg::new("template")
                        .long("template")
                        .required(true)
                        .help("Path to template file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(aws::CMD)
                .about("Deploy the stack with CloudFormation and run its task on ECS Fargate.")
                .subcommand(
                    Command::new(aws::DEPLOY_CMD)
                        .about("Create or update the stack from a YAML configuration file.")
                        .arg(config_arg(true)),
                )
                .subcommand(
                    Command::new(aws::RUN_CMD)
                        .about("Run the batch task once against a deployed stack.")
                        .arg(config_arg(true))
                        .arg(
                            Arg::new("wait")
                                .long("wait")
                                .help("Wait for the task to stop and fail if any container failed")
                                .action(ArgAction::SetTrue),
                        ),
                )
                .subcommand(
                    Command::new(aws::DESTROY_CMD)
                        .about("Delete the stack associated with a given deployment.")
                        .arg(config_arg(false))
                        .arg(
                            Arg::new("name")
                                .long("name")
                                .help("Stack name (uses persisted metadata)")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .group(
                            clap::ArgGroup::new("target")
                                .args(["config", "name"])
                                .required(true),
                        ),
                )
                .subcommand(
                    Command::new(aws::LIST_CMD)
                        .about("List all active deployments (created but not destroyed)."),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    match matches.subcommand() {
        Some((stack::SYNTH_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            let output = matches.get_one::<PathBuf>("output");
            let format = match matches.get_one::<String>("format").unwrap().parse() {
                Ok(format) => format,
                Err(e) => {
                    error!(error=?e, "invalid format");
                    return std::process::ExitCode::FAILURE;
                }
            };
            if let Err(e) = stack::synth(config_path, output, format) {
                error!(error=?e, "failed to synthesize template");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((stack::VERIFY_CMD, matches)) => {
            let template_path = matches.get_one::<PathBuf>("template").unwrap();
            if let Err(e) = stack::verify(template_path) {
                error!(error=?e, "failed to verify template");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((aws::CMD, aws_matches)) => match aws_matches.subcommand() {
            Some((aws::DEPLOY_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                if let Err(e) = aws::deploy(config_path).await {
                    error!(error=?e, "failed to deploy stack");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::RUN_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let wait = matches.get_flag("wait");
                if let Err(e) = aws::run(config_path, wait).await {
                    error!(error=?e, "failed to run task");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::DESTROY_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config");
                let name = matches.get_one::<String>("name").map(|s| s.as_str());
                if let Err(e) = aws::destroy(config_path, name).await {
                    error!(error=?e, "failed to destroy stack");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::LIST_CMD, _)) => {
                if let Err(e) = aws::list() {
                    error!(error=?e, "failed to list deployments");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
            }
            None => {
                error!("no subcommand provided");
            }
        },
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
