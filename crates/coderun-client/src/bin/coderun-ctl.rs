// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! coderun control CLI
//!
//! Submits one piece of code to the worker pool and prints the result.
//!
//! Usage:
//!   coderun-ctl run --language <lang> --version <ver> (--file <path> | --code <src>)
//!                   [--stdin <text>] [--timeout <seconds>]

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use coderun_client::{ClientConfig, RpcClient};
use coderun_protocol::{AmqpBroker, RunCodeTask};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!(
        r#"Usage: coderun-ctl <command> [options]

Run code on a coderun worker pool.

COMMANDS:
    run                             Submit code and print its result

RUN OPTIONS:
    --language <name>               Language name, e.g. python (required)
    --version <ver>                 Language version, e.g. 3.11 (required)
    --file <path>                   Read source code from a file
    --code <src>                    Inline source code
    --stdin <text>                  Standard input for the program
    --timeout <seconds>             Give up after this long (default: 30)

ENVIRONMENT:
    CODERUN_AMQP_URL                Broker URL (required)
    CODERUN_TASK_QUEUE              Task queue name (default: code_run)
    CODERUN_TASK_EXCHANGE           Exchange to publish through (default: none)

EXIT STATUS:
    0 when the program ran and exited cleanly, 1 otherwise.

EXAMPLES:
    coderun-ctl run --language python --version 3.11 --code 'print(1)'
    coderun-ctl run --language python --version 3.11 --file solve.py --stdin '4 5'
"#
    );
}

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
enum Source {
    File(String),
    Inline(String),
}

#[derive(Debug)]
enum Command {
    Run {
        language: String,
        version: String,
        source: Source,
        stdin: String,
        timeout_secs: u64,
    },
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "run" => {
            let mut language: Option<String> = None;
            let mut version: Option<String> = None;
            let mut source: Option<Source> = None;
            let mut stdin = String::new();
            let mut timeout_secs = DEFAULT_TIMEOUT_SECS;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--language" => {
                        i += 1;
                        language = Some(args.get(i).ok_or("--language requires a name")?.clone());
                    }
                    "--version" => {
                        i += 1;
                        version = Some(args.get(i).ok_or("--version requires a value")?.clone());
                    }
                    "--file" | "--code" if source.is_some() => {
                        return Err("--file and --code are mutually exclusive".to_string());
                    }
                    "--file" => {
                        i += 1;
                        source = Some(Source::File(
                            args.get(i).ok_or("--file requires a path")?.clone(),
                        ));
                    }
                    "--code" => {
                        i += 1;
                        source = Some(Source::Inline(
                            args.get(i).ok_or("--code requires source code")?.clone(),
                        ));
                    }
                    "--stdin" => {
                        i += 1;
                        stdin = args.get(i).ok_or("--stdin requires a value")?.clone();
                    }
                    "--timeout" => {
                        i += 1;
                        timeout_secs = args
                            .get(i)
                            .ok_or("--timeout requires seconds")?
                            .parse()
                            .map_err(|_| "Invalid timeout")?;
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::Run {
                language: language.ok_or("--language is required")?,
                version: version.ok_or("--version is required")?,
                source: source.ok_or("--file or --code is required")?,
                stdin,
                timeout_secs,
            })
        }
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "coderun_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let _ = dotenvy::dotenv();

    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let config = match ClientConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let broker = match AmqpBroker::connect(&config.amqp_url).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("Failed to connect to broker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let client = match RpcClient::connect(broker.clone(), &config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to set up client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = execute_command(&client, cmd).await;

    if let Err(e) = client.close().await {
        eprintln!("Warning: failed to delete reply queue: {}", e);
    }
    drop(client);
    if let Err(e) = broker.close().await {
        eprintln!("Warning: failed to close broker connection: {}", e);
    }

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the submitted program succeeded.
async fn execute_command(client: &RpcClient, cmd: Command) -> Result<bool, String> {
    match cmd {
        Command::Run {
            language,
            version,
            source,
            stdin,
            timeout_secs,
        } => {
            let code = match source {
                Source::File(path) => fs::read_to_string(&path)
                    .map_err(|e| format!("Failed to read {}: {}", path, e))?,
                Source::Inline(code) => code,
            };

            let task = RunCodeTask::new(code, language, version).with_stdin(stdin);
            let result = client
                .request_with_timeout(task, Duration::from_secs(timeout_secs))
                .await
                .map_err(|e| e.to_string())?;

            println!(
                "{}",
                serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?
            );
            Ok(result.ok)
        }
    }
}
