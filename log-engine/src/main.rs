// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `logpiped`, the pipeline daemon front-end.
//!
//! Exit codes: 0 on success, 1 for configuration or startup problems,
//! 2 for fatal runtime errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log_engine::config::EngineConfig;
use log_engine::engine::Engine;

#[derive(Debug, Parser)]
#[command(name = "logpiped", version, about = "High-throughput log processing daemon")]
struct Cli {
    /// Configuration file (JSON).
    #[arg(long = "cfgfile", short = 'f')]
    cfgfile: PathBuf,

    /// Override the configured state directory for queue files.
    #[arg(long = "persist-dir")]
    persist_dir: Option<PathBuf>,

    /// Override the configured control socket path.
    #[arg(long = "control")]
    control: Option<PathBuf>,

    /// Only verify the configuration, do not start.
    #[arg(long = "syntax-only")]
    syntax_only: bool,

    /// Write the resolved configuration to a file and exit.
    #[arg(long = "preprocess-into")]
    preprocess_into: Option<PathBuf>,

    /// Print the configuration id and exit.
    #[arg(long = "config-id")]
    config_id: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match EngineConfig::parse_file(&cli.cfgfile) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("logpiped: {err}");
            return ExitCode::from(1);
        }
    };
    if let Some(dir) = cli.persist_dir {
        cfg.persist_dir = Some(dir);
    }
    if let Some(path) = cli.control {
        cfg.control_socket = Some(path);
    }
    if let Err(err) = cfg.validate() {
        eprintln!("logpiped: {err}");
        return ExitCode::from(1);
    }

    if cli.config_id {
        println!("{}", cfg.config_id());
        return ExitCode::SUCCESS;
    }
    if let Some(path) = cli.preprocess_into {
        let rendered = match serde_json::to_string_pretty(&cfg) {
            Ok(rendered) => rendered,
            Err(err) => {
                eprintln!("logpiped: {err}");
                return ExitCode::from(1);
            }
        };
        if let Err(err) = std::fs::write(&path, rendered) {
            eprintln!("logpiped: cannot write {}: {err}", path.display());
            return ExitCode::from(1);
        }
        return ExitCode::SUCCESS;
    }
    if cli.syntax_only {
        println!("configuration OK, id {}", cfg.config_id());
        return ExitCode::SUCCESS;
    }

    let log_controller = log_engine::logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("logpiped: cannot start runtime: {err}");
            return ExitCode::from(2);
        }
    };

    let engine = Engine::new(cfg, Some(cli.cfgfile), log_controller);
    match runtime.block_on(engine.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("logpiped: fatal: {err:#}");
            ExitCode::from(2)
        }
    }
}
