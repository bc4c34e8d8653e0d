// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;

mod cli;
mod config;
mod file_security;
mod logging;
mod lifecycle;
mod recording;
mod relay_hub;
mod server;
mod session;
mod state;
mod telemetry;
mod upgrade_gate;
mod websocket;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    cli::handle_command(&cli, |log_config, telemetry_config| {
        logging::init_logging(log_config, telemetry_config)
    })
    .await;
}
