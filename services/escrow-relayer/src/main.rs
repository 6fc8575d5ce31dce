// Copyright 2024 Escrow Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Escrow Relayer Binary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal::unix;

use escrow_relayer::routes::build_web_services;
use escrow_relayer::service;
use escrow_relayer_config::cli::{
    create_store, load_config, setup_logger, Opts,
};
use escrow_relayer_context::RelayerContext;

/// The main entry point for the relayer.
///
/// # Arguments
///
/// * `args` - The command line arguments.
#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }

    // the configuration is validated and loaded from the directory
    // selected by NODE_ENV; a bad config refuses to start.
    let config = load_config(args.config_dir.clone())?;
    setup_logger(args.verbose, config.relayer.log_level.as_deref())?;

    // persistent storage for the relayer.
    let store = create_store(&args).await?;
    let ctx = RelayerContext::new(config, store);

    // the HTTP query API.
    let app = build_web_services().with_state(Arc::new(ctx.clone()));
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.relayer.port));
    tracing::info!("Starting the server on {}", addr);
    let server_handle = tokio::spawn(
        axum::Server::bind(&addr).serve(app.into_make_service()),
    );

    // start all background workers; this does not block.
    service::ignite(&ctx).await?;
    tracing::event!(
        target: escrow_relayer_utils::probe::TARGET,
        tracing::Level::DEBUG,
        kind = %escrow_relayer_utils::probe::Kind::Lifecycle,
        started = true,
    );

    // watch for signals and fatal worker conditions.
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    let mut fatal_signal = ctx.fatal_signal();
    let shutdown = || {
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::Lifecycle,
            shutdown = true,
        );
        tracing::warn!("Shutting down...");
        ctx.shutdown();
        server_handle.abort();
        std::thread::sleep(std::time::Duration::from_millis(300));
        tracing::info!("Clean Exit ..");
    };
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
            shutdown();
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
            shutdown();
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
            shutdown();
        },
        reason = fatal_signal.recv() => {
            let reason = reason
                .unwrap_or_else(|_| "fatal channel closed".to_string());
            tracing::error!("Fatal worker condition: {}", reason);
            shutdown();
            anyhow::bail!("fatal: {reason}");
        },
    }
    Ok(())
}
