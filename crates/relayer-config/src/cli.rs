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

use crate::EscrowRelayerConfig;
use anyhow::Context;
use directories_next::ProjectDirs;
use std::path::PathBuf;
use structopt::StructOpt;

/// Package identifier, where the default configuration & database are
/// defined. If the user does not start the relayer with `--config-dir`
/// it will default to the OS-specific location.
pub const PACKAGE_ID: [&str; 3] = ["tools", "escrow", "escrow-relayer"];

/// The escrow relayer command-line tool.
///
/// Start the relayer from a config directory:
///
/// $ escrow-relayer -vvv -c <CONFIG_DIR>
#[derive(StructOpt)]
#[structopt(name = "Escrow Relayer")]
pub struct Opts {
    /// A level of verbosity, and can be used multiple times.
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: i32,
    /// Directory that contains the `config.<env>.yaml` files.
    #[structopt(
        short = "c",
        long = "config-dir",
        value_name = "PATH",
        parse(from_os_str)
    )]
    pub config_dir: Option<PathBuf>,
    /// Create the database store in a temporary directory, deleted when
    /// the process exits.
    #[structopt(long)]
    pub tmp: bool,
}

/// The environment tag selecting the config file, from `NODE_ENV`.
pub fn environment_tag() -> String {
    std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Loads `config.<NODE_ENV>.yaml` from the given directory (or the
/// OS-default config directory).
pub fn load_config(
    config_dir: Option<PathBuf>,
) -> Result<EscrowRelayerConfig, anyhow::Error> {
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get project dirs")?;
    let path = match config_dir {
        Some(p) => p,
        None => dirs.config_dir().to_path_buf(),
    };
    if !path.is_dir() {
        return Err(anyhow::anyhow!("{} is not a directory", path.display()));
    }
    let env = environment_tag();
    tracing::trace!(
        "Loading config for `{}` from {} ..",
        env,
        path.display()
    );
    let config = crate::utils::load(path, &env)?;
    tracing::trace!("Config loaded..");
    Ok(config)
}

/// Sets up the logger for the relayer, based on the verbosity level and
/// the configured log level.
pub fn setup_logger(
    verbosity: i32,
    log_level: Option<&str>,
) -> anyhow::Result<()> {
    use tracing::Level;
    let level = match (verbosity, log_level) {
        (0, Some(name)) => name.parse().unwrap_or(Level::INFO),
        (0, None) => Level::ERROR,
        (1, _) => Level::WARN,
        (2, _) => Level::INFO,
        (3, _) => Level::DEBUG,
        _ => Level::TRACE,
    };
    let directive = format!("escrow_relayer={level}")
        .parse()
        .expect("valid log directive");
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive);
    let logger = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(level)
        .with_env_filter(env_filter);
    // humans get pretty logs, integration tooling gets JSON.
    #[cfg(not(feature = "integration-tests"))]
    let logger = logger.pretty();
    #[cfg(feature = "integration-tests")]
    let logger = logger.json().flatten_event(true).with_current_span(false);

    logger.init();
    Ok(())
}

/// Creates the database store for the relayer based on the CLI options.
pub async fn create_store(
    opts: &Opts,
) -> anyhow::Result<escrow_relayer_store::SledStore> {
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = escrow_relayer_store::SledStore::temporary()?;
        return Ok(store);
    }
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get project dirs")?;
    let db_path = match opts.config_dir.as_ref().and_then(|p| p.parent()) {
        Some(parent) => parent.join("store"),
        None => dirs.data_local_dir().join("store"),
    };
    let store = escrow_relayer_store::SledStore::open(db_path)?;
    Ok(store)
}
