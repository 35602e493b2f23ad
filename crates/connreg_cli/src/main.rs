//! CLI smoke entry point.
//!
//! # Responsibility
//! - Bring up the default database through the registry and check it once.
//! - Exit non-zero when bring-up is impossible.

use connreg_core::{RegistryConfig, SqliteOpener, SqlitePool};
use log::error;
use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(err) = connreg_core::init_logging(connreg_core::default_log_level(), None) {
        eprintln!("logging disabled: {err}");
    }

    match run(std::env::args().nth(1)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("event=cli_exit module=cli status=error error={}", message);
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: Option<String>) -> Result<(), String> {
    let mut config = match config_path {
        Some(path) => RegistryConfig::load(&path).map_err(|err| err.to_string())?,
        None => RegistryConfig::default(),
    };
    config.apply_process_env().map_err(|err| err.to_string())?;

    let registry = SqliteOpener::new(config).into_registry();
    let default_name = registry.default_name();

    let check = registry
        .open(&default_name)
        .map_err(|err| err.to_string())
        .and_then(|pool| select_one(&pool));

    println!("connreg_core version={}", connreg_core::core_version());
    println!("connreg databases={}", registry.names().join(","));
    registry.close_all();

    let one = check?;
    println!("connreg check {default_name}={one}");
    Ok(())
}

fn select_one(pool: &SqlitePool) -> Result<i64, String> {
    let conn = pool.acquire().map_err(|err| err.to_string())?;
    conn.query_row("SELECT 1;", [], |row| row.get::<_, i64>(0))
        .map_err(|err| err.to_string())
}
