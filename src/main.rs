/*!
 * Nested Maps - Main Entry Point
 *
 * Runs one pass of the nested table protocol against a compiled object:
 * bind, load, insert, lookup, delete, unload.
 */

use std::process::ExitCode;
use tracing::info;

use nested_maps::{init_tracing, Bootstrap, Config, Stage};

fn main() -> ExitCode {
    init_tracing();

    let config = match Config::from_args(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            let code = e.stage().unwrap_or(Stage::Config).exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            return ExitCode::from(code);
        }
    };

    info!(
        object = %config.object_path.display(),
        outer_map = %config.outer_map,
        backend = %config.backend,
        "nested maps starting"
    );

    match Bootstrap::new(config.clone()).run() {
        Ok(report) => {
            if config.report_json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize run report"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            let code = failure.exit_code();
            eprintln!("{:?}", miette::Report::new(failure));
            ExitCode::from(code)
        }
    }
}
