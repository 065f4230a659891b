//! Administrative CLI entry point. Thin by design: all command logic lives
//! in `stratadb::tool` so it stays testable without spawning a process.

use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = stratadb::tool::run(&args);
    ExitCode::from(code as u8)
}
