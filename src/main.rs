mod cli;
mod commands;
mod digest;
mod env_loader;
mod error;
mod logging;
mod slack;

use std::process::ExitCode;

fn main() -> ExitCode {
    env_loader::load_dotenv();

    match cli::run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
