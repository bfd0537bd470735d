//! rtc-native - Main entry point

use log::{error, info};
use rtc_native::args::{self, Launch};
use rtc_native::{orchestrator, AppError, FileConfig, LogContext};
use std::process::ExitCode;

fn main() -> ExitCode {
    let startup = match args::parse(std::env::args_os()) {
        Ok(Launch::Version) => {
            println!("{}", args::version_string());
            return ExitCode::SUCCESS;
        }
        Ok(Launch::Help(help)) => {
            println!("{}", help);
            return ExitCode::FAILURE;
        }
        Ok(Launch::Run(startup)) => startup,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let file_config = match FileConfig::load(&startup.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}", startup.config_path, e);
            return ExitCode::FAILURE;
        }
    };

    let log = match LogContext::init(&file_config.logging, startup.log_level) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("rtc-native v{}", env!("CARGO_PKG_VERSION"));
    info!("Logging to {:?}, console level {}", log.file_path(), log.console_level());

    if startup.daemon {
        if let Err(e) = daemonize() {
            error!("{}", e);
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    let code = match orchestrator::run(&startup.settings, &file_config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    };

    drop(log);
    code
}

/// Detach from the terminal, keeping the working directory for the log files
fn daemonize() -> Result<(), AppError> {
    // SAFETY: called before any thread or runtime exists.
    if unsafe { libc::daemon(1, 0) } != 0 {
        return Err(AppError::Daemon(std::io::Error::last_os_error()));
    }
    Ok(())
}
