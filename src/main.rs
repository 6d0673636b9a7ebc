use std::path::PathBuf;
use std::process::ExitCode;

use kiosk_hal::config::CONFIG_FILE_NAME;
use kiosk_hal::daemon::Daemon;

/// Resolve the configuration path: explicit argument, else `config.ini`
/// next to the executable, else in the working directory.
fn config_path(args: &[String]) -> Result<PathBuf, String> {
    match args {
        [] => {}
        [path] => return Ok(PathBuf::from(path)),
        _ => return Err(format!("usage: kiosk-hald [{CONFIG_FILE_NAME}]")),
    }
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)));
    Ok(match beside_exe {
        Some(path) if path.exists() => path,
        _ => PathBuf::from(CONFIG_FILE_NAME),
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match config_path(&args) {
        Ok(path) => path,
        Err(usage) => {
            eprintln!("{usage}");
            return ExitCode::from(1);
        }
    };
    log::info!("using configuration at {}", config_path.display());

    let daemon = match Daemon::new(&config_path) {
        Ok(daemon) => daemon,
        Err(err) => {
            log::error!("initialization failed: {err}");
            return ExitCode::from(1);
        }
    };

    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("startup failed: {err}");
            daemon.shutdown();
            ExitCode::from(1)
        }
    }
}
