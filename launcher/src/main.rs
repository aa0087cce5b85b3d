mod cli;
mod error;
mod injector;
mod introspect;
mod payload;
mod tracer;

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use flight_profiler_common::ExitCode;
use log::error;
use nix::unistd::Pid;
use structopt::StructOpt;

use crate::cli::Opt;
use crate::injector::Injector;

fn main() -> ProcessExitCode {
    let opt = Opt::from_args();
    init_logging(opt.debug);

    if opt.dump_config {
        Opt::print_dump_config();
        return ExitCode::Success.into();
    }

    let pid = match opt.pid {
        Some(p) => p,
        None => {
            error!("a target pid is required unless --dump-config is given");
            return ExitCode::AttachFailed.into();
        }
    };

    let agent_path = match opt.agent_path.clone() {
        Some(p) => p,
        None => match sibling_agent_path() {
            Ok(p) => p,
            Err(e) => {
                error!("could not locate the agent shared object: {}", e);
                return ExitCode::AttachFailed.into();
            }
        },
    };

    let injector = Injector::new(
        Pid::from_raw(pid),
        agent_path.to_string_lossy().into_owned(),
        opt.debug,
    );

    match injector.perform_injection() {
        Ok(()) => ExitCode::Success.into(),
        Err((err, code)) => {
            error!("injection failed: {}", err);
            code.into()
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();
}

/// Resolve the agent `.so` expected to sit next to this launcher binary on
/// disk, the way `inject.cpp`'s `main()` finds `flight_profiler_agent.so`
/// via `/proc/self/exe`.
fn sibling_agent_path() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "exe has no parent dir"))?;
    let candidate = dir.join("libflight_profiler_agent.so");
    Ok(candidate)
}
