use std::path::PathBuf;

use flight_profiler_common::LockMonitorConfig;
use structopt::StructOpt;

/// `launcher <pid> [--debug]` — attach to a live process and inject the
/// profiling agent.
#[derive(Debug, StructOpt)]
#[structopt(name = "flight-profiler-launcher")]
pub struct Opt {
    /// Target process id to attach to and inject the agent into.
    #[structopt(required_unless = "dump_config")]
    pub pid: Option<i32>,

    /// Verbose logging of resolved addresses and each injection step.
    #[structopt(long)]
    pub debug: bool,

    /// Explicit path to the agent shared object; defaults to the sibling
    /// `.so` next to this binary.
    #[structopt(long, parse(from_os_str))]
    pub agent_path: Option<PathBuf>,

    /// Print the resolved lock-monitor config defaults as JSON and exit
    /// without attaching to anything.
    #[structopt(long = "dump-config")]
    pub dump_config: bool,
}

impl Opt {
    pub fn print_dump_config() {
        let cfg = LockMonitorConfig::default();
        println!("{}", serde_json::to_string_pretty(&cfg).unwrap());
    }
}
