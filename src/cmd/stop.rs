use clap::{ArgMatches, Command};
use log::info;
use sysinfo::System;

use codechat_server::errors::*;

pub fn make_subcommand() -> Command {
    Command::new("stop").about("Stop every running CodeChat Server instance")
}

pub fn execute(_args: &ArgMatches) -> Result<()> {
    let me = sysinfo::get_current_pid().map_err(|e| anyhow::anyhow!("{}", e))?;
    let sys = System::new_all();

    let mut stopped = 0usize;
    for (pid, process) in sys.processes() {
        if *pid == me {
            continue;
        }
        if process.name().contains("codechat-server") && process.kill() {
            info!("stopped pid {}", pid);
            stopped += 1;
        }
    }
    if stopped == 0 {
        info!("no running CodeChat Server found");
    } else {
        info!("stopped {} instance(s)", stopped);
    }
    Ok(())
}
