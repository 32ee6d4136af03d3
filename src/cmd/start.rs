use std::env;
use std::io::{BufRead, BufReader};
use std::process::{Command as Process, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;

use codechat_server::constants::{READY_MARKER, STARTUP_TIMEOUT_SECS};
use codechat_server::errors::*;

pub fn make_subcommand() -> Command {
    Command::new("start")
        .about("Start the CodeChat Server in the background and wait until it is ready")
        .arg(
            Arg::new("insecure")
                .long("insecure")
                .action(ArgAction::SetTrue)
                .help("Bind on all network interfaces instead of loopback only"),
        )
        .arg(
            Arg::new("coverage")
                .long("coverage")
                .hide(true)
                .action(ArgAction::SetTrue),
        )
}

pub fn execute(args: &ArgMatches) -> Result<()> {
    let exe = env::current_exe().with_context(|| "Unable to locate this executable")?;
    let mut command = Process::new(exe);
    command.arg("serve");
    if args.get_flag("insecure") {
        command.arg("--insecure");
    }
    if args.get_flag("coverage") {
        command.arg("--coverage");
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| "Unable to start the server process")?;
    let stderr = child.stderr.take().expect("stderr was piped");

    // Relay the child's stderr while scanning for the ready marker.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let deadline = Instant::now() + Duration::from_secs(STARTUP_TIMEOUT_SECS);
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(line) => {
                eprintln!("{}", line);
                if line == READY_MARKER {
                    info!("the server is running with pid {}", child.id());
                    return Ok(());
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let _ = child.kill();
                bail!(
                    "The server did not become ready within {} seconds",
                    STARTUP_TIMEOUT_SECS
                );
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // The child exited before printing the marker; its exit
                // status carries the reason (port conflicts and the like).
                let status = child.wait()?;
                bail!("The server exited during startup with {}", status);
            }
        }
    }
}
