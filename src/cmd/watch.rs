use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{info, warn};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;

use codechat_server::errors::*;
use codechat_server::rpc::RpcClient;
use codechat_server::utils;
use codechat_server::ClientId;

pub fn make_subcommand() -> Command {
    Command::new("watch")
        .about("Watch directories and submit changed files to a running CodeChat Server")
        .arg(
            Arg::new("paths")
                .long("paths")
                .help("The directories to watch")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("patterns")
                .long("patterns")
                .help("Globs a changed file must match to be rendered")
                .value_name("GLOB")
                .num_args(1..)
                .default_values(["*"]),
        )
        .arg(
            Arg::new("ignore-patterns")
                .long("ignore-patterns")
                .help("Globs that exclude changed files")
                .value_name("GLOB")
                .num_args(1..),
        )
        .arg(
            Arg::new("id")
                .long("id")
                .help("The client id to render under; created on first use when negative")
                .value_name("ID")
                .allow_hyphen_values(true)
                .value_parser(clap::value_parser!(ClientId))
                .default_value("-1"),
        )
}

fn build_globset(patterns: Option<clap::parser::ValuesRef<'_, String>>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.into_iter().flatten() {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob {:?}", pattern))?);
    }
    Ok(builder.build()?)
}

pub fn execute(args: &ArgMatches) -> Result<()> {
    let paths = args.get_many::<PathBuf>("paths").expect("paths is required");
    let patterns = build_globset(args.get_many::<String>("patterns"))?;
    let ignore = build_globset(args.get_many::<String>("ignore-patterns"))?;
    let id = *args.get_one::<ClientId>("id").expect("id has a default");

    let (tx, rx) = channel();
    let mut debouncer = new_debouncer(Duration::from_millis(500), None, tx)
        .with_context(|| "Unable to start the filesystem watcher")?;
    for path in paths {
        debouncer
            .watcher()
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Unable to watch {}", path.display()))?;
        info!("watching {}", path.display());
    }

    loop {
        let first = rx
            .recv()
            .with_context(|| "The filesystem watcher stopped")?;
        let batch = std::iter::once(first).chain(rx.try_iter());
        let changed: Vec<PathBuf> = batch
            .filter_map(|result| match result {
                Ok(events) => Some(events),
                Err(errors) => {
                    warn!("watch errors: {:?}", errors);
                    None
                }
            })
            .flatten()
            .map(|event| event.path)
            .filter(|path| patterns.is_match(path) && !ignore.is_match(path))
            .collect();

        for path in changed {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                // Deleted or unreadable between the event and now.
                Err(e) => {
                    warn!("{}: {}", path.display(), e);
                    continue;
                }
            };
            let absolute = utils::fs::absolute_posix(&path);
            info!("rendering {}", absolute);
            let error = RpcClient::connect()?.start_render(text, absolute, id, false)?;
            if !error.is_empty() {
                warn!("the server refused the render: {}", error);
            }
        }
    }
}
