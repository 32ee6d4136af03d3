use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use log::info;

use codechat_server::errors::*;
use codechat_server::rpc::RpcClient;
use codechat_server::utils;
use codechat_server::ClientId;

pub fn make_subcommand() -> Command {
    Command::new("render")
        .about("Submit one render to a running CodeChat Server")
        .arg(
            Arg::new("path")
                .help("The file to render")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("id")
                .help("The client id; negative ids are created on first use")
                .value_name("ID")
                .allow_hyphen_values(true)
                .value_parser(clap::value_parser!(ClientId))
                .required(true),
        )
}

pub fn execute(args: &ArgMatches) -> Result<()> {
    let path = args.get_one::<PathBuf>("path").expect("path is required");
    let id = *args.get_one::<ClientId>("id").expect("id is required");

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read {}", path.display()))?;
    // The server resolves project configs and static assets against this
    // path, so it has to be absolute.
    let absolute = utils::fs::absolute_posix(path);

    let error = RpcClient::connect()?.start_render(text, absolute, id, false)?;
    if !error.is_empty() {
        bail!(error);
    }
    info!("submitted {} for client {}", path.display(), id);
    Ok(())
}
