use clap::{Arg, ArgAction, ArgMatches, Command};

use codechat_server::errors::*;
use codechat_server::server::{self, ServeOpts};

pub fn make_subcommand() -> Command {
    Command::new("serve")
        .about("Run the CodeChat Server in the foreground")
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
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .help("Only log warnings and errors"),
        )
}

pub fn execute(args: &ArgMatches) -> Result<()> {
    let opts = ServeOpts {
        insecure: args.get_flag("insecure"),
        coverage: args.get_flag("coverage"),
    };
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::run(opts))
}
