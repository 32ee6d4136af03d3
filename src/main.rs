use std::env;
use std::io::Write;

use clap::{crate_version, Arg, Command};
use env_logger::Builder;
use log::LevelFilter;

use codechat_server::utils;

mod cmd;

const VERSION: &str = concat!("v", crate_version!());

fn main() {
    let command = create_clap_command();
    let matches = command.get_matches();

    let quiet = matches!(
        matches.subcommand(),
        Some(("serve", args)) if args.get_flag("quiet")
    );
    init_logger(quiet);

    let res = match matches.subcommand() {
        Some(("start", sub_matches)) => cmd::start::execute(sub_matches),
        Some(("stop", sub_matches)) => cmd::stop::execute(sub_matches),
        Some(("serve", sub_matches)) => cmd::serve::execute(sub_matches),
        Some(("build", sub_matches)) => cmd::build::execute(sub_matches),
        Some(("render", sub_matches)) => cmd::render::execute(sub_matches),
        Some(("watch", sub_matches)) => cmd::watch::execute(sub_matches),
        Some(("completions", sub_matches)) => (|| {
            let shell = sub_matches
                .get_one::<clap_complete::Shell>("shell")
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Shell name missing."))?;
            let mut complete_app = create_clap_command();
            clap_complete::generate(
                shell,
                &mut complete_app,
                "codechat-server",
                &mut std::io::stdout().lock(),
            );
            Ok(())
        })(),
        _ => unreachable!(),
    };

    if let Err(e) = res {
        utils::log_backtrace(&e);
        std::process::exit(101);
    }
}

/// Create a list of valid arguments and sub-commands
fn create_clap_command() -> Command {
    Command::new("codechat-server")
        .about("Renders editor buffers and documents to a live HTML view in the browser")
        .author("The CodeChat System Developers")
        .version(VERSION)
        .propagate_version(true)
        .arg_required_else_help(true)
        .after_help(
            "For more information about the CodeChat System, check out the documentation at \
             https://codechat-system.readthedocs.io/",
        )
        .subcommand(cmd::start::make_subcommand())
        .subcommand(cmd::stop::make_subcommand())
        .subcommand(cmd::serve::make_subcommand())
        .subcommand(cmd::build::make_subcommand())
        .subcommand(cmd::render::make_subcommand())
        .subcommand(cmd::watch::make_subcommand())
        .subcommand(
            Command::new("completions")
                .about("Generate shell completions for your shell to stdout")
                .arg(
                    Arg::new("shell")
                        .value_parser(clap::value_parser!(clap_complete::Shell))
                        .help("the shell to generate completions for")
                        .value_name("SHELL")
                        .required(true),
                ),
        )
}

fn init_logger(quiet: bool) {
    let mut builder = Builder::new();

    builder.format(|formatter, record| {
        writeln!(
            formatter,
            "{} [{}] ({}): {}",
            formatter.timestamp_seconds(),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Ok(var) = env::var("RUST_LOG") {
        builder.parse_filters(&var);
    } else if quiet {
        builder.filter(None, LevelFilter::Warn);
    } else {
        // if no RUST_LOG provided, default to logging at the Info level
        builder.filter(None, LevelFilter::Info);
        // Filter extraneous serving logs.
        builder.filter(Some("warp::server"), LevelFilter::Warn);
        builder.filter(Some("hyper"), LevelFilter::Warn);
    }

    builder.init();
}
