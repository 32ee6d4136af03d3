use std::path::PathBuf;

use anyhow::bail;
use clap::{Arg, ArgMatches, Command};

use codechat_server::errors::*;
use codechat_server::renderer::render_file;

pub fn make_subcommand() -> Command {
    Command::new("build")
        .about("Render files once; HTML or the rendered file's path goes to stdout")
        .arg(
            Arg::new("path")
                .help("The file(s) to render")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .num_args(1..)
                .required(true),
        )
}

pub fn execute(args: &ArgMatches) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut failures = 0usize;
        for path in args.get_many::<PathBuf>("path").expect("path is required") {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("{}: {}", path.display(), e);
                    failures += 1;
                    continue;
                }
            };
            let mut co_build = |chunk: String| eprint!("{}", chunk);
            let outcome = render_file(&text, path, &mut co_build, false).await;
            if !outcome.errors.is_empty() {
                eprintln!("{}", outcome.errors.trim_end());
                failures += 1;
            }
            match outcome.html {
                Some(html) => println!("{}", html),
                None => println!("{}", outcome.rendered_file_path),
            }
        }
        if failures > 0 {
            bail!("{} file(s) failed to render", failures);
        }
        Ok(())
    })
}
