mod cmd;
mod util;

use std::process::ExitCode;

use argp::FromArgs;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};
use typed_path::Utf8NativePathBuf;

use crate::util::native_path;

#[derive(FromArgs, Debug)]
/// Drive a GitHub Actions workflow as a GitHub App.
struct TopLevel {
    #[argp(
        option,
        short = 'c',
        default = "Utf8NativePathBuf::from(\"config.yml\")",
        from_str_fn(native_path)
    )]
    /// configuration file (default: config.yml)
    config: Utf8NativePathBuf,
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Check(cmd::check::Args),
    Run(cmd::run::Args),
    Serve(cmd::serve::Args),
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let result = match util::load_config(&args.config) {
        Ok(config) => match args.command {
            SubCommand::Check(c_args) => cmd::check::run(c_args, config).await,
            SubCommand::Run(c_args) => cmd::run::run(c_args, config).await,
            SubCommand::Serve(c_args) => cmd::serve::run(c_args, config).await,
        },
        Err(e) => Err(e),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<indent_github::Error>() {
                Some(err) => eprintln!("error ({}): {e:#}", err.kind()),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
