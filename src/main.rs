use std::process::ExitCode;

use anyhow::Result;
use regionview::cli;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("regionview=info".parse().expect("valid directive")),
        )
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let Some(args) = cli::parse_args(std::env::args().skip(1))? else {
        println!("{}", cli::USAGE);
        return Ok(ExitCode::SUCCESS);
    };
    let summary = cli::run(&args)?;
    if summary.timed_out {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}
