use std::error::Error;

use clap::Parser;

use pib::{
    cli::args::{CliArgs, Command},
    Pib, Steps,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = CliArgs::parse();

    let mut builder = Pib::builder()
        .spec_files(cli_args.spec_files)
        .stop_on_failure(cli_args.stop_on_failure)
        .only(cli_args.only)
        .exclude(cli_args.exclude);
    if let Some(site) = cli_args.site {
        builder = builder.site_file(site);
    }
    if let Some(state_dir) = cli_args.state_dir {
        builder = builder.state_directory(state_dir);
    }
    if let Some(jobs) = cli_args.jobs {
        builder = builder.jobs(jobs);
    }
    let pib = builder.try_build()?;

    let steps = match cli_args.cmd {
        Command::Plan { through, format } => {
            let steps = through.map_or(Steps::All, Steps::Through);
            print!("{}", pib.plan(steps, format)?);
            return Ok(());
        }
        Command::Inspect {
            path,
            output,
            no_download,
        } => {
            let document = pib.inspect(&path, !no_download)?;
            match output {
                Some(output) => std::fs::write(output, document)?,
                None => print!("{}", document),
            }
            return Ok(());
        }
        Command::Status { module } => {
            for progress in pib.status(module.as_deref())? {
                println!("{}", progress);
            }
            return Ok(());
        }
        Command::CleanState => return pib.clean_state(),
        Command::All => Steps::All,
        ref step_command => match step_command.step() {
            Some(step) => Steps::Only(step),
            None => return Err(format!("Unhandled command {:?}", step_command).into()),
        },
    };

    let report = pib.run(steps)?;
    if report.is_success() {
        Ok(())
    } else {
        Err(format!(
            "{} step(s) failed, {} blocked, {} not attempted",
            report.failed.len(),
            report.blocked.len(),
            report.pending.len()
        )
        .into())
    }
}
