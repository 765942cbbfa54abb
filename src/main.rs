use dandere2x_orchestrator::{logging, Args, Error, Orchestrator, SessionReport, Workspace};

fn run_session() -> Result<SessionReport, Error> {
    let args = Args::parse()?;
    let workspace = Workspace::create(&args.workspace)?;
    let log_file = logging::init(&workspace.logs())?;
    tracing::info!("Logging to {}", log_file.display());
    Orchestrator::new(args, workspace).with_shutdown_hook(true).run()
}

fn main() {
    match run_session() {
        Ok(report) => {
            tracing::info!(merged = report.merged, mode = %report.mode, "Session complete");
            println!("Completed!");
        }
        Err(error) => {
            if tracing::dispatcher::has_been_set() {
                tracing::error!("{}", error);
            } else {
                eprintln!("Error: {}", error);
            }
            std::process::exit(1);
        }
    }
}
