use clap::Parser;
use dotenv::dotenv;
use smr::SmrError;
use smr::abort::{AbortCoordinator, AbortReason};
use smr::config::{ClusterConfig, JobConfig, LogFormat, config_name};
use smr::input::expand_inputs;
use smr::job::{Job, JobOutcome};
use smr::lifecycle::{InstanceLifecycleManager, InstanceProvider, LocalProvider, StaticHostProvider};
use smr::logging::init_tracing;
use smr::reducer::{ReducerProcess, ReducerSink};
use smr::transport::{LocalTransport, SshTransport, Transport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "smr")]
#[command(about = "Distributed map/reduce job runner", long_about = None)]
struct Cli {
    /// Job configuration file (JSON)
    config: PathBuf,
    /// Worker processes per instance
    #[arg(short, long)]
    workers: Option<usize>,
    /// Number of instances to run workers on
    #[arg(long)]
    instances: Option<usize>,
    /// Output path template; {config_name} and {time} are expanded
    #[arg(long)]
    output: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Input URIs, replacing the configured ones (file://dir, s3://bucket/prefix, or ids)
    #[arg(long = "input", num_args = 1..)]
    inputs: Vec<String>,
    /// Run workers as local processes whatever the cluster section says
    #[arg(long)]
    local: bool,
}

impl Cli {
    fn apply(&self, config: &mut JobConfig) {
        if let Some(workers) = self.workers {
            config.workers_per_instance = workers;
        }
        if let Some(instances) = self.instances {
            config.instances = instances;
        }
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
        if !self.inputs.is_empty() {
            config.input = self.inputs.clone();
        }
        if self.local {
            config.cluster = ClusterConfig::Local;
        }
    }
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "job failed to run");
            eprintln!("smr: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode, SmrError> {
    let mut config = JobConfig::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;
    init_tracing("smr", &config.logging)?;

    let output = config.resolve_output(&config_name(&cli.config))?;
    println!("getting list of the items to process...");
    let items = expand_inputs(&config.input, &config.s3)?;
    info!(items = items.len(), output = %output.display(), "inputs expanded");

    let abort = Arc::new(AbortCoordinator::new());
    {
        let abort = Arc::clone(&abort);
        if let Err(err) = ctrlc::set_handler(move || {
            abort.trigger(AbortReason::Interrupted);
        }) {
            error!("failed to set Ctrl-C handler: {}", err);
        }
    }

    let (provider, transport): (Arc<dyn InstanceProvider>, Arc<dyn Transport>) =
        match &config.cluster {
            ClusterConfig::Hosts {
                hosts,
                user,
                identity_file,
            } => (
                Arc::new(StaticHostProvider::new(hosts.clone())),
                Arc::new(SshTransport::new(
                    user.clone(),
                    identity_file.as_ref().map(PathBuf::from),
                )),
            ),
            ClusterConfig::Local => (Arc::new(LocalProvider), Arc::new(LocalTransport::new())),
        };
    let lifecycle = Arc::new(InstanceLifecycleManager::new(
        provider,
        transport,
        config.readiness.clone(),
    ));

    let reduce_command = config.reduce_command.clone();
    let job = Job::new(config, lifecycle).with_output(output.clone());
    let report = job.run(
        items,
        || {
            let reducer = ReducerProcess::spawn(&reduce_command, &output)?;
            Ok(Box::new(reducer) as Box<dyn ReducerSink>)
        },
        abort,
    )?;

    match &report.outcome {
        JobOutcome::Complete => {
            println!("done. elapsed time: {:.1?}", report.elapsed);
            println!("results are in {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        JobOutcome::Partial => {
            println!(
                "gave up on {} of {} items. elapsed time: {:.1?}",
                report.abandoned, report.total, report.elapsed
            );
            println!("partial results are in {}", output.display());
            Ok(ExitCode::FAILURE)
        }
        JobOutcome::Aborted(reason) => {
            eprintln!("job aborted: {}", reason);
            println!(
                "processed {} of {} items. elapsed time: {:.1?}",
                report.processed, report.total, report.elapsed
            );
            println!("partial results are in {}", output.display());
            Ok(ExitCode::FAILURE)
        }
    }
}
