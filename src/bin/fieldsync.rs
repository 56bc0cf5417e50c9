use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use fieldsync::app::App;
use fieldsync::cancel::CancellationToken;
use fieldsync::config::ConfigLoader;
use fieldsync::domain::{InstanceId, InstanceStatus};
use fieldsync::error::SyncError;
use fieldsync::output::{JsonOutput, StderrProgress};
use fieldsync::progress::{LogProgress, ProgressSink};
use fieldsync::task::TaskEvent;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Keep a device's form catalog and submission queue in sync with a server")]
#[command(version, author)]
struct Cli {
    /// Config file to use instead of ./fieldsync.json
    #[arg(long, global = true)]
    config: Option<String>,

    /// Send progress to the log instead of stderr
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Manage the local form catalog")]
    Forms(FormsArgs),
    #[command(about = "Manage filled-in submissions")]
    Instances(InstancesArgs),
    #[command(about = "Upload the given instances")]
    Send(SendArgs),
    #[command(about = "Upload every finalized instance whose form allows auto-send")]
    AutoSend,
}

#[derive(Args)]
struct FormsArgs {
    #[command(subcommand)]
    command: FormsCommand,
}

#[derive(Subcommand)]
enum FormsCommand {
    #[command(about = "Make the local catalog match the server's form list")]
    Sync,
    #[command(about = "List downloaded forms")]
    List,
}

#[derive(Args)]
struct InstancesArgs {
    #[command(subcommand)]
    command: InstancesCommand,
}

#[derive(Subcommand)]
enum InstancesCommand {
    #[command(about = "List instances")]
    List {
        #[arg(long)]
        status: Option<InstanceStatus>,
    },
    #[command(about = "Record a submission file for a downloaded form")]
    Import(ImportArgs),
}

#[derive(Args)]
struct ImportArgs {
    form_id: String,

    submission: Utf8PathBuf,

    #[arg(long)]
    version: Option<String>,

    /// Keep the instance editable instead of finalizing it
    #[arg(long)]
    incomplete: bool,
}

#[derive(Args)]
struct SendArgs {
    #[arg(required = true)]
    ids: Vec<InstanceId>,

    /// Send to this URL instead of each instance's own destination
    #[arg(long)]
    url: Option<String>,

    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingConfig | SyncError::NothingToSubmit | SyncError::InstanceNotFound(_) => 2,
        SyncError::GoogleAccountNotSet
        | SyncError::GoogleAccountNotPermitted
        | SyncError::SpreadsheetUnavailable => 2,
        SyncError::FetchError(_)
        | SyncError::FormDownload { .. }
        | SyncError::Http(_)
        | SyncError::HttpStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::from_config(config)?;

    match cli.command {
        Commands::Forms(args) => run_forms(args.command, &app, cli.quiet),
        Commands::Instances(args) => run_instances(args.command, &app),
        Commands::Send(args) => run_send(args, &app),
        Commands::AutoSend => {
            let result = app.auto_send()?;
            JsonOutput::print_submission(&result).into_diagnostic()?;
            eprintln!("{}", result.summary);
            Ok(batch_exit_code(result.any_failure))
        }
    }
}

fn run_forms(command: FormsCommand, app: &App, quiet: bool) -> miette::Result<ExitCode> {
    match command {
        FormsCommand::Sync => {
            let progress: &dyn ProgressSink = if quiet { &LogProgress } else { &StderrProgress };
            let result = app.sync_forms(progress, &CancellationToken::new())?;
            JsonOutput::print_sync(&result).into_diagnostic()?;
        }
        FormsCommand::List => {
            JsonOutput::print_forms(&app.list_forms()?).into_diagnostic()?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_instances(command: InstancesCommand, app: &App) -> miette::Result<ExitCode> {
    match command {
        InstancesCommand::List { status } => {
            JsonOutput::print_instances(&app.list_instances(status)?).into_diagnostic()?;
        }
        InstancesCommand::Import(args) => {
            let status = if args.incomplete {
                InstanceStatus::Incomplete
            } else {
                InstanceStatus::Complete
            };
            let instance = app.import_instance(
                &args.form_id,
                args.version.as_deref(),
                &args.submission,
                status,
            )?;
            JsonOutput::print_instance(&instance).into_diagnostic()?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_send(args: SendArgs, app: &App) -> miette::Result<ExitCode> {
    let mut task = app.upload_task();
    if let Some(url) = args.url {
        task.set_destination_url(url);
    }
    if let (Some(username), Some(password)) = (args.username, args.password) {
        task.set_credentials(username, password);
    }

    let handle = task.spawn(args.ids);
    for event in handle.events().iter() {
        match event {
            TaskEvent::Progress { processed, total } => {
                eprintln!("phase=Upload; {processed}/{total}");
            }
        }
    }
    let outcome = handle.join()?;
    JsonOutput::print_upload(&outcome).into_diagnostic()?;
    if let Some(host) = &outcome.result.auth_requesting_server {
        eprintln!("{host} requires credentials; retry with --username and --password");
    }
    eprintln!("{}", outcome.result.summary);
    Ok(batch_exit_code(outcome.result.any_failure))
}

fn batch_exit_code(any_failure: bool) -> ExitCode {
    if any_failure {
        ExitCode::from(4)
    } else {
        ExitCode::SUCCESS
    }
}
