use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use orbit::{
    logging, BestEffortFailure, CancelToken, CloseResult, ErrorKind, OrbitService, RecoverReport,
    RecoveryAction, RecoveryOutcome, RejectMode, ServiceError, StartOptions, StatusUpdate,
    TaskReport, TerminalConfirmer,
};
use orbit_core::config::{load_config_or_default, ConfigError, DEFAULT_CONFIG_PATH};
use orbit_core::state::TaskStatus;
use orbit_core::types::Task;

#[derive(Parser, Debug)]
#[command(name = "orbit")]
#[command(author, version, about = "Task and workspace lifecycle for worktree-isolated agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (default: .orbit/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a task in a workspace, creating the workspace if needed
    Start {
        workspace: String,

        /// Pipeline step, repeatable (default: configured steps)
        #[arg(long = "step")]
        steps: Vec<String>,

        /// Process id of the agent running the task
        #[arg(long)]
        agent_pid: Option<u32>,

        /// Backlog item this task was picked from
        #[arg(long)]
        backlog_id: Option<String>,
    },

    /// Show every workspace with its latest task
    Status,

    /// Task state operations
    #[command(subcommand)]
    Task(TaskCommands),

    /// Approve the task awaiting review
    Approve { workspace: String },

    /// Reject the task awaiting review
    Reject {
        workspace: String,

        /// Close the task as rejected
        #[arg(long, conflicts_with = "retry", required_unless_present = "retry")]
        done: bool,

        /// Send the task back to a pipeline step
        #[arg(long)]
        retry: bool,

        #[arg(long)]
        feedback: Option<String>,

        /// 1-based step to resume from (default: first implement step)
        #[arg(long, requires = "retry", allow_hyphen_values = true)]
        step: Option<i64>,
    },

    /// Abandon the latest task and pause its workspace
    Abandon {
        workspace: String,

        /// Also abandon a running task, terminating its agent
        #[arg(long)]
        force: bool,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Recover a task stuck in an error state
    Recover {
        workspace: String,

        #[command(flatten)]
        action: RecoverArgs,
    },

    /// Put a task in an error state back to running
    Resume { workspace: String },

    /// Workspace lifecycle operations
    #[command(subcommand)]
    Workspace(WorkspaceCommands),
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// Record a validation, push or CI outcome for the latest task
    SetStatus {
        workspace: String,

        #[arg(value_parser = parse_status)]
        status: TaskStatus,

        #[arg(long)]
        reason: Option<String>,

        /// Push failure class recorded with gh_failed (e.g. non_fast_forward)
        #[arg(long)]
        push_error_type: Option<String>,

        #[arg(long)]
        ci_url: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommands {
    /// Remove the worktree and mark the workspace closed
    Close { workspace: String },
    /// Remove the worktree and mark the workspace retired
    Retire { workspace: String },
    /// Delete the workspace, its tasks and its git state
    Destroy {
        workspace: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// List workspaces
    List,
}

/// At most one action; none means ask interactively.
#[derive(Args, Debug, Default)]
#[group(multiple = false)]
struct RecoverArgs {
    #[arg(long)]
    retry: bool,
    #[arg(long)]
    rebase: bool,
    #[arg(long)]
    fix: bool,
    #[arg(long = "continue")]
    continue_waiting: bool,
    #[arg(long)]
    view_logs: bool,
    #[arg(long)]
    abandon: bool,
}

impl RecoverArgs {
    fn action(&self) -> Option<RecoveryAction> {
        [
            (self.retry, RecoveryAction::Retry),
            (self.rebase, RecoveryAction::RebaseAndRetry),
            (self.fix, RecoveryAction::FixManually),
            (self.continue_waiting, RecoveryAction::ContinueWaiting),
            (self.view_logs, RecoveryAction::ViewCiLogs),
            (self.abandon, RecoveryAction::Abandon),
        ]
        .into_iter()
        .find_map(|(set, action)| set.then_some(action))
    }
}

fn parse_status(value: &str) -> Result<TaskStatus, String> {
    value.parse()
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(err) = err.downcast_ref::<ServiceError>() {
        return err.kind().exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return ErrorKind::Validation.exit_code();
    }
    ErrorKind::Internal.exit_code()
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let config_path = cli
        .config
        .unwrap_or_else(|| cwd.join(DEFAULT_CONFIG_PATH));
    let config = load_config_or_default(&config_path)?;
    let ctx = CancelToken::from_signals().context("failed to install signal handlers")?;
    let service = OrbitService::open(config, &cwd)?;
    let confirmer = TerminalConfirmer;

    match cli.command {
        Commands::Start {
            workspace,
            steps,
            agent_pid,
            backlog_id,
        } => {
            let options = StartOptions {
                steps,
                agent_pid,
                backlog_id,
            };
            let report = service.start_task(&ctx, &workspace, options)?;
            print_task_report(&report);
        }
        Commands::Status => {
            let summaries = service.status()?;
            if summaries.is_empty() {
                println!("no workspaces");
            }
            for summary in summaries {
                let latest = summary
                    .latest
                    .as_ref()
                    .map(describe_task)
                    .unwrap_or_else(|| "no tasks".to_string());
                println!(
                    "{} [{}] {} task(s); latest: {latest}",
                    summary.workspace.name, summary.workspace.status, summary.task_count
                );
            }
        }
        Commands::Task(TaskCommands::SetStatus {
            workspace,
            status,
            reason,
            push_error_type,
            ci_url,
        }) => {
            let update = StatusUpdate {
                reason,
                push_error_type,
                ci_url,
            };
            let report = service.set_status(&ctx, &workspace, status, update)?;
            print_task_report(&report);
        }
        Commands::Approve { workspace } => {
            print_task_report(&service.approve(&ctx, &workspace)?);
        }
        Commands::Reject {
            workspace,
            done,
            feedback,
            step,
            ..
        } => {
            let mode = if done {
                RejectMode::Done { feedback }
            } else {
                RejectMode::Retry {
                    feedback: feedback.unwrap_or_default(),
                    step,
                }
            };
            print_task_report(&service.reject(&ctx, &workspace, mode)?);
        }
        Commands::Abandon {
            workspace,
            force,
            reason,
        } => {
            let report = service.abandon(&ctx, &workspace, force, reason.as_deref())?;
            print_task_report(&report);
        }
        Commands::Recover { workspace, action } => {
            let report = service.recover(&ctx, &workspace, action.action(), &confirmer)?;
            print_recover_report(&report);
        }
        Commands::Resume { workspace } => {
            print_task_report(&service.resume(&ctx, &workspace)?);
        }
        Commands::Workspace(command) => run_workspace(&service, &ctx, &confirmer, command)?,
    }
    Ok(())
}

fn run_workspace(
    service: &OrbitService,
    ctx: &CancelToken,
    confirmer: &TerminalConfirmer,
    command: WorkspaceCommands,
) -> Result<(), ServiceError> {
    match command {
        WorkspaceCommands::Close { workspace } => {
            print_close_result(&service.close(ctx, &workspace)?);
        }
        WorkspaceCommands::Retire { workspace } => {
            print_close_result(&service.retire(ctx, &workspace)?);
        }
        WorkspaceCommands::Destroy { workspace, force } => {
            match service.destroy(ctx, &workspace, force, confirmer)? {
                None => println!("destroy of '{workspace}' cancelled"),
                Some(result) => {
                    println!(
                        "destroyed workspace '{}' ({} task(s) removed)",
                        result.workspace, result.removed_tasks
                    );
                    for warning in &result.warnings {
                        eprintln!("warning: {warning}");
                    }
                    print_diagnostics(&result.diagnostics);
                }
            }
        }
        WorkspaceCommands::List => {
            for workspace in service.list_workspaces()? {
                let path = workspace
                    .worktree_path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{path}",
                    workspace.name, workspace.status, workspace.branch
                );
            }
        }
    }
    Ok(())
}

fn describe_task(task: &Task) -> String {
    let step = task.current_step_name().unwrap_or("-");
    format!("{} {} (step {step})", task.id, task.status)
}

fn print_task_report(report: &TaskReport) {
    println!("{}: {}", report.task.workspace, describe_task(&report.task));
    print_diagnostics(&report.diagnostics);
}

fn print_recover_report(report: &RecoverReport) {
    match &report.outcome {
        RecoveryOutcome::Resumed { action, .. } => {
            println!("{}: {action}", report.task.workspace);
        }
        RecoveryOutcome::Abandoned(_) => println!("{}: abandoned", report.task.workspace),
        RecoveryOutcome::ManualFix {
            worktree_path,
            hint,
        } => {
            if let Some(path) = worktree_path {
                println!("worktree: {}", path.display());
            }
            println!("{hint}");
        }
        RecoveryOutcome::CiLogs { url } => match url {
            Some(url) => println!("CI logs: {url}"),
            None => println!("no CI url recorded for task {}", report.task.id),
        },
    }
    println!("{}: {}", report.task.workspace, describe_task(&report.task));
    print_diagnostics(&report.diagnostics);
}

fn print_close_result(result: &CloseResult) {
    let name = &result.workspace.name;
    let status = result.workspace.status;
    if result.already_in_state {
        println!("workspace '{name}' is already {status}");
        return;
    }
    if let Some(path) = &result.removed_worktree {
        println!("removed worktree {}", path.display());
    }
    println!("workspace '{name}' is now {status}");
}

fn print_diagnostics(diagnostics: &[BestEffortFailure]) {
    for diagnostic in diagnostics {
        eprintln!("warning: {diagnostic}");
    }
}
