//! dispatchctl - CLI client for dispatchd
//!
//! Runs modal commands, dispatches scripts, and browses execution logs and
//! app profiles through the local daemon.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use client::{
    Client, ClientError, CommandLineRequest, CreateAppRequest, DispatchRequest, EventStream,
    LogMetadata,
};
use dispatch_core::{Credentials, Id, Invocation, UiEvent};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// CLI client for the dispatchd daemon.
#[derive(Parser)]
#[command(name = "dispatchctl")]
#[command(about = "Control plane client for the modal dispatch daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7700)
    #[arg(long, global = true, env = "DISPATCHD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "DISPATCHD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Credentials forwarded to the modal CLI.
#[derive(clap::Args, Debug, Default)]
struct CredentialArgs {
    /// Modal token id
    #[arg(long, env = "MODAL_TOKEN_ID", hide_env_values = true)]
    token_id: Option<String>,

    /// Modal token secret
    #[arg(long, env = "MODAL_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,
}

impl CredentialArgs {
    fn into_credentials(self) -> Option<Credentials> {
        match (self.token_id, self.token_secret) {
            (Some(id), Some(secret)) => Some(Credentials::new(id, secret)),
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run a modal command and wait for it to finish
    Exec {
        /// Modal subcommand, e.g. `app`
        subcommand: String,

        /// Arguments passed through verbatim
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Working directory (relative paths resolve under the projects dir)
        #[arg(long)]
        workdir: Option<PathBuf>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Run a free-form command line such as "modal app list"
    Line {
        /// The command line
        line: String,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Start a modal command in the background
    Start {
        /// Modal subcommand, e.g. `serve`
        subcommand: String,

        /// Arguments passed through verbatim
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Working directory (relative paths resolve under the projects dir)
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Stream output until the command completes
        #[arg(short, long)]
        follow: bool,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Deploy a script
    Deploy(ScriptArgs),

    /// Run a script
    Run(ScriptArgs),

    /// List running executions
    Ps,

    /// Cancel an execution (the most recent one when no id is given)
    Cancel {
        /// Execution ID
        execution_id: Option<String>,
    },

    /// Stream UI events from the daemon
    Watch {
        /// Only show events for this execution
        #[arg(long)]
        execution_id: Option<String>,
    },

    /// Browse and prune execution logs
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },

    /// Manage app profiles
    Apps {
        #[command(subcommand)]
        command: AppsCommand,
    },

    /// Check whether the daemon can run the modal CLI
    Doctor,
}

#[derive(clap::Args)]
struct ScriptArgs {
    /// Script path (relative to --workdir when set)
    script: PathBuf,

    /// Extra arguments appended after the script (after `--`)
    #[arg(last = true)]
    args: Vec<String>,

    /// App profile providing credentials and environment suffix
    #[arg(long)]
    app: Option<String>,

    /// Working directory
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Record an execution log for this project
    #[arg(long, requires = "project_id")]
    log: bool,

    /// Project id stored with the log
    #[arg(long)]
    project_id: Option<String>,

    /// Project name stored with the log
    #[arg(long)]
    project_name: Option<String>,

    /// Variables stored with the log (KEY=VALUE)
    #[arg(long = "var", value_parser = parse_key_value)]
    vars: Vec<(String, String)>,

    /// Stream output until the script completes
    #[arg(short, long)]
    follow: bool,
}

#[derive(Subcommand)]
enum LogsCommand {
    /// List logs, newest first
    List {
        /// Only logs for this project
        #[arg(long)]
        project_id: Option<String>,

        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one log with its output
    Show {
        /// Log ID
        log_id: String,
    },

    /// Delete one log
    Rm {
        /// Log ID
        log_id: String,
    },

    /// Delete all logs, or one project's
    Clear {
        /// Only logs for this project
        #[arg(long)]
        project_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum AppsCommand {
    /// List app profiles
    List,

    /// Add an app profile
    Add {
        /// Display name
        name: String,

        /// App name on modal
        #[arg(long, default_value = "")]
        app_name: String,

        /// Environment suffix, e.g. `test` or `-prod`
        #[arg(long, default_value = "")]
        suffix: String,

        /// Workspace name
        #[arg(long, default_value = "")]
        workspace: String,

        /// Description
        #[arg(long, default_value = "")]
        description: String,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Remove an app profile
    Rm {
        /// App ID
        app_id: String,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7700".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Exec {
            subcommand,
            args,
            workdir,
            credentials,
        } => {
            let invocation = build_invocation(subcommand, args, workdir, credentials);
            run_exec(&client, &invocation).await
        }
        Command::Line { line, credentials } => run_line(&client, line, credentials).await,
        Command::Start {
            subcommand,
            args,
            workdir,
            follow,
            credentials,
        } => {
            let invocation = build_invocation(subcommand, args, workdir, credentials);
            run_start(&client, &invocation, follow).await
        }
        Command::Deploy(args) => run_dispatch(&client, "deploy", args).await,
        Command::Run(args) => run_dispatch(&client, "run", args).await,
        Command::Ps => run_ps(&client).await,
        Command::Cancel { execution_id } => run_cancel(&client, execution_id.as_deref()).await,
        Command::Watch { execution_id } => run_watch(&client, execution_id.as_deref()).await,
        Command::Logs { command } => run_logs(&client, command).await,
        Command::Apps { command } => run_apps(&client, command).await,
        Command::Doctor => run_doctor(&client).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn build_invocation(
    subcommand: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    credentials: CredentialArgs,
) -> Invocation {
    let mut invocation = Invocation::new(subcommand).args(args);
    if let Some(dir) = workdir {
        invocation = invocation.working_dir(dir);
    }
    if let Some(creds) = credentials.into_credentials() {
        invocation = invocation.credentials(creds);
    }
    invocation
}

// Each command returns Ok(false) when the modal command itself failed so the
// process exits non-zero without printing a client error.

async fn run_exec(client: &Client, invocation: &Invocation) -> Result<bool, ClientError> {
    let result = client.run_command(invocation).await?;
    render::print_run_result(&result);
    Ok(result.succeeded)
}

async fn run_line(
    client: &Client,
    line: String,
    credentials: CredentialArgs,
) -> Result<bool, ClientError> {
    let req = CommandLineRequest {
        line,
        token_id: credentials.token_id,
        token_secret: credentials.token_secret,
    };
    let result = client.run_command_line(&req).await?;
    render::print_run_result(&result);
    Ok(result.succeeded)
}

async fn run_start(
    client: &Client,
    invocation: &Invocation,
    follow: bool,
) -> Result<bool, ClientError> {
    if !follow {
        let id = client.start_execution(invocation).await?;
        println!("Started execution: {}", id);
        return Ok(true);
    }

    // Subscribe before starting so no early line is missed.
    let events = client.open_events(None).await?;
    let id = client.start_execution(invocation).await?;
    eprintln!("Started execution: {}", id);
    follow_execution(events, &id).await
}

/// Print events for one execution until it completes. Returns whether it
/// succeeded.
async fn follow_execution(events: EventStream, execution_id: &Id) -> Result<bool, ClientError> {
    let mut succeeded = false;
    events
        .for_each(|event| {
            if event.execution_id() != execution_id {
                return true;
            }
            render::print_event(event, false);
            if let UiEvent::ExecutionCompleted { result, .. } = event {
                succeeded = result.succeeded;
                return false;
            }
            true
        })
        .await?;
    Ok(succeeded)
}

async fn run_dispatch(
    client: &Client,
    command: &str,
    args: ScriptArgs,
) -> Result<bool, ClientError> {
    let log = args.log.then(|| LogMetadata {
        project_id: args.project_id.clone().unwrap_or_default(),
        project_name: args.project_name.clone().unwrap_or_default(),
        script_name: None,
        variables: args.vars.iter().cloned().collect::<BTreeMap<_, _>>(),
    });
    let req = DispatchRequest {
        command: command.to_string(),
        script_path: args.script,
        work_dir: args.workdir,
        extra_args: args.args,
        app_id: args.app,
        log,
    };

    let events = if args.follow {
        Some(client.open_events(None).await?)
    } else {
        None
    };

    let response = client.dispatch_script(&req).await?;
    println!("Dispatched execution: {}", response.execution_id);
    if let Some(log_id) = &response.log_id {
        println!("  Log: {}", log_id);
    }

    match events {
        Some(events) => follow_execution(events, &response.execution_id).await,
        None => Ok(true),
    }
}

async fn run_ps(client: &Client) -> Result<bool, ClientError> {
    let running = client.list_executions().await?;
    if running.is_empty() {
        println!("No running executions.");
    }
    for id in running {
        println!("{}", id);
    }
    Ok(true)
}

async fn run_cancel(client: &Client, execution_id: Option<&str>) -> Result<bool, ClientError> {
    if client.cancel(execution_id).await? {
        println!("Cancellation requested.");
    } else {
        println!("Nothing to cancel.");
    }
    Ok(true)
}

async fn run_watch(client: &Client, execution_id: Option<&str>) -> Result<bool, ClientError> {
    client
        .watch_events(execution_id, |event| {
            render::print_event(event, execution_id.is_none());
            true
        })
        .await?;
    Ok(true)
}

async fn run_logs(client: &Client, command: LogsCommand) -> Result<bool, ClientError> {
    match command {
        LogsCommand::List { project_id, limit } => {
            let logs = client.list_logs(project_id.as_deref(), limit).await?;
            render::print_log_list(&logs);
        }
        LogsCommand::Show { log_id } => {
            let log = client.get_log(&log_id).await?;
            render::print_log_details(&log);
        }
        LogsCommand::Rm { log_id } => {
            client.delete_log(&log_id).await?;
            println!("Deleted log: {}", log_id);
        }
        LogsCommand::Clear { project_id } => {
            let removed = client.clear_logs(project_id.as_deref()).await?;
            println!("Removed {} log(s)", removed);
        }
    }
    Ok(true)
}

async fn run_apps(client: &Client, command: AppsCommand) -> Result<bool, ClientError> {
    match command {
        AppsCommand::List => {
            let apps = client.list_apps().await?;
            render::print_app_list(&apps);
        }
        AppsCommand::Add {
            name,
            app_name,
            suffix,
            workspace,
            description,
            credentials,
        } => {
            let req = CreateAppRequest {
                name,
                app_name,
                description,
                token_id: credentials.token_id.unwrap_or_default(),
                token_secret: credentials.token_secret.unwrap_or_default(),
                workspace,
                suffix,
            };
            let app = client.create_app(&req).await?;
            println!("Created app: {}", app.id);
            println!("  Name:   {}", app.name);
            println!("  Suffix: {}", app.suffix);
        }
        AppsCommand::Rm { app_id } => {
            client.delete_app(&app_id).await?;
            println!("Deleted app: {}", app_id);
        }
    }
    Ok(true)
}

async fn run_doctor(client: &Client) -> Result<bool, ClientError> {
    println!("daemon:    ok ({})", client.addr());
    let installed = client.cli_installed().await?;
    if installed {
        println!("modal CLI: ok");
    } else {
        println!("modal CLI: not found (install with `pip install modal`)");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_key_value_splits_on_first_equals() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn exec_passes_hyphenated_args_through() {
        let cli = Cli::parse_from(["dispatchctl", "exec", "app", "logs", "--timestamps", "svc"]);
        match cli.command {
            Command::Exec {
                subcommand, args, ..
            } => {
                assert_eq!(subcommand, "app");
                assert_eq!(args, vec!["logs", "--timestamps", "svc"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn credentials_need_both_halves() {
        let only_id = CredentialArgs {
            token_id: Some("ak".to_string()),
            token_secret: None,
        };
        assert!(only_id.into_credentials().is_none());

        let inv = build_invocation(
            "deploy".to_string(),
            vec!["app.py".to_string()],
            Some(PathBuf::from("svc")),
            CredentialArgs {
                token_id: Some("ak".to_string()),
                token_secret: Some("as".to_string()),
            },
        );
        assert_eq!(inv.argv(), vec!["deploy", "app.py"]);
        assert!(inv.effective_credentials().is_some());
    }

    #[test]
    fn deploy_with_log_requires_project() {
        assert!(Cli::try_parse_from(["dispatchctl", "deploy", "app.py", "--log"]).is_err());
        let cli = Cli::try_parse_from([
            "dispatchctl",
            "deploy",
            "app.py",
            "--log",
            "--project-id",
            "p1",
            "--var",
            "GPU=A10G",
        ])
        .unwrap();
        match cli.command {
            Command::Deploy(args) => {
                assert!(args.log);
                assert_eq!(args.vars, vec![("GPU".to_string(), "A10G".to_string())]);
            }
            _ => panic!("expected deploy"),
        }
    }
}
