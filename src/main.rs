//! procdeck CLI entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use procdeck::console_log::{self, MAX_LOG_FILES};
use procdeck::probe::{self, PortStatus};
use procdeck::{App, Config, JobEvent, JobId};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "procdeck", version, about = "Named process console")]
struct Cli {
    /// Root directory (default working directory, home of logs/)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (default: <root>/procdeck.yml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a command and follow its output until it exits
    Run {
        /// Track under this name (replaces a running instance)
        #[arg(long)]
        name: Option<String>,
        /// Working directory (default: root)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Command to run. A single argument is a shell command line used as
        /// is; several are quoted so each reaches the program intact
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Start a configured service and follow its output
    Up { service: String },
    /// Stop a named process, including one started by an earlier run
    Stop { name: String },
    /// Show tracked processes and port status
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a TCP port accepts connections
    Probe {
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Print the last lines of the console log (or another file)
    Tail {
        #[arg(short = 'n', long, default_value_t = procdeck::app::DEFAULT_TAIL_LINES)]
        lines: usize,
        /// Only lines matching this regex
        #[arg(long)]
        grep: Option<String>,
        /// Read this file instead of the console log
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List *.log files under the root
    Logs,
    /// Accept JSON control commands on stdin, one per line
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(cli.root.as_deref(), cli.config.as_deref())?;
    log::debug!("procdeck v{} rooted at {}", env!("CARGO_PKG_VERSION"), config.root.display());

    let (app, mut events) = App::new(config);

    match cli.command {
        Command::Run { name, cwd, command } => {
            let command = command_line(&command);
            let job_id = app.supervisor.start(name.as_deref(), &command, cwd.as_deref())?;
            let code = follow(&app, events, job_id).await;
            std::process::exit(code);
        }
        Command::Up { service } => {
            let job_id = app.start_service(&service)?;
            let code = follow(&app, events, job_id).await;
            std::process::exit(code);
        }
        Command::Stop { name } => {
            app.supervisor.stop(&name);
            println!("stopped {}", name);
        }
        Command::Status { json } => {
            let status = app.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("Tracked processes");
            if status.tracked.is_empty() {
                println!("  None");
            }
            for (name, record) in &status.tracked {
                let pid = record
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let alive = if app.supervisor.is_alive(name) { "alive" } else { "gone" };
                println!(
                    "  {:<16} pid {:<8} {:<6} {}  [{}] {}",
                    name, pid, alive, record.started_at, record.cwd, record.cmd
                );
            }

            println!("Ports");
            for result in &status.probes {
                println!(
                    "  {:<16} {}:{:<6} {}",
                    result.target.label, result.target.host, result.target.port, result.status
                );
            }
        }
        Command::Probe { port, host } => {
            let status = PortStatus::from(probe::port_open(&host, port, app.config.probe_timeout));
            println!("{}:{} {}", host, port, status);
        }
        Command::Tail { lines, grep, file } => {
            let out = match file {
                Some(path) => {
                    let filter = grep.as_deref().map(regex::Regex::new).transpose()?;
                    console_log::tail_file(&path, lines, filter.as_ref())?
                }
                None => app.tail(lines, grep.as_deref())?,
            };
            for line in out {
                println!("{}", line);
            }
        }
        Command::Logs => {
            for path in console_log::find_log_files(&app.config.root, MAX_LOG_FILES) {
                println!("{}", path.display());
            }
        }
        Command::Serve => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            app.serve(&mut events, stdin, tokio::io::stdout()).await?;
        }
    }

    Ok(())
}

/// Shell command line for `run`'s trailing arguments
fn command_line(args: &[String]) -> String {
    match args {
        [line] => line.clone(),
        _ => shell_words::join(args),
    }
}

/// Echo a job's output until it exits; Ctrl-C stops every job. Returns the
/// exit code to hand back to the shell.
async fn follow(app: &App, mut events: mpsc::UnboundedReceiver<JobEvent>, job_id: JobId) -> i32 {
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) if event.job_id() != job_id => {}
                Some(JobEvent::Output { line, .. }) => println!("{}", line),
                Some(JobEvent::Exited { exit_code, .. }) => {
                    // Killed by signal N is reported the way shells do, 128 + N
                    return match exit_code {
                        Some(code) if code < 0 => 128 - code,
                        Some(code) => code,
                        None => 1,
                    };
                }
                Some(JobEvent::Failed { error, .. }) => {
                    eprintln!("failed to start: {}", error);
                    return 127;
                }
                Some(_) => {}
                None => return 1,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                log::info!("Interrupted, stopping jobs");
                interrupted = true;
                app.supervisor.stop_all();
            }
        }
    }
}
