//! Application state and the line-oriented control loop

use crate::config::Config;
use crate::control::{ControlCommand, ControlResponse, StatusSnapshot};
use crate::core::{JobEvent, JobId, Supervisor};
use crate::probe;
use anyhow::Result;
use regex::Regex;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Console lines returned by `tail` when no count is given
pub const DEFAULT_TAIL_LINES: usize = 500;

/// Application state
pub struct App {
    pub config: Config,
    pub supervisor: Supervisor,
}

impl App {
    /// Create the app and the supervisor's event stream
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (supervisor, events) = Supervisor::from_config(&config);
        (Self { config, supervisor }, events)
    }

    /// Start a configured service as a named process
    pub fn start_service(&self, service: &str) -> Result<JobId> {
        let spec = self.config.service(service)?;
        let cwd = self.config.service_cwd(spec);
        Ok(self.supervisor.start(Some(service), &spec.command, Some(&cwd))?)
    }

    /// Jobs, registry contents and probe results
    pub async fn status(&self) -> StatusSnapshot {
        let targets = self.config.all_probes();
        let timeout = self.config.probe_timeout;
        let probes = tokio::task::spawn_blocking(move || probe::probe_all(&targets, timeout))
            .await
            .unwrap_or_default();

        StatusSnapshot {
            jobs: self.supervisor.jobs(),
            tracked: self.supervisor.registry().read(),
            probes,
        }
    }

    /// Last console lines, optionally filtered by a regex
    pub fn tail(&self, lines: usize, pattern: Option<&str>) -> Result<Vec<String>> {
        let filter = pattern.map(Regex::new).transpose()?;
        Ok(self.supervisor.console_log().tail(lines, filter.as_ref()))
    }

    /// Execute one control command
    pub async fn handle(&self, command: ControlCommand) -> ControlResponse {
        match self.dispatch(command).await {
            Ok(Some(data)) => ControlResponse::ok_with_data(data),
            Ok(None) => ControlResponse::ok(),
            Err(e) => ControlResponse::error(e.to_string()),
        }
    }

    async fn dispatch(&self, command: ControlCommand) -> Result<Option<serde_json::Value>> {
        let data = match command {
            ControlCommand::Start { name, command, cwd } => {
                let job_id = self
                    .supervisor
                    .start(name.as_deref(), &command, cwd.as_deref())?;
                Some(json!({ "job_id": job_id }))
            }
            ControlCommand::StartService { service } => {
                let job_id = self.start_service(&service)?;
                Some(json!({ "job_id": job_id }))
            }
            ControlCommand::Stop { name } => {
                self.supervisor.stop(&name);
                None
            }
            ControlCommand::StopAll => {
                self.supervisor.stop_all();
                None
            }
            ControlCommand::Status => Some(serde_json::to_value(self.status().await)?),
            ControlCommand::Alive { name } => {
                let supervisor = self.supervisor.clone();
                let alive = tokio::task::spawn_blocking(move || supervisor.is_alive(&name)).await?;
                Some(json!({ "alive": alive }))
            }
            ControlCommand::Probe { host, port } => {
                let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
                let timeout = self.config.probe_timeout;
                let open =
                    tokio::task::spawn_blocking(move || probe::port_open(&host, port, timeout))
                        .await?;
                Some(json!({ "port": port, "status": probe::PortStatus::from(open) }))
            }
            ControlCommand::Jobs => Some(serde_json::to_value(self.supervisor.jobs())?),
            ControlCommand::Tail { lines, pattern } => {
                let lines = self.tail(lines.unwrap_or(DEFAULT_TAIL_LINES), pattern.as_deref())?;
                Some(json!({ "lines": lines }))
            }
            ControlCommand::Quit => None,
        };
        Ok(data)
    }

    /// Read one JSON command per line from `reader` and answer each with one
    /// JSON line on `writer`, until EOF or `quit`. Processes started here keep
    /// running afterwards; the registry keeps them stoppable.
    ///
    /// `events` is drained meanwhile. Job output already lands in the
    /// console log and nobody follows it here.
    pub async fn serve<R, W>(
        &self,
        events: &mut mpsc::UnboundedReceiver<JobEvent>,
        reader: R,
        mut writer: W,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => line,
                    None => break,
                },
                Some(event) = events.recv() => {
                    log::trace!("Discarding event for job {}", event.job_id());
                    continue;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (response, quit) = match serde_json::from_str::<ControlCommand>(line) {
                Ok(command) => {
                    log::debug!("Control command: {:?}", command);
                    let quit = command == ControlCommand::Quit;
                    (self.handle(command).await, quit)
                }
                Err(e) => (ControlResponse::error(format!("invalid command: {}", e)), false),
            };

            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;

            if quit {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::JobState;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::BufReader;

    fn app(temp_dir: &TempDir) -> App {
        app_with_events(temp_dir).0
    }

    fn app_with_events(temp_dir: &TempDir) -> (App, mpsc::UnboundedReceiver<JobEvent>) {
        let mut config = Config::for_root(temp_dir.path());
        config.probes.clear();
        App::new(config)
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let (app, mut events) = app_with_events(&temp_dir);

        let input = concat!(
            r#"{"action":"start","name":"svc","command":"sleep 30"}"#,
            "\n",
            "not json\n",
            r#"{"action":"stop","name":"svc"}"#,
            "\n",
            r#"{"action":"quit"}"#,
            "\n",
            r#"{"action":"jobs"}"#,
            "\n",
        );
        let mut output = Vec::new();
        app.serve(&mut events, input.as_bytes(), &mut output).await.unwrap();

        let responses: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        // Nothing after quit is processed
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0]["status"], "ok");
        assert_eq!(responses[0]["data"]["job_id"], 1);
        assert_eq!(responses[1]["status"], "error");
        assert_eq!(responses[2]["status"], "ok");
        assert_eq!(responses[3]["status"], "ok");
        assert!(app.supervisor.job_for("svc").is_none());
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        let resp = app
            .handle(ControlCommand::Start {
                name: None,
                command: "   ".to_string(),
                cwd: None,
            })
            .await;
        assert!(!resp.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_service_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        let resp = app
            .handle(ControlCommand::StartService {
                service: "ghost".to_string(),
            })
            .await;
        match resp {
            ControlResponse::Error { message } => assert!(message.contains("ghost")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_tail_pattern() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        let resp = app
            .handle(ControlCommand::Tail {
                lines: None,
                pattern: Some("(".to_string()),
            })
            .await;
        assert!(!resp.is_ok());
    }

    #[tokio::test]
    async fn test_status_lists_tracked_processes() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        app.supervisor.start(Some("svc"), "sleep 30", None).unwrap();
        let status = app.status().await;
        assert_eq!(status.jobs.len(), 1);
        assert!(status.tracked.contains_key("svc"));
        assert!(status.probes.is_empty());

        app.supervisor.stop_all();
        assert!(app.supervisor.registry().read().is_empty());
    }

    #[tokio::test]
    async fn test_serve_drains_job_events() {
        let temp_dir = TempDir::new().unwrap();
        let (app, mut events) = app_with_events(&temp_dir);

        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);

        let session = app.serve(&mut events, BufReader::new(server_read), server_write);
        let driver = async {
            client
                .write_all(b"{\"action\":\"start\",\"command\":\"seq 1 2000\"}\n")
                .await
                .unwrap();

            let exited = async {
                while app.supervisor.job_state(JobId(1)) != Some(JobState::Exited(0)) {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            tokio::time::timeout(Duration::from_secs(10), exited)
                .await
                .expect("job did not exit in time");
            // Let the session catch up on the last events
            tokio::time::sleep(Duration::from_millis(200)).await;

            client.write_all(b"{\"action\":\"quit\"}\n").await.unwrap();
        };

        let (result, ()) = tokio::join!(session, driver);
        result.unwrap();
        assert!(events.try_recv().is_err());
    }
}
