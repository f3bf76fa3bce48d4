//! Delivery of vendor job lists to the autosampler program.
//!
//! All entries of one run are submitted as a single composite command line:
//!
//! ```text
//! PAL.exe /loadmethod "<method file>" "<params>" ... /start /quit
//! ```
//!
//! The command runs either on this machine or on the autosampler PC through
//! the system `ssh` client. The ssh connection check is the only retried step
//! in the crate: it is repeated every `retry_interval_ms` until it succeeds or
//! the emergency stop is engaged.

use crate::config::TransportConfig;
use crate::error::{AppResult, WorkcellError};
use crate::estop::EstopFlag;
use crate::pal::plan::JobEntry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delivers job lists to the vendor program.
#[async_trait]
pub trait CommandTransport: Send {
    /// Make sure the autosampler PC is reachable.
    async fn connect(&mut self, estop: &EstopFlag) -> AppResult<()>;

    /// Submit one run's job list.
    async fn submit(&mut self, jobs: &[JobEntry]) -> AppResult<()>;

    /// Wait for the last submitted program to exit.
    async fn drain(&mut self) -> AppResult<()>;
}

/// Vendor program arguments for a job list.
pub fn vendor_arguments(jobs: &[JobEntry]) -> Vec<String> {
    let mut args = Vec::with_capacity(jobs.len() * 3 + 2);
    for job in jobs {
        args.push("/loadmethod".to_string());
        args.push(job.method_file.display().to_string());
        args.push(job.params.clone());
    }
    args.push("/start".to_string());
    args.push("/quit".to_string());
    args
}

/// POSIX shell word for `arg`. Plain words pass through; anything else is
/// single-quoted so the remote shell expands nothing.
fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | ','));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

async fn wait_child(child: &mut Option<Child>, wrap: fn(String) -> WorkcellError) -> AppResult<()> {
    let Some(mut running) = child.take() else {
        return Ok(());
    };
    let status = running
        .wait()
        .await
        .map_err(|e| wrap(format!("failed to wait for vendor program: {}", e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(wrap(format!("vendor program exited with {}", status)))
    }
}

/// Runs the vendor program on this machine.
pub struct LocalProcessTransport {
    program: PathBuf,
    child: Option<Child>,
}

impl LocalProcessTransport {
    /// Transport running `program` locally.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            child: None,
        }
    }
}

#[async_trait]
impl CommandTransport for LocalProcessTransport {
    async fn connect(&mut self, _estop: &EstopFlag) -> AppResult<()> {
        Ok(())
    }

    async fn submit(&mut self, jobs: &[JobEntry]) -> AppResult<()> {
        // one vendor program instance at a time
        wait_child(&mut self.child, WorkcellError::Command).await?;
        let args = vendor_arguments(jobs);
        debug!("local: {} {}", self.program.display(), args.join(" "));
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                WorkcellError::Command(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        self.child = Some(child);
        Ok(())
    }

    async fn drain(&mut self) -> AppResult<()> {
        wait_child(&mut self.child, WorkcellError::Command).await
    }
}

/// Runs the vendor program on the autosampler PC through `ssh`.
pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: u16,
    program: String,
    retry_interval: Duration,
    child: Option<Child>,
}

impl SshTransport {
    /// Transport to `user@host:port` running `program` there.
    pub fn new(
        host: String,
        user: Option<String>,
        port: u16,
        program: String,
        retry_interval: Duration,
    ) -> Self {
        Self {
            host,
            user,
            port,
            program,
            retry_interval,
            child: None,
        }
    }

    fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=5", "-p"])
            .arg(self.port.to_string())
            .arg(self.target())
            .stdin(Stdio::null());
        cmd
    }

    /// Remote command line for a job list.
    pub fn remote_command(&self, jobs: &[JobEntry]) -> String {
        let mut parts = vec![quote(&self.program)];
        parts.extend(vendor_arguments(jobs).iter().map(|a| quote(a)));
        parts.join(" ")
    }
}

#[async_trait]
impl CommandTransport for SshTransport {
    async fn connect(&mut self, estop: &EstopFlag) -> AppResult<()> {
        let mut attempt: u64 = 0;
        loop {
            if estop.is_set() {
                return Err(WorkcellError::Estop);
            }
            attempt += 1;
            let mut check = self.ssh();
            check
                .arg("exit")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            let status = tokio::select! {
                status = check.status() => status,
                _ = estop.wait() => return Err(WorkcellError::Estop),
            };
            // a missing client is retried like an unreachable host
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!("ssh: failed to run connection check: {}, retrying in {:?}", e, self.retry_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        _ = estop.wait() => return Err(WorkcellError::Estop),
                    }
                    continue;
                }
            };
            if status.success() {
                info!("ssh: connected to {} after {} attempt(s)", self.target(), attempt);
                return Ok(());
            }
            warn!(
                "ssh: {} unreachable ({}), retrying in {:?}",
                self.target(),
                status,
                self.retry_interval
            );
            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = estop.wait() => return Err(WorkcellError::Estop),
            }
        }
    }

    async fn submit(&mut self, jobs: &[JobEntry]) -> AppResult<()> {
        wait_child(&mut self.child, WorkcellError::Ssh).await?;
        let remote = self.remote_command(jobs);
        debug!("ssh {}: {}", self.target(), remote);
        let child = self
            .ssh()
            .arg(remote)
            .spawn()
            .map_err(|e| WorkcellError::Ssh(format!("failed to run ssh: {}", e)))?;
        self.child = Some(child);
        Ok(())
    }

    async fn drain(&mut self) -> AppResult<()> {
        wait_child(&mut self.child, WorkcellError::Ssh).await
    }
}

/// One job list accepted by the [`SimulatedTransport`].
#[derive(Debug, Clone)]
pub struct SimulatedSubmission {
    /// When the job list was accepted
    pub at: Instant,
    /// The job list
    pub jobs: Vec<JobEntry>,
}

/// Records job lists instead of running anything.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    log: Arc<Mutex<Vec<SimulatedSubmission>>>,
}

impl SimulatedTransport {
    /// Transport with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything submitted so far, shared with clones.
    pub fn submissions(&self) -> Vec<SimulatedSubmission> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl CommandTransport for SimulatedTransport {
    async fn connect(&mut self, estop: &EstopFlag) -> AppResult<()> {
        if estop.is_set() {
            return Err(WorkcellError::Estop);
        }
        Ok(())
    }

    async fn submit(&mut self, jobs: &[JobEntry]) -> AppResult<()> {
        debug!("simulated: {} job(s) accepted", jobs.len());
        self.log.lock().push(SimulatedSubmission {
            at: Instant::now(),
            jobs: jobs.to_vec(),
        });
        Ok(())
    }

    async fn drain(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Build the transport selected in the configuration.
pub fn transport_from_config(config: &TransportConfig) -> Box<dyn CommandTransport> {
    match config {
        TransportConfig::Simulated => Box::new(SimulatedTransport::new()),
        TransportConfig::Local { program } => Box::new(LocalProcessTransport::new(program.clone())),
        TransportConfig::Ssh {
            host,
            user,
            port,
            program,
            retry_interval_ms,
        } => Box::new(SshTransport::new(
            host.clone(),
            user.clone(),
            *port,
            program.clone(),
            Duration::from_millis(*retry_interval_ms),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs() -> Vec<JobEntry> {
        vec![
            JobEntry {
                method_file: PathBuf::from("C:/methods/transfer.cam"),
                params: "LS3;100;tray;1;1;1;tray;1;1;2;False;False;False;False;log.txt".into(),
            },
            JobEntry {
                method_file: PathBuf::from("C:/methods/archive.cam"),
                params: "LS3;50;cell1;;;;tray;1;1;3;True;False;False;False;log.txt".into(),
            },
        ]
    }

    #[test]
    fn test_vendor_arguments_order() {
        let args = vendor_arguments(&jobs());
        assert_eq!(args.len(), 8);
        assert_eq!(args[0], "/loadmethod");
        assert_eq!(args[1], "C:/methods/transfer.cam");
        assert_eq!(args[3], "/loadmethod");
        assert_eq!(&args[6..], &["/start".to_string(), "/quit".to_string()]);
    }

    #[test]
    fn test_remote_command_quotes_paths_and_params() {
        let ssh = SshTransport::new(
            "pal-pc".into(),
            Some("lab".into()),
            22,
            "C:/Program Files/PAL.exe".into(),
            Duration::from_secs(1),
        );
        let remote = ssh.remote_command(&jobs()[..1]);
        assert!(remote.starts_with("'C:/Program Files/PAL.exe' /loadmethod C:/methods/transfer.cam 'LS3;100;"));
        assert!(remote.ends_with("/start /quit"));
        assert_eq!(ssh.target(), "lab@pal-pc");
    }

    #[test]
    fn test_remote_command_expands_nothing() {
        let ssh = SshTransport::new(
            "pal-pc".into(),
            None,
            22,
            "PAL.exe".into(),
            Duration::from_secs(1),
        );
        let jobs = vec![JobEntry {
            method_file: PathBuf::from("C:/methods/it's.cam"),
            params: "LS3;100;$HOME;`id`;\"x\";log.txt".into(),
        }];
        let remote = ssh.remote_command(&jobs);
        assert_eq!(
            remote,
            "PAL.exe /loadmethod 'C:/methods/it'\\''s.cam' 'LS3;100;$HOME;`id`;\"x\";log.txt' /start /quit"
        );
        assert_eq!(quote(""), "''");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_nonzero_exit_is_command_error() {
        let mut transport = LocalProcessTransport::new(PathBuf::from("false"));
        transport.connect(&EstopFlag::new()).await.unwrap();
        transport.submit(&jobs()).await.unwrap();
        let err = transport.drain().await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CmdError);
        // nothing left to wait for
        transport.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_missing_program_is_command_error() {
        let mut transport = LocalProcessTransport::new(PathBuf::from("/nonexistent/PAL.exe"));
        let err = transport.submit(&jobs()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CmdError);
    }

    #[tokio::test]
    async fn test_ssh_connect_retries_until_estop() {
        let config = TransportConfig::Ssh {
            host: "pal-pc.invalid".into(),
            user: None,
            port: 22,
            program: "PAL.exe".into(),
            retry_interval_ms: 20,
        };
        let mut transport = transport_from_config(&config);
        let estop = EstopFlag::new();
        let trip = estop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trip.set(true);
        });
        let err = tokio::time::timeout(Duration::from_secs(30), transport.connect(&estop))
            .await
            .expect("connect did not observe the emergency stop")
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Estop);
    }

    #[tokio::test]
    async fn test_simulated_transport_records_submissions() {
        let transport = SimulatedTransport::new();
        let mut boxed = transport_from_config(&TransportConfig::Simulated);
        assert!(boxed.connect(&EstopFlag::new()).await.is_ok());
        let mut boxed: Box<dyn CommandTransport> = Box::new(transport.clone());
        boxed.connect(&EstopFlag::new()).await.unwrap();
        boxed.submit(&jobs()).await.unwrap();
        boxed.drain().await.unwrap();
        assert_eq!(transport.submissions().len(), 1);
        assert_eq!(transport.submissions()[0].jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_simulated_connect_refuses_during_estop() {
        let estop = EstopFlag::new();
        estop.set(true);
        let err = SimulatedTransport::new().connect(&estop).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Estop);
    }
}
