use crate::error::{PanelError, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use std::{io, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
};
use tracing::{debug, error, info, warn};

pub mod device;
pub mod sensors;
pub mod services;

/// Lines produced by a running process. Dropping the stream kills the process.
pub type LineStream = BoxStream<'static, io::Result<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

/// Capability for launching external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the program and captures stdout, whatever the exit status.
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Runs the program to completion; a non-zero exit is an error.
    async fn run(&self, program: &str, args: &[&str]) -> Result<()>;

    /// Spawns the program and streams its stdout line by line.
    fn stream_lines(&self, program: &str, args: &[&str]) -> Result<LineStream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        debug!("Running command: {:?}", cmd);

        let output = cmd.output().await.map_err(|e| {
            error!("Failed to start {} {:?}: {}", program, args, e);
            PanelError::ExternalCommand(format!("failed to start {}: {}", program, e))
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        debug!("Running command: {:?}", cmd);

        let status = cmd.status().await.map_err(|e| {
            error!("Failed to start {} {:?}: {}", program, args, e);
            PanelError::ExternalCommand(format!("failed to start {}: {}", program, e))
        })?;

        if !status.success() {
            error!("{} {:?} exited with {}", program, args, status);
            return Err(PanelError::ExternalCommand(format!(
                "{} {} exited with {}",
                program,
                args.join(" "),
                status
            )));
        }
        Ok(())
    }

    fn stream_lines(&self, program: &str, args: &[&str]) -> Result<LineStream> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Spawning streaming command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {} {:?}: {}", program, args, e);
            PanelError::ExternalCommand(format!("failed to spawn {}: {}", program, e))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PanelError::ExternalCommand(format!("no stdout handle for {}", program))
        })?;

        if let Some(stderr) = child.stderr.take() {
            let program = program.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("{}: {}", program, line);
                }
            });
        }

        info!("Started {} (pid {:?})", program, child.id());

        // The child rides along in the stream state so it is killed when the
        // consumer goes away.
        let tail = Tail {
            program: program.to_string(),
            child,
            reader: BufReader::new(stdout),
        };
        Ok(Box::pin(stream::unfold(tail, |mut tail| async move {
            let item = tail.next_line().await?;
            Some((item, tail))
        })))
    }
}

struct Tail {
    program: String,
    child: Child,
    reader: BufReader<ChildStdout>,
}

impl Tail {
    /// Next stdout line, decoded lossily so stray bytes never end the stream.
    /// `None` once the process closes stdout.
    async fn next_line(&mut self) -> Option<io::Result<String>> {
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                self.log_exit().await;
                None
            }
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                    if buf.ends_with(b"\r") {
                        buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&buf).into_owned()))
            }
            Err(e) => {
                error!("Reading output of {} failed: {}", self.program, e);
                Some(Err(e))
            }
        }
    }

    async fn log_exit(&mut self) {
        match self.child.wait().await {
            Ok(status) if status.success() => info!("{} finished", self.program),
            Ok(status) => warn!("{} exited with {}", self.program, status),
            Err(e) => error!("Failed to reap {}: {}", self.program, e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn output_captures_stdout() {
        let out = SystemRunner.output("echo", &["enabled"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "enabled");
    }

    #[tokio::test]
    async fn run_reports_non_zero_exit() {
        assert_ok!(SystemRunner.run("true", &[]).await);
        assert!(matches!(
            SystemRunner.run("false", &[]).await,
            Err(PanelError::ExternalCommand(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_is_external_command_error() {
        assert!(matches!(
            SystemRunner.run("gs-panel-no-such-binary", &[]).await,
            Err(PanelError::ExternalCommand(_))
        ));
    }

    #[tokio::test]
    async fn stream_lines_yields_stdout_in_order() {
        let lines: Vec<String> = SystemRunner
            .stream_lines("printf", &["L1\\nL2\\n"])
            .unwrap()
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["L1".to_string(), "L2".to_string()]);
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let mut lines = SystemRunner
            .stream_lines("sh", &["-c", "printf 'L1\\nbad \\377\\nL3\\n'; exec sleep 30"])
            .unwrap();

        assert_eq!(lines.next().await.unwrap().unwrap(), "L1");
        assert_eq!(lines.next().await.unwrap().unwrap(), "bad \u{FFFD}");
        assert_eq!(lines.next().await.unwrap().unwrap(), "L3");
    }

    #[tokio::test]
    async fn failed_process_ends_the_stream() {
        let mut lines = SystemRunner
            .stream_lines("sh", &["-c", "echo denied >&2; exit 1"])
            .unwrap();
        assert!(lines.next().await.is_none());
    }

    fn is_running(pid: u32) -> bool {
        // A killed child that has not been reaped yet shows up as a zombie.
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_kills_the_process() {
        let mut lines = SystemRunner
            .stream_lines("sh", &["-c", "echo $$; exec sleep 30"])
            .unwrap();
        let pid: u32 = lines.next().await.unwrap().unwrap().trim().parse().unwrap();
        assert!(is_running(pid));

        drop(lines);

        let mut stopped = false;
        for _ in 0..100 {
            if !is_running(pid) {
                stopped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(stopped, "pid {} still running after the stream was dropped", pid);
    }
}
