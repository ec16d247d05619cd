//! Running external tools with a time limit.
//!
//! Both the formatting toolchain and the parser under test are untrusted
//! from the harness' point of view: they may hang or crash.  Every invocation
//! runs on a private single-threaded tokio runtime, bounded by a timeout.  A
//! child that outlives its timeout is killed and the invocation fails; it is
//! never retried.

use std::{
    ffi::{OsStr, OsString},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use log::debug;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{error::ToolError, IO_CHUNK};

/// A command line for an external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

/// What a finished process produced.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout as text, invalid UTF-8 replaced.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// What the tool had to say about a failure: stderr, or stdout if stderr
    /// was empty.
    pub fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        if stderr.trim().is_empty() {
            self.stdout_text()
        } else {
            stderr.into_owned()
        }
    }
}

fn runtime(tool: &str) -> Result<tokio::runtime::Runtime, ToolError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| ToolError::Spawn {
            tool: tool.to_string(),
            source,
        })
}

async fn drain(mut reader: impl AsyncRead + Unpin) -> std::io::Result<Vec<u8>> {
    let mut buffer = vec![];
    reader.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

async fn hash_stream(mut reader: impl AsyncRead + Unpin) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        ToolCommand {
            program: program.into(),
            args: vec![],
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program's file name, for messages.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// The full command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn spawn(&self) -> Result<tokio::process::Child, ToolError> {
        debug!("running {}", self.command_line());
        tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => ToolError::NotFound { tool: self.name() },
                _ => ToolError::Spawn {
                    tool: self.name(),
                    source,
                },
            })
    }

    fn timed_out(&self) -> ToolError {
        ToolError::TimedOut {
            tool: self.name(),
            secs: self.timeout.as_secs(),
        }
    }

    fn exit_code(&self, status: ExitStatus) -> Result<i32, ToolError> {
        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(code),
            (None, Some(signal)) => Err(ToolError::Crashed {
                tool: self.name(),
                signal,
            }),
            (None, None) => Err(ToolError::Crashed {
                tool: self.name(),
                signal: 0,
            }),
        }
    }

    /// Runs the command to completion, whatever its exit status.
    ///
    /// Fails only if the command cannot be started, is killed by a signal, or
    /// exceeds its timeout.
    pub fn run(&self) -> Result<ToolOutput, ToolError> {
        let rt = runtime(&self.name())?;
        let output = rt.block_on(async {
            let child = self.spawn()?;
            match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(|source| ToolError::Spawn {
                    tool: self.name(),
                    source,
                }),
                // dropping the child kills it
                Err(_) => Err(self.timed_out()),
            }
        })?;

        let status = self.exit_code(output.status)?;
        debug!("{} exited with {status}", self.name());
        Ok(ToolOutput {
            status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Runs the command and requires a zero exit status.
    pub fn output(&self) -> Result<ToolOutput, ToolError> {
        let output = self.run()?;
        if !output.success() {
            return Err(ToolError::Failed {
                tool: self.name(),
                status: output.status,
                diagnostic: output.diagnostic(),
            });
        }
        Ok(output)
    }

    /// Runs the command and hashes its stdout as it streams by, without
    /// buffering it.  Returns the hex SHA-256 and the number of bytes.
    pub fn hash_stdout(&self) -> Result<(String, u64), ToolError> {
        let rt = runtime(&self.name())?;
        rt.block_on(async {
            let mut child = self.spawn()?;
            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                return Err(ToolError::Spawn {
                    tool: self.name(),
                    source: std::io::Error::other("missing stdio pipes"),
                });
            };

            let work = async {
                let (hashed, diagnostic) = tokio::join!(hash_stream(stdout), drain(stderr));
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((hashed?, diagnostic?, status))
            };
            let (hashed, diagnostic, status) = match tokio::time::timeout(self.timeout, work).await
            {
                Ok(result) => result.map_err(|source| ToolError::Spawn {
                    tool: self.name(),
                    source,
                })?,
                Err(_) => return Err(self.timed_out()),
            };

            let status = self.exit_code(status)?;
            if status != 0 {
                return Err(ToolError::Failed {
                    tool: self.name(),
                    status,
                    diagnostic: String::from_utf8_lossy(&diagnostic).into_owned(),
                });
            }
            Ok(hashed)
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("/bin/sh", Duration::from_secs(10)).args(["-c", script])
    }

    #[test]
    fn test_run_captures_output() {
        let output = sh("echo out; echo err >&2; exit 3").run().unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.diagnostic(), "err\n");
    }

    #[test]
    fn test_output_requires_success() {
        match sh("echo 'bad feature' >&2; exit 1").output() {
            Err(ToolError::Failed {
                status, diagnostic, ..
            }) => {
                assert_eq!(status, 1);
                assert_eq!(diagnostic, "bad feature\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        // stdout stands in when stderr is empty
        match sh("echo only-stdout; exit 2").output() {
            Err(ToolError::Failed { diagnostic, .. }) => assert_eq!(diagnostic, "only-stdout\n"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills() {
        let started = std::time::Instant::now();
        let result = sh("sleep 30")
            .with_timeout(Duration::from_millis(200))
            .run();
        assert!(matches!(result, Err(ToolError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_crash_detected() {
        let result = sh("kill -SEGV $$").run();
        assert!(matches!(
            result,
            Err(ToolError::Crashed { signal: 11, .. })
        ));
    }

    #[test]
    fn test_missing_program() {
        let result = ToolCommand::new("/nonexistent/parser", Duration::from_secs(1)).run();
        assert!(matches!(result, Err(ToolError::NotFound { .. })));
    }

    #[test]
    fn test_hash_stdout() {
        let (digest, len) = sh("printf abc").hash_stdout().unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(len, 3);

        assert!(matches!(
            sh("echo nope >&2; exit 1").hash_stdout(),
            Err(ToolError::Failed { .. })
        ));
    }

    #[test]
    fn test_command_line() {
        let cmd = ToolCommand::new("/usr/bin/fls", Duration::from_secs(1)).args(["-r", "img"]);
        assert_eq!(cmd.name(), "fls");
        assert_eq!(cmd.command_line(), "/usr/bin/fls -r img");
    }
}
