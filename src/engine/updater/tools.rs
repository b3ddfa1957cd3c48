//! External tool runner
//!
//! Spawns helper programs (decryptor, converter, programmer) with piped I/O and a
//! wall-clock bound, killing them when they overrun.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a successful run
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Resolve a program name against `PATH`, accepting explicit paths as-is
pub fn locate(program: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return if candidate.exists() {
            Ok(candidate.to_path_buf())
        } else {
            Err(ToolError::NotFound(program.to_string()))
        };
    }
    which::which(program).map_err(|_| ToolError::NotFound(program.to_string()))
}

/// One invocation of an external program
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self {
            program,
            args: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Run to completion, failing on non-zero exit or timeout
    pub fn run(self) -> Result<ToolOutput, ToolError> {
        let name = self.name();
        tracing::debug!(program = %self.program.display(), args = ?self.args, "Running tool");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: name.clone(),
                source,
            })?;

        // Pipes are drained on their own threads so a chatty child never blocks
        let stdin_writer = match (child.stdin.take(), self.stdin) {
            (Some(mut pipe), Some(data)) => Some(thread::spawn(move || {
                let result = pipe.write_all(&data);
                drop(pipe);
                result
            })),
            _ => None,
        };
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ToolError::Timeout {
                            program: name,
                            timeout: self.timeout,
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(ToolError::Io { program: name, source });
                }
            }
        };

        if let Some(writer) = stdin_writer {
            // A child that exits before consuming stdin closes the pipe early;
            // its exit status is what matters.
            if let Ok(Err(e)) = writer.join() {
                tracing::debug!(program = %name, error = %e, "Stdin pipe closed early");
            }
        }
        let stdout = join_output(stdout_reader, &name)?;
        let stderr = join_output(stderr_reader, &name)?;

        if !status.success() {
            return Err(ToolError::Failed {
                program: name,
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

fn join_output(
    handle: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>,
    program: &str,
) -> Result<Vec<u8>, ToolError> {
    let Some(handle) = handle else {
        return Ok(Vec::new());
    };
    match handle.join() {
        Ok(Ok(buf)) => Ok(buf),
        Ok(Err(source)) => Err(ToolError::Io {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(ToolError::Io {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "pipe reader panicked"),
        }),
    }
}
