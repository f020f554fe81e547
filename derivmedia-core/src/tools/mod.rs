use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ToolsSection;

pub mod probe;

pub use probe::{sniff_media_type, MediaProbe};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found at {path}")]
    Missing { tool: ToolKind, path: PathBuf },
    #[error("{tool} at {path} is not executable")]
    NotExecutable { tool: ToolKind, path: PathBuf },
    #[error("failed to launch {program}: {source}")]
    Launch { source: io::Error, program: PathBuf },
    #[error("{program} did not finish within {seconds}s")]
    Timeout { program: PathBuf, seconds: u64 },
    #[error("failed to read {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("invalid probe output: {0}")]
    Parse(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Ffmpeg,
    Ffprobe,
    Ghostscript,
    Convert,
    Pdftohtml,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::Ffprobe => "ffprobe",
            ToolKind::Ghostscript => "ghostscript",
            ToolKind::Convert => "convert",
            ToolKind::Pdftohtml => "pdftohtml",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output> {
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Program and arguments, for logs only.
    pub command: String,
    /// Stdout followed by stderr.
    pub output: String,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Clone)]
pub struct ToolInvoker {
    tools: ToolsSection,
    executor: Arc<dyn CommandExecutor>,
}

impl ToolInvoker {
    pub fn new(tools: ToolsSection) -> Self {
        Self {
            tools,
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn program(&self, kind: ToolKind) -> &Path {
        match kind {
            ToolKind::Ffmpeg => &self.tools.ffmpeg,
            ToolKind::Ffprobe => &self.tools.ffprobe,
            ToolKind::Ghostscript => &self.tools.ghostscript,
            ToolKind::Convert => &self.tools.convert,
            ToolKind::Pdftohtml => &self.tools.pdftohtml,
        }
    }

    /// Existence and executable-bit check, run once per job.
    pub fn check_available(&self, kind: ToolKind) -> ToolResult<PathBuf> {
        let program = self.program(kind);
        let path = locate(program).ok_or_else(|| ToolError::Missing {
            tool: kind,
            path: program.to_path_buf(),
        })?;
        if is_executable(&path) {
            Ok(path)
        } else {
            Err(ToolError::NotExecutable { tool: kind, path })
        }
    }

    pub async fn invoke(&self, kind: ToolKind, args: &[String]) -> ToolResult<ToolOutput> {
        let limit = match kind {
            ToolKind::Ffprobe => self.tools.probe_timeout_seconds,
            _ => self.tools.timeout_seconds,
        };
        self.invoke_with_timeout(kind, args, Duration::from_secs(limit))
            .await
    }

    pub async fn invoke_with_timeout(
        &self,
        kind: ToolKind,
        args: &[String],
        limit: Duration,
    ) -> ToolResult<ToolOutput> {
        let program = self.program(kind);
        let command = display_command(program, args);
        debug!(tool = %kind, command = %command, "invoking external tool");
        let output = match timeout(limit, self.executor.run(program, args)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolError::Launch {
                    source,
                    program: program.to_path_buf(),
                })
            }
            Err(_) => {
                return Err(ToolError::Timeout {
                    program: program.to_path_buf(),
                    seconds: limit.as_secs(),
                })
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ToolOutput {
            command,
            output: text.trim().to_string(),
            exit_code: output.status.code(),
        })
    }
}

impl fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("tools", &self.tools)
            .finish()
    }
}

pub fn display_command(program: &Path, args: &[String]) -> String {
    let mut parts = vec![program.display().to_string()];
    parts.extend(args.iter().map(|arg| {
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            format!("'{arg}'")
        } else {
            arg.clone()
        }
    }));
    parts.join(" ")
}

/// Splits a validated converter template into arguments. Single quotes
/// group a token and are removed.
pub fn tokenize(template: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in template.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    tokens
}

fn locate(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;

    pub type RecordedCalls = Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>;

    /// Records calls and answers with a fixed exit code and stdout.
    pub struct RecordingExecutor {
        calls: RecordedCalls,
        exit_code: i32,
        stdout: Vec<u8>,
    }

    impl RecordingExecutor {
        pub fn build(exit_code: i32, stdout: &[u8]) -> (Arc<dyn CommandExecutor>, RecordedCalls) {
            let calls: RecordedCalls = Arc::new(Mutex::new(Vec::new()));
            let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
                calls: Arc::clone(&calls),
                exit_code,
                stdout: stdout.to_vec(),
            });
            (executor, calls)
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(Output {
                status: std::process::ExitStatus::from_raw(self.exit_code << 8),
                stdout: self.stdout.clone(),
                stderr: Vec::new(),
            })
        }
    }

    pub fn tools_section(dir: &Path) -> ToolsSection {
        ToolsSection {
            ffmpeg: dir.join("ffmpeg"),
            ffprobe: dir.join("ffprobe"),
            ghostscript: dir.join("gs"),
            convert: dir.join("convert"),
            pdftohtml: dir.join("pdftohtml"),
            timeout_seconds: 5,
            probe_timeout_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{tools_section, RecordingExecutor};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tokenize_keeps_quoted_groups() {
        assert_eq!(
            tokenize("-c copy -filter:v crop='floor(in_w/2)*2:floor(in_h/2)*2' -crf 22"),
            vec![
                "-c",
                "copy",
                "-filter:v",
                "crop=floor(in_w/2)*2:floor(in_h/2)*2",
                "-crf",
                "22"
            ]
        );
        assert_eq!(tokenize("  a   'b c'  "), vec!["a", "b c"]);
        assert!(tokenize("   ").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn availability_checks_exec_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let invoker = ToolInvoker::new(tools_section(dir.path()));
        assert!(matches!(
            invoker.check_available(ToolKind::Ffmpeg),
            Err(ToolError::Missing { .. })
        ));

        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(&ffmpeg, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            invoker.check_available(ToolKind::Ffmpeg),
            Err(ToolError::NotExecutable { .. })
        ));

        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(invoker.check_available(ToolKind::Ffmpeg).unwrap(), ffmpeg);
    }

    #[tokio::test]
    async fn invoke_captures_exit_code_and_arguments() {
        let dir = TempDir::new().unwrap();
        let (executor, calls) = RecordingExecutor::build(1, b"boom");
        let invoker = ToolInvoker::new(tools_section(dir.path())).with_executor(executor);
        let args = vec!["-i".to_string(), "in put.wav".to_string()];
        let output = invoker.invoke(ToolKind::Ffmpeg, &args).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(1));
        assert_eq!(output.output, "boom");
        assert!(output.command.ends_with("-i 'in put.wav'"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, dir.path().join("ffmpeg"));
        assert_eq!(calls[0].1, args);
    }
}
