//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 实时日志流式输出，同时按顺序收集完整输出
//! - 通过 stdin 传入敏感数据（凭据不出现在参数或日志里）
//! - 超时控制与取消支持

use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::deploy::LogLine;
use crate::state::log_hub::LogSink;

/// 进程结束后等待输出读取完成的上限
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(std::io::Error),
    /// 命令超时
    #[error("Command timed out")]
    Timeout,
    /// 命令被取消
    #[error("Command was cancelled")]
    Cancelled,
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(std::io::Error),
}

/// 待执行的命令
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// 写入 stdin 的内容，不会被记录
    stdin: Option<SecretString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            timeout,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, input: SecretString) -> Self {
        self.stdin = Some(input);
        self
    }

    /// 用于日志展示的命令行（stdin 内容不展示）
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        let mut line = parts.join(" ");
        if self.stdin.is_some() {
            line.push_str(" < (stdin)");
        }
        line
    }
}

/// 命令执行结果
#[derive(Clone, Debug, Default)]
pub struct CommandResult {
    /// 退出码（被信号终止时为 None）
    pub exit_code: Option<i32>,
    pub success: bool,
    /// 是否因超时而终止
    pub timed_out: bool,
    /// 按到达顺序排列的 stdout/stderr 行
    pub lines: Vec<LogLine>,
}

impl CommandResult {
    /// 成功结果
    pub fn ok(lines: Vec<LogLine>) -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            timed_out: false,
            lines,
        }
    }

    /// 非零退出
    pub fn failed(exit_code: i32, lines: Vec<LogLine>) -> Self {
        Self {
            exit_code: Some(exit_code),
            success: false,
            timed_out: false,
            lines,
        }
    }

    /// stdout 拼接文本（用于解析 JSON 输出）
    pub fn stdout_text(&self) -> String {
        self.lines
            .iter()
            .filter(|l| l.stream == "stdout")
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// stdout + stderr 拼接文本（用于错误分类）
    pub fn combined_text(&self) -> String {
        crate::domain::deploy::join_lines(&self.lines)
    }
}

impl CommandRunner {
    /// 执行命令并流式输出日志
    ///
    /// 输出行会写入 `log_tx`（如果有），同时收集到返回值中。
    /// 超时返回 `Ok` 且 `timed_out = true`，携带已收集的部分输出；
    /// 取消返回 `CommandError::Cancelled`。
    pub async fn run(
        spec: &CommandSpec,
        log_tx: Option<&LogSink>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(ref dir) = spec.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(CommandError::SpawnFailed)?;

        // 写入 stdin 后关闭管道
        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.expose_secret().as_bytes()).await {
                warn!(program = %spec.program, error = %e, "Failed to write command stdin");
            }
            drop(stdin);
        }

        let stdout_task = spawn_reader(child.stdout.take(), "stdout", log_tx.cloned());
        let stderr_task = spawn_reader(child.stderr.take(), "stderr", log_tx.cloned());

        // 等待命令完成，支持超时和取消
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %spec.program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(spec.timeout) => {
                error!(program = %spec.program, "Command timed out after {:?}", spec.timeout);
                let _ = child.kill().await;
                // 等待进程实际终止
                let status = child.wait().await.map_err(CommandError::WaitFailed)?;
                Ok((status, true))
            }
            status = child.wait() => {
                let status = status.map_err(CommandError::WaitFailed)?;
                Ok((status, false))
            }
        };

        // 等待日志读取完成
        let mut lines = drain_reader(stdout_task).await;
        lines.extend(drain_reader(stderr_task).await);
        lines.sort_by_key(|l| l.timestamp);

        let (status, timed_out) = outcome?;
        Ok(CommandResult {
            exit_code: status.code(),
            success: status.success() && !timed_out,
            timed_out,
            lines,
        })
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于启动时的工具链探测等不需要实时日志的场景
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program).args(args).kill_on_drop(true).output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout)
            }
        }
    }
}

/// 启动输出读取任务：逐行转发并收集
fn spawn_reader<R>(
    reader: Option<R>,
    stream: &'static str,
    log_tx: Option<LogSink>,
) -> JoinHandle<Vec<LogLine>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        if let Some(reader) = reader {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let log_line = LogLine::new(stream, line);
                if let Some(ref tx) = log_tx {
                    tx.send(log_line.clone());
                }
                collected.push(log_line);
            }
        }
        collected
    })
}

async fn drain_reader(task: JoinHandle<Vec<LogLine>>) -> Vec<LogLine> {
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            Vec::new()
        }
        Err(_) => {
            warn!("Output reader did not finish in time");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec::new(program, Duration::from_secs(5)).args(args.iter().copied())
    }

    #[tokio::test]
    async fn test_run_collects_output() {
        let result = CommandRunner::run(
            &spec("sh", &["-c", "echo hello; echo oops 1>&2"]),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout_text(), "hello");
        assert!(result
            .lines
            .iter()
            .any(|l| l.stream == "stderr" && l.content == "oops"));
    }

    #[tokio::test]
    async fn test_run_streams_to_channel() {
        let tx = LogSink::new();
        let mut rx = tx.subscribe();
        let result = CommandRunner::run(&spec("echo", &["streamed"]), Some(&tx), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "streamed");
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let command = spec("cat", &[]).stdin(SecretString::from("from-stdin".to_string()));
        assert!(command.display().ends_with("< (stdin)"));
        assert!(!command.display().contains("from-stdin"));

        let result = CommandRunner::run(&command, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout_text(), "from-stdin");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let result = CommandRunner::run(&spec("sh", &["-c", "exit 3"]), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_output() {
        let command = CommandSpec::new("sh", Duration::from_millis(300))
            .args(["-c", "echo started; exec sleep 10"]);
        let result = CommandRunner::run(&command, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.stdout_text(), "started");
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = CommandRunner::run(&spec("sleep", &["10"]), None, &cancel).await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }
}
