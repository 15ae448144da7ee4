use anyhow::{bail, Result};
use common::TaskAssignment;
use tokio::process::Command;
use tracing::debug;

/// Resultado de correr el comando de una tarea.
#[derive(Debug)]
pub struct RunResult {
    pub success: bool,
    /// Diagnóstico para el reporte de error (código de salida y última línea
    /// de stderr).
    pub message: Option<String>,
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Corre el comando de la tarea con el shell de la plataforma.
///
/// El span de frames se expone también como variables de entorno
/// (`RFARM_FRAME_START`, `RFARM_FRAME_END`, `RFARM_FRAME_STEP`) para los
/// servicios que no usan el placeholder en la línea de comandos.
pub async fn run_task(task: &TaskAssignment) -> Result<RunResult> {
    if task.command.trim().is_empty() {
        bail!("tarea {} sin comando", task.task);
    }

    let mut cmd = shell(&task.command);
    cmd.env("RFARM_JOB", &task.job_name)
        .env("RFARM_BLOCK", &task.block_name)
        .env("RFARM_TASK", &task.name)
        .env("RFARM_SERVICE", &task.service);
    if let Some(frames) = task.frames {
        cmd.env("RFARM_FRAME_START", frames.start.to_string())
            .env("RFARM_FRAME_END", frames.end.to_string())
            .env("RFARM_FRAME_STEP", task.step.to_string());
    }

    debug!(task = %task.task, command = %task.command, "ejecutando");
    let output = cmd.output().await?;

    if output.status.success() {
        return Ok(RunResult {
            success: true,
            message: None,
        });
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty());
    let message = match (output.status.code(), last_line) {
        (Some(code), Some(line)) => format!("exit {}: {}", code, line.trim()),
        (Some(code), None) => format!("exit {}", code),
        (None, Some(line)) => format!("killed: {}", line.trim()),
        (None, None) => "killed by signal".to_string(),
    };

    Ok(RunResult {
        success: false,
        message: Some(message),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use common::{FrameSpan, TaskRef};

    fn assignment(command: &str) -> TaskAssignment {
        TaskAssignment {
            task: TaskRef {
                job_id: "j".into(),
                block: 0,
                task: 0,
            },
            job_name: "job".into(),
            block_name: "beauty".into(),
            service: "generic".into(),
            name: "0000".into(),
            command: command.into(),
            frames: Some(FrameSpan::new(10, 12)),
            step: 1,
            errors: 0,
        }
    }

    #[tokio::test]
    async fn successful_command() {
        let res = run_task(&assignment("true")).await.unwrap();
        assert!(res.success);
        assert!(res.message.is_none());
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code_and_stderr() {
        let res = run_task(&assignment("echo se rompio >&2; exit 3"))
            .await
            .unwrap();
        assert!(!res.success);
        assert_eq!(res.message.as_deref(), Some("exit 3: se rompio"));
    }

    #[tokio::test]
    async fn frame_span_is_exported() {
        let res = run_task(&assignment(
            r#"test "$RFARM_FRAME_START-$RFARM_FRAME_END" = "10-12""#,
        ))
        .await
        .unwrap();
        assert!(res.success);
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        assert!(run_task(&assignment("  ")).await.is_err());
    }
}
