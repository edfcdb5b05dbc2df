//! Interface de terminal do relay: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner e `console` para estilização com
//! cores. O [`WatchProgress`] acompanha visualmente uma predição a partir das
//! notificações recebidas pelo canal push.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;

use crate::events::{
    METHOD_ERROR, METHOD_PROGRESS, METHOD_SESSION_CLOSED, METHOD_STATUS, Notification,
};
use crate::state_machine::JobStatus;

/// O que uma notificação push significa para quem acompanha a predição.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchUpdate {
    Status { from: JobStatus, to: JobStatus },
    Progress { status: JobStatus, progress: u8 },
    Error(String),
    Closed,
}

impl WatchUpdate {
    /// Interpreta um frame JSON-RPC; frames desconhecidos retornam `None`.
    pub fn parse(frame: &str) -> Option<Self> {
        let notification: Notification = serde_json::from_str(frame).ok()?;
        let params = &notification.params;
        match notification.method.as_str() {
            METHOD_STATUS => Some(WatchUpdate::Status {
                from: status_param(params, "from")?,
                to: status_param(params, "to")?,
            }),
            METHOD_PROGRESS => Some(WatchUpdate::Progress {
                status: status_param(params, "status")?,
                progress: params.get("progress")?.as_u64()?.min(100) as u8,
            }),
            METHOD_ERROR => Some(WatchUpdate::Error(
                params.get("error")?.as_str()?.to_string(),
            )),
            METHOD_SESSION_CLOSED => Some(WatchUpdate::Closed),
            _ => None,
        }
    }
}

fn status_param(params: &Value, key: &str) -> Option<JobStatus> {
    serde_json::from_value(params.get(key)?.clone()).ok()
}

/// Indicador visual de progresso para uma predição acompanhada no terminal.
///
/// Exibe um spinner animado enquanto a predição roda e mensagens coloridas
/// para sucesso (verde), falha (vermelho) e cancelamento (amarelo).
pub struct WatchProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl WatchProgress {
    /// Inicia o spinner para a predição informada.
    pub fn start(prediction_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("{prediction_id}: aguardando status"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Aplica uma atualização. Retorna `true` quando não há mais nada a esperar.
    pub fn apply(&self, update: &WatchUpdate) -> bool {
        match update {
            WatchUpdate::Status { from, to } => {
                self.pb.println(format!("  {from} → {to}"));
                self.pb.set_message(format!("{to}"));
                if to.is_terminal() {
                    self.complete(*to);
                    return true;
                }
                false
            }
            WatchUpdate::Progress { status, progress } => {
                self.pb.set_message(format!("{status} ({progress}%)"));
                false
            }
            WatchUpdate::Error(message) => {
                self.pb
                    .println(format!("  {} {message}", self.red.apply_to("!")));
                false
            }
            WatchUpdate::Closed => {
                self.pb.finish_and_clear();
                println!("  {} conexão encerrada", self.yellow.apply_to("↻"));
                true
            }
        }
    }

    /// Finaliza o spinner e exibe o status final.
    pub fn complete(&self, status: JobStatus) {
        self.pb.finish_and_clear();
        match status {
            JobStatus::Succeeded => {
                println!("  {} Prediction succeeded", self.green.apply_to("✓"));
            }
            JobStatus::Failed => {
                println!("  {} Prediction failed", self.red.apply_to("✗"));
            }
            other => {
                println!("  {} Prediction {other}", self.yellow.apply_to("•"));
            }
        }
    }

    /// Mensagem avulsa acima do spinner.
    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {}", self.yellow.apply_to(message)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_frame() {
        let frame = r#"{"jsonrpc":"2.0","method":"prediction/status","params":{"uri":"prediction://p","from":"starting","to":"processing"}}"#;
        assert_eq!(
            WatchUpdate::parse(frame),
            Some(WatchUpdate::Status {
                from: JobStatus::Starting,
                to: JobStatus::Processing
            })
        );
    }

    #[test]
    fn parses_progress_and_error_frames() {
        let progress = r#"{"jsonrpc":"2.0","method":"prediction/progress","params":{"status":"processing","progress":42}}"#;
        assert_eq!(
            WatchUpdate::parse(progress),
            Some(WatchUpdate::Progress {
                status: JobStatus::Processing,
                progress: 42
            })
        );

        let error = r#"{"jsonrpc":"2.0","method":"prediction/error","params":{"error":"CUDA OOM"}}"#;
        assert_eq!(
            WatchUpdate::parse(error),
            Some(WatchUpdate::Error("CUDA OOM".into()))
        );
    }

    #[test]
    fn ignores_heartbeats_and_garbage() {
        assert_eq!(WatchUpdate::parse(r#"{"jsonrpc":"2.0","method":"heartbeat"}"#), None);
        assert_eq!(WatchUpdate::parse("not json"), None);
        assert_eq!(
            WatchUpdate::parse(r#"{"jsonrpc":"2.0","method":"prediction/status","params":{"to":"bogus"}}"#),
            None
        );
    }

    #[test]
    fn terminal_status_finishes_the_watch() {
        let progress = WatchProgress::start("p");
        assert!(!progress.apply(&WatchUpdate::Progress {
            status: JobStatus::Processing,
            progress: 10
        }));
        assert!(progress.apply(&WatchUpdate::Status {
            from: JobStatus::Processing,
            to: JobStatus::Succeeded
        }));
    }
}
