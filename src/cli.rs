//! Interface de linha de comando do relay baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (watch, cancel, sign,
//! verify, check-webhook) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const SECRET_ENV: &str = "RELAY_WEBHOOK_SECRET";

/// Relay de status de predições: polling, notificações push e webhooks assinados.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: `relay.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Acompanha uma predição até o fim, exibindo status e progresso.
    Watch {
        /// Identificador da predição.
        prediction_id: String,

        /// URL que recebe os eventos de status via webhook.
        #[arg(long)]
        webhook_url: Option<String>,

        /// Segredo usado para assinar os webhooks (mínimo de 32 caracteres).
        #[arg(long, env = SECRET_ENV, hide_env_values = true)]
        webhook_secret: Option<String>,

        /// Servidor push (SSE) que recebe as notificações; sem ele o
        /// acompanhamento fica só no terminal.
        #[arg(long)]
        push_url: Option<String>,
    },

    /// Cancela uma predição em andamento.
    Cancel {
        prediction_id: String,
    },

    /// Imprime a assinatura HMAC-SHA256 do conteúdo de um arquivo.
    Sign {
        file: PathBuf,

        #[arg(long, env = SECRET_ENV, hide_env_values = true)]
        secret: String,
    },

    /// Confere a assinatura de um arquivo recebido via webhook.
    Verify {
        file: PathBuf,

        /// Assinatura recebida, com ou sem o prefixo `sha256=`.
        #[arg(long)]
        signature: String,

        #[arg(long, env = SECRET_ENV, hide_env_values = true)]
        secret: String,
    },

    /// Valida uma configuração de webhook sem enviar nada.
    CheckWebhook {
        url: String,

        #[arg(long)]
        secret: Option<String>,

        #[arg(long, allow_negative_numbers = true)]
        max_retries: Option<i64>,

        #[arg(long)]
        timeout_ms: Option<i64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_watch_subcommand() {
        let cli = Cli::parse_from([
            "relay",
            "watch",
            "pred_1",
            "--webhook-url",
            "https://example.com/hook",
        ]);
        match cli.command {
            Command::Watch {
                prediction_id,
                webhook_url,
                ..
            } => {
                assert_eq!(prediction_id, "pred_1");
                assert_eq!(webhook_url.as_deref(), Some("https://example.com/hook"));
            }
            _ => panic!("expected Watch command"),
        }
    }

    #[test]
    fn cli_parses_push_url() {
        let cli = Cli::parse_from([
            "relay",
            "watch",
            "pred_2",
            "--push-url",
            "http://localhost:8080/push",
        ]);
        match cli.command {
            Command::Watch {
                push_url,
                webhook_url,
                ..
            } => {
                assert_eq!(push_url.as_deref(), Some("http://localhost:8080/push"));
                assert_eq!(webhook_url, None);
            }
            _ => panic!("expected Watch command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["relay", "--config", "custom.toml", "--verbose", "cancel", "p9"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Cancel { ref prediction_id } if prediction_id == "p9"));
    }

    #[test]
    fn cli_parses_verify_subcommand() {
        let cli = Cli::parse_from([
            "relay",
            "verify",
            "body.json",
            "--signature",
            "sha256=abcd",
            "--secret",
            "s3cret",
        ]);
        match cli.command {
            Command::Verify {
                file,
                signature,
                secret,
            } => {
                assert_eq!(file, PathBuf::from("body.json"));
                assert_eq!(signature, "sha256=abcd");
                assert_eq!(secret, "s3cret");
            }
            _ => panic!("expected Verify command"),
        }
    }

    #[test]
    fn cli_accepts_negative_retries_for_validation() {
        let cli = Cli::parse_from([
            "relay",
            "check-webhook",
            "https://example.com",
            "--max-retries",
            "-1",
        ]);
        assert!(matches!(
            cli.command,
            Command::CheckWebhook {
                max_retries: Some(-1),
                ..
            }
        ));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
