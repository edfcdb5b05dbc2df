//! Configuração do relay carregada a partir de `relay.toml`.
//!
//! A struct [`RelayConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `REPLICATE_API_TOKEN` tem precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::poller::PollerConfig;
use crate::push::TransportConfig;
use crate::replicate::client::API_URL;
use crate::retry::RetryPolicy;
use crate::webhook::QueueConfig;

pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";
pub const TOKEN_ENV: &str = "REPLICATE_API_TOKEN";

/// Configuração de nível superior carregada de `relay.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// URL base da API de predições.
    pub api_base_url: String,

    /// Token de acesso à API.
    pub api_token: String,

    /// Intervalo entre consultas de status, em milissegundos.
    pub poll_interval_ms: u64,

    /// Por quanto tempo um status terminal continua consultável.
    pub status_retention_secs: u64,

    /// Tentativas por consulta de status, incluindo a primeira.
    pub fetch_max_attempts: u32,

    pub fetch_min_delay_ms: u64,

    pub fetch_max_delay_ms: u64,

    /// Tempo ocioso antes de enviar um heartbeat numa conexão push.
    pub keep_alive_secs: u64,

    /// Máximo de tentativas de reconexão por queda.
    pub max_reconnect_attempts: u32,

    /// Atraso base do backoff exponencial de webhooks.
    pub webhook_base_delay_ms: u64,

    pub webhook_max_delay_ms: u64,

    pub webhook_max_jitter_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base_url: API_URL.to_string(),
            api_token: String::new(),
            poll_interval_ms: 1000,
            status_retention_secs: 300,
            fetch_max_attempts: 3,
            fetch_min_delay_ms: 500,
            fetch_max_delay_ms: 5000,
            keep_alive_secs: 30,
            max_reconnect_attempts: 5,
            webhook_base_delay_ms: 1000,
            webhook_max_delay_ms: 60_000,
            webhook_max_jitter_ms: 1000,
        }
    }
}

impl RelayConfig {
    /// Carrega a configuração. Sem caminho explícito, usa `relay.toml` no
    /// diretório atual se existir; um caminho explícito precisa existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_token(std::env::var(TOKEN_ENV).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    // Variável de ambiente tem precedência sobre o arquivo de configuração para o token.
    fn apply_token(&mut self, token: Option<String>) {
        if let Some(token) = token
            && !token.is_empty()
        {
            self.api_token = token;
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            status_retention: Duration::from_secs(self.status_retention_secs),
            fetch_policy: RetryPolicy {
                max_attempts: self.fetch_max_attempts.max(1),
                min_delay: Duration::from_millis(self.fetch_min_delay_ms),
                max_delay: Duration::from_millis(self.fetch_max_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn transport(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            reconnect: RetryPolicy {
                max_attempts: self.max_reconnect_attempts,
                ..defaults.reconnect
            },
        }
    }

    pub fn webhook_queue(&self) -> QueueConfig {
        QueueConfig {
            base_delay: Duration::from_millis(self.webhook_base_delay_ms),
            max_delay: Duration::from_millis(self.webhook_max_delay_ms),
            max_jitter: Duration::from_millis(self.webhook_max_jitter_ms),
            ..QueueConfig::default()
        }
    }
}
