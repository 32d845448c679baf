//! Structured traffic records.
//!
//! Every record carries the route path under the `url` field and goes to the
//! `hermes::ws` target, so subscribers can filter the whole layer with one
//! directive. Payload bodies are only included when
//! [`WsConfig::log_payloads`](crate::WsConfig::log_payloads) is set.

use tracing::{error, info, warn};

use crate::config::WsConfig;

const TARGET: &str = "hermes::ws";

pub(crate) fn ws_connected(config: &WsConfig, url: &str) {
    if config.log_traffic {
        info!(target: TARGET, url, "websocket connected");
    }
}

pub(crate) fn ws_rejected(config: &WsConfig, url: &str, status: Option<u16>, reason: Option<&str>) {
    if config.log_traffic {
        warn!(target: TARGET, url, status, reason, "websocket rejected");
    }
}

pub(crate) fn ws_input(config: &WsConfig, url: &str, data: &[u8]) {
    if !config.log_traffic {
        return;
    }
    if config.log_payloads {
        info!(
            target: TARGET,
            url,
            payload = %String::from_utf8_lossy(data),
            "websocket message received"
        );
    } else {
        info!(target: TARGET, url, bytes = data.len(), "websocket message received");
    }
}

pub(crate) fn ws_output(config: &WsConfig, url: &str, data: &[u8]) {
    if !config.log_traffic {
        return;
    }
    if config.log_payloads {
        info!(
            target: TARGET,
            url,
            payload = %String::from_utf8_lossy(data),
            "websocket message sent"
        );
    } else {
        info!(target: TARGET, url, bytes = data.len(), "websocket message sent");
    }
}

pub(crate) fn ws_init_done(config: &WsConfig, url: &str) {
    if config.log_traffic {
        info!(target: TARGET, url, "websocket init complete");
    }
}

pub(crate) fn ws_init_failed(config: &WsConfig, url: &str, reason: &str) {
    if config.log_traffic {
        warn!(target: TARGET, url, reason, "websocket init failed");
    }
}

pub(crate) fn ws_close(config: &WsConfig, url: &str, code: u16) {
    if config.log_traffic {
        info!(target: TARGET, url, code, "websocket closed");
    }
}

pub(crate) fn ws_terminate(config: &WsConfig, url: &str) {
    if config.log_traffic {
        info!(target: TARGET, url, "websocket terminated");
    }
}

pub(crate) fn ws_error(config: &WsConfig, url: &str, error: &str) {
    error!(target: TARGET, url, error, "websocket error");
}
