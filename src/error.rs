// Error taxonomy for the proxy core
use crate::http::ResponseHead;
use thiserror::Error;

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[from] std::io::Error),

    #[error("unexpected upstream response: {0}")]
    UpstreamProtocol(String),

    /// CONNECT ended with a terminal non-2xx; the upstream response is kept
    /// so it can be relayed to the client as-is.
    #[error("CONNECT refused by proxy: {}", head.status_line)]
    TunnelRefused { head: ResponseHead, body: Vec<u8> },

    #[error("proxy authentication failed: NTLM challenges exhausted")]
    AuthExhausted,

    #[error("illegal server state: {0}")]
    IllegalState(&'static str),
}

impl ProxyError {
    /// Status code and reason for a synthesized downstream error reply,
    /// used only while no response byte has been written to the client.
    /// `TunnelRefused` never comes through here: the upstream's own
    /// response (including any `Proxy-Authenticate`) is relayed verbatim.
    pub fn downstream_status(&self) -> (u16, &'static str) {
        match self {
            ProxyError::MalformedRequest(_) => (400, "Bad Request"),
            _ => (502, "Bad Gateway"),
        }
    }
}
