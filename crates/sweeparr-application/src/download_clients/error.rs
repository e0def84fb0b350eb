// SPDX-License-Identifier: GPL-3.0-or-later
use thiserror::Error;

use super::xmlrpc::XmlRpcError;

#[derive(Debug, Error)]
pub enum DownloadClientError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("authentication failed")]
    Authentication,
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("download client responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("deserialization failed: {0}")]
    Deserialization(String),
    #[error("rpc call {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error(transparent)]
    XmlRpc(#[from] XmlRpcError),
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DownloadClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}
