//! HTTP client for VMM control sockets.
//!
//! Both supported VMMs expose a REST API over a per-instance Unix socket;
//! this client speaks HTTP/1.1 over that socket, one connection per call.
//! Request serialization failures and non-2xx statuses surface as typed
//! errors with the VMM's message attached.

use std::path::Path;

use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors from VMM control calls.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("VMM API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("control socket missing: {0}")]
    SocketNotFound(String),
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Control client bound to one Unix socket.
pub struct ApiClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl ApiClient {
    /// Creates a client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().into_owned(),
            client: Client::unix(),
        }
    }

    /// Whether the socket file exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// PUT with a JSON body.
    pub async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        self.send(Method::PUT, path, Some(serde_json::to_vec(body)?))
            .await
            .map(|_| ())
    }

    /// PUT with an empty body.
    pub async fn put_empty(&self, path: &str) -> Result<(), ApiError> {
        self.send(Method::PUT, path, None).await.map(|_| ())
    }

    /// PATCH with a JSON body.
    pub async fn patch<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        self.send(Method::PATCH, path, Some(serde_json::to_vec(body)?))
            .await
            .map(|_| ())
    }

    /// GET returning a deserialized JSON body.
    pub async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// GET where only success matters.
    pub async fn get_ok(&self, path: &str) -> Result<(), ApiError> {
        self.send(Method::GET, path, None).await.map(|_| ())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, ApiError> {
        if !self.socket_exists() {
            return Err(ApiError::SocketNotFound(self.socket_path.clone()));
        }

        debug!(method = %method, path, socket = %self.socket_path, "VMM control call");

        let uri = Uri::new(&self.socket_path, path);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?.to_vec();

        if status.is_success() {
            Ok(bytes)
        } else {
            Err(ApiError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_socket_is_a_typed_error() {
        let client = ApiClient::new("/nonexistent/hypeman-test.sock");
        let err = client.put_empty("/api/v1/vm.boot").await.unwrap_err();
        assert!(matches!(err, ApiError::SocketNotFound(_)));
    }
}
