//! Echo origin server
//!
//! Answers `GET /?content=X` with status 200 and body `X`. Requests that
//! reach it through the proxy chain prove the chain delivered them.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

/// How long `stop_listening` waits for in-flight connections
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct EchoQuery {
    #[serde(default)]
    content: String,
}

async fn echo(Query(query): Query<EchoQuery>) -> String {
    tracing::debug!("Echoing {} bytes", query.content.len());
    query.content
}

fn router() -> Router {
    Router::new().route("/", get(echo))
}

/// A running echo server
#[derive(Debug)]
pub struct EchoServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl EchoServer {
    /// Listen on `127.0.0.1:<port>`
    ///
    /// The server accepts connections once this returns.
    pub async fn start(port: u16) -> Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], port))).await
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::EchoServer(format!("Failed to listen on {}: {}", addr, e)))?;
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        tracing::info!("Echo server listening on {}", addr);
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL that makes the server echo `content`
    pub fn url_for(&self, content: &str) -> Result<Url> {
        echo_url(self.addr, content)
    }

    /// Stop accepting connections and wait for the server task to finish
    pub async fn stop_listening(self) -> Result<()> {
        let _ = self.shutdown.send(());

        let mut task = self.task;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!("Echo server on {} stopped", self.addr);
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(Error::EchoServer(format!("Server error: {}", e))),
            Ok(Err(e)) => Err(Error::EchoServer(format!("Server task failed: {}", e))),
            Err(_) => {
                task.abort();
                Err(Error::EchoServer(format!(
                    "Connections still open after {:?}, aborted",
                    SHUTDOWN_TIMEOUT
                )))
            }
        }
    }
}

/// `http://<addr>/?content=<content>`
pub fn echo_url(addr: SocketAddr, content: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("http://{}/", addr))
        .map_err(|e| Error::Internal(format!("Invalid echo address {}: {}", addr, e)))?;
    url.query_pairs_mut().append_pair("content", content);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_url() {
        let addr: SocketAddr = "127.0.0.1:7072".parse().unwrap();
        let url = echo_url(addr, "abcdefg").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:7072/?content=abcdefg");
    }

    #[tokio::test]
    async fn test_echoes_content_and_stops() {
        let server = EchoServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let url = server.url_for("abcdefg").unwrap();

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let response = client.get(url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "abcdefg");

        let addr = server.addr();
        drop(client);
        server.stop_listening().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_port_in_use_is_echo_server_error() {
        let first = EchoServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = EchoServer::bind(first.addr()).await.unwrap_err();
        assert!(matches!(err, Error::EchoServer(_)));
        first.stop_listening().await.unwrap();
    }
}
