use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, Instant};

use filescan_core::FetchError;

/// Retrieves the content a locator points at.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Must give up after `timeout` with [`FetchError::Timeout`].
    async fn fetch(&self, locator: &str, timeout: Duration) -> Result<Bytes, FetchError>;
}

/// Fetches `http(s)://` locators with a shared connection pool.
#[derive(Clone)]
pub struct HttpContentFetcher {
    client: reqwest::Client,
}

impl HttpContentFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("filescan/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            timeout_ms: timeout_ms(timeout),
        }
    } else if let Some(status) = err.status() {
        FetchError::Status(status.as_u16())
    } else {
        FetchError::Network(err.to_string())
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    #[tracing::instrument(skip(self), fields(timeout_ms = timeout_ms(timeout)))]
    async fn fetch(&self, locator: &str, timeout: Duration) -> Result<Bytes, FetchError> {
        let start = Instant::now();

        // The request timeout covers connect, headers and body.
        let response = self
            .client
            .get(locator)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "Content fetch returned an error status");
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        tracing::debug!(
            content_len = body.len(),
            duration_ms = start.elapsed().as_millis(),
            "Content fetched"
        );
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one connection with a canned raw HTTP response.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}/doc.pdf", addr)
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;
        let fetcher = HttpContentFetcher::new().unwrap();

        let body = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let fetcher = HttpContentFetcher::new().unwrap();

        let err = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(404)), "got {:?}", err);
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let fetcher = HttpContentFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("http://{}/slow", addr), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Timeout { timeout_ms: 200 }),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = HttpContentFetcher::new().unwrap();

        let err = fetcher
            .fetch(&format!("http://{}/gone", addr), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "got {:?}", err);
    }
}
