use std::time::Duration;

use reqwest::{Client, Method};

use crate::config::AnalysisHttp;

use super::{Evaluation, ProviderError, ProviderResult};

/// Concrete HTTP probe provider. Performs one configured request per tick
/// and matches the response against the expected status and body.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new(timeout: Duration) -> ProviderResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn kind(&self) -> &'static str {
        "http"
    }

    pub async fn run(&self, config: &AnalysisHttp) -> ProviderResult<Evaluation> {
        let method = Method::from_bytes(config.method.as_bytes())
            .map_err(|_| ProviderError::Query(format!("invalid http method {}", config.method)))?;
        let mut request = self.client.request(method, &config.url);
        for header in &config.headers {
            request = request.header(&header.key, &header.value);
        }
        if let Some(body) = &config.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        if status != config.expected_code {
            return Ok(Evaluation::fail(format!(
                "unexpected status code {status}, expected {}",
                config.expected_code
            )));
        }
        if let Some(expected_body) = &config.expected_body {
            let body = response.text().await?;
            if &body != expected_body {
                return Ok(Evaluation::fail(
                    "response body did not match the expected body",
                ));
            }
        }
        Ok(Evaluation::pass(format!(
            "response matched the expected status code {}",
            config.expected_code
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/healthz")
    }

    fn http_check(url: String, expected_code: u16, expected_body: Option<String>) -> AnalysisHttp {
        AnalysisHttp {
            url,
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            expected_code,
            expected_body,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            failure_limit: 0,
            skip_on_no_data: false,
        }
    }

    #[tokio::test]
    async fn probe_matching_status_and_body_passes() {
        let url = serve_once("200 OK", "ready").await;
        let provider = HttpProvider::new(Duration::from_secs(5)).unwrap();
        let evaluation = provider
            .run(&http_check(url, 200, Some("ready".to_string())))
            .await
            .unwrap();
        assert!(evaluation.passed);
    }

    #[tokio::test]
    async fn probe_with_unexpected_status_fails() {
        let url = serve_once("500 Internal Server Error", "boom").await;
        let provider = HttpProvider::new(Duration::from_secs(5)).unwrap();
        let evaluation = provider.run(&http_check(url, 200, None)).await.unwrap();
        assert!(!evaluation.passed);
        assert!(evaluation.reason.contains("500"));
    }

    #[tokio::test]
    async fn probe_rejects_invalid_method() {
        let provider = HttpProvider::new(Duration::from_secs(5)).unwrap();
        let mut check = http_check("http://127.0.0.1:1/".to_string(), 200, None);
        check.method = "NOT A METHOD".to_string();
        let err = provider.run(&check).await.unwrap_err();
        assert!(matches!(err, ProviderError::Query(_)));
    }
}
