use std::future::Future;

use serde::{de::DeserializeOwned, Deserialize};

use crate::search::{ImageSearchResponse, SearchError, TextSearchResponse};

use super::ClientError;

/// How the orchestrator reaches the search server.
pub trait SearchTransport: Send + Sync + 'static {
    fn search_text(
        &self,
        query: String,
        limit: usize,
    ) -> impl Future<Output = Result<TextSearchResponse, ClientError>> + Send;

    fn search_image(
        &self,
        bytes: Vec<u8>,
        mime: Option<String>,
        limit: usize,
    ) -> impl Future<Output = Result<ImageSearchResponse, ClientError>> + Send;
}

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.strip_suffix('/').unwrap_or(base_url).to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum WebResponse<T> {
    Error { error: String, code: String },
    Data(T),
}

async fn handle_response<T>(response: reqwest::Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| ClientError::Network(err.to_string()))?;

    match serde_json::from_str::<WebResponse<T>>(&text) {
        Ok(WebResponse::Data(data)) if status.is_success() => Ok(data),
        Ok(WebResponse::Error { error, code }) => Err(SearchError::from_code(&code, &error)
            .map(ClientError::Search)
            .unwrap_or(ClientError::Decode(error))),
        _ if status == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
            Err(SearchError::IndexUnavailable.into())
        }
        _ if status.is_server_error() => Err(ClientError::Network(status.to_string())),
        Ok(WebResponse::Data(_)) => Err(ClientError::Decode(format!("status {status}"))),
        Err(err) => {
            log::error!("{err}. tried to parse: {text:?}");
            Err(ClientError::Decode(err.to_string()))
        }
    }
}

fn network(err: reqwest::Error) -> ClientError {
    ClientError::Network(err.to_string())
}

impl SearchTransport for HttpTransport {
    async fn search_text(
        &self,
        query: String,
        limit: usize,
    ) -> Result<TextSearchResponse, ClientError> {
        let limit = limit.to_string();
        let response = self
            .client
            .post(self.url("/search/text"))
            .query(&[("q", query.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(network)?;
        handle_response(response).await
    }

    async fn search_image(
        &self,
        bytes: Vec<u8>,
        mime: Option<String>,
        limit: usize,
    ) -> Result<ImageSearchResponse, ClientError> {
        let mut part = reqwest::multipart::Part::bytes(bytes).file_name("upload");
        if let Some(mime) = mime {
            part = part.mime_str(&mime).map_err(network)?;
        }
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(self.url("/search/image"))
            .query(&[("limit", limit)])
            .multipart(form)
            .send()
            .await
            .map_err(network)?;
        handle_response(response).await
    }
}
