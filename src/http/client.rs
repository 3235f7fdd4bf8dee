//! Blocking HTTP client used for all outbound calls to agent control
//! surfaces.

use reqwest::blocking::Client;
use reqwest::{Error as ReqwestError, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpBuildError {
    #[error("could not build the http client: {0}")]
    ClientBuilder(String),
}

#[derive(Error, Debug)]
pub enum HttpRequestError {
    #[error("connection error: could not connect to the host: {0}")]
    Connect(#[source] ReqwestError),

    #[error("timeout error: the request timed out: {0}")]
    Timeout(#[source] ReqwestError),

    #[error("transport error: {0}")]
    Transport(#[source] ReqwestError),

    /// A response arrived but carried a non-2xx status.
    #[error("unsuccessful response: {status} - body: {body}")]
    UnsuccessfulResponse { status: StatusCode, body: String },

    #[error("could not decode response body: {0}")]
    Decode(String),
}

impl HttpRequestError {
    /// Connection-level failures, as opposed to responses the remote end
    /// actually produced.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::Transport(_))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration, conn_timeout: Duration) -> Result<Self, HttpBuildError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(conn_timeout)
            .build()
            .map_err(|err| HttpBuildError::ClientBuilder(err.to_string()))?;
        Ok(Self { client })
    }

    /// GET `url`, expecting a 2xx JSON body.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T, HttpRequestError> {
        let mut req = self.client.get(url);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let res = req.send().map_err(classify)?;
        let res = check_status(res)?;
        res.json()
            .map_err(|err| HttpRequestError::Decode(err.to_string()))
    }

    /// POST a JSON body to `url`, expecting any 2xx. Non-2xx responses are
    /// returned as [`HttpRequestError::UnsuccessfulResponse`] so callers can
    /// classify them.
    pub fn post_json<B: Serialize>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<(), HttpRequestError> {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let res = req.send().map_err(classify)?;
        check_status(res)?;
        Ok(())
    }
}

fn classify(err: ReqwestError) -> HttpRequestError {
    if err.is_connect() {
        HttpRequestError::Connect(err)
    } else if err.is_timeout() {
        HttpRequestError::Timeout(err)
    } else {
        HttpRequestError::Transport(err)
    }
}

fn check_status(
    res: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, HttpRequestError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().unwrap_or_default();
    Err(HttpRequestError::UnsuccessfulResponse { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use httpmock::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        value: String,
    }

    fn client() -> HttpClient {
        HttpClient::new(Duration::from_secs(2), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn get_json_deserializes_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/data").header("authorization", "Bearer tkn");
            then.status(200).json_body(serde_json::json!({"value": "ok"}));
        });

        let got: Payload = client()
            .get_json(&server.url("/data"), Some("tkn"))
            .unwrap();
        mock.assert();
        assert_eq!(
            got,
            Payload {
                value: "ok".to_string()
            }
        );
    }

    #[test]
    fn non_success_status_carries_code_and_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/act");
            then.status(409).body("{\"deferred\": true}");
        });

        let err = client()
            .post_json(&server.url("/act"), None, &serde_json::json!({}))
            .unwrap_err();
        assert_matches!(
            err,
            HttpRequestError::UnsuccessfulResponse { status, ref body }
                if status == StatusCode::CONFLICT && body.contains("deferred")
        );
        assert!(!err.is_unreachable());
    }

    #[test]
    fn connection_refused_is_unreachable() {
        // Port 1 is never listening.
        let err = client()
            .get_json::<Payload>("http://127.0.0.1:1/health", None)
            .unwrap_err();
        assert!(err.is_unreachable());
    }
}
