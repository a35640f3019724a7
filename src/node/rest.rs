use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Method, StatusCode,
};
use serde_json::Value;
use tracing::trace;

use crate::{
    config::NodeConfig,
    error::{NodeError, RestError},
};

/// Superficie REST mínima que necesita la conexión a un nodo.
///
/// `Ok(None)` cubre tanto `204 No Content` como un cuerpo `200`/`201` vacío.
/// Cualquier otro status es un error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
    ) -> Result<Option<Value>, RestError>;
}

/// Transporte sobre `reqwest` ligado a un nodo
pub struct Rest {
    http: reqwest::Client,
    base_url: String,
}

impl Rest {
    /// Crea el cliente HTTP con los headers de autenticación
    pub fn new(config: &NodeConfig, user_id: u64, client_name: &str) -> Result<Self, NodeError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&config.password)?);
        headers.insert("User-Id", header_value(&user_id.to_string())?);
        headers.insert("Client-Name", header_value(client_name)?);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(RestError::from)?;

        Ok(Self {
            http,
            base_url: config.http_url(),
        })
    }
}

#[async_trait]
impl RestTransport for Rest {
    async fn request(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
    ) -> Result<Option<Value>, RestError> {
        let url = format!("{}{}", self.base_url, path);
        trace!("{} {}", method, url);

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK | StatusCode::CREATED => {
                let bytes = response.bytes().await?;
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::from_slice(&bytes)?))
                }
            }
            status => Err(RestError::Status(status.as_u16())),
        }
    }
}

/// Convierte un valor de header, usado por REST y WebSocket
pub(crate) fn header_value(value: &str) -> Result<HeaderValue, NodeError> {
    HeaderValue::from_str(value).map_err(|e| NodeError::InvalidHeader(e.to_string()))
}
