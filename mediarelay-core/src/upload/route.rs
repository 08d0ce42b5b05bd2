use async_trait::async_trait;

use super::error::{UploadError, UploadResult};

/// Network path used for every upload of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRoute {
    pub proxy: Option<String>,
}

impl UploadRoute {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn label(&self) -> &str {
        self.proxy.as_deref().unwrap_or("direct")
    }
}

#[async_trait]
pub trait RouteSelector: Send + Sync {
    async fn select(&self, task_id: &str) -> UploadResult<UploadRoute>;
}

#[derive(Debug, Clone, Default)]
pub struct DirectRoute;

#[async_trait]
impl RouteSelector for DirectRoute {
    async fn select(&self, _task_id: &str) -> UploadResult<UploadRoute> {
        Ok(UploadRoute::direct())
    }
}

/// Always routes through one configured proxy.
#[derive(Debug, Clone)]
pub struct StaticProxyRoute {
    proxy: String,
}

impl StaticProxyRoute {
    pub fn new(proxy: impl Into<String>) -> UploadResult<Self> {
        let proxy = proxy.into();
        url::Url::parse(&proxy).map_err(|err| UploadError::Route(format!("{proxy}: {err}")))?;
        Ok(Self { proxy })
    }
}

#[async_trait]
impl RouteSelector for StaticProxyRoute {
    async fn select(&self, _task_id: &str) -> UploadResult<UploadRoute> {
        Ok(UploadRoute {
            proxy: Some(self.proxy.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_proxy_is_validated_and_returned() {
        assert!(StaticProxyRoute::new("not a url").is_err());
        let selector = StaticProxyRoute::new("http://127.0.0.1:3128").unwrap();
        let route = selector.select("t").await.unwrap();
        assert_eq!(route.label(), "http://127.0.0.1:3128");
        assert_eq!(DirectRoute.select("t").await.unwrap().label(), "direct");
    }
}
