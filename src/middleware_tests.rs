#[cfg(all(test, feature = "tower-middleware"))]
mod tests {
    use crate::middleware::{FlagsLayer, RequestExt};
    use crate::{FlagError, FlagSource, FlagStore};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use http_body_util::{Empty, Full};
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::{ServiceBuilder, ServiceExt};

    struct FixedSource(Vec<Value>);

    #[async_trait]
    impl FlagSource for FixedSource {
        async fn fetch_all(&self) -> Result<Vec<Value>, FlagError> {
            Ok(self.0.clone())
        }
    }

    async fn mounted_store(rows: Vec<Value>) -> Arc<FlagStore> {
        let store = FlagStore::builder()
            .with_source(FixedSource(rows))
            .mount()
            .expect("Failed to mount test store");

        while store.loading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_middleware_adds_store_to_request_extensions() {
        let store = mounted_store(vec![json!({"name": "beta_marketplace", "enabled": true})]).await;

        let service = ServiceBuilder::new()
            .layer(FlagsLayer::new(store))
            .service_fn(|req: Request<Empty<Bytes>>| async move {
                let store = req.flag_store().expect("store missing from extensions");
                assert!(store.is_enabled("beta_marketplace"));
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
            });

        let request = Request::builder()
            .uri("/")
            .body(Empty::new())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        assert!(response.headers().get("X-Enabled-Flags").is_none());
    }

    #[tokio::test]
    async fn test_middleware_reports_enabled_requested_flags() {
        let store = mounted_store(vec![
            json!({"name": "feature-1", "enabled": true}),
            json!({"name": "feature-2", "enabled": false}),
            json!({"name": "feature-3", "enabled": true}),
        ])
        .await;

        let service = ServiceBuilder::new()
            .layer(FlagsLayer::new(store))
            .service_fn(|_req: Request<Empty<Bytes>>| async move {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
            });

        let request = Request::builder()
            .uri("/")
            .header("X-Feature-Flags", "feature-1, feature-2,feature-3,unknown")
            .body(Empty::new())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();

        let enabled_flags = response.headers().get("X-Enabled-Flags").unwrap();
        assert_eq!(enabled_flags, "feature-1,feature-3");
    }

    #[tokio::test]
    async fn test_middleware_with_custom_header_name() {
        let store = mounted_store(vec![json!({"name": "test-flag", "enabled": true})]).await;

        let service = ServiceBuilder::new()
            .layer(FlagsLayer::new(store).with_header_name("Custom-Flags"))
            .service_fn(|_req: Request<Empty<Bytes>>| async move {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
            });

        let request = Request::builder()
            .uri("/")
            .header("Custom-Flags", "test-flag")
            .body(Empty::new())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.headers().get("X-Enabled-Flags").unwrap(), "test-flag");
    }

    #[tokio::test]
    async fn test_middleware_omits_header_when_nothing_enabled() {
        let store = mounted_store(vec![json!({"name": "some-flag", "enabled": false})]).await;

        let service = ServiceBuilder::new()
            .layer(FlagsLayer::new(store))
            .service_fn(|_req: Request<Empty<Bytes>>| async move {
                Ok::<_, Infallible>(Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::new()))
                    .unwrap())
            });

        let request = Request::builder()
            .uri("/")
            .header("X-Feature-Flags", "some-flag")
            .body(Empty::new())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("X-Enabled-Flags").is_none());
    }

    #[tokio::test]
    async fn test_disposed_store_fails_closed_in_handlers() {
        let store = mounted_store(vec![json!({"name": "feature-1", "enabled": true})]).await;
        store.dispose().await;

        let service = ServiceBuilder::new()
            .layer(FlagsLayer::new(store))
            .service_fn(|req: Request<Empty<Bytes>>| async move {
                assert!(!req.flag_store().unwrap().is_enabled("feature-1"));
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
            });

        let request = Request::builder()
            .uri("/")
            .header("X-Feature-Flags", "feature-1")
            .body(Empty::new())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        assert!(response.headers().get("X-Enabled-Flags").is_none());
    }
}
