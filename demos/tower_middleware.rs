use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flagstore::middleware::{FlagsLayer, RequestExt};
use flagstore::{FlagStore, RestSource};
use http::{Request, Response, StatusCode};
use http_body_util::{Empty, Full};
use tower::{ServiceBuilder, ServiceExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let base_url = std::env::var("FLAGS_DB_URL").unwrap_or_else(|_| "http://localhost:54321".to_string());

    let store = FlagStore::builder()
        .with_source(RestSource::builder().with_base_url(&base_url).build()?)
        .mount()?;
    while store.loading() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let service = ServiceBuilder::new()
        .layer(FlagsLayer::new(Arc::new(store)).with_header_name("X-Feature-Flags"))
        .service_fn(handle_request);

    let request = Request::builder()
        .uri("/marketplace")
        .header("X-Feature-Flags", "beta_marketplace,savings_goals")
        .body(Empty::<Bytes>::new())?;

    let response = service.oneshot(request).await?;

    println!("Response status: {}", response.status());
    if let Some(enabled_flags) = response.headers().get("X-Enabled-Flags") {
        println!("Enabled flags: {:?}", enabled_flags);
    }

    Ok(())
}

async fn handle_request(req: Request<Empty<Bytes>>) -> Result<Response<Full<Bytes>>, Infallible> {
    let open = req
        .flag_store()
        .map(|store| store.is_enabled("beta_marketplace"))
        .unwrap_or(false);

    let (status, body) = if open {
        (StatusCode::OK, "Welcome to the marketplace")
    } else {
        (StatusCode::NOT_FOUND, "Marketplace is not available yet")
    };

    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
