use crate::FlagStore;
use http::header::HeaderValue;
use http::{Request, Response};
use log::debug;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

const ENABLED_FLAGS_HEADER: &str = "X-Enabled-Flags";

/// Makes a mounted [`FlagStore`] available to every request.
///
/// Handlers read flags through [`RequestExt::flag_store`]. A request may
/// also list flag names in the configured header; the response then
/// carries `X-Enabled-Flags` with the ones that are on.
#[derive(Clone)]
pub struct FlagsLayer {
    store: Arc<FlagStore>,
    header_name: String,
}

impl FlagsLayer {
    pub fn new(store: Arc<FlagStore>) -> Self {
        Self {
            store,
            header_name: "X-Feature-Flags".to_string(),
        }
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }
}

impl<S> Layer<S> for FlagsLayer {
    type Service = FlagsMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FlagsMiddleware {
            inner,
            store: self.store.clone(),
            header_name: self.header_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct FlagsMiddleware<S> {
    inner: S,
    store: Arc<FlagStore>,
    header_name: String,
}

#[pin_project]
pub struct FlagsFuture<F> {
    #[pin]
    inner: F,
    enabled_flags: Option<HeaderValue>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for FlagsMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: http_body::Body,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = FlagsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let enabled_flags = req
            .headers()
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty() && self.store.is_enabled(name))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .filter(|joined| !joined.is_empty())
            .and_then(|joined| match HeaderValue::from_str(&joined) {
                Ok(value) => Some(value),
                Err(_) => {
                    debug!("Enabled flag list is not a valid header value: {}", joined);
                    None
                }
            });

        req.extensions_mut().insert(FlagsState {
            store: self.store.clone(),
        });

        FlagsFuture {
            inner: self.inner.call(req),
            enabled_flags,
        }
    }
}

impl<F, ResBody, E> Future for FlagsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.poll(cx) {
            Poll::Ready(Ok(mut response)) => {
                if let Some(enabled_flags) = this.enabled_flags.take() {
                    response.headers_mut().insert(ENABLED_FLAGS_HEADER, enabled_flags);
                }
                Poll::Ready(Ok(response))
            }
            other => other,
        }
    }
}

#[derive(Clone)]
pub struct FlagsState {
    pub store: Arc<FlagStore>,
}

pub trait RequestExt {
    fn flag_store(&self) -> Option<&FlagStore>;
}

impl<T> RequestExt for Request<T> {
    fn flag_store(&self) -> Option<&FlagStore> {
        self.extensions()
            .get::<FlagsState>()
            .map(|state| state.store.as_ref())
    }
}
