//! Request middleware: structured access logs plus the coarse HTTP counters
//! surfaced through `/metrics`.

use std::future::{ready, Ready};
use std::sync::atomic::Ordering;
use std::time::Instant;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{web, Error};
use futures_util::future::LocalBoxFuture;
use tracing::info;

use crate::state::AppState;

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingService { service }))
    }
}

pub struct RequestLoggingService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        if let Some(state) = req.app_data::<web::Data<AppState>>() {
            state.metrics.requests.fetch_add(1, Ordering::Relaxed);
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_client_error() || status.is_server_error() {
                        if let Some(state) =
                            response.request().app_data::<web::Data<AppState>>()
                        {
                            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    info!(
                        method,
                        path,
                        status = status.as_u16(),
                        duration_ms,
                        "request"
                    );
                }
                Err(e) => {
                    info!(method, path, error = %e, duration_ms, "request failed");
                }
            }

            result
        })
    }
}
