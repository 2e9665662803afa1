//! Request logging middleware for detailed API request/response logging.
//!
//! Event stream responses are logged when headers are sent, so the duration
//! of an SSE request is its time to first byte.

use actix_web::Error;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::http::StatusCode;
use futures_util::future::LocalBoxFuture;
use std::future::{Ready, ready};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::UPLOAD_ID_HEADER;

/// Request logger middleware factory.
pub struct RequestLogger;

impl<S, B> Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggerMiddleware { service }))
    }
}

/// Request logger middleware service.
pub struct RequestLoggerMiddleware<S> {
    service: S,
}

fn header_or<'a>(req: &'a ServiceRequest, name: &str, fallback: &'a str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(fallback)
}

/// How a finished request is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    ClientError,
    ServerError,
}

impl Outcome {
    fn of(status: StatusCode) -> Self {
        if status.is_client_error() {
            Outcome::ClientError
        } else if status.is_server_error() {
            Outcome::ServerError
        } else {
            Outcome::Completed
        }
    }
}

/// Fields logged on both ends of a request.
struct RequestLine {
    method: String,
    path: String,
    upload_id: String,
}

impl RequestLine {
    fn finished(&self, status: StatusCode, elapsed: Duration) {
        let status_code = status.as_u16();
        let duration_ms = elapsed.as_millis();
        let (method, path, upload_id) = (&self.method, &self.path, &self.upload_id);

        match Outcome::of(status) {
            Outcome::Completed => info!(
                target: "api",
                method = %method,
                path = %path,
                upload_id = %upload_id,
                status = status_code,
                duration_ms,
                "← Request completed"
            ),
            Outcome::ClientError => warn!(
                target: "api",
                method = %method,
                path = %path,
                upload_id = %upload_id,
                status = status_code,
                duration_ms,
                "← Client error"
            ),
            Outcome::ServerError => error!(
                target: "api",
                method = %method,
                path = %path,
                upload_id = %upload_id,
                status = status_code,
                duration_ms,
                "← Server error"
            ),
        }
    }
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddleware<S>
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
        let line = RequestLine {
            method: req.method().to_string(),
            path: req.path().to_string(),
            upload_id: header_or(&req, UPLOAD_ID_HEADER, "-").to_string(),
        };

        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        info!(
            target: "api",
            method = %line.method,
            path = %line.path,
            query = %req.query_string(),
            remote_addr = %remote_addr,
            user_agent = %header_or(&req, "user-agent", "unknown"),
            upload_id = %line.upload_id,
            "→ Request started"
        );

        let fut = self.service.call(req);

        Box::pin(async move {
            let res = fut.await?;
            line.finished(res.status(), start.elapsed());
            Ok(res)
        })
    }
}
