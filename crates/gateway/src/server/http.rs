//! Request handlers for the application and admin listeners

use std::convert::Infallible;
use std::time::Instant;

use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use lemur_common::{CertMetrics, RequestId};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::request::{CertRequest, CertRequestService, IssueError};

pub type HttpResponse = Response<Full<Bytes>>;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_BODY_BYTES: usize = 64 * 1024;

const CREATE_CERT_PATH: &str = "/v1/createcert";

#[derive(Serialize)]
struct Health {
    application: Status,
}

#[derive(Serialize)]
struct Status {
    healthy: bool,
}

/// Application listener: `POST /v1/createcert`.
///
/// The certificate's RBAC group comes from `authenticator`.
pub async fn handle_app<B>(
    service: &CertRequestService,
    authenticator: &dyn Authenticator,
    req: Request<B>,
) -> Result<HttpResponse, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let request_id = request_id(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::POST, CREATE_CERT_PATH) => create_cert(service, authenticator, req).await,
        (_, CREATE_CERT_PATH) => text(StatusCode::METHOD_NOT_ALLOWED, "405 - Method not allowed."),
        _ => text(StatusCode::NOT_FOUND, "404 - Not found."),
    };

    Ok(finish(response, &request_id, &method, &path, started))
}

/// Admin listener: ping, healthcheck and metrics
pub async fn handle_admin<B>(
    metrics: &CertMetrics,
    req: Request<B>,
) -> Result<HttpResponse, Infallible> {
    let started = Instant::now();
    let request_id = request_id(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/ping") => text(StatusCode::OK, "SYNACK"),
        (&Method::GET, "/healthcheck") => json(
            StatusCode::OK,
            &Health {
                application: Status { healthy: true },
            },
        ),
        (&Method::GET, "/metrics") => match metrics.render() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!(error = %e, "Failed to render metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "500 - Unable to render metrics.")
            }
        },
        (_, "/ping" | "/healthcheck" | "/metrics") => {
            text(StatusCode::METHOD_NOT_ALLOWED, "405 - Method not allowed.")
        }
        _ => text(StatusCode::NOT_FOUND, "404 - Not found."),
    };

    Ok(finish(response, &request_id, &method, &path, started))
}

async fn create_cert<B>(
    service: &CertRequestService,
    authenticator: &dyn Authenticator,
    req: Request<B>,
) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let principal = match authenticator.authenticate(req.headers()) {
        Ok(principal) => principal,
        Err(e) => {
            service.metrics().record_error();
            warn!(error = %e, "Rejected unauthenticated certificate request");
            return text(StatusCode::UNAUTHORIZED, "401 - Bad token.");
        }
    };

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            service.metrics().record_error();
            warn!(error = %e, "Unable to read certificate request body");
            return text(StatusCode::BAD_REQUEST, "400 - Unable to read request body.");
        }
    };

    let request: CertRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            service.metrics().record_error();
            warn!(error = %e, "Unable to decode certificate request");
            return text(
                StatusCode::BAD_REQUEST,
                format!("400 - Unable to decode request: {}", e),
            );
        }
    };

    info!(
        username = principal.username.as_deref().unwrap_or("-"),
        rbac_group = %principal.rbac_group,
        "Certificate request authenticated"
    );
    match service.issue(request, &principal.rbac_group).await {
        Ok(pair) => json(StatusCode::OK, &pair),
        Err(IssueError::InvalidRequest(reason)) => {
            text(StatusCode::BAD_REQUEST, format!("400 - {}", reason))
        }
        Err(IssueError::Certificate(e)) => {
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("500 - {}", e))
        }
    }
}

fn request_id<B>(req: &Request<B>) -> RequestId {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(RequestId::from_string)
        .unwrap_or_default()
}

fn finish(
    mut response: HttpResponse,
    request_id: &RequestId,
    method: &Method,
    path: &str,
    started: Instant,
) -> HttpResponse {
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    info!(
        request_id = %request_id.as_str(),
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Handled request"
    );
    response
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "500 - Unable to encode response.")
        }
    }
}
