//! The HTTP surface: `/api/data`, methods MATCH and PATCH, one frame per
//! request body and one per response body.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request as HttpRequest, Response, Server, StatusCode};
use tracing::{debug, info};

use crate::frame::{error_frame, parse_request, RequestError};
use crate::server::{handle_request, ServerContext};

pub async fn serve(context: ServerContext, addr: SocketAddr) -> Result<(), hyper::Error> {
    let make_service = make_service_fn(move |_conn| {
        let context = context.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let context = context.clone();
                async move { Ok::<_, Infallible>(handle_http(&context, request).await) }
            }))
        }
    });

    info!(%addr, "http server listening");
    Server::bind(&addr).serve(make_service).await
}

async fn handle_http(context: &ServerContext, request: HttpRequest<Body>) -> Response<Body> {
    if request.uri().path() != "/api/data" {
        return plain_status(StatusCode::NOT_FOUND);
    }

    let match_method = Method::from_bytes(b"MATCH").expect("static method token");
    let patch_method = Method::PATCH;
    let method = request.method().clone();
    if method != match_method && method != patch_method {
        return plain_status(StatusCode::METHOD_NOT_ALLOWED);
    }

    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return plain_status(StatusCode::BAD_REQUEST);
        }
    };
    let raw = match std::str::from_utf8(&body) {
        Ok(raw) => raw,
        Err(_) => return plain_status(StatusCode::BAD_REQUEST),
    };

    let frame = match parse_request(raw) {
        Ok(parsed) => {
            // The HTTP method must agree with the frame classification.
            let is_patch = matches!(parsed, crate::frame::Request::Patch { .. });
            if is_patch != (method == patch_method) {
                error_frame(&RequestError::usage(
                    "request body does not match the HTTP method",
                ))
            } else {
                match handle_request(context, parsed).await {
                    Ok(frame) => frame,
                    Err(error) => error_frame(&error),
                }
            }
        }
        Err(error) => error_frame(&error),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(format!("{frame}\n")))
        .expect("static response parts")
}

fn plain_status(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response parts")
}
