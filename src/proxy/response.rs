//! Responses the proxy produces itself

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// 500 with an `ERROR:` text body describing why the origin was unreachable
pub fn error_response(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!("ERROR:{}\n", message);

    let mut resp = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}
