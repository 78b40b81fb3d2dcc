//! HTTP request handling for the caching proxy.

use std::time::Instant;

use bytes::Bytes;
use futures_util::TryStreamExt as _;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt as _, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, SERVER};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, error, info};

use crate::cacher::Cacher;
use crate::error::CacheError;
use crate::fileinfo::clean_path;
use crate::humanfmt::HumanFmt;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const READ_BUF_SIZE: usize = 64 * 1024;

fn empty() -> BoxBody<Bytes, CacheError> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, CacheError> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
fn quick_response<T: Into<Bytes>>(
    status: StatusCode,
    message: T,
) -> Response<BoxBody<Bytes, CacheError>> {
    Response::builder()
        .status(status)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(message))
        .expect("response is valid")
}

/// Content type derived from the file extension; repository payloads
/// default to raw bytes.
#[must_use]
fn content_type(p: &str) -> &'static str {
    let ext = match p.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') => ext,
        _ => "",
    };
    match ext {
        "gz" => "application/gzip",
        "bz2" => "application/x-bzip2",
        "xz" => "application/x-xz",
        "gpg" => "application/pgp-signature",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Serves one client request: resolves the logical path through the
/// cacher and streams the cache file back.
///
/// Only retrieval methods are honoured; HEAD omits the body.
pub(crate) async fn handle_request(
    cacher: Cacher,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, CacheError>>, CacheError> {
    let start = Instant::now();
    let method = req.method().clone();

    if method != Method::GET && method != Method::HEAD {
        return Ok(quick_response(StatusCode::NOT_IMPLEMENTED, "bad method"));
    }

    let p = clean_path(req.uri().path().trim_start_matches('/'));
    debug!("Request path `{p}`");

    let response = match cacher.get(&p).await {
        Err(err) => {
            error!("Error getting `{p}`:  {err}");
            quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Ok((StatusCode::NOT_FOUND, _)) => {
            quick_response(StatusCode::NOT_FOUND, "404 page not found")
        }
        Ok((status, _)) if status != StatusCode::OK => {
            quick_response(status, format!("status {status}"))
        }
        Ok((_, None)) => {
            error!("Missing cache file handle for `{p}`");
            quick_response(StatusCode::INTERNAL_SERVER_ERROR, "cache access failure")
        }
        Ok((_, Some(file))) => {
            let size = match file.metadata().await {
                Ok(m) => m.len(),
                Err(err) => {
                    error!("Error getting metadata of cached file `{p}`:  {err}");
                    return Ok(quick_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "cache access failure",
                    ));
                }
            };

            let body = if method == Method::HEAD {
                empty()
            } else {
                let reader = tokio_util::io::ReaderStream::with_capacity(file, READ_BUF_SIZE);
                BoxBody::new(StreamBody::new(
                    reader.map_ok(Frame::data).map_err(CacheError::Io),
                ))
            };

            Response::builder()
                .status(StatusCode::OK)
                .header(SERVER, HeaderValue::from_static(APP_NAME))
                .header(CONTENT_TYPE, content_type(&p))
                .header(CONTENT_LENGTH, size)
                .body(body)
                .expect("response is valid")
        }
    };

    info!(
        "{method} /{p} {} in {}",
        response.status(),
        HumanFmt::Time(start.elapsed())
    );

    Ok(response)
}
