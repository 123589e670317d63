//! Decide a proxied request and relay it upstream when allowed.

use super::error::ProxyError;
use super::server::ProxyContext;
use crate::interceptor::{InterceptDecision, InterceptRequest, Protocol, RequestInterceptor};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Response header carrying the decision's request id.
pub const REQUEST_ID_HEADER: &str = "x-rashomon-request-id";

/// Headers the proxy consumes and never forwards.
const INTERNAL_HEADER_PREFIX: &str = "x-rashomon-";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Run one request through the interceptor. Allowed requests go to `send`;
/// the response body is metered and the request finalized once the body is
/// dropped.
pub(crate) async fn serve_request<F, Fut>(
    ctx: &ProxyContext,
    req: Request<Incoming>,
    url: String,
    protocol: Protocol,
    source_port: Option<u16>,
    send: F,
) -> Result<Response<ProxyBody>, ProxyError>
where
    F: FnOnce(Request<Full<Bytes>>) -> Fut,
    Fut: Future<Output = Result<Response<Incoming>, ProxyError>>,
{
    let (parts, body) = req.into_parts();
    let limit = ctx.interceptor.body_limit();
    let hinted = body.size_hint().lower();

    let mut request = InterceptRequest {
        method: parts.method.to_string(),
        url,
        headers: header_pairs(&parts.headers),
        body: Bytes::new(),
        protocol,
        source_port,
        body_overflow: None,
    };
    match Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX)).collect().await {
        Ok(collected) => request.body = collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            debug!(url = %request.url, limit, "Request body exceeds read limit");
            request.body_overflow = Some(hinted.max(limit.saturating_add(1)));
        }
        Err(e) => {
            return Err(match e.downcast::<hyper::Error>() {
                Ok(e) => ProxyError::Http(*e),
                Err(e) => ProxyError::InvalidRequest(e.to_string()),
            });
        }
    }
    let body = request.body.clone();

    let decision = ctx.interceptor.intercept(&request).await;
    if !decision.is_allowed() {
        return Ok(decision_response(&decision));
    }

    let mut upstream = Request::from_parts(parts, Full::new(body));
    strip_headers(upstream.headers_mut());

    match send(upstream).await {
        Ok(response) => {
            let status = response.status().as_u16();
            let interceptor = ctx.interceptor.clone();
            let request_id = decision.request_id;
            let mut response = response.map(|body| {
                MeteredBody::new(body, interceptor, request_id.clone(), status).boxed()
            });
            strip_headers(response.headers_mut());
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        }
        Err(e) => {
            warn!(request_id = %decision.request_id, url = %request.url, error = %e, "Upstream request failed");
            ctx.interceptor.finalize(&decision.request_id, 502, 0);
            Ok(json_response(
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": "upstream_unavailable",
                    "reason": e.to_string(),
                    "requestId": decision.request_id,
                })
                .to_string(),
                Some(&decision.request_id),
            ))
        }
    }
}

/// Headers as name/value strings for scanning. Non-UTF-8 values are
/// converted lossily.
pub(crate) fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Remove identification and hop-by-hop headers before forwarding.
pub(crate) fn strip_headers(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name.starts_with(INTERNAL_HEADER_PREFIX) || HOP_BY_HOP.contains(&name)
        })
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

/// JSON reply for a non-allow decision.
pub(crate) fn decision_response(decision: &InterceptDecision) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(decision.status_code).unwrap_or(StatusCode::FORBIDDEN);
    json_response(
        status,
        decision.response_body().unwrap_or_default(),
        Some(&decision.request_id),
    )
}

pub(crate) fn json_response(
    status: StatusCode,
    body: String,
    request_id: Option<&str>,
) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(value) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// Response body that counts relayed bytes and finalizes its request when
/// dropped, whether it finished or the client went away.
pub(crate) struct MeteredBody<B> {
    inner: B,
    interceptor: Arc<RequestInterceptor>,
    request_id: String,
    status: u16,
    bytes: u64,
}

impl<B> MeteredBody<B> {
    pub(crate) fn new(
        inner: B,
        interceptor: Arc<RequestInterceptor>,
        request_id: String,
        status: u16,
    ) -> Self {
        Self {
            inner,
            interceptor,
            request_id,
            status,
            bytes: 0,
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &poll
            && let Some(data) = frame.data_ref()
        {
            self.bytes += data.len() as u64;
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for MeteredBody<B> {
    fn drop(&mut self) {
        debug!(request_id = %self.request_id, bytes = self.bytes, "Response relayed");
        self.interceptor
            .finalize(&self.request_id, self.status, self.bytes);
    }
}
