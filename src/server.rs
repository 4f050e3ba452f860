//! The HTTP front shared by the gateway and the subgraphs.
//!
//! Every process serves one GraphQL endpoint at `POST /graphql`. The bearer
//! token is asserted here, once per request, and handed to the endpoint as a
//! [`RequestIdentity`].

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE, ORIGIN, VARY,
};
use http::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::federation_gateway::FederationGateway;
use crate::identity::{RequestIdentity, TokenAuthority};
use crate::response::{GraphQLError, GraphQLResponse};
use crate::GraphQLRequest;

type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// A GraphQL service mounted at `/graphql`.
#[async_trait]
pub trait GraphQLEndpoint: Send + Sync + 'static {
    /// Executes one raw request body on behalf of `identity`.
    async fn execute(&self, body: Bytes, identity: RequestIdentity) -> (StatusCode, Value);
}

#[async_trait]
impl GraphQLEndpoint for FederationGateway {
    async fn execute(&self, body: Bytes, identity: RequestIdentity) -> (StatusCode, Value) {
        let request = match serde_json::from_slice::<GraphQLRequest>(&body) {
            Ok(request) => request.with_identity(identity),
            Err(e) => {
                let response = GraphQLResponse::from_error(
                    GraphQLError::new(format!("Invalid JSON request: {e}")).with_code("BAD_REQUEST"),
                );
                return (StatusCode::BAD_REQUEST, to_json(&response));
            }
        };

        let response = self.process_request(request).await;
        (status_for(&response), to_json(&response))
    }
}

/// Request-level failures never reached a subgraph: malformed requests are
/// the client's fault, anything else is ours.
fn status_for(response: &GraphQLResponse) -> StatusCode {
    if !response.is_request_error() {
        return StatusCode::OK;
    }
    match response.errors.first().and_then(GraphQLError::code) {
        Some("GRAPHQL_PARSE_FAILED" | "GRAPHQL_VALIDATION_FAILED" | "BAD_REQUEST") => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_json(response: &GraphQLResponse) -> Value {
    serde_json::to_value(response).unwrap_or_default()
}

/// Origins allowed to call the endpoint from a browser.
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: impl IntoIterator<Item = String>) -> Self {
        CorsPolicy {
            allowed_origins: allowed_origins.into_iter().collect(),
        }
    }

    fn apply(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap, preflight: bool) {
        headers.insert(VARY, HeaderValue::from_static("Origin"));
        let Some(origin) = origin else {
            return;
        };
        let allowed = origin
            .to_str()
            .is_ok_and(|origin| self.allowed_origins.iter().any(|o| o == origin));
        if !allowed {
            return;
        }

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        if preflight {
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            );
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
        }
    }
}

struct ServerContext<E> {
    endpoint: Arc<E>,
    authority: TokenAuthority,
    cors: CorsPolicy,
}

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(full(""));
    *response.status_mut() = status;
    response
}

async fn handle_request<E: GraphQLEndpoint>(
    req: Request<Incoming>,
    context: Arc<ServerContext<E>>,
) -> Result<Response<ResponseBody>, Infallible> {
    let origin = req.headers().get(ORIGIN).cloned();
    let preflight = req.method() == Method::OPTIONS;

    let mut response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let identity = RequestIdentity::from_headers(req.headers(), &context.authority);
            match req.collect().await {
                Ok(collected) => {
                    let (status, body) = context.endpoint.execute(collected.to_bytes(), identity).await;
                    json_response(status, &body)
                }
                Err(e) => {
                    warn!(error = %e, "failed to read request body");
                    json_response(
                        StatusCode::BAD_REQUEST,
                        &json!({"errors": [{"message": "Failed to read request body"}]}),
                    )
                }
            }
        }
        (&Method::OPTIONS, _) => empty_response(StatusCode::NO_CONTENT),
        (&Method::GET, "/health") => json_response(StatusCode::OK, &json!({"status": "ok"})),
        _ => empty_response(StatusCode::NOT_FOUND),
    };

    context
        .cors
        .apply(origin.as_ref(), response.headers_mut(), preflight);
    Ok(response)
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

/// Accepts connections on `listener` until `shutdown` resolves.
pub async fn serve<E, S>(
    listener: TcpListener,
    endpoint: Arc<E>,
    authority: TokenAuthority,
    cors: CorsPolicy,
    shutdown: S,
) -> io::Result<()>
where
    E: GraphQLEndpoint,
    S: Future<Output = ()>,
{
    let context = Arc::new(ServerContext {
        endpoint,
        authority,
        cors,
    });
    info!(address = %listener.local_addr()?, "listening");

    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let context = Arc::clone(&context);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&context)));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                debug!(%peer, error = %e, "error processing connection");
            }
        });
    }
}
