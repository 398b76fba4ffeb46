#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::context::ServerContext;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	ctx: Arc<ServerContext>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
	pub connections: usize,
	pub online_users: usize,
	pub topics: usize,
	pub calls: usize,
	pub uploads: usize,
}

impl HealthState {
	pub fn new(ctx: Arc<ServerContext>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			ctx,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn stats(&self) -> Stats {
		Stats {
			connections: self.ctx.registry.len(),
			online_users: self.ctx.registry.online_users().len(),
			topics: self.ctx.broker.topic_count(),
			calls: self.ctx.calls.len(),
			uploads: self.ctx.uploads.len(),
		}
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let state = state.clone();
				async move { Ok::<_, hyper::Error>(route(req.method(), req.uri().path(), &state)) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
		resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
	}
	resp
}

pub(crate) fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, "text/plain", Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => respond(StatusCode::OK, "text/plain", Bytes::from_static(b"ready")),
		"/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", Bytes::from_static(b"not-ready")),
		"/stats" => match serde_json::to_vec(&state.stats()) {
			Ok(body) => respond(StatusCode::OK, "application/json", body),
			Err(e) => {
				warn!(error = %e, "failed to encode stats");
				respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", Bytes::new())
			}
		},
		_ => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::new()),
	}
}
