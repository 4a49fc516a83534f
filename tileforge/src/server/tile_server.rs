//! Server lifecycle: configuration ingestion, middleware stack, listening,
//! graceful shutdown.
//!
//! The router and handlers stay in their own modules; this type owns only
//! lifecycle concerns. Guarantees: starting twice stops the previous
//! instance, stopping twice is a no-op, and in-flight requests get a
//! bounded grace period on shutdown.

use super::{cors, routes};
use crate::state::AppState;
use anyhow::Result;
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::{BoxError, Router, response::IntoResponse};
use tokio::{net::TcpListener, sync::oneshot};
use tower::{
	ServiceBuilder, buffer::BufferLayer, limit::ConcurrencyLimitLayer, load_shed::LoadShedLayer, timeout::TimeoutLayer,
};
use tower_http::catch_panic::CatchPanicLayer;

pub struct TileServer {
	ip: String,
	port: u16,
	state: AppState,
	cors_allowed_origins: Vec<String>,
	exit_signal: Option<oneshot::Sender<()>>,
	join: Option<tokio::task::JoinHandle<()>>,
}

impl TileServer {
	pub fn new(ip: &str, port: u16, state: AppState, cors_allowed_origins: Vec<String>) -> TileServer {
		TileServer {
			ip: ip.to_string(),
			port,
			state,
			cors_allowed_origins,
			exit_signal: None,
			join: None,
		}
	}

	/// Bind and serve. Re-arms all project timers and starts the scheduler
	/// heartbeat before accepting traffic.
	pub async fn start(&mut self) -> Result<()> {
		if self.exit_signal.is_some() || self.join.is_some() {
			self.stop().await;
		}

		log::info!("starting tile server");
		self.state.scheduler.reschedule_all();
		self.state.scheduler.start_heartbeat();

		let mut router = routes::build_router(self.state.clone());
		router = router.layer(cors::build_cors_layer(&self.cors_allowed_origins, 3600)?);

		// Protection layers, innermost to outermost:
		//   LoadShed → ConcurrencyLimit → Buffer → Timeout → CatchPanic → HandleError
		let overload_handler = HandleErrorLayer::new(|_err: BoxError| async move {
			let mut response = (StatusCode::SERVICE_UNAVAILABLE, "Service overloaded, try later").into_response();
			response.headers_mut().insert("Retry-After", "2".parse().unwrap());
			Ok::<_, std::convert::Infallible>(response)
		});
		// the request timeout must stay above the synchronous tile budget
		let protection = ServiceBuilder::new()
			.layer(overload_handler)
			.layer(CatchPanicLayer::new())
			.layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
			.layer(BufferLayer::new(512))
			.layer(ConcurrencyLimitLayer::new(256))
			.layer(LoadShedLayer::new());
		let router = router.layer(protection);

		let addr = format!("{}:{}", self.ip, self.port);
		let listener = TcpListener::bind(&addr).await?;
		if self.port == 0 {
			self.port = listener.local_addr()?.port();
		}
		log::info!("listening on {}:{}", self.ip, self.port);

		let (tx, rx) = oneshot::channel::<()>();
		let handle = tokio::spawn(async move {
			if let Err(err) = axum::serve(listener, router.into_make_service())
				.with_graceful_shutdown(async {
					rx.await.ok();
				})
				.await
			{
				log::error!("server task exited with error: {err}");
			}
		});

		self.exit_signal = Some(tx);
		self.join = Some(handle);
		Ok(())
	}

	/// Graceful shutdown of the HTTP surface. The worker pool survives so
	/// the server can be started again; callers close it on final exit.
	pub async fn stop(&mut self) {
		if self.exit_signal.is_none() && self.join.is_none() {
			return;
		}
		log::info!("stopping tile server");

		if let Some(tx) = self.exit_signal.take() {
			let _ = tx.send(());
		}
		if let Some(handle) = self.join.take() {
			if tokio::time::timeout(std::time::Duration::from_secs(10), handle).await.is_err() {
				log::warn!("server task did not shut down within timeout");
			}
		}
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn state(&self) -> &AppState {
		&self.state
	}
}
