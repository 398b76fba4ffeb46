#![forbid(unsafe_code)]

pub mod broker;
pub mod calls;
pub mod completion;
pub mod connection;
pub mod context;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod health;
pub mod janitor;
pub mod outbox;
pub mod registry;
pub mod store;
pub mod uploads;



#[cfg(test)]
mod dispatch_tests;


#[cfg(test)]
mod uploads_tests;

use tracing::{info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::dispatch::Dispatcher;
use crate::server::registry::ConnectionHandle;

/// Accept QUIC connections until the endpoint is closed, one task per connection.
pub async fn serve(endpoint: quinn::Endpoint, dispatcher: Dispatcher, settings: ConnectionSettings) {
	let mut next_handle: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let handle = ConnectionHandle(next_handle);
		next_handle += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		let dispatcher = dispatcher.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					if let Err(e) = handle_connection(handle, connection, dispatcher, settings).await {
						warn!(%handle, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(%handle, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	info!("endpoint closed; accept loop finished");
}
