//! Common test utilities.

use tokio::net::TcpListener;

use snapdelta::{Config, DeltaServer};

/// Test server wrapper.
pub struct TestServer {
    pub base_url: String,
}

impl TestServer {
    /// Creates and starts a test server on a random port.
    pub async fn start() -> Self {
        // Find an available port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config {
            host: "127.0.0.1".to_string(),
            port,
            ..Config::default()
        };

        let base_url = format!("http://127.0.0.1:{}/apis/snapdelta/v1", port);

        let server = DeltaServer::new(config);

        // Start server in background
        tokio::spawn(async move {
            server.run().await.unwrap();
        });

        // Wait for server to be ready
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self { base_url }
    }

    /// Returns the URL for a namespace's delta collection.
    pub fn deltas_url(&self, namespace: &str) -> String {
        format!("{}/namespaces/{}/deltas", self.base_url, namespace)
    }

    /// Returns the URL for one delta record.
    pub fn delta_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.deltas_url(namespace), name)
    }

    /// Returns the URL for a record's enrichment subresource.
    pub fn changedblocks_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/changedblocks", self.delta_url(namespace, name))
    }

    /// Returns the URL for the driver registry collection.
    pub fn drivers_url(&self) -> String {
        format!("{}/drivers", self.base_url)
    }
}

/// Starts a stub driver backend that answers every GET with `body` as JSON.
///
/// Returns the backend's base URL.
pub async fn start_stub_backend(body: serde_json::Value) -> String {
    use axum::{routing::get, Json, Router};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let app = Router::new().route("/", get(move || async move { Json(body.clone()) }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://127.0.0.1:{}/", port)
}
