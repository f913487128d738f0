//! Connection management for MongoDB
//!
//! Builds a `mongodb::Client` from a connection URI and the connection
//! settings, and verifies the deployment answers before a dump starts.

use std::time::Duration;

use bson::doc;
use mongodb::{Client, options::ClientOptions};
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{DumpError, Result};

/// MongoDB connection manager
pub struct ConnectionManager {
    /// Client, set once connected
    client: Option<Client>,

    /// Connection configuration
    config: ConnectionConfig,

    /// Connection URI
    uri: String,
}

impl ConnectionManager {
    /// Create a new connection manager
    ///
    /// # Arguments
    /// * `uri` - MongoDB connection URI
    /// * `config` - Connection configuration
    pub fn new(uri: String, config: ConnectionConfig) -> Self {
        Self {
            client: None,
            config,
            uri,
        }
    }

    /// Establish the connection and ping the deployment
    ///
    /// # Returns
    /// * `Result<()>` - Success or connection error
    pub async fn connect(&mut self) -> Result<()> {
        let options = self.client_options().await?;
        let client = Client::with_options(options)?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DumpError::MongoDb(e).with_context("connecting"))?;

        info!("Connected to {}", redact_uri(&self.uri));
        self.client = Some(client);
        Ok(())
    }

    /// Parse the URI and apply application name and timeouts.
    async fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::parse(self.uri.as_str())
            .await
            .map_err(|e| DumpError::MongoDb(e).with_context("parsing connection URI"))?;

        let timeout = Duration::from_secs(self.config.timeout);
        if options.app_name.is_none() {
            options.app_name = Some(self.config.app_name.clone());
        }
        options.connect_timeout.get_or_insert(timeout);
        options.server_selection_timeout.get_or_insert(timeout);

        debug!(
            "Client options: app name {:?}, timeout {}s",
            options.app_name, self.config.timeout
        );
        Ok(options)
    }

    /// Get the MongoDB client
    ///
    /// # Returns
    /// * `Result<&Client>` - Reference to client, or an error when not connected
    pub fn get_client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DumpError::Generic("not connected to MongoDB".to_string()))
    }

    /// Version string reported by `buildInfo`.
    pub async fn get_server_version(&self) -> Result<String> {
        let reply = self
            .get_client()?
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await?;

        Ok(reply.get_str("version").unwrap_or("unknown").to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Shut the client down, waiting for in-flight operations.
    pub async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            debug!("Disconnected from {}", redact_uri(&self.uri));
        }
    }
}

/// Replace the credentials of a URI with `***`.
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &uri[..scheme_end + 3], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
