//! Module for connecting to a postgres database and storing the readings received over mqtt in
//! the database.
//!
//! The same store also answers the read queries of the http api.
use std::time::Duration;

use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::{Client, Config, NoTls};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};

use crate::record::Reading;

static SQL_CREATE_DATABASE: &str = include_str!("sql/create_database.sql");

static SQL_INSERT_READING: &str = include_str!("sql/insert_reading.sql");
static SQL_SELECT_READINGS: &str = include_str!("sql/select_readings.sql");
static SQL_SELECT_READING: &str = include_str!("sql/select_reading.sql");

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    #[serde(default = "default_port")]
    pub port: u16,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    #[serde(default)]
    pub password: Option<String>,
    /// The database to open on the server.
    pub database: String,
    /// Seconds to wait for the server before a connection attempt fails.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Flag to enable tls for the database server connection.
    #[serde(default)]
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    #[serde(default)]
    pub tls_params: Option<DatabaseTlsParameters>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: Option<String>,
    /// The path to the client key for TLS encryption.
    pub client_key_path: Option<String>,
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("TLS enabled but no TLS parameters specified")]
    MissingTlsParameters,
    #[error("could not configure the TLS connector: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("could not establish database connection: {0}")]
    Connect(#[source] postgres::Error),
    #[error("database query failed: {0}")]
    Query(#[source] postgres::Error),
    #[error("database connection is not available")]
    NotConnected,
}

/// Storage for sensor readings.
///
/// Implementations return the reading as stored, with the identifier and timestamp assigned by
/// the storage.
pub trait ReadingStore {
    fn insert_reading(&mut self, sensor_type: &str, value: f64) -> Result<Reading, StoreError>;
}

fn postgres_config(params: &DatabaseParameters) -> Config {
    let mut config = Config::new();
    config
        .host(&params.hostname)
        .port(params.port)
        .user(&params.username)
        .dbname(&params.database)
        .application_name("sensord")
        .connect_timeout(Duration::from_secs(params.connect_timeout_secs));
    if let Some(password) = &params.password {
        config.password(password);
    }
    config
}

fn tls_connector(tls_params: &DatabaseTlsParameters) -> Result<MakeTlsConnector, StoreError> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::PEER);
    builder.set_ca_file(&tls_params.server_ca_path)?;

    if let Some(cert_path) = &tls_params.client_cert_path {
        builder.set_certificate_file(cert_path, SslFiletype::PEM)?;
    }
    if let Some(key_path) = &tls_params.client_key_path {
        builder.set_private_key_file(key_path, SslFiletype::PEM)?;
    }
    Ok(MakeTlsConnector::new(builder.build()))
}

/// Opens a new database connection.
///
/// # Errors
///
/// Errors occur when one of the following conditions is met:
///
/// * TLS is enabled but the TLS parameters are missing.
///
/// * The files for the TLS connection cannot be loaded.
///
/// * The connection cannot be established or the user is not authorized for the database.
pub fn connect(params: &DatabaseParameters) -> Result<Client, StoreError>
{
    let config = postgres_config(params);

    let client = if params.tls_enable {
        let tls_params = params.tls_params.as_ref().ok_or(StoreError::MissingTlsParameters)?;
        config.connect(tls_connector(tls_params)?)
    } else {
        config.connect(NoTls)
    };

    let client = client.map_err(StoreError::Connect)?;
    log::info!(target: "sensord::db", "Database connection established to \'{}:{}\'!", params.hostname, params.port);
    Ok(client)
}

/// Reading store backed by a postgres database.
///
/// The connection is opened on first use. After a failed query the connection is dropped and a
/// new one is opened by the next operation.
pub struct PostgresStore {
    params: DatabaseParameters,
    client: Option<Client>,
}

impl PostgresStore {
    pub fn new(params: DatabaseParameters) -> Self {
        PostgresStore { params, client: None }
    }

    fn client(&mut self) -> Result<&mut Client, StoreError> {
        if self.client.as_ref().map_or(true, Client::is_closed) {
            self.client = Some(connect(&self.params)?);
        }
        self.client.as_mut().ok_or(StoreError::NotConnected)
    }

    fn with_client<T, F>(&mut self, operation: F) -> Result<T, StoreError>
        where F: FnOnce(&mut Client) -> Result<T, postgres::Error>
    {
        let client = self.client()?;
        match operation(client) {
            Ok(result) => Ok(result),
            Err(err) => {
                log::warn!(target: "sensord::db", "Dropping database connection after failed query: \'{}\'", err);
                self.client = None;
                Err(StoreError::Query(err))
            }
        }
    }

    /// Creates the `sensor_data` table and its index if they do not exist yet.
    pub fn prepare_schema(&mut self) -> Result<(), StoreError> {
        self.with_client(|client| client.batch_execute(SQL_CREATE_DATABASE))
    }

    /// Returns up to `limit` readings ordered by id, skipping the first `skip`.
    pub fn list_readings(&mut self, skip: i64, limit: i64) -> Result<Vec<Reading>, StoreError> {
        self.with_client(|client| {
            client.query(SQL_SELECT_READINGS, &[&limit, &skip])?
                .iter()
                .map(Reading::try_from)
                .collect()
        })
    }

    pub fn get_reading(&mut self, id: i64) -> Result<Option<Reading>, StoreError> {
        self.with_client(|client| {
            client.query_opt(SQL_SELECT_READING, &[&id])?
                .as_ref()
                .map(Reading::try_from)
                .transpose()
        })
    }
}

impl ReadingStore for PostgresStore {
    fn insert_reading(&mut self, sensor_type: &str, value: f64) -> Result<Reading, StoreError> {
        let reading = self.with_client(|client| {
            let row = client.query_one(SQL_INSERT_READING, &[&sensor_type, &value])?;
            Reading::try_from(&row)
        })?;
        log::debug!(target: "sensord::db", "Stored reading {} ({} = {})", reading.id, reading.sensor_type, reading.value);
        Ok(reading)
    }
}
