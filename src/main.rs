use std::path::Path;
use std::process::exit;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::App;

mod alert;
mod api;
mod config;
mod database;
mod logging;
mod mailer;
mod mqtt;
mod record;
mod router;
mod shutdown;
mod subscription;

use crate::alert::ThresholdRules;
use crate::config::{Configuration, DEFAULT_CONFIGURATION_PATH};
use crate::database::PostgresStore;
use crate::mailer::SmtpNotifier;
use crate::mqtt::PahoTransport;
use crate::router::MessageRouter;
use crate::shutdown::Shutdown;
use crate::subscription::{Backoff, SubscriptionLoop};

/// Waits for a worker thread until `deadline`.
///
/// Returns `None` if the thread did not stop in time or panicked.
fn join_thread<T>(name: &str, handle: JoinHandle<T>, deadline: Instant) -> Option<T> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!(target: "sensord", "The {} thread did not stop in time!", name);
            return None;
        }
        thread::sleep(Duration::from_millis(50));
    }
    match handle.join() {
        Ok(result) => {
            log::debug!(target: "sensord", "Joined {} thread!", name);
            Some(result)
        }
        Err(_) => {
            log::error!(target: "sensord", "Could not join the {} thread!", name);
            None
        }
    }
}

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();
    let configuration_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIGURATION_PATH);

    let mut configuration = match Configuration::from_file(Path::new(configuration_path)) {
        Ok(configuration) => configuration,
        Err(err) => {
            eprintln!("sensord: {}", err);
            exit(100);
        }
    };
    if let Some(level) = matches.value_of("log-level") {
        configuration.logging.level = level.to_string();
        configuration.logging.config_file = None;
    }

    if let Err(err) = logging::init(&configuration.logging) {
        eprintln!("sensord: {}", err);
        exit(101);
    }

    let notifier = match SmtpNotifier::new(&configuration.mail_parameters) {
        Ok(notifier) => notifier,
        Err(err) => {
            log::error!(target: "sensord", "Cannot configure the mail transport: \'{}\'", err);
            exit(102);
        }
    };

    let mut store = PostgresStore::new(configuration.database_connection_parameters.clone());
    if let Err(err) = store.prepare_schema() {
        log::error!(target: "sensord", "Cannot prepare the database schema: \'{}\'", err);
        exit(103);
    }

    let shutdown = Shutdown::new();

    let router = MessageRouter::new(
        store,
        notifier,
        ThresholdRules::new(&configuration.alert_parameters),
        configuration.mail_parameters.recipient.clone(),
    );
    let backoff = Backoff::from_params(&configuration.mqtt_connection_parameters);
    let transport = PahoTransport::new(configuration.mqtt_connection_parameters.clone());
    let mqtt_shutdown = shutdown.clone();
    let mqtt_thread = match thread::Builder::new()
        .name("mqtt".to_string())
        .spawn(move || {
            SubscriptionLoop::new(transport, router, backoff, mqtt_shutdown).run();
        }) {
        Ok(mqtt_handle) => mqtt_handle,
        Err(err) => {
            log::error!(target: "sensord", "Cannot start the mqtt thread: \'{}\'", err);
            exit(201);
        }
    };

    let http_configuration = configuration.http_parameters.clone();
    let http_database_configuration = configuration.database_connection_parameters.clone();
    let http_shutdown = shutdown.clone();
    let http_thread = match thread::Builder::new()
        .name("http".to_string())
        .spawn(move || {
            api::http_thread(http_configuration, http_database_configuration, http_shutdown)
        }) {
        Ok(http_handle) => http_handle,
        Err(err) => {
            log::error!(target: "sensord", "Cannot start the http thread: \'{}\'", err);
            shutdown.trigger();
            join_thread("mqtt", mqtt_thread, Instant::now() + Duration::from_secs(configuration.shutdown_timeout_secs));
            exit(202);
        }
    };

    let handler_shutdown = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        log::info!(target: "sensord", "Termination signal received!");
        handler_shutdown.trigger();
    }) {
        log::error!(target: "sensord", "Cannot set the termination handler: \'{}\'", err);
        shutdown.trigger();
    }

    let mut worker_failed = false;
    while !shutdown.wait_timeout(Duration::from_secs(1)) {
        if mqtt_thread.is_finished() || http_thread.is_finished() {
            log::error!(target: "sensord", "A worker thread stopped without a termination signal!");
            worker_failed = true;
            shutdown.trigger();
        }
    }

    let deadline = Instant::now() + Duration::from_secs(configuration.shutdown_timeout_secs);
    let mqtt_joined = join_thread("mqtt", mqtt_thread, deadline);
    let http_joined = join_thread("http", http_thread, deadline);
    if worker_failed || http_joined == Some(false) {
        exit(302);
    }
    if mqtt_joined.is_none() || http_joined.is_none() {
        exit(301);
    }

    log::info!(target: "sensord", "Exiting");
    exit(0);
}
