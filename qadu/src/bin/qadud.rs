// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of qadu.
//
// qadu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// qadu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with qadu.  If not, see
// <http://www.gnu.org/licenses/>.

//! # qadud
//!
//! Quick-and-dirty video counter propagation.
//!
//! # Introduction
//!
//! qadud keeps peer pods' copies of our videos' likes, dislikes & views roughly current. It runs
//! the quick-and-dirty update scheduler on a timer, and accepts the same updates from peers on
//! [QADU_ENDPOINT_PATH].
//!
//! qadud runs in the foreground & logs to stdout; run it under a process supervisor.

use std::{
    env,
    fmt::Display,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde::Deserialize;
use snafu::prelude::*;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::Notify,
};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt, layer::SubscriberExt};
use url::Url;

use qadu::{
    entities::{Peer, QADU_ENDPOINT_PATH},
    http::{ErrorResponseBody, healthcheck},
    memory::InMemory,
    metrics::{Instruments, check_metric_names},
    qadu::Qadu,
    remote::make_router as make_remote_router,
    scheduler,
    storage::Backend,
    transport::{self, HttpTransport},
    util::Credentials,
};

/// The qadud application error type
///
/// As with any binary returning `Result` from `main()`, the [Debug] implementation is what the
/// operator sees, so it's implemented in terms of [Display] rather than derived.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to create the HTTP transport: {source}"))]
    HttpTransport { source: transport::Error },
    #[snafu(display("Failed to setup the in-memory store: {source}"))]
    InMemory { source: qadu::memory::Error },
    #[snafu(display("While building the OLTP exporter, {source}"))]
    OltpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Failed to setup quick-and-dirty updates: {source}"))]
    Qadu { source: qadu::qadu::Error },
    #[snafu(display("Expected schema version {expected}, but found {found:?}"))]
    SchemaMismatch { expected: u32, found: Option<u32> },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to connect to ScyllaDB: {source}"))]
    Scylla {
        #[snafu(source(from(qadu::scylla::Error, Box::new)))]
        source: Box<qadu::scylla::Error>,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

static SCHEMA_VERSION: u32 = 0;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

/// Datastore configuration
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub enum StorageConfig {
    /// Use ScyllaDB/CQL interface
    Scylla {
        /// ScyllaDB credentials, if authentication is to be used
        credentials: Option<Credentials>,
        /// ScyllaDB hosts; specify as "host:port" (or anything that can be parsed as a [SocketAddr])
        hosts: Vec<SocketAddr>,
    },
    /// Keep everything in process memory; nothing survives a restart, nor a `SIGHUP` that changes
    /// the storage configuration
    InMemory {
        /// The pods with which we federate
        #[serde(default)]
        peers: Vec<Peer>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Scylla {
            credentials: None,
            hosts: vec![SocketAddr::from(([127, 0, 0, 1], 9042))],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<Duration>,
}

/// qadud configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// OTLP export target; None means don't export
    #[serde(rename = "otlp-export")]
    otlp_export: Option<OtelExportConfig>,
    /// Local address at which to listen for requests; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    scheduler: scheduler::Config,
    transport: transport::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            otlp_export: None,
            public_address: SocketAddr::from(([0, 0, 0, 0], 20690)),
            storage_config: StorageConfig::default(),
            scheduler: scheduler::Config::default(),
            transport: transport::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the qadud configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    use snafu::IntoError;
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from("/etc/qadud.toml"), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(cfg) => match cfg {
                Configuration::V1(cfg) => Ok(cfg),
            },
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Produce the formatting layer & filter for this process' logging
///
/// Whatever the format, we log to stdout.
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers *of different types*, hence the `Box`.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          web service                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// State shared by the daemon's own endpoints
struct Qadud {
    exporter: PrometheusExporter,
}

async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // OTel names must be ASCII and belong to the alphanumeric characters, '_', '.', '-' and '/'.
    // Drop anything else & replace '/' with '.'.
    let stem: String = request
        .uri()
        .path()
        .chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => Some(c),
            _ => None,
        })
        .collect();

    let name = format!("http.{}{}", request.method().as_str().to_lowercase(), stem);
    let counter = global::meter("qadud").u64_counter(name).build();
    counter.add(1, &[]);
    next.run(request).await
}

async fn metrics(State(state): State<Arc<Qadud>>) -> Response {
    let mut output = Vec::new();
    if let Err(err) = state.exporter.export(&mut output) {
        error!("Failed to encode Prometheus metrics: {err:?}");
        return ErrorResponseBody {
            error: format!("{err:?}"),
        }
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response();
    }
    match String::from_utf8(output) {
        Ok(text) => text.into_response(),
        Err(err) => ErrorResponseBody {
            error: format!("{err}"),
        }
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response(),
    }
}

fn make_router(state: Arc<Qadud>, qadu: Arc<Qadu>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(make_remote_router(qadu))
        .layer(axum::middleware::from_fn(otel_middleware))
}

/// Build the configured datastore
async fn select_storage(config: &StorageConfig) -> Result<Arc<dyn Backend>> {
    match config {
        StorageConfig::Scylla { credentials, hosts } => {
            let session = qadu::scylla::Session::new(hosts.iter().copied(), credentials)
                .await
                .context(ScyllaSnafu)?;
            // Validate the schema ASAP:
            let found = session.schema_version().await.context(ScyllaSnafu)?;
            ensure!(
                found == Some(SCHEMA_VERSION),
                SchemaMismatchSnafu {
                    expected: SCHEMA_VERSION,
                    found
                }
            );
            Ok(Arc::new(session))
        }
        StorageConfig::InMemory { peers } => {
            let store = InMemory::new();
            for peer in peers {
                store.add_peer(peer.clone()).context(InMemorySnafu)?;
            }
            warn!("Using the in-memory store; pending updates will be lost on restart.");
            Ok(Arc::new(store))
        }
    }
}

/// Wire-up storage, transport & scheduler for `cfg`
fn assemble(
    cfg: &ConfigV1,
    backend: Arc<dyn Backend>,
    instruments: &Arc<Instruments>,
) -> Result<Arc<Qadu>> {
    let transport = Arc::new(
        HttpTransport::new(&cfg.transport, instruments.clone()).context(HttpTransportSnafu)?,
    );
    Ok(Arc::new(
        Qadu::new(
            backend,
            transport,
            cfg.scheduler.clone(),
            instruments.clone(),
        )
        .context(QaduSnafu)?,
    ))
}

/// Re-read the configuration file & re-assemble
///
/// The current datastore is kept unless the storage configuration has changed; in particular, an
/// in-memory store (and everything pending in it) survives.
async fn reconfigure(
    pth: &Option<PathBuf>,
    storage_config: &StorageConfig,
    backend: &Arc<dyn Backend>,
    instruments: &Arc<Instruments>,
) -> Result<(ConfigV1, Arc<dyn Backend>, Arc<Qadu>)> {
    let cfg = parse_config(pth)?;
    let backend = if cfg.storage_config == *storage_config {
        backend.clone()
    } else {
        info!("The storage configuration has changed; switching datastores.");
        select_storage(&cfg.storage_config).await?
    };
    let qadu = assemble(&cfg, backend.clone(), instruments)?;
    Ok((cfg, backend, qadu))
}

/// Serve quick-and-dirty updates
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    let state = Arc::new(Qadud {
        exporter: init_telemetry(cfg.otlp_export.as_ref())?,
    });
    // Instruments must be built after the meter provider has been installed.
    let instruments = Arc::new(Instruments::new("qadu"));

    // Failure here is fatal; on SIGHUP we fall back to what we have.
    let mut backend = select_storage(&cfg.storage_config).await?;
    let mut qadu = assemble(&cfg, backend.clone(), &instruments)?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        let mut processor = qadu.spawn();
        // Give the timer task a bit longer than it gives an in-flight cycle.
        let grace = cfg.scheduler.shutdown_timeout + Duration::from_secs(1);

        let nfy = Arc::new(Notify::new());
        let mut server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_router(state.clone(), qadu.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()))
        .into_future();

        info!(
            "Listening on {}; delivering every {:?}.",
            cfg.public_address, cfg.scheduler.interval
        );

        tokio::select! {
            // The server *should* never shutdown on its own.
            res = &mut server => {
                error!("The server exited early with {:?}; shutting-down.", res);
                log_on_err(processor.shutdown(grace).await);
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                log_on_err(processor.shutdown(grace).await);
                match reconfigure(&opts.cfg, &cfg.storage_config, &backend, &instruments).await {
                    Ok((new_cfg, new_backend, new_qadu)) => {
                        cfg = new_cfg;
                        backend = new_backend;
                        qadu = new_qadu;
                    }
                    Err(err) => {
                        warn!("Failed to reconfigure ({err}); keeping the current configuration.")
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                log_on_err(processor.shutdown(grace).await);
                break;
            }
            res = &mut processor => {
                // This shouldn't happen!
                error!("The scheduler exited early with {:?}; shutting-down.", res);
                nfy.notify_one();
                log_on_err(server.await);
                break;
            }
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// <div class="warning">
///
/// This method must be invoked from inside the Tokio runtime, but before any instruments are
/// accessed.
///
/// </div>
///
/// Return an exporter that can be used to implement a `/metrics` endpoint; if `collector_config`
/// is given, metrics will also be pushed over OTLP.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<PrometheusExporter> {
    check_metric_names();
    let old_school_exporter = PrometheusExporter::new();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "qadud"))
                .build(),
        )
        .with_reader(old_school_exporter.clone());

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OltpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(old_school_exporter)
}

async fn go_async(opts: CliOpts) -> Result<()> {
    // Failure to parse at this point is fatal; in `serve()` we fall back to the last "known-good"
    // configuration & keep going.
    let cfg = parse_config(&opts.cfg)?;
    info!(
        "qadud version {} starting; QADU endpoint is {}.",
        crate_version!(),
        QADU_ENDPOINT_PATH
    );
    serve(opts, cfg).await
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("qadud")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Quick-and-dirty video counter propagation")
            .long_about(
                "`qadud` periodically tells peer pods about changes to our videos' likes, \
                 dislikes & views, and accepts the same from them.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("QADU_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QADU_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QADU_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QADU_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("QADU_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Nb. this can only be invoked once (will panic on a second invocation)!
    let (formatter, filter) = configure_logging(&opts.log_opts)?;
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)?;

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts))
}
