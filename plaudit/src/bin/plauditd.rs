// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of plaudit.
//
// plaudit is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// plaudit is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with plaudit.  If not,
// see <http://www.gnu.org/licenses/>.

//! # plauditd
//!
//! The plaudit daemon: project-showcase rankings & listings over HTTP.
//!
//! Single-node for now: the bundled in-memory backend serves storage, snapshots & the
//! registration lock. The service layer only ever speaks through the [storage]/[snapshot]/
//! [LockProvider] seams, so pointing it at a relational store & a distributed lock service is a
//! matter of wiring, not surgery.
//!
//! [storage]: plaudit::storage
//! [snapshot]: plaudit::snapshot
//! [LockProvider]: plaudit::coordinator::LockProvider

use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};

use axum::{routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, Command};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
                         Layer, Registry};

use plaudit::{
    badges, comments,
    coordinator::{self, Coordinator},
    http::{healthcheck, Plaudit},
    memory::Memory,
    metrics::Instruments,
    paging::PageSize,
    projects,
    util::Key,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     application error type                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Failed to bind {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Couldn't read the configuration file {}: {source}", pth.display()))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Couldn't parse the configuration file {}: {source}", pth.display()))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("{size} is not a usable default page size: {source}"))]
    DefaultPageSize {
        size: usize,
        source: plaudit::paging::Error,
    },
    #[snafu(display("The server failed: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signals { source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          configuration                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// plaudit configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address at which to listen; specify as "address:port"
    address: SocketAddr,
    /// Key under which pagination tokens are signed; every node serving one store needs the same
    /// one
    #[serde(rename = "token-key")]
    token_key: Key,
    /// Page size used when callers don't name one
    #[serde(rename = "default-page-size")]
    default_page_size: usize,
    /// Snapshot coordination (freshness window, lock bounds)
    snapshots: coordinator::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            address: "0.0.0.0:20789".parse::<SocketAddr>().unwrap(/* known good */),
            // Fine for a dev instance; any real deployment should configure its own.
            token_key: Key::from(b"plaudit-dev-pagination-token-key".to_vec()),
            default_page_size: 12, // Copied from Mastodon
            snapshots: coordinator::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the plaudit configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/plaudit.toml").unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            the app                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn run(config: ConfigV1) -> Result<()> {
    let memory = Arc::new(Memory::new());
    let instruments = Arc::new(Instruments::new("plaudit"));
    let coordinator = Coordinator::new(
        memory.clone(),
        memory.clone(),
        memory.clone(),
        config.snapshots.clone(),
        instruments.clone(),
    );
    let state = Arc::new(Plaudit {
        storage: memory.clone(),
        snapshots: memory.clone(),
        coordinator,
        token_key: config.token_key.clone(),
        default_page_size: PageSize::new(config.default_page_size).context(
            DefaultPageSizeSnafu {
                size: config.default_page_size,
            },
        )?,
        instruments,
    });

    let app = Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(projects::make_router(state.clone()))
        .merge(comments::make_router(state.clone()))
        .merge(badges::make_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(&config.address).await.context(BindSnafu {
        address: config.address,
    })?;
    info!("plauditd listening on {}", config.address);

    let mut sigterm = signal(SignalKind::terminate()).context(SignalsSnafu)?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalsSnafu)?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM; shutting down"),
                _ = sigint.recv() => info!("SIGINT; shutting down"),
            }
        })
        .await
        .context(ServeSnafu)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("plauditd")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Project-showcase rankings & listings over HTTP")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help(
                    "path (absolute or relative to the process' current directory) to the \
                     plauditd configuration file; defaults to /etc/plaudit.toml",
                ),
        )
        .get_matches();

    Registry::default()
        .with(
            fmt::layer().with_writer(std::io::stderr).with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .init();

    let config = parse_config(&matches.get_one::<PathBuf>("config").cloned())?;
    run(config).await
}
