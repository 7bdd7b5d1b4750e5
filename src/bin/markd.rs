// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The mKTL Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `markd`: start an authoritative mKTL daemon.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "markd", about = "Start an mKTL daemon for one store.")]
struct Arguments {
    /// The store this daemon provides items for.
    store: String,

    /// The unique name of this daemon within the store; locates its items
    /// descriptor on disk.
    identifier: String,

    /// Python-style loadable modules are not supported by this
    /// implementation; custom stores link against the mktl library.
    #[arg(long)]
    module: Option<String>,

    /// See --module.
    #[arg(long)]
    subclass: Option<String>,

    /// Items descriptor to load, superseding any cached copy for this
    /// identifier.
    #[arg(long)]
    configuration: Option<PathBuf>,

    /// Application-specific configuration file, recorded for handlers that
    /// want it. The default caching store ignores it.
    #[arg(long)]
    appconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let arguments = Arguments::parse();

    if arguments.module.is_some() || arguments.subclass.is_some() {
        bail!(
            "--module and --subclass are not supported: build a custom daemon \
             against the mktl library and register handlers on DaemonBuilder"
        );
    }
    if let Some(appconfig) = &arguments.appconfig {
        info!(path = %appconfig.display(), "appconfig noted; the default store does not use it");
    }

    let mut builder = mktl::Daemon::builder(&arguments.store, &arguments.identifier);
    if let Some(configuration) = arguments.configuration {
        builder = builder.configuration(configuration);
    }

    let daemon = builder
        .start()
        .await
        .with_context(|| format!("starting daemon {}", arguments.identifier))?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        signal_cancel.cancel();
    });

    daemon.run(cancel).await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installation failed");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
