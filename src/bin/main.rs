// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dispensary_payments::server::{self, AppState};
use dispensary_payments::{
    Directory, HttpProvider, PaymentService, ProviderRegistry, SettlementBatcher, Settings,
    WebhookIngestor, telemetry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Payment core - idempotent charges, webhooks, refunds, disputes, settlements
#[derive(Parser, Debug)]
#[command(name = "dispensary-payments")]
#[command(about = "Payment core for a multi-tenant retail platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and background workers
    Serve {
        /// TOML settings file; `PAYMENTS_*` environment variables override it
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
    }
}

async fn serve(config: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = Settings::load(config.as_deref()).context("loading settings")?;
    let directory = Arc::new(Directory::from_settings(&settings));

    let mut providers = ProviderRegistry::new();
    for (id, credentials) in &settings.providers {
        let client = HttpProvider::new(
            credentials,
            settings.provider_http.timeout,
            settings.provider_http.retry_policy(),
        )
        .with_context(|| format!("building client for provider {id}"))?;
        providers.register(id.clone(), Arc::new(client));
    }

    let service = Arc::new(PaymentService::new(
        directory.clone(),
        Arc::new(providers),
        &settings,
    ));
    let webhooks = Arc::new(WebhookIngestor::new(
        directory.clone(),
        service.ledger().clone(),
        service.disputes().clone(),
        &settings.webhook,
    ));
    let settlements = Arc::new(SettlementBatcher::new(
        service.ledger().clone(),
        service.refunds().clone(),
        service.disputes().clone(),
    ));

    let shutdown = CancellationToken::new();
    let workers = [
        tokio::spawn(
            service
                .clone()
                .run_idempotency_sweeper(settings.idempotency.sweep_interval, shutdown.clone()),
        ),
        tokio::spawn(
            webhooks
                .clone()
                .run_retry_worker(settings.webhook.retry_poll_interval, shutdown.clone()),
        ),
        tokio::spawn(settlements.clone().run_worker(
            directory,
            settings.settlement.interval,
            settings.settlement.report_dir.clone(),
            shutdown.clone(),
        )),
    ];

    let app = server::router(AppState {
        service,
        webhooks,
        settlements,
    });
    let listener = TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.server.bind_addr))?;
    info!(addr = %settings.server.bind_addr, "payments API listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            signal.cancel();
        })
        .await
        .context("serving HTTP")?;

    shutdown.cancel();
    for worker in workers {
        worker.await.context("joining background worker")?;
    }
    info!("shutdown complete");
    Ok(())
}
