mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use common::logger::{TraceId, init_tracing, root_span};
use market::{HttpMarketSource, LiveMarketClient, MarketView, WsConnector};
use routing::{HttpQuoteSource, RequestCoordinator, RouteOptions, RouteScorer};
use tracing::{Instrument, info, warn};

use crate::cli::Cli;
use crate::config::AppConfig;

/// Log every published view change until the client goes away.
fn spawn_view_logger(mut view: MarketView) {
    tokio::spawn(async move {
        while let Ok(state) = view.changed().await {
            info!(
                connection = state.connection.label(),
                quality = ?state.quality,
                fallback = ?state.fallback_reason,
                assets = state.snapshots.len(),
                error = state.error.as_deref().unwrap_or(""),
                "market view updated"
            );
            for s in state.snapshots.values() {
                tracing::debug!(key = %s.key, apy = s.value, trend = ?s.trend, source = ?s.source, "snapshot");
            }
        }
    });
}

async fn lookup_route(cfg: &AppConfig, cli: &Cli, from: &str, to: &str, amount: &str) -> anyhow::Result<()> {
    let source = Arc::new(HttpQuoteSource::new(cfg.api_base_url.clone())?);
    let coordinator = RequestCoordinator::new(
        source,
        RouteScorer::new(cfg.scorer_config()),
        cfg.coordinator_config(),
    );

    let options = RouteOptions {
        slippage_tolerance_percent: cli.slippage,
        ..Default::default()
    };

    match coordinator.find_route(from, to, amount, options).await {
        Ok(route) => {
            info!(
                output = route.quote.output_amount,
                minimum_received = route.minimum_received,
                impact_pct = route.quote.price_impact_percent,
                score = route.score,
                warning = route.price_impact_warning,
                hops = route.quote.path.len(),
                alternatives = route.alternatives.len(),
                "best route"
            );
            for risk in &route.risks {
                warn!(kind = ?risk.kind, level = ?risk.level, "{}", risk.description);
            }
        }
        Err(e) => warn!(error = %e, "route lookup failed"),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("live-market", cli.json_logs || config::is_production());
    let cfg = AppConfig::from_env();

    let session = root_span("live_market", &TraceId::default());
    async move {
        info!(ws = %cfg.ws_url, api = %cfg.api_base_url, "Starting live market client...");

        let client = LiveMarketClient::spawn(
            cfg.feed_config(),
            Arc::new(WsConnector::new(cfg.ws_url.clone())),
            Arc::new(HttpMarketSource::new(cfg.api_base_url.clone())?),
        );

        spawn_view_logger(client.view());
        client.subscribe(cli.assets.iter().cloned());
        client.open();

        if let Some(period) = cli.history {
            for asset in &cli.assets {
                match client.historical(asset, period).await {
                    Ok(points) => info!(asset = %asset, period = period.as_str(), points = points.len(), "history loaded"),
                    Err(e) => warn!(asset = %asset, error = %e, "history lookup failed"),
                }
            }
        }

        if let Some((from, to, amount)) = cli.route_request() {
            lookup_route(&cfg, &cli, from, to, amount).await?;
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        client.shutdown().await;

        Ok(())
    }
    .instrument(session)
    .await
}
