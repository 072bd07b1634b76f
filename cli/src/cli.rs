use clap::Parser;
use market::types::HistoryPeriod;

#[derive(Debug, Parser)]
#[clap(name = "live-market", version)]
pub struct Cli {
    /// Assets to keep live (comma-separated)
    #[clap(long, value_delimiter = ',', default_value = "XLM,USDC")]
    pub assets: Vec<String>,

    /// Look up a swap route from this asset
    #[clap(long, requires = "to")]
    pub from: Option<String>,

    /// Route output asset
    #[clap(long, requires = "amount")]
    pub to: Option<String>,

    /// Route input amount
    #[clap(long, requires = "from")]
    pub amount: Option<String>,

    /// Slippage tolerance (%) for the route lookup
    #[clap(long, default_value = "1.0")]
    pub slippage: f64,

    /// Print historical yield for every asset over this period (1h, 24h, 7d, 30d)
    #[clap(long, value_parser = parse_period)]
    pub history: Option<HistoryPeriod>,

    /// Force JSON log output
    #[clap(long)]
    pub json_logs: bool,
}

impl Cli {
    /// `(from, to, amount)` when a route lookup was requested.
    pub fn route_request(&self) -> Option<(&str, &str, &str)> {
        match (&self.from, &self.to, &self.amount) {
            (Some(f), Some(t), Some(a)) => Some((f, t, a)),
            _ => None,
        }
    }
}

fn parse_period(raw: &str) -> Result<HistoryPeriod, String> {
    HistoryPeriod::parse(raw).ok_or_else(|| format!("unknown period {raw:?}; expected 1h, 24h, 7d or 30d"))
}
