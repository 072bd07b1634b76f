//! Route Scorer
//!
//! Turns a raw [`RouteQuote`] into a [`ScoredQuote`]: a weighted score, a
//! list of risk findings, a price-impact warning, the minimum amount received
//! under the caller's slippage tolerance, and the alternatives ranked.
//!
//! ## Score
//!
//! ```text
//! normalized_output = 100 * output / best_output      (0 when best <= 0)
//! impact_term       = max(0, 100 - impact_pct * impact_scale)
//! cost_term         = max(0, 100 - cost_units / cost_divisor)
//!
//! score = w_out  * normalized_output
//!       + w_imp  * impact_term
//!       + w_cost * cost_term
//!       + w_conf * confidence_pct
//! ```
//!
//! `best_output` is the largest output among the quote and its alternatives.
//!
//! ## Ranking
//! Score descending, then lower price impact, then higher confidence.
//!
//! Pure functions only. Nothing here drops or mutates the quote it is given:
//! an impact above the configured maximum raises a warning flag and the
//! quote is still returned.

use std::cmp::Ordering;

use common::RiskLevel;

use crate::types::{RiskFinding, RiskKind, RouteOptions, RouteQuote, ScoredAlternative, ScoredQuote};

#[derive(Clone, Debug, PartialEq)]
pub struct ScoreWeights {
    pub output: f64,
    pub price_impact: f64,
    pub cost: f64,
    pub confidence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            output: 0.4,
            price_impact: 0.3,
            cost: 0.2,
            confidence: 0.1,
        }
    }
}

/// Boundaries for [`RouteScorer::analyze_risks`]. Comparisons are strict.
#[derive(Clone, Debug, PartialEq)]
pub struct RiskThresholds {
    /// Minimum hop liquidity below this is high risk.
    pub liquidity_high: f64,
    /// Minimum hop liquidity below this is medium risk.
    pub liquidity_medium: f64,
    /// Price impact (%) above this is high risk.
    pub impact_high: f64,
    /// Price impact (%) above this is medium risk.
    pub impact_medium: f64,
    /// Slippage tolerance (%) above this is high risk.
    pub slippage_high: f64,
    /// Cost units above this are high risk.
    pub cost_high: f64,
    /// Cost units above this are medium risk.
    pub cost_medium: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            liquidity_high: 10_000.0,
            liquidity_medium: 50_000.0,
            impact_high: 10.0,
            impact_medium: 5.0,
            slippage_high: 3.0,
            cost_high: 500_000.0,
            cost_medium: 200_000.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScorerConfig {
    pub weights: ScoreWeights,
    pub impact_scale: f64,
    pub cost_divisor: f64,

    /// Price impact (%) above which `price_impact_warning` is set.
    pub max_price_impact_percent: f64,

    pub risk: RiskThresholds,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            impact_scale: 10.0,
            cost_divisor: 1_000.0,
            max_price_impact_percent: 15.0,
            risk: RiskThresholds::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RouteScorer {
    config: ScorerConfig,
}

impl RouteScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score `quote` with output normalized against `best_output`.
    pub fn score_against(&self, quote: &RouteQuote, best_output: f64) -> f64 {
        let w = &self.config.weights;

        let normalized_output = if best_output > 0.0 {
            100.0 * quote.output_amount / best_output
        } else {
            0.0
        };
        let impact_term = (100.0 - quote.price_impact_percent * self.config.impact_scale).max(0.0);
        let cost_divisor = if self.config.cost_divisor > 0.0 { self.config.cost_divisor } else { 1.0 };
        let cost_term = (100.0 - quote.estimated_cost_units / cost_divisor).max(0.0);

        w.output * normalized_output
            + w.price_impact * impact_term
            + w.cost * cost_term
            + w.confidence * quote.confidence_percent
    }

    /// Score `quote` within its own candidate set (itself plus alternatives).
    pub fn score(&self, quote: &RouteQuote) -> f64 {
        self.score_against(quote, best_output(quote))
    }

    pub fn analyze_risks(&self, quote: &RouteQuote, slippage_tolerance_percent: f64) -> Vec<RiskFinding> {
        let t = &self.config.risk;
        let mut risks = Vec::new();

        if let Some(liquidity) = quote.min_hop_liquidity() {
            let level = if liquidity < t.liquidity_high {
                Some(RiskLevel::High)
            } else if liquidity < t.liquidity_medium {
                Some(RiskLevel::Medium)
            } else {
                None
            };
            if let Some(level) = level {
                risks.push(RiskFinding {
                    kind: RiskKind::Liquidity,
                    level,
                    description: format!("Thinnest pool on the path holds only {liquidity:.0} in liquidity"),
                });
            }
        }

        let impact = quote.price_impact_percent;
        let impact_level = if impact > t.impact_high {
            Some(RiskLevel::High)
        } else if impact > t.impact_medium {
            Some(RiskLevel::Medium)
        } else {
            None
        };
        if let Some(level) = impact_level {
            risks.push(RiskFinding {
                kind: RiskKind::Price,
                level,
                description: format!("Price impact of {impact:.2}% is significant"),
            });
        }

        if slippage_tolerance_percent > t.slippage_high {
            risks.push(RiskFinding {
                kind: RiskKind::Slippage,
                level: RiskLevel::High,
                description: format!("Slippage tolerance of {slippage_tolerance_percent:.2}% exposes the swap to front-running"),
            });
        }

        let cost = quote.estimated_cost_units;
        let cost_level = if cost > t.cost_high {
            Some(RiskLevel::High)
        } else if cost > t.cost_medium {
            Some(RiskLevel::Medium)
        } else {
            None
        };
        if let Some(level) = cost_level {
            risks.push(RiskFinding {
                kind: RiskKind::Gas,
                level,
                description: format!("Estimated execution cost of {cost:.0} units is high"),
            });
        }

        risks
    }

    /// Score and sort `quotes` best first.
    pub fn rank(&self, quotes: Vec<RouteQuote>, best_output: f64) -> Vec<ScoredAlternative> {
        let mut scored: Vec<ScoredAlternative> = quotes
            .into_iter()
            .map(|quote| ScoredAlternative {
                score: self.score_against(&quote, best_output),
                quote,
            })
            .collect();

        scored.sort_by(|a, b| compare_ranked(a.score, &a.quote, b.score, &b.quote));
        scored
    }

    pub fn evaluate(&self, quote: RouteQuote, options: &RouteOptions) -> ScoredQuote {
        let best = best_output(&quote);
        let score = self.score_against(&quote, best);
        let slippage = options.slippage_tolerance_percent;
        let risks = self.analyze_risks(&quote, slippage);
        let price_impact_warning = quote.price_impact_percent > self.config.max_price_impact_percent;
        let minimum_received = minimum_received(quote.output_amount, slippage);
        let alternatives = self.rank(quote.alternatives.clone(), best);

        if price_impact_warning {
            tracing::warn!(
                impact_pct = quote.price_impact_percent,
                max_pct = self.config.max_price_impact_percent,
                "route price impact above maximum"
            );
        }

        ScoredQuote {
            quote,
            score,
            risks,
            price_impact_warning,
            minimum_received,
            alternatives,
        }
    }
}

/// Largest output among `quote` and its alternatives.
pub fn best_output(quote: &RouteQuote) -> f64 {
    quote
        .alternatives
        .iter()
        .map(|a| a.output_amount)
        .fold(quote.output_amount, f64::max)
}

pub fn minimum_received(output_amount: f64, slippage_tolerance_percent: f64) -> f64 {
    (output_amount * (1.0 - slippage_tolerance_percent / 100.0)).max(0.0)
}

fn compare_ranked(a_score: f64, a: &RouteQuote, b_score: f64, b: &RouteQuote) -> Ordering {
    b_score
        .total_cmp(&a_score)
        .then_with(|| a.price_impact_percent.total_cmp(&b.price_impact_percent))
        .then_with(|| b.confidence_percent.total_cmp(&a.confidence_percent))
}
