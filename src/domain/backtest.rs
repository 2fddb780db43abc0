//! Backtest engine and event loop.
//!
//! The loop walks the trading days in `[start_date, end_date]`, values the
//! portfolio at each close and rebalances whenever a calendar boundary of the
//! configured frequency is crossed. Every decision on day `t` reads only rows
//! dated at or before `t`.

use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::allocation::{AllocationConstraints, AllocationStrategy};
use super::cache::ArtifactCache;
use super::costs::CostModel;
use super::eligibility::{PitConfig, detect_delistings, eligibility_cached};
use super::error::FactorsimError;
use super::membership::{self, MembershipPolicy};
use super::metrics::PerformanceMetrics;
use super::portfolio::{
    EquityPoint, PortfolioState, RebalanceEvent, RebalanceTrigger, money_to_f64, to_money,
};
use super::preselection::{self, PreselectionConfig};
use super::table::{PriceTable, ReturnTable};

/// Calendar slack allowed between the requested window and the data.
pub const COVERAGE_TOLERANCE_DAYS: i64 = 5;

/// Rounding residue tolerated when fitted trades land a hair below zero cash.
const CASH_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl RebalanceFrequency {
    /// True when `current` lies in a later calendar period than `last`.
    pub fn is_due(&self, last: NaiveDate, current: NaiveDate) -> bool {
        if current <= last {
            return false;
        }
        match self {
            RebalanceFrequency::Daily => true,
            RebalanceFrequency::Weekly => {
                let (a, b) = (last.iso_week(), current.iso_week());
                (a.year(), a.week()) != (b.year(), b.week())
            }
            RebalanceFrequency::Monthly => {
                (last.year(), last.month()) != (current.year(), current.month())
            }
            RebalanceFrequency::Quarterly => {
                (last.year(), last.month0() / 3) != (current.year(), current.month0() / 3)
            }
            RebalanceFrequency::Annual => last.year() != current.year(),
        }
    }
}

impl fmt::Display for RebalanceFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebalanceFrequency::Daily => "daily",
            RebalanceFrequency::Weekly => "weekly",
            RebalanceFrequency::Monthly => "monthly",
            RebalanceFrequency::Quarterly => "quarterly",
            RebalanceFrequency::Annual => "annual",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RebalanceFrequency {
    type Err = FactorsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(RebalanceFrequency::Daily),
            "weekly" => Ok(RebalanceFrequency::Weekly),
            "monthly" => Ok(RebalanceFrequency::Monthly),
            "quarterly" => Ok(RebalanceFrequency::Quarterly),
            "annual" | "annually" | "yearly" => Ok(RebalanceFrequency::Annual),
            other => Err(FactorsimError::invalid(
                "backtest",
                "rebalance_frequency",
                format!("unknown frequency '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    pub frequency: RebalanceFrequency,
    pub costs: CostModel,
    /// Fraction of portfolio value kept in cash at each rebalance.
    pub cash_reserve: f64,
    pub risk_free_rate: f64,
    pub pit: PitConfig,
    pub constraints: AllocationConstraints,
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), FactorsimError> {
        if self.start_date >= self.end_date {
            return Err(FactorsimError::invalid(
                "backtest",
                "start_date",
                format!(
                    "start_date ({}) must be before end_date ({})",
                    self.start_date, self.end_date
                ),
            ));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(FactorsimError::invalid(
                "backtest",
                "initial_capital",
                "initial_capital must be positive",
            ));
        }
        self.costs.validate()?;
        if !(0.0..1.0).contains(&self.cash_reserve) {
            return Err(FactorsimError::invalid(
                "backtest",
                "cash_reserve",
                "cash_reserve must be in [0, 1)",
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(FactorsimError::invalid(
                "backtest",
                "risk_free_rate",
                "risk_free_rate must be finite",
            ));
        }
        if self.pit.min_history_days < 0 || self.pit.delisting_lookforward_days < 0 {
            return Err(FactorsimError::invalid(
                "pit",
                "min_history_days",
                "day counts must be non-negative",
            ));
        }
        if let Some(w) = self.constraints.max_weight {
            if !(w > 0.0 && w <= 1.0) {
                return Err(FactorsimError::invalid(
                    "allocation",
                    "max_weight",
                    "max_weight must be in (0, 1]",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PerformanceMetrics,
    pub rebalances: Vec<RebalanceEvent>,
    pub final_state: PortfolioState,
}

/// Mutable state threaded through the loop.
struct RunState {
    portfolio: PortfolioState,
    /// Latest valid close per asset, as of the current step.
    last_prices: HashMap<String, f64>,
    /// Consecutive executed rebalances each current holding has survived.
    holding_periods: HashMap<String, usize>,
    ledger: Vec<RebalanceEvent>,
}

/// Assets a rebalance may allocate to, plus the holdings it must sell in full.
struct Candidates {
    assets: Vec<String>,
    /// Held assets that failed PIT filtering or have no close on the rebalance date.
    forced_exits: BTreeSet<String>,
}

pub struct BacktestEngine {
    config: BacktestConfig,
    prices: PriceTable,
    returns: ReturnTable,
    strategy: Box<dyn AllocationStrategy>,
    preselection: Option<PreselectionConfig>,
    membership: Option<MembershipPolicy>,
    cache: Option<ArtifactCache>,
}

impl BacktestEngine {
    pub fn new(
        config: BacktestConfig,
        prices: PriceTable,
        strategy: Box<dyn AllocationStrategy>,
    ) -> Result<Self, FactorsimError> {
        config.validate()?;
        let returns = prices.pct_change();
        Ok(Self {
            config,
            prices,
            returns,
            strategy,
            preselection: None,
            membership: None,
            cache: None,
        })
    }

    pub fn with_preselection(mut self, config: PreselectionConfig) -> Result<Self, FactorsimError> {
        config.validate()?;
        self.preselection = Some(config);
        Ok(self)
    }

    pub fn with_membership(mut self, policy: MembershipPolicy) -> Result<Self, FactorsimError> {
        policy.validate()?;
        self.membership = Some(policy);
        Ok(self)
    }

    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run(&self) -> Result<BacktestResult, FactorsimError> {
        self.check_coverage()?;

        let mut state = RunState {
            portfolio: PortfolioState::new(self.config.initial_capital),
            last_prices: HashMap::new(),
            holding_periods: HashMap::new(),
            ledger: Vec::new(),
        };
        let mut equity_curve = Vec::new();
        let mut anchor: Option<NaiveDate> = None;

        info!(
            start = %self.config.start_date,
            end = %self.config.end_date,
            frequency = %self.config.frequency,
            strategy = self.strategy.name(),
            assets = self.prices.assets().len(),
            "starting backtest"
        );

        for (row, &date) in self.prices.dates().iter().enumerate() {
            if date > self.config.end_date {
                break;
            }
            for (col, asset) in self.prices.assets().iter().enumerate() {
                if let Some(price) = self.prices.value(row, col) {
                    state.last_prices.insert(asset.clone(), price);
                }
            }
            if date < self.config.start_date {
                continue;
            }

            match anchor {
                None => {
                    self.rebalance_step(date, RebalanceTrigger::Initial, &mut state)?;
                    anchor = Some(date);
                    equity_curve.push(self.value_point(date, &state));
                }
                Some(last) => {
                    equity_curve.push(self.value_point(date, &state));
                    if self.config.frequency.is_due(last, date) {
                        self.rebalance_step(date, RebalanceTrigger::Scheduled, &mut state)?;
                        anchor = Some(date);
                    }
                }
            }
        }

        let metrics = PerformanceMetrics::compute(
            &equity_curve,
            &state.ledger,
            money_to_f64(self.config.initial_capital),
            self.config.risk_free_rate,
        );
        info!(
            days = equity_curve.len(),
            rebalances = state.ledger.len(),
            final_value = metrics.final_value,
            "backtest complete"
        );

        Ok(BacktestResult {
            equity_curve,
            metrics,
            rebalances: state.ledger,
            final_state: state.portfolio,
        })
    }

    fn value_point(&self, date: NaiveDate, state: &RunState) -> EquityPoint {
        EquityPoint {
            date,
            equity: state.portfolio.total_value(&state.last_prices),
        }
    }

    fn check_coverage(&self) -> Result<(), FactorsimError> {
        let tolerance = Duration::days(COVERAGE_TOLERANCE_DAYS);
        let available = match (self.prices.first_date(), self.prices.last_date()) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ => "no rows".to_string(),
        };
        let starts_in_time = self
            .prices
            .first_date()
            .is_some_and(|first| first <= self.config.start_date + tolerance);
        if !starts_in_time {
            return Err(FactorsimError::Coverage {
                boundary: "start",
                date: self.config.start_date,
                available,
            });
        }
        let ends_in_time = self
            .prices
            .last_date()
            .is_some_and(|last| last >= self.config.end_date - tolerance);
        if !ends_in_time {
            return Err(FactorsimError::Coverage {
                boundary: "end",
                date: self.config.end_date,
                available,
            });
        }
        if self
            .prices
            .between(self.config.start_date, self.config.end_date)
            .is_empty()
        {
            return Err(FactorsimError::Coverage {
                boundary: "start",
                date: self.config.start_date,
                available,
            });
        }
        Ok(())
    }

    /// Run one rebalance. Insufficient history skips it; anything else aborts
    /// the run wrapped with the rebalance date.
    fn rebalance_step(
        &self,
        date: NaiveDate,
        trigger: RebalanceTrigger,
        state: &mut RunState,
    ) -> Result<(), FactorsimError> {
        match self.rebalance(date, trigger, state) {
            Ok(Some(event)) => {
                debug!(
                    %date,
                    %trigger,
                    trades = event.trades.len(),
                    cost = %event.total_cost,
                    "rebalance executed"
                );
                state.ledger.push(event);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) if e.is_insufficient_data() => {
                info!(%date, %trigger, reason = %e, "rebalance skipped");
                Ok(())
            }
            Err(e) => Err(FactorsimError::rebalance(date, e)),
        }
    }

    /// Assets the rebalance may allocate to, after PIT filtering and
    /// preselection. `None` means the rebalance is skipped.
    fn candidate_universe(
        &self,
        date: NaiveDate,
        state: &RunState,
    ) -> Result<Option<Candidates>, FactorsimError> {
        let cache = self.cache.as_ref();
        let tradeable: BTreeSet<String> = self
            .prices
            .assets()
            .iter()
            .filter(|a| self.prices.value_at(date, a).is_some())
            .cloned()
            .collect();

        let mut universe: Vec<String> = self.prices.assets().to_vec();
        if self.config.pit.enabled {
            let mask = eligibility_cached(cache, &self.returns, date, &self.config.pit);
            let delisted = detect_delistings(
                &self.prices.rows_through(date),
                date,
                self.config.pit.delisting_lookforward_days,
            );
            for asset in &delisted {
                if state.portfolio.has_position(asset) {
                    info!(%date, %asset, "holding delisted, liquidating at last price");
                }
            }
            universe.retain(|a| mask.get(a).copied().unwrap_or(false) && !delisted.contains(a));
            if universe.is_empty() {
                info!(%date, "no eligible assets, rebalance skipped");
                return Ok(None);
            }
        }
        universe.retain(|a| tradeable.contains(a));
        let forced_exits: BTreeSet<String> = state
            .portfolio
            .holdings
            .keys()
            .filter(|a| !universe.contains(a))
            .cloned()
            .collect();

        let Some(presel) = &self.preselection else {
            return Ok(Some(Candidates {
                assets: universe,
                forced_exits,
            }));
        };

        let subset = self.returns.select_assets(&universe);
        let scores = preselection::compute_scores_cached(cache, &subset, Some(date), presel)?;
        let ranked = preselection::rank(&scores);
        let selected = match &self.membership {
            Some(policy) => {
                let held: BTreeSet<String> = state.portfolio.holdings.keys().cloned().collect();
                membership::apply(
                    &held,
                    &ranked,
                    policy,
                    Some(&state.holding_periods),
                    presel.top_k,
                )
            }
            None => preselection::select_top_k(&scores, presel.top_k),
        };
        // Protected holdings may have become untradeable or ineligible.
        let allowed: BTreeSet<&String> = universe.iter().collect();
        Ok(Some(Candidates {
            assets: selected.into_iter().filter(|a| allowed.contains(a)).collect(),
            forced_exits,
        }))
    }

    fn rebalance(
        &self,
        date: NaiveDate,
        trigger: RebalanceTrigger,
        state: &mut RunState,
    ) -> Result<Option<RebalanceEvent>, FactorsimError> {
        let Some(candidates) = self.candidate_universe(date, state)? else {
            return Ok(None);
        };

        let history = self
            .returns
            .rows_through(date)
            .select_assets(&candidates.assets);
        let weights = self
            .strategy
            .construct(&history, &self.config.constraints)?;

        // Held assets without a close today trade at their last available price.
        let price_map = &state.last_prices;
        let value_before = state.portfolio.total_value(price_map);
        let investable = value_before * (1.0 - self.config.cash_reserve);

        let mut targets: BTreeMap<String, i64> = BTreeMap::new();
        for (asset, weight) in &weights {
            let Some(price) = self.prices.value_at(date, asset) else {
                continue;
            };
            if price <= 0.0 || *weight <= 0.0 {
                continue;
            }
            let shares = (weight * investable / price).floor() as i64;
            if shares > 0 {
                targets.insert(asset.clone(), shares);
            }
        }

        let mut trades: BTreeMap<String, i64> = BTreeMap::new();
        for (asset, &held) in &state.portfolio.holdings {
            let target = targets.get(asset).copied().unwrap_or(0);
            trades.insert(asset.clone(), target - held);
        }
        for (asset, &target) in &targets {
            trades.entry(asset.clone()).or_insert(target);
        }

        let cash_before = state.portfolio.cash;
        let (trades, costs) = self.config.costs.fit_to_cash(
            trades,
            price_map,
            money_to_f64(cash_before),
            &candidates.forced_exits,
        )?;

        let mut cash_after = cash_before + to_money(costs.cash_delta())?;
        if cash_after < Decimal::ZERO {
            if cash_after > -CASH_DUST {
                cash_after = Decimal::ZERO;
            } else {
                return Err(FactorsimError::Costing {
                    reason: format!("trades would overdraw cash to {cash_after}"),
                });
            }
        }

        let turnover = if value_before > 0.0 {
            (costs.buy_value + costs.sell_value) / value_before
        } else {
            0.0
        };
        let total_cost = to_money(costs.total_cost())?;
        state.portfolio.apply(&trades, cash_after - cash_before);

        state
            .holding_periods
            .retain(|asset, _| state.portfolio.has_position(asset));
        for asset in state.portfolio.holdings.keys() {
            *state.holding_periods.entry(asset.clone()).or_insert(0) += 1;
        }

        if turnover > 1.0 + f64::EPSILON && trigger == RebalanceTrigger::Scheduled {
            warn!(%date, turnover, "turnover above 100% of portfolio value");
        }

        Ok(Some(RebalanceEvent {
            date,
            trigger,
            trades,
            total_cost,
            value_before,
            value_after: state.portfolio.total_value(price_map),
            cash_before,
            cash_after,
            turnover,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::allocation::{EqualWeight, InverseVolatility};
    use crate::domain::table::AssetTable;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn config(start: NaiveDate, end: NaiveDate) -> BacktestConfig {
        BacktestConfig {
            start_date: start,
            end_date: end,
            initial_capital: Decimal::new(100_000, 0),
            frequency: RebalanceFrequency::Monthly,
            costs: CostModel::default(),
            cash_reserve: 0.0,
            risk_free_rate: 0.0,
            pit: PitConfig::default(),
            constraints: AllocationConstraints::default(),
        }
    }

    /// Daily calendar prices from 2024-01-01. `f(asset, day)` returns the close.
    fn prices(days: i64, assets: &[&str], f: impl Fn(usize, i64) -> Option<f64>) -> AssetTable {
        let dates: Vec<NaiveDate> = (0..days).map(|i| d(2024, 1, 1) + Duration::days(i)).collect();
        let columns = assets
            .iter()
            .enumerate()
            .map(|(a, name)| (name.to_string(), (0..days).map(|i| f(a, i)).collect()))
            .collect();
        AssetTable::from_columns(dates, columns).unwrap()
    }

    fn trending(days: i64) -> AssetTable {
        prices(days, &["AAA", "BBB"], |a, i| {
            Some(100.0 + (a as f64 + 1.0) * 0.1 * i as f64)
        })
    }

    #[test]
    fn frequency_boundaries() {
        let f = RebalanceFrequency::Monthly;
        assert!(!f.is_due(d(2024, 1, 5), d(2024, 1, 31)));
        assert!(f.is_due(d(2024, 1, 31), d(2024, 2, 1)));
        let q = RebalanceFrequency::Quarterly;
        assert!(!q.is_due(d(2024, 1, 2), d(2024, 3, 29)));
        assert!(q.is_due(d(2024, 3, 29), d(2024, 4, 1)));
        let w = RebalanceFrequency::Weekly;
        // Friday to Monday crosses an ISO week.
        assert!(w.is_due(d(2024, 1, 5), d(2024, 1, 8)));
        assert!(!w.is_due(d(2024, 1, 8), d(2024, 1, 12)));
        let y = RebalanceFrequency::Annual;
        assert!(y.is_due(d(2023, 12, 29), d(2024, 1, 2)));
        assert!(RebalanceFrequency::Daily.is_due(d(2024, 1, 1), d(2024, 1, 2)));
        assert!(!RebalanceFrequency::Daily.is_due(d(2024, 1, 2), d(2024, 1, 2)));
    }

    #[test]
    fn frequency_parses() {
        assert_eq!(
            "Quarterly".parse::<RebalanceFrequency>().unwrap(),
            RebalanceFrequency::Quarterly
        );
        assert_eq!(
            "yearly".parse::<RebalanceFrequency>().unwrap(),
            RebalanceFrequency::Annual
        );
        assert!("hourly".parse::<RebalanceFrequency>().is_err());
    }

    #[test]
    fn config_validation() {
        let ok = config(d(2024, 1, 1), d(2024, 3, 31));
        assert!(ok.validate().is_ok());
        assert!(config(d(2024, 3, 1), d(2024, 1, 1)).validate().is_err());
        assert!(BacktestConfig {
            initial_capital: Decimal::ZERO,
            ..ok.clone()
        }
        .validate()
        .is_err());
        assert!(BacktestConfig {
            cash_reserve: 1.0,
            ..ok.clone()
        }
        .validate()
        .is_err());
        assert!(BacktestConfig {
            costs: CostModel {
                commission_rate: -0.1,
                ..CostModel::default()
            },
            ..ok
        }
        .validate()
        .is_err());
    }

    #[test]
    fn monthly_run_rebalances_at_each_boundary() {
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 3, 31)),
            trending(91),
            Box::new(EqualWeight),
        )
        .unwrap();
        let result = engine.run().unwrap();
        assert_eq!(result.equity_curve.len(), 91);
        let dates: Vec<NaiveDate> = result.rebalances.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 1), d(2024, 2, 1), d(2024, 3, 1)]);
        assert_eq!(result.rebalances[0].trigger, RebalanceTrigger::Initial);
        assert_eq!(result.metrics.num_rebalances, 3);
    }

    #[test]
    fn initial_rebalance_precedes_first_valuation() {
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 1, 31)),
            trending(31),
            Box::new(EqualWeight),
        )
        .unwrap();
        let result = engine.run().unwrap();
        let first = &result.rebalances[0];
        assert!(first.trades.values().all(|&q| q > 0));
        // With no costs the first point equals the starting capital.
        assert!((result.equity_curve[0].equity - 100_000.0).abs() < 1e-6);
        assert!(result.final_state.position_count() == 2);
    }

    #[test]
    fn cash_never_negative_with_costs() {
        let cfg = BacktestConfig {
            costs: CostModel::new(0.002, 10.0, 15.0).unwrap(),
            frequency: RebalanceFrequency::Weekly,
            ..config(d(2024, 1, 1), d(2024, 3, 31))
        };
        let engine = BacktestEngine::new(cfg, trending(91), Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        assert!(result.rebalances.len() > 10);
        assert!(result.rebalances[0].total_cost > Decimal::ZERO);
        for event in &result.rebalances {
            assert!(event.cash_after >= Decimal::ZERO, "{event:?}");
        }
        assert!(result.final_state.cash >= Decimal::ZERO);
    }

    #[test]
    fn cash_reserve_is_left_uninvested() {
        let cfg = BacktestConfig {
            cash_reserve: 0.2,
            ..config(d(2024, 1, 1), d(2024, 1, 31))
        };
        let engine = BacktestEngine::new(cfg, trending(31), Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        assert!(result.rebalances[0].cash_after >= Decimal::new(20_000, 0));
    }

    #[test]
    fn coverage_failure_names_boundary() {
        let engine = BacktestEngine::new(
            config(d(2023, 12, 1), d(2024, 1, 31)),
            trending(31),
            Box::new(EqualWeight),
        )
        .unwrap();
        match engine.run() {
            Err(FactorsimError::Coverage { boundary, .. }) => assert_eq!(boundary, "start"),
            other => panic!("expected coverage error, got {other:?}"),
        }

        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 6, 30)),
            trending(31),
            Box::new(EqualWeight),
        )
        .unwrap();
        assert!(matches!(
            engine.run(),
            Err(FactorsimError::Coverage { boundary: "end", .. })
        ));
    }

    #[test]
    fn coverage_allows_short_gaps_at_edges() {
        // Data ends on Jan 29; requesting Jan 31 is inside the tolerance.
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 1, 31)),
            trending(29),
            Box::new(EqualWeight),
        )
        .unwrap();
        assert_eq!(engine.run().unwrap().equity_curve.len(), 29);
    }

    #[test]
    fn insufficient_history_skips_but_keeps_schedule() {
        // 40 rows of history needed: January and the Feb 1 rebalance are skipped.
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 3, 31)),
            trending(91),
            Box::new(InverseVolatility { lookback: 40 }),
        )
        .unwrap();
        let result = engine.run().unwrap();
        let dates: Vec<NaiveDate> = result.rebalances.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d(2024, 3, 1)]);
        assert!((result.equity_curve[10].equity - 100_000.0).abs() < 1e-9);
    }

    #[test]
    fn pit_without_eligible_assets_stays_in_cash() {
        let cfg = BacktestConfig {
            pit: PitConfig {
                enabled: true,
                min_history_days: 400,
                min_price_rows: 1,
                delisting_lookforward_days: 0,
            },
            ..config(d(2024, 1, 1), d(2024, 3, 31))
        };
        let engine = BacktestEngine::new(cfg, trending(91), Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        assert!(result.rebalances.is_empty());
        assert!(result
            .equity_curve
            .iter()
            .all(|p| (p.equity - 100_000.0).abs() < 1e-9));
    }

    #[test]
    fn delisted_holding_is_sold_at_last_price() {
        // BBB stops trading after Feb 10, once it has been bought on Feb 1.
        let table = prices(91, &["AAA", "BBB"], |a, i| {
            if a == 1 && i > 40 { None } else { Some(50.0 + i as f64 * 0.1) }
        });
        let cfg = BacktestConfig {
            pit: PitConfig {
                enabled: true,
                min_history_days: 0,
                min_price_rows: 0,
                delisting_lookforward_days: 5,
            },
            ..config(d(2024, 1, 1), d(2024, 3, 31))
        };
        let engine = BacktestEngine::new(cfg, table, Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        // Day one has no return history yet, so nothing is eligible until Feb 1.
        let feb = &result.rebalances[0];
        assert_eq!(feb.date, d(2024, 2, 1));
        let bought = feb.trades["BBB"];
        assert!(bought > 0);

        let mar = &result.rebalances[1];
        assert_eq!(mar.date, d(2024, 3, 1));
        assert_eq!(mar.trades["BBB"], -bought);
        assert!(!result.final_state.has_position("BBB"));
        assert!(result.final_state.has_position("AAA"));
    }

    #[test]
    fn forced_exit_is_not_scaled_when_cash_is_short() {
        // Flat prices; DEL has no close after Jan 20 and the minimum commission
        // forces the AAA rebuy to be scaled down on Feb 1.
        let table = prices(91, &["AAA", "DEL"], |a, i| {
            if a == 1 && i > 19 { None } else { Some(100.0) }
        });
        let cfg = BacktestConfig {
            initial_capital: Decimal::new(10_000, 0),
            costs: CostModel::new(0.0, 100.0, 0.0).unwrap(),
            ..config(d(2024, 1, 1), d(2024, 3, 31))
        };
        let engine = BacktestEngine::new(cfg, table, Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();

        let jan = &result.rebalances[0];
        let held_del = jan.trades["DEL"];
        let held_aaa = jan.trades["AAA"];
        assert!(held_del > 0);

        let feb = &result.rebalances[1];
        assert_eq!(feb.date, d(2024, 2, 1));
        assert_eq!(feb.trades["DEL"], -held_del);
        let full_rebuy = (feb.value_before / 100.0).floor() as i64 - held_aaa;
        assert!(feb.trades["AAA"] < full_rebuy);
        assert!(feb.cash_after >= Decimal::ZERO);

        assert!(!result.final_state.has_position("DEL"));
        assert!(result.rebalances[2..]
            .iter()
            .all(|r| !r.trades.contains_key("DEL")));
    }

    #[test]
    fn untradeable_holding_is_liquidated_without_pit() {
        let table = prices(91, &["AAA", "BBB"], |a, i| {
            if a == 1 && i > 19 { None } else { Some(50.0 + i as f64 * 0.1) }
        });
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 3, 31)),
            table,
            Box::new(EqualWeight),
        )
        .unwrap();
        let result = engine.run().unwrap();
        let feb = result
            .rebalances
            .iter()
            .find(|r| r.date == d(2024, 2, 1))
            .unwrap();
        assert!(feb.trades["BBB"] < 0);
        assert!(!result.final_state.has_position("BBB"));
        // Valuation of the sold position used the last available close.
        assert!(feb.value_before > 0.0);
    }

    #[test]
    fn preselection_narrows_holdings() {
        let table = prices(120, &["AAA", "BBB", "CCC"], |a, i| {
            Some(100.0 * (1.0 + 0.001 * (a as f64 + 1.0)).powi(i as i32))
        });
        let presel = PreselectionConfig {
            top_k: 1,
            lookback: 20,
            skip: 0,
            min_periods: 10,
            ..PreselectionConfig::default()
        };
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 4, 29)),
            table,
            Box::new(EqualWeight),
        )
        .unwrap()
        .with_preselection(presel)
        .unwrap();
        let result = engine.run().unwrap();
        // Not enough rows on Jan 1, so the first executed rebalance is Feb 1.
        assert_eq!(result.rebalances[0].date, d(2024, 2, 1));
        assert_eq!(
            result.final_state.holdings.keys().collect::<Vec<_>>(),
            vec!["CCC"]
        );
    }

    #[test]
    fn daily_run_rebalances_every_row() {
        let cfg = BacktestConfig {
            frequency: RebalanceFrequency::Daily,
            ..config(d(2024, 1, 1), d(2024, 1, 31))
        };
        let engine = BacktestEngine::new(cfg, trending(31), Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        assert_eq!(result.rebalances.len(), 31);
        assert!(result.rebalances[1..]
            .iter()
            .all(|r| r.trigger == RebalanceTrigger::Scheduled));
        assert!(result.rebalances.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn weekly_run_rebalances_on_first_day_of_each_iso_week() {
        let cfg = BacktestConfig {
            frequency: RebalanceFrequency::Weekly,
            ..config(d(2024, 1, 1), d(2024, 3, 31))
        };
        let engine = BacktestEngine::new(cfg, trending(91), Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        // 2024-01-01 is a Monday: thirteen Mondays up to Mar 25.
        assert_eq!(result.rebalances.len(), 13);
        assert!(result
            .rebalances
            .iter()
            .all(|r| r.date.weekday() == chrono::Weekday::Mon));
    }

    #[test]
    fn annual_run_rebalances_at_year_boundary() {
        let dates: Vec<NaiveDate> = (0..62).map(|i| d(2023, 12, 1) + Duration::days(i)).collect();
        let table = AssetTable::from_columns(
            dates,
            vec![
                ("AAA".into(), (0..62).map(|i| Some(100.0 + i as f64)).collect()),
                ("BBB".into(), (0..62).map(|i| Some(50.0 + i as f64)).collect()),
            ],
        )
        .unwrap();
        let cfg = BacktestConfig {
            frequency: RebalanceFrequency::Annual,
            ..config(d(2023, 12, 1), d(2024, 1, 31))
        };
        let engine = BacktestEngine::new(cfg, table, Box::new(EqualWeight)).unwrap();
        let result = engine.run().unwrap();
        let dates: Vec<NaiveDate> = result.rebalances.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d(2023, 12, 1), d(2024, 1, 1)]);
        assert_eq!(result.equity_curve.len(), 62);
    }

    /// Two regimes split at day 60: `early` assets compound at their rate before
    /// it and lose at that rate after; `late` assets do the opposite.
    fn regime_switch(assets: &[&str], rates: &[f64], early: usize) -> AssetTable {
        let rates = rates.to_vec();
        prices(122, assets, move |a, i| {
            let r = rates[a];
            let (before, after) = if a < early { (r, -r) } else { (-r, r) };
            let first = i.min(60) as i32;
            let second = (i - 60).max(0) as i32;
            Some(100.0 * (1.0 + before).powi(first) * (1.0 + after).powi(second))
        })
    }

    fn momentum(top_k: usize) -> PreselectionConfig {
        PreselectionConfig {
            top_k,
            lookback: 20,
            skip: 0,
            min_periods: 10,
            ..PreselectionConfig::default()
        }
    }

    fn holdings(event_date: NaiveDate, result: &BacktestResult) -> Vec<String> {
        // Replays the ledger up to and including `event_date`.
        let mut held: BTreeMap<String, i64> = BTreeMap::new();
        for event in result.rebalances.iter().filter(|r| r.date <= event_date) {
            for (asset, q) in &event.trades {
                *held.entry(asset.clone()).or_insert(0) += q;
            }
        }
        held.into_iter().filter(|(_, q)| *q > 0).map(|(a, _)| a).collect()
    }

    #[test]
    fn young_holdings_survive_a_rank_drop() {
        let table = regime_switch(&["AAA", "BBB", "CCC"], &[0.01, 0.0, 0.01], 1);
        let policy = MembershipPolicy {
            enabled: true,
            min_holding_periods: Some(3),
            ..MembershipPolicy::default()
        };
        let result = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 5, 1)),
            table,
            Box::new(EqualWeight),
        )
        .unwrap()
        .with_preselection(momentum(1))
        .unwrap()
        .with_membership(policy)
        .unwrap()
        .run()
        .unwrap();

        let dates: Vec<NaiveDate> = result.rebalances.iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            vec![d(2024, 2, 1), d(2024, 3, 1), d(2024, 4, 1), d(2024, 5, 1)]
        );
        assert_eq!(holdings(d(2024, 3, 1), &result), vec!["AAA"]);
        // AAA has survived two rebalances, so it is still protected on Apr 1.
        assert_eq!(holdings(d(2024, 4, 1), &result), vec!["AAA", "CCC"]);
        // After a third it may be dropped.
        assert_eq!(holdings(d(2024, 5, 1), &result), vec!["CCC"]);
    }

    #[test]
    fn new_asset_cap_phases_in_the_portfolio() {
        let table = prices(120, &["AAA", "BBB", "CCC"], |a, i| {
            Some(100.0 * (1.0 + 0.001 * (a as f64 + 1.0)).powi(i as i32))
        });
        let policy = MembershipPolicy {
            enabled: true,
            max_new_assets: Some(1),
            ..MembershipPolicy::default()
        };
        let result = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 4, 29)),
            table,
            Box::new(EqualWeight),
        )
        .unwrap()
        .with_preselection(momentum(2))
        .unwrap()
        .with_membership(policy)
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(holdings(d(2024, 2, 1), &result), vec!["CCC"]);
        assert_eq!(holdings(d(2024, 3, 1), &result), vec!["BBB", "CCC"]);
    }

    #[test]
    fn removal_cap_keeps_best_ranked_leaver() {
        let table = regime_switch(
            &["AAA", "BBB", "CCC", "DDD"],
            &[0.01, 0.005, 0.01, 0.005],
            2,
        );
        let policy = MembershipPolicy {
            enabled: true,
            max_removed_assets: Some(1),
            ..MembershipPolicy::default()
        };
        let result = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 4, 29)),
            table,
            Box::new(EqualWeight),
        )
        .unwrap()
        .with_preselection(momentum(2))
        .unwrap()
        .with_membership(policy)
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(holdings(d(2024, 3, 1), &result), vec!["AAA", "BBB"]);
        // Both leave the top two on Apr 1; only AAA, the worse ranked, may go.
        assert_eq!(holdings(d(2024, 4, 1), &result), vec!["BBB", "CCC", "DDD"]);
    }

    #[test]
    fn unexpected_failure_is_wrapped_with_date() {
        let cfg = BacktestConfig {
            constraints: AllocationConstraints {
                max_weight: Some(0.3),
            },
            ..config(d(2024, 1, 1), d(2024, 1, 31))
        };
        let engine = BacktestEngine::new(cfg, trending(31), Box::new(EqualWeight)).unwrap();
        match engine.run() {
            Err(FactorsimError::Rebalance { date, source }) => {
                assert_eq!(date, d(2024, 1, 1));
                assert!(matches!(*source, FactorsimError::ConstraintViolation { .. }));
            }
            other => panic!("expected rebalance error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_preselection_rejected_at_construction() {
        let engine = BacktestEngine::new(
            config(d(2024, 1, 1), d(2024, 1, 31)),
            trending(31),
            Box::new(EqualWeight),
        )
        .unwrap();
        let bad = PreselectionConfig {
            skip: 300,
            ..PreselectionConfig::default()
        };
        assert!(engine.with_preselection(bad).is_err());
    }
}
