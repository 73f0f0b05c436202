//! Consumption and cost-allocation engine.
//!
//! Everything here is synchronous arithmetic over a store snapshot. The engine
//! borrows the store, keeps no state between calls and performs no I/O, so the
//! same snapshot always yields the same result.

pub mod consumption;
pub mod formula;
pub mod proportional;
pub mod summary;
pub mod unmetered;

pub use consumption::{ConsumptionMap, ConsumptionSummary, SubmeterConsumption};
pub use formula::{evaluate_formula, weighted_consumption, FormulaShare};
pub use proportional::{allocate_proportional, RemainderPolicy, SubmeterCostShare};
pub use summary::{PropertyReadingSummary, ReadingHistory, SubmeterReading};
pub use unmetered::compute_unmetered;

use meter_ledger::{
    domain::{Period, PropertyId},
    error::NotFound,
    MeterStore, Result,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Costs are rounded to cents with banker's rounding (half to even).
pub const COST_DECIMAL_PLACES: u32 = 2;

pub(crate) fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(COST_DECIMAL_PLACES, RoundingStrategy::MidpointNearestEven)
}

/// How a shared cost was split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Allocation {
    /// One entry per physical submeter with data.
    Proportional { submeters: Vec<SubmeterCostShare> },
    /// One entry per active formula, plus the consumption map the formulas
    /// were evaluated against.
    Formula {
        meter_consumptions: ConsumptionMap,
        shares: Vec<FormulaShare>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostDistributionResult {
    pub property_id: PropertyId,
    pub period: Period,
    pub total_cost: Decimal,
    pub main_meter_consumption: Option<Decimal>,
    pub unmetered_consumption: Option<Decimal>,
    pub allocation: Allocation,
}

impl CostDistributionResult {
    /// Sum of every allocated cost.
    pub fn allocated_total(&self) -> Decimal {
        match &self.allocation {
            Allocation::Proportional { submeters } => submeters.iter().map(|s| s.cost).sum(),
            Allocation::Formula { shares, .. } => shares.iter().map(|s| s.cost).sum(),
        }
    }
}

/// Entry point for every consumption and distribution computation.
pub struct AllocationEngine<'a, S> {
    store: &'a S,
    remainder_policy: RemainderPolicy,
}

impl<'a, S: MeterStore> AllocationEngine<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            remainder_policy: RemainderPolicy::default(),
        }
    }

    pub fn with_remainder_policy(mut self, policy: RemainderPolicy) -> Self {
        self.remainder_policy = policy;
        self
    }

    fn require_property(&self, property_id: PropertyId) -> Result<()> {
        if self.store.has_property(property_id) {
            Ok(())
        } else {
            Err(NotFound::Property(property_id).into())
        }
    }
}
