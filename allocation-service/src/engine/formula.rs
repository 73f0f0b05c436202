use meter_ledger::{
    domain::{CostFormula, FormulaId, FormulaTerms, Period, PropertyId},
    error::PreconditionFailure,
    FormulaStore, MeterStore, Result,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use super::{consumption::ConsumptionMap, round_cents, Allocation, AllocationEngine, CostDistributionResult};

/// Cost of one active formula, with everything needed to recompute it by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormulaShare {
    pub formula_id: FormulaId,
    pub name: String,
    pub description: Option<String>,
    pub terms: FormulaTerms,
    pub weighted_consumption: Decimal,
    pub cost: Decimal,
}

/// `sum(coefficient * consumption)` over the terms. Names missing from the
/// map contribute zero.
pub fn weighted_consumption(terms: &FormulaTerms, consumptions: &ConsumptionMap) -> Decimal {
    terms
        .iter()
        .map(|(key, coefficient)| *coefficient * consumptions.get_or_zero(key))
        .sum()
}

/// `round(total_cost * weighted / main_consumption, 2)`, or zero when the
/// main consumption is not positive.
pub fn evaluate_formula(
    terms: &FormulaTerms,
    consumptions: &ConsumptionMap,
    total_cost: Decimal,
    main_consumption: Decimal,
) -> Decimal {
    if main_consumption <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let weighted = weighted_consumption(terms, consumptions);
    let raw = match total_cost.checked_mul(weighted) {
        Some(product) => product / main_consumption,
        None => (weighted / main_consumption) * total_cost,
    };
    round_cents(raw)
}

fn share_of(
    formula: CostFormula,
    consumptions: &ConsumptionMap,
    total_cost: Decimal,
    main_consumption: Decimal,
) -> FormulaShare {
    let weighted = weighted_consumption(&formula.terms, consumptions);
    let cost = evaluate_formula(&formula.terms, consumptions, total_cost, main_consumption);
    FormulaShare {
        formula_id: formula.id,
        name: formula.name,
        description: formula.description,
        terms: formula.terms,
        weighted_consumption: weighted,
        cost,
    }
}

impl<'a, S: MeterStore + FormulaStore> AllocationEngine<'a, S> {
    /// Prices every active formula of the property against the main meter.
    ///
    /// Formulas are independent: their costs need not add up to `total_cost`.
    pub fn distribute_by_formula(
        &self,
        property_id: PropertyId,
        period: &Period,
        total_cost: Decimal,
    ) -> Result<CostDistributionResult> {
        self.require_property(property_id)?;

        let formulas = self.store.list_formulas(property_id, true);
        if formulas.is_empty() {
            return Err(PreconditionFailure::NoActiveFormulas(property_id).into());
        }

        let summary = self.property_consumption(property_id, period)?;
        let main = summary
            .main_meter_consumption
            .ok_or(PreconditionFailure::MainConsumptionUnavailable)?;
        if main <= Decimal::ZERO {
            return Err(PreconditionFailure::MainConsumptionNotPositive.into());
        }

        let meter_consumptions = summary.consumption_map();
        let shares: Vec<FormulaShare> = formulas
            .into_iter()
            .map(|formula| share_of(formula, &meter_consumptions, total_cost, main))
            .collect();

        metrics::counter!("distribution_runs_total", "strategy" => "formula").increment(1);
        debug!(
            property_id = %property_id,
            formulas = shares.len(),
            main = %main,
            "formula distribution computed"
        );

        Ok(CostDistributionResult {
            property_id,
            period: *period,
            total_cost,
            main_meter_consumption: summary.main_meter_consumption,
            unmetered_consumption: summary.unmetered_consumption,
            allocation: Allocation::Formula {
                meter_consumptions,
                shares,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{absolute_property, period, NOW};
    use meter_ledger::{store::NewFormula, InMemoryStore};
    use rust_decimal_macros::dec;

    fn terms(pairs: &[(&str, &str)]) -> FormulaTerms {
        FormulaTerms::parse(pairs.iter().copied()).unwrap()
    }

    fn add_formula(store: &mut InMemoryStore, property_id: PropertyId, name: &str, pairs: &[(&str, &str)]) -> CostFormula {
        store
            .create_formula(
                NewFormula {
                    property_id,
                    name: name.to_string(),
                    description: None,
                    terms: terms(pairs),
                },
                NOW,
            )
            .unwrap()
    }

    fn sample_map() -> ConsumptionMap {
        [("sub_a", dec!(300)), ("sub_b", dec!(400)), ("_unmetered", dec!(100))]
            .into_iter()
            .collect()
    }

    #[test]
    fn weighted_consumption_with_unmetered_term() {
        let terms = terms(&[("sub_a", "1.0"), ("_unmetered", "0.2")]);
        assert_eq!(weighted_consumption(&terms, &sample_map()), dec!(320));
        assert_eq!(evaluate_formula(&terms, &sample_map(), dec!(800), dec!(800)), dec!(320.00));
    }

    #[test]
    fn half_of_a_submeter_priced_against_main() {
        let map: ConsumptionMap = [("sub_a", dec!(200)), ("_unmetered", dec!(0))].into_iter().collect();
        let terms = terms(&[("sub_a", "0.5")]);
        assert_eq!(evaluate_formula(&terms, &map, dec!(1000), dec!(500)), dec!(200.00));
    }

    #[test]
    fn large_costs_fall_back_to_ratio_first() {
        let map: ConsumptionMap = [("sub_a", dec!(1000000000))].into_iter().collect();
        let terms = terms(&[("sub_a", "1")]);
        let total_cost = dec!(100000000000000000000);
        assert_eq!(
            evaluate_formula(&terms, &map, total_cost, dec!(2000000000)),
            dec!(50000000000000000000)
        );
    }

    #[test]
    fn unknown_meter_contributes_nothing() {
        let terms = terms(&[("sub_a", "1"), ("ghost", "3")]);
        assert_eq!(weighted_consumption(&terms, &sample_map()), dec!(300));
    }

    #[test]
    fn non_positive_main_gives_zero() {
        let terms = terms(&[("sub_a", "1")]);
        assert_eq!(evaluate_formula(&terms, &sample_map(), dec!(100), dec!(0)), dec!(0));
        assert_eq!(evaluate_formula(&terms, &sample_map(), dec!(100), dec!(-5)), dec!(0));
    }

    #[test]
    fn weighted_consumption_is_linear_in_coefficients() {
        let single = terms(&[("sub_a", "0.3"), ("sub_b", "0.7")]);
        let doubled = terms(&[("sub_a", "0.6"), ("sub_b", "1.4")]);
        let map = sample_map();
        assert_eq!(
            weighted_consumption(&doubled, &map),
            weighted_consumption(&single, &map) * dec!(2)
        );
    }

    #[test]
    fn distributes_every_active_formula() {
        let (mut store, property_id) = absolute_property(
            (dec!(1000), dec!(1800)),
            &[("sub_a", dec!(300), dec!(600)), ("sub_b", dec!(500), dec!(900))],
        );
        let tenant = add_formula(&mut store, property_id, "Tenant A", &[("sub_a", "1.0"), ("_unmetered", "0.2")]);
        let retired = add_formula(&mut store, property_id, "Retired", &[("sub_b", "1")]);
        store.deactivate_formula(retired.id).unwrap();

        let engine = AllocationEngine::new(&store);
        let result = engine
            .distribute_by_formula(property_id, &period(), dec!(800))
            .unwrap();

        assert_eq!(result.main_meter_consumption, Some(dec!(800)));
        let Allocation::Formula {
            meter_consumptions,
            shares,
        } = &result.allocation
        else {
            panic!("expected formula allocation");
        };
        assert_eq!(meter_consumptions, &sample_map());
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].formula_id, tenant.id);
        assert_eq!(shares[0].weighted_consumption, dec!(320));
        assert_eq!(shares[0].cost, dec!(320.00));
    }

    #[test]
    fn tenant_with_part_of_a_second_submeter() {
        let (mut store, property_id) = absolute_property(
            (dec!(0), dec!(1000)),
            &[("sub_1", dec!(0), dec!(200)), ("sub_2", dec!(0), dec!(300))],
        );
        add_formula(&mut store, property_id, "Tenant", &[("sub_1", "1.0"), ("sub_2", "0.4")]);

        let engine = AllocationEngine::new(&store);
        let result = engine
            .distribute_by_formula(property_id, &period(), dec!(1000))
            .unwrap();

        let Allocation::Formula { shares, .. } = &result.allocation else {
            panic!("expected formula allocation");
        };
        assert_eq!(shares[0].weighted_consumption, dec!(320));
        assert_eq!(shares[0].cost, dec!(320.00));
    }

    #[test]
    fn formula_costs_need_not_sum_to_total() {
        let (mut store, property_id) =
            absolute_property((dec!(0), dec!(100)), &[("sub_a", dec!(0), dec!(60))]);
        add_formula(&mut store, property_id, "All of A", &[("sub_a", "1")]);
        add_formula(&mut store, property_id, "A again", &[("sub_a", "1")]);

        let engine = AllocationEngine::new(&store);
        let result = engine
            .distribute_by_formula(property_id, &period(), dec!(100))
            .unwrap();
        assert_eq!(result.allocated_total(), dec!(120.00));
    }

    #[test]
    fn requires_active_formulas() {
        let (store, property_id) = absolute_property((dec!(0), dec!(100)), &[]);
        let engine = AllocationEngine::new(&store);
        let err = engine
            .distribute_by_formula(property_id, &period(), dec!(10))
            .unwrap_err();
        assert_eq!(err.condition(), "no_active_formulas");
    }

    #[test]
    fn requires_main_consumption() {
        let mut store = InMemoryStore::new();
        let (property, _) = store.add_property("No readings", None).unwrap();
        add_formula(&mut store, property.id, "Everything", &[("_unmetered", "1")]);

        let engine = AllocationEngine::new(&store);
        let err = engine
            .distribute_by_formula(property.id, &period(), dec!(10))
            .unwrap_err();
        assert_eq!(err.condition(), "main_consumption_unavailable");
    }

    #[test]
    fn requires_positive_main_consumption() {
        let (mut store, property_id) = absolute_property((dec!(50), dec!(50)), &[]);
        add_formula(&mut store, property_id, "Everything", &[("_unmetered", "1")]);

        let engine = AllocationEngine::new(&store);
        let err = engine
            .distribute_by_formula(property_id, &period(), dec!(10))
            .unwrap_err();
        assert_eq!(err.condition(), "main_consumption_not_positive");
    }

    #[test]
    fn unknown_property_checked_before_formulas() {
        let store = InMemoryStore::new();
        let engine = AllocationEngine::new(&store);
        let err = engine
            .distribute_by_formula(PropertyId(42), &period(), dec!(10))
            .unwrap_err();
        assert_eq!(err.condition(), "property_not_found");
    }
}
