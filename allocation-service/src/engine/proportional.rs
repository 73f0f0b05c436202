use meter_ledger::{
    domain::{MeterId, Period, PropertyId},
    MeterStore, Result,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    consumption::SubmeterConsumption, round_cents, Allocation, AllocationEngine,
    CostDistributionResult, COST_DECIMAL_PLACES,
};

/// How per-submeter rounding is reconciled with the total cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Each cost is rounded on its own; the sum may drift from the total by a
    /// few cents.
    #[default]
    Independent,
    /// Costs are floored to cents and the leftover cents go to the largest
    /// fractional remainders, so the sum equals the rounded total exactly.
    LargestRemainder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmeterCostShare {
    pub name: String,
    pub meter_id: MeterId,
    pub location: Option<String>,
    pub consumption: Decimal,
    /// Fraction of the submetered total attributed to this submeter.
    pub consumption_share: Decimal,
    /// Part of the unmetered consumption carried by this submeter.
    pub unmetered_share: Decimal,
    pub total_consumption: Decimal,
    pub cost: Decimal,
}

/// Splits `total_cost` across physical submeters by consumption, with the
/// unmetered residual spread in proportion to each submeter's share.
///
/// `submeters` must hold physical submeters only; entries without a meter id
/// are skipped.
pub fn allocate_proportional(
    submeters: &[SubmeterConsumption],
    total_submetered: Decimal,
    unmetered: Option<Decimal>,
    total_cost: Decimal,
    policy: RemainderPolicy,
) -> Vec<SubmeterCostShare> {
    let unmetered = unmetered.unwrap_or(Decimal::ZERO);

    let mut shares: Vec<SubmeterCostShare> = submeters
        .iter()
        .filter(|s| !s.is_virtual)
        .filter_map(|s| {
            let meter_id = s.meter_id?;
            let consumption_share = if total_submetered > Decimal::ZERO {
                s.consumption / total_submetered
            } else {
                Decimal::ZERO
            };
            let unmetered_share = consumption_share * unmetered;
            Some(SubmeterCostShare {
                name: s.name.clone(),
                meter_id,
                location: s.location.clone(),
                consumption: s.consumption,
                consumption_share,
                unmetered_share,
                total_consumption: s.consumption + unmetered_share,
                cost: Decimal::ZERO,
            })
        })
        .collect();

    let grand_total: Decimal = shares.iter().map(|s| s.total_consumption).sum();
    if grand_total <= Decimal::ZERO {
        return shares;
    }

    // ratio first: it is at most 1, so the product cannot overflow
    let exact: Vec<Decimal> = shares
        .iter()
        .map(|s| (s.total_consumption / grand_total) * total_cost)
        .collect();

    match policy {
        RemainderPolicy::Independent => {
            for (share, raw) in shares.iter_mut().zip(&exact) {
                share.cost = round_cents(*raw);
            }
        }
        RemainderPolicy::LargestRemainder => {
            for (share, cost) in shares.iter_mut().zip(largest_remainder(&exact, total_cost)) {
                share.cost = cost;
            }
        }
    }

    shares
}

/// Floors every amount to cents, then hands out the missing cents one at a
/// time in order of decreasing fractional remainder (ties by position).
fn largest_remainder(exact: &[Decimal], total_cost: Decimal) -> Vec<Decimal> {
    let cent = Decimal::new(1, COST_DECIMAL_PLACES);
    let mut costs: Vec<Decimal> = exact
        .iter()
        .map(|raw| raw.round_dp_with_strategy(COST_DECIMAL_PLACES, RoundingStrategy::ToNegativeInfinity))
        .collect();

    let mut order: Vec<usize> = (0..exact.len()).collect();
    order.sort_by(|&a, &b| {
        let rem_a = exact[a] - costs[a];
        let rem_b = exact[b] - costs[b];
        rem_b.cmp(&rem_a).then(a.cmp(&b))
    });

    let allocated: Decimal = costs.iter().sum();
    let mut residue = round_cents(total_cost) - allocated;
    for idx in order {
        if residue < cent {
            break;
        }
        costs[idx] += cent;
        residue -= cent;
    }

    if residue >= cent {
        debug!(residue = %residue, "rounding residue left after one pass");
    }
    costs
}

impl<'a, S: MeterStore> AllocationEngine<'a, S> {
    /// Splits `total_cost` across the property's physical submeters in
    /// proportion to their consumption, the unmetered part included.
    pub fn distribute_proportional(
        &self,
        property_id: PropertyId,
        period: &Period,
        total_cost: Decimal,
    ) -> Result<CostDistributionResult> {
        let summary = self.property_consumption(property_id, period)?;

        let physical: Vec<SubmeterConsumption> = summary.physical_submeters().cloned().collect();
        let submeters = allocate_proportional(
            &physical,
            summary.total_submetered_consumption,
            summary.unmetered_consumption,
            total_cost,
            self.remainder_policy,
        );

        metrics::counter!("distribution_runs_total", "strategy" => "proportional").increment(1);
        debug!(
            property_id = %property_id,
            submeters = submeters.len(),
            policy = ?self.remainder_policy,
            "proportional distribution computed"
        );

        Ok(CostDistributionResult {
            property_id,
            period: *period,
            total_cost,
            main_meter_consumption: summary.main_meter_consumption,
            unmetered_consumption: summary.unmetered_consumption,
            allocation: Allocation::Proportional { submeters },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{absolute_property, period};
    use rust_decimal_macros::dec;

    fn physical(name: &str, id: i64, consumption: Decimal) -> SubmeterConsumption {
        SubmeterConsumption {
            name: name.to_string(),
            meter_id: Some(MeterId(id)),
            location: None,
            consumption,
            is_virtual: false,
        }
    }

    fn costs(shares: &[SubmeterCostShare]) -> Vec<Decimal> {
        shares.iter().map(|s| s.cost).collect()
    }

    #[test]
    fn unmetered_is_spread_by_consumption_share() {
        let (store, property_id) = absolute_property(
            (dec!(0), dec!(1000)),
            &[("sub_a", dec!(0), dec!(300)), ("sub_b", dec!(0), dec!(450))],
        );
        let engine = AllocationEngine::new(&store);
        let result = engine
            .distribute_proportional(property_id, &period(), dec!(500.00))
            .unwrap();

        assert_eq!(result.main_meter_consumption, Some(dec!(1000)));
        assert_eq!(result.unmetered_consumption, Some(dec!(250)));

        let Allocation::Proportional { submeters } = &result.allocation else {
            panic!("expected proportional allocation");
        };
        assert_eq!(submeters.len(), 2);
        assert_eq!(submeters[0].consumption_share, dec!(0.4));
        assert_eq!(submeters[0].unmetered_share, dec!(100));
        assert_eq!(submeters[0].total_consumption, dec!(400));
        assert_eq!(submeters[0].cost, dec!(200.00));
        assert_eq!(submeters[1].unmetered_share, dec!(150));
        assert_eq!(submeters[1].total_consumption, dec!(600));
        assert_eq!(submeters[1].cost, dec!(300.00));
        assert_eq!(result.allocated_total(), dec!(500.00));
    }

    #[test]
    fn two_tenants_share_the_unmetered_remainder() {
        let (store, property_id) = absolute_property(
            (dec!(0), dec!(500)),
            &[("sub_1", dec!(0), dec!(100)), ("sub_2", dec!(0), dec!(150))],
        );
        let engine = AllocationEngine::new(&store);
        let result = engine
            .distribute_proportional(property_id, &period(), dec!(500.00))
            .unwrap();

        assert_eq!(result.unmetered_consumption, Some(dec!(250)));
        let Allocation::Proportional { submeters } = &result.allocation else {
            panic!("expected proportional allocation");
        };
        let totals: Vec<_> = submeters.iter().map(|s| s.total_consumption).collect();
        assert_eq!(totals, vec![dec!(200), dec!(300)]);
        assert_eq!(costs(submeters), vec![dec!(200.00), dec!(300.00)]);
    }

    #[test]
    fn large_costs_do_not_overflow() {
        let subs = [physical("a", 1, dec!(1000000000))];
        let total_cost = dec!(100000000000000000000);
        let shares = allocate_proportional(&subs, dec!(1000000000), None, total_cost, RemainderPolicy::Independent);
        assert_eq!(costs(&shares), vec![total_cost]);

        let subs = [
            physical("a", 1, dec!(1000000000)),
            physical("b", 2, dec!(3000000000)),
        ];
        let shares = allocate_proportional(
            &subs,
            dec!(4000000000),
            Some(dec!(1000000000)),
            total_cost,
            RemainderPolicy::LargestRemainder,
        );
        let total: Decimal = costs(&shares).iter().sum();
        assert_eq!(total, total_cost);
    }

    #[test]
    fn zero_consumption_gives_zero_costs() {
        let subs = [physical("a", 1, dec!(0)), physical("b", 2, dec!(0))];
        let shares = allocate_proportional(
            &subs,
            dec!(0),
            Some(dec!(0)),
            dec!(100),
            RemainderPolicy::Independent,
        );
        assert_eq!(costs(&shares), vec![dec!(0), dec!(0)]);
        assert!(shares.iter().all(|s| s.consumption_share.is_zero()));
    }

    #[test]
    fn unmetered_without_submetered_consumption_is_not_allocated() {
        let subs = [physical("a", 1, dec!(0))];
        let shares = allocate_proportional(
            &subs,
            dec!(0),
            Some(dec!(50)),
            dec!(100),
            RemainderPolicy::Independent,
        );
        assert_eq!(costs(&shares), vec![dec!(0)]);
    }

    #[test]
    fn missing_unmetered_counts_as_zero() {
        let subs = [physical("a", 1, dec!(10)), physical("b", 2, dec!(30))];
        let shares = allocate_proportional(&subs, dec!(40), None, dec!(80), RemainderPolicy::Independent);
        assert_eq!(costs(&shares), vec![dec!(20.00), dec!(60.00)]);
        assert!(shares.iter().all(|s| s.unmetered_share.is_zero()));
    }

    #[test]
    fn independent_rounding_stays_within_a_cent_per_submeter() {
        let subs = [
            physical("a", 1, dec!(1)),
            physical("b", 2, dec!(1)),
            physical("c", 3, dec!(1)),
        ];
        let shares = allocate_proportional(&subs, dec!(3), Some(dec!(0)), dec!(100), RemainderPolicy::Independent);
        assert_eq!(costs(&shares), vec![dec!(33.33), dec!(33.33), dec!(33.33)]);

        let total: Decimal = costs(&shares).iter().sum();
        let drift = (total - dec!(100)).abs();
        assert!(drift <= dec!(0.01) * Decimal::from(shares.len()));
    }

    #[test]
    fn largest_remainder_matches_total_exactly() {
        let subs = [
            physical("a", 1, dec!(1)),
            physical("b", 2, dec!(1)),
            physical("c", 3, dec!(1)),
        ];
        let shares = allocate_proportional(
            &subs,
            dec!(3),
            Some(dec!(0)),
            dec!(100),
            RemainderPolicy::LargestRemainder,
        );
        assert_eq!(costs(&shares), vec![dec!(33.34), dec!(33.33), dec!(33.33)]);

        let subs = [
            physical("a", 1, dec!(2)),
            physical("b", 2, dec!(5)),
            physical("c", 3, dec!(7)),
        ];
        let shares = allocate_proportional(
            &subs,
            dec!(14),
            Some(dec!(3)),
            dec!(99.99),
            RemainderPolicy::LargestRemainder,
        );
        let total: Decimal = costs(&shares).iter().sum();
        assert_eq!(total, dec!(99.99));
    }

    #[test]
    fn largest_remainder_prefers_biggest_fraction() {
        let exact = [dec!(2.504), dec!(7.496)];
        assert_eq!(largest_remainder(&exact, dec!(10)), vec![dec!(2.50), dec!(7.50)]);

        let exact = [dec!(3.333), dec!(3.336), dec!(3.331)];
        assert_eq!(
            largest_remainder(&exact, dec!(10)),
            vec![dec!(3.33), dec!(3.34), dec!(3.33)]
        );
    }

    #[test]
    fn virtual_entries_are_ignored() {
        let mut unmetered = physical("_unmetered", 0, dec!(100));
        unmetered.meter_id = None;
        unmetered.is_virtual = true;
        let subs = [physical("a", 1, dec!(100)), unmetered];
        let shares = allocate_proportional(
            &subs,
            dec!(100),
            Some(dec!(100)),
            dec!(10),
            RemainderPolicy::Independent,
        );
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].cost, dec!(10.00));
    }

    #[test]
    fn no_submeters_gives_empty_allocation() {
        let (store, property_id) = absolute_property((dec!(0), dec!(100)), &[]);
        let engine = AllocationEngine::new(&store).with_remainder_policy(RemainderPolicy::LargestRemainder);
        let result = engine
            .distribute_proportional(property_id, &period(), dec!(50))
            .unwrap();
        assert_eq!(result.allocated_total(), dec!(0));
        assert_eq!(result.unmetered_consumption, Some(dec!(100)));
    }

    #[test]
    fn policy_reads_from_config_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: RemainderPolicy,
        }
        let parsed: Wrapper = toml::from_str(r#"policy = "largest_remainder""#).unwrap();
        assert_eq!(parsed.policy, RemainderPolicy::LargestRemainder);
        assert_eq!(RemainderPolicy::default(), RemainderPolicy::Independent);
    }
}
