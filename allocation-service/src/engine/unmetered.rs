use rust_decimal::Decimal;

/// Consumption not attributable to any physical submeter.
///
/// `None` when the main value is unknown: without a baseline there is nothing
/// to infer from, and "unknown" is never replaced by zero. Otherwise
/// `max(0, main - sum(submeters))`. A negative residual means the submeters
/// disagree with the main meter; it is clamped here and callers decide how
/// to surface it.
pub fn compute_unmetered(main: Option<Decimal>, submeters: &[Decimal]) -> Option<Decimal> {
    residual(main, submeters).map(|raw| raw.max(Decimal::ZERO))
}

/// Unclamped `main - sum(submeters)`.
pub(crate) fn residual(main: Option<Decimal>, submeters: &[Decimal]) -> Option<Decimal> {
    let main = main?;
    let submetered: Decimal = submeters.iter().sum();
    Some(main - submetered)
}
