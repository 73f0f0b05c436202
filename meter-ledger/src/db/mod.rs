pub mod ledger_queries;

pub use ledger_queries::{fetch_formulas, fetch_meters, fetch_property, fetch_readings};
