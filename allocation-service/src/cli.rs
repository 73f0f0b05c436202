//! Command-line surface: argument parsing and dispatch onto the engine.

use std::io::Write;

use anyhow::{anyhow, bail, Context};
use meter_ledger::{
    domain::{MeterId, Period, PropertyId},
    FormulaStore, MeterStore, Page,
};
use rust_decimal::Decimal;
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    engine::{
        AllocationEngine, ConsumptionSummary, CostDistributionResult, PropertyReadingSummary,
        ReadingHistory, RemainderPolicy,
    },
    sources::{SnapshotSource, SourceError},
};

pub const USAGE: &str = "\
usage:
  allocation-service consumption  <property_id> <start> <end>
  allocation-service proportional <property_id> <start> <end> <total_cost>
  allocation-service formula      <property_id> <start> <end> <total_cost>
  allocation-service readings-at  <property_id> <timestamp>
  allocation-service latest       <property_id>
  allocation-service history      <property_id> <meter_id> [limit] [offset]

timestamps are RFC 3339, e.g. 2024-01-01T00:00:00Z";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Consumption {
        property_id: PropertyId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    },
    Proportional {
        property_id: PropertyId,
        start: OffsetDateTime,
        end: OffsetDateTime,
        total_cost: Decimal,
    },
    Formula {
        property_id: PropertyId,
        start: OffsetDateTime,
        end: OffsetDateTime,
        total_cost: Decimal,
    },
    ReadingsAt {
        property_id: PropertyId,
        at: OffsetDateTime,
    },
    Latest {
        property_id: PropertyId,
    },
    History {
        property_id: PropertyId,
        meter_id: MeterId,
        page: Page,
    },
}

/// JSON body printed for a successful command.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Report {
    Consumption(ConsumptionSummary),
    Distribution(CostDistributionResult),
    Readings(Option<PropertyReadingSummary>),
    History(ReadingHistory),
}

fn parse_id(raw: Option<String>, what: &str) -> anyhow::Result<i64> {
    let raw = raw.ok_or_else(|| anyhow!("missing {what}\n\n{USAGE}"))?;
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {what} '{raw}'"))
}

fn parse_ts(raw: Option<String>, what: &str) -> anyhow::Result<OffsetDateTime> {
    let raw = raw.ok_or_else(|| anyhow!("missing {what}\n\n{USAGE}"))?;
    OffsetDateTime::parse(raw.trim(), &Rfc3339).with_context(|| format!("invalid {what} '{raw}'"))
}

fn parse_cost(raw: Option<String>) -> anyhow::Result<Decimal> {
    let raw = raw.ok_or_else(|| anyhow!("missing total_cost\n\n{USAGE}"))?;
    raw.trim()
        .parse()
        .with_context(|| format!("invalid total_cost '{raw}'"))
}

fn parse_usize(raw: Option<String>, what: &str, default: usize) -> anyhow::Result<usize> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {what} '{raw}'")),
    }
}

impl Command {
    /// Parses the arguments that follow the program name.
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let name = args.next().ok_or_else(|| anyhow!("missing command\n\n{USAGE}"))?;

        let command = match name.as_str() {
            "consumption" => Command::Consumption {
                property_id: PropertyId(parse_id(args.next(), "property_id")?),
                start: parse_ts(args.next(), "start")?,
                end: parse_ts(args.next(), "end")?,
            },
            "proportional" => Command::Proportional {
                property_id: PropertyId(parse_id(args.next(), "property_id")?),
                start: parse_ts(args.next(), "start")?,
                end: parse_ts(args.next(), "end")?,
                total_cost: parse_cost(args.next())?,
            },
            "formula" => Command::Formula {
                property_id: PropertyId(parse_id(args.next(), "property_id")?),
                start: parse_ts(args.next(), "start")?,
                end: parse_ts(args.next(), "end")?,
                total_cost: parse_cost(args.next())?,
            },
            "readings-at" => Command::ReadingsAt {
                property_id: PropertyId(parse_id(args.next(), "property_id")?),
                at: parse_ts(args.next(), "timestamp")?,
            },
            "latest" => Command::Latest {
                property_id: PropertyId(parse_id(args.next(), "property_id")?),
            },
            "history" => {
                let property_id = PropertyId(parse_id(args.next(), "property_id")?);
                let meter_id = MeterId(parse_id(args.next(), "meter_id")?);
                let defaults = Page::default();
                Command::History {
                    property_id,
                    meter_id,
                    page: Page {
                        limit: parse_usize(args.next(), "limit", defaults.limit)?,
                        offset: parse_usize(args.next(), "offset", defaults.offset)?,
                    },
                }
            }
            other => bail!("unknown command '{other}'\n\n{USAGE}"),
        };

        if let Some(extra) = args.next() {
            bail!("unexpected argument '{extra}'\n\n{USAGE}");
        }
        Ok(command)
    }

    pub fn property_id(&self) -> PropertyId {
        match self {
            Command::Consumption { property_id, .. }
            | Command::Proportional { property_id, .. }
            | Command::Formula { property_id, .. }
            | Command::ReadingsAt { property_id, .. }
            | Command::Latest { property_id }
            | Command::History { property_id, .. } => *property_id,
        }
    }

    pub fn execute<S>(&self, engine: &AllocationEngine<'_, S>) -> meter_ledger::Result<Report>
    where
        S: MeterStore + FormulaStore,
    {
        match self {
            Command::Consumption {
                property_id,
                start,
                end,
            } => {
                let period = Period::new(*start, *end)?;
                engine
                    .property_consumption(*property_id, &period)
                    .map(Report::Consumption)
            }
            Command::Proportional {
                property_id,
                start,
                end,
                total_cost,
            } => {
                let period = Period::new(*start, *end)?;
                engine
                    .distribute_proportional(*property_id, &period, *total_cost)
                    .map(Report::Distribution)
            }
            Command::Formula {
                property_id,
                start,
                end,
                total_cost,
            } => {
                let period = Period::new(*start, *end)?;
                engine
                    .distribute_by_formula(*property_id, &period, *total_cost)
                    .map(Report::Distribution)
            }
            Command::ReadingsAt { property_id, at } => engine
                .reading_summary_at(*property_id, *at)
                .map(|s| Report::Readings(Some(s))),
            Command::Latest { property_id } => engine
                .latest_reading_summary(*property_id)
                .map(Report::Readings),
            Command::History { meter_id, page, .. } => {
                engine.meter_history(*meter_id, *page).map(Report::History)
            }
        }
    }
}

/// Loads the command's property from `source` and runs the command on it.
pub async fn run(
    source: &dyn SnapshotSource,
    command: &Command,
    policy: RemainderPolicy,
) -> Result<Report, SourceError> {
    let store = source.load(command.property_id()).await?;
    let engine = AllocationEngine::new(&store).with_remainder_policy(policy);
    Ok(command.execute(&engine)?)
}

/// Prints a finished run: the report as pretty JSON on `stdout`, or a ledger
/// failure as `{"error", "message"}` on `stderr`.
///
/// Returns whether the run succeeded. Failures without a ledger condition
/// are handed back as errors and nothing is printed for them.
pub fn write_outcome(
    outcome: Result<Report, SourceError>,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> anyhow::Result<bool> {
    match outcome {
        Ok(report) => {
            serde_json::to_writer_pretty(&mut *stdout, &report)?;
            writeln!(stdout)?;
            Ok(true)
        }
        Err(e) => match e.condition() {
            Some(condition) => {
                let body = serde_json::json!({ "error": condition, "message": e.to_string() });
                serde_json::to_writer_pretty(&mut *stderr, &body)?;
                writeln!(stderr)?;
                Ok(false)
            }
            None => Err(e.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn args(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parses_distribution_commands() {
        let cmd = Command::parse(args("proportional 3 2024-01-01T00:00:00Z 2024-02-01T00:00:00Z 500.00")).unwrap();
        assert_eq!(
            cmd,
            Command::Proportional {
                property_id: PropertyId(3),
                start: datetime!(2024-01-01 00:00:00 UTC),
                end: datetime!(2024-02-01 00:00:00 UTC),
                total_cost: dec!(500.00),
            }
        );
        assert_eq!(cmd.property_id(), PropertyId(3));
    }

    #[test]
    fn history_uses_default_page() {
        let cmd = Command::parse(args("history 1 4")).unwrap();
        assert_eq!(
            cmd,
            Command::History {
                property_id: PropertyId(1),
                meter_id: MeterId(4),
                page: Page::default(),
            }
        );

        let cmd = Command::parse(args("history 1 4 10 20")).unwrap();
        let Command::History { page, .. } = cmd else {
            panic!("expected history command");
        };
        assert_eq!(page, Page { limit: 10, offset: 20 });
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Command::parse(Vec::<String>::new()).is_err());
        assert!(Command::parse(args("teleport 1")).is_err());
        assert!(Command::parse(args("latest one")).is_err());
        assert!(Command::parse(args("latest 1 2")).is_err());
        assert!(Command::parse(args("formula 1 2024-01-01 2024-02-01T00:00:00Z 10")).is_err());
        assert!(Command::parse(args("formula 1 2024-01-01T00:00:00Z 2024-02-01T00:00:00Z")).is_err());
    }

    #[test]
    fn ledger_failures_go_to_stderr_as_json() {
        let err = SourceError::from(meter_ledger::LedgerError::from(
            meter_ledger::error::NotFound::Property(PropertyId(9)),
        ));
        let (mut out, mut errs) = (Vec::new(), Vec::new());
        let succeeded = write_outcome(Err(err), &mut out, &mut errs).unwrap();

        assert!(!succeeded);
        assert!(out.is_empty());
        let body: serde_json::Value = serde_json::from_slice(&errs).unwrap();
        assert_eq!(body["error"], "property_not_found");
    }

    #[test]
    fn other_failures_are_returned_not_printed() {
        let err = SourceError::Database("connection reset".to_string());
        let (mut out, mut errs) = (Vec::new(), Vec::new());
        let err = write_outcome(Err(err), &mut out, &mut errs).unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert!(out.is_empty() && errs.is_empty());
    }

    #[test]
    fn reports_go_to_stdout() {
        let (mut out, mut errs) = (Vec::new(), Vec::new());
        let succeeded = write_outcome(Ok(Report::Readings(None)), &mut out, &mut errs).unwrap();

        assert!(succeeded);
        assert_eq!(String::from_utf8(out).unwrap(), "null\n");
        assert!(errs.is_empty());
    }

    #[test]
    fn inverted_period_is_a_ledger_error() {
        let store = meter_ledger::InMemoryStore::new();
        let engine = AllocationEngine::new(&store);
        let cmd = Command::parse(args("consumption 1 2024-02-01T00:00:00Z 2024-01-01T00:00:00Z")).unwrap();
        let err = cmd.execute(&engine).unwrap_err();
        assert_eq!(err.condition(), "period_inverted");
    }
}
