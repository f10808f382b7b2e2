// Entry point and high-level CLI flow.
//
// Every command runs the same staged pipeline: load the notifications,
// normalize their dates into month periods, aggregate, and then either
// report, forecast the requested keys, or export the consolidated rates.
// Load failures are reported and the stage continues with an empty table.
mod aggregate;
mod config;
mod error;
mod forecast;
mod loader;
mod normalize;
mod output;
mod reports;
mod types;
mod util;

use aggregate::{aggregate, aggregate_with_population, rank_series, RateAggregation};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::PipelineConfig;
use error::{PipelineError, PipelineResult};
use forecast::{forecast, ForecastOutcome, PolynomialTrend, TrendModel};
use loader::{LoadReport, PopulationReport};
use normalize::NormalizeReport;
use std::path::PathBuf;
use types::{ConsolidatedRow, GroupKey, PopulationReference, Table};

#[derive(Parser)]
#[command(name = "notif-trends")]
#[command(about = "Monthly notification counts, population rates and trend forecasts", long_about = None)]
struct Cli {
    /// JSON configuration file; flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Notifications file (delimited)
    #[arg(long, global = true)]
    notifications: Option<PathBuf>,
    /// Population reference file (delimited)
    #[arg(long, global = true)]
    population: Option<PathBuf>,
    /// First valid notification date (inclusive, YYYY-MM-DD)
    #[arg(long, global = true)]
    from: Option<NaiveDate>,
    /// Last valid notification date (inclusive, YYYY-MM-DD)
    #[arg(long, global = true)]
    to: Option<NaiveDate>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Descriptive breakdowns: symptoms, regions, demographics, doses, months
    Analyze {
        #[arg(long)]
        top: Option<usize>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Forecast next month's value for the requested series only
    Forecast {
        /// Forecast the total over all regions (default when nothing else is selected)
        #[arg(long)]
        overall: bool,
        /// Forecast specific regions
        #[arg(long = "region")]
        regions: Vec<String>,
        /// Forecast the N regions with the most notifications
        #[arg(long)]
        top: Option<usize>,
        /// Forecast population-adjusted rates instead of counts
        #[arg(long)]
        balanced: bool,
        #[arg(long)]
        scale: Option<f64>,
        #[arg(long)]
        horizon: Option<i64>,
        /// Use a linear trend instead of the quadratic one
        #[arg(long)]
        linear: bool,
    },
    /// Export (region, period, count, population, rate) as CSV
    Consolidate {
        #[arg(long, default_value = "dados_consolidados.csv")]
        out: PathBuf,
        #[arg(long)]
        scale: Option<f64>,
        #[arg(long)]
        top: Option<usize>,
    },
    /// Convert a "Name: 1.234" text listing into the population CSV
    ConvertPopulation {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "municipios_populacao.csv")]
        out: PathBuf,
    },
}

/// Normalized notifications plus the diagnostics of each stage.
struct Prepared {
    data: Table,
    load: LoadReport,
    normalize: NormalizeReport,
}

fn prepare(cfg: &PipelineConfig) -> PipelineResult<Prepared> {
    let (raw, load) = loader::load_table_or_empty(
        &cfg.notifications_path,
        cfg.notifications_delimiter()?,
        "notifications",
    );
    let range = cfg.valid_range()?;
    let (data, normalize) =
        match normalize::normalize(&raw, &cfg.columns.date, &cfg.period_field, &range) {
            Ok(out) => out,
            Err(e) => {
                log::error!("normalization failed: {}", e);
                eprintln!("Normalization failed: {}", e);
                (Table::default(), NormalizeReport::default())
            }
        };
    println!(
        "Processing dataset... ({} rows loaded, {} within {}..={})",
        util::format_int(load.loaded_rows),
        util::format_int(normalize.retained),
        range.min(),
        range.max()
    );
    if load.skipped_rows > 0 {
        println!(
            "Note: {} malformed rows skipped.",
            util::format_int(load.skipped_rows)
        );
    }
    if normalize.unparseable + normalize.out_of_range > 0 {
        println!(
            "Note: {} rows without a valid date, {} outside the date range.",
            util::format_int(normalize.unparseable),
            util::format_int(normalize.out_of_range)
        );
    }
    println!();
    Ok(Prepared { data, load, normalize })
}

fn load_population_or_empty(cfg: &PipelineConfig) -> PipelineResult<PopulationReference> {
    match loader::load_population(&cfg.population_path, cfg.population_delimiter()?) {
        Ok((reference, report)) => {
            let PopulationReport { invalid_population, .. } = report;
            if reference.is_empty() {
                log::warn!("population reference {} has no usable rows", cfg.population_path.display());
            }
            println!(
                "Population reference: {} regions ({} rows without a valid population).",
                util::format_int(reference.len()),
                util::format_int(invalid_population)
            );
            Ok(reference)
        }
        Err(e) => {
            log::error!("population reference unavailable: {}", e);
            eprintln!("Failed to load population reference: {}", e);
            Ok(PopulationReference::new())
        }
    }
}

/// Rates for every region, or `None` after reporting why they could not be
/// computed.
fn population_rates(
    cfg: &PipelineConfig,
    data: &Table,
    population: &PopulationReference,
) -> PipelineResult<Option<RateAggregation>> {
    let scale = cfg.scale()?;
    let region = cfg.columns.region.as_str();
    match aggregate_with_population(data, &[region], &cfg.period_field, population, region, scale) {
        Ok(rates) => {
            if rates.unmatched_rows > 0 {
                println!(
                    "Note: {} notifications from {} regions without population data left out of rates.",
                    util::format_int(rates.unmatched_rows),
                    util::format_int(rates.unmatched_regions.len())
                );
            }
            Ok(Some(rates))
        }
        Err(e @ (PipelineError::Schema { .. } | PipelineError::JoinMismatch { .. })) => {
            log::error!("population rates unavailable: {}", e);
            eprintln!("Population rates unavailable: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn handle_analyze(cfg: &PipelineConfig, out_dir: PathBuf) -> PipelineResult<()> {
    let prepared = prepare(cfg)?;
    std::fs::create_dir_all(&out_dir)?;
    let overview =
        reports::generate_overview(&prepared.data, &cfg.columns, &cfg.period_field, cfg.top_n);

    let sections = [
        ("symptoms.csv", "Top Symptoms", &overview.symptoms),
        ("regions.csv", "Top Regions by Notifications", &overview.regions),
        ("demographics.csv", "Notifications by Demographic Category", &overview.demographics),
        ("vaccine_doses.csv", "Vaccine Doses", &overview.vaccine_doses),
    ];
    for (file, title, rows) in sections {
        let path = out_dir.join(file);
        if let Err(e) = output::write_csv(&path, rows) {
            eprintln!("Write error: {}", e);
        }
        let note = format!("top {}", cfg.top_n);
        output::preview_table(title, Some(note.as_str()), rows, cfg.top_n);
        println!("(Full table exported to {})\n", path.display());
    }

    let months_path = out_dir.join("months.csv");
    if let Err(e) = output::write_csv(&months_path, &overview.months) {
        eprintln!("Write error: {}", e);
    }
    output::preview_table("Notifications by Month", None, &overview.months, overview.months.len());
    println!("(Full table exported to {})\n", months_path.display());

    let mut rates = None;
    if cfg.scale_factor.is_some() {
        let population = load_population_or_empty(cfg)?;
        rates = population_rates(cfg, &prepared.data, &population)?;
    }
    if let Some(rates) = &rates {
        let ranking = reports::generate_rate_ranking(rates, cfg.top_n);
        let path = out_dir.join("rate_ranking.csv");
        if let Err(e) = output::write_csv(&path, &ranking) {
            eprintln!("Write error: {}", e);
        }
        let note = format!(
            "per {} inhabitants, summed over months",
            util::format_number(cfg.scale()?.value(), 0)
        );
        output::preview_table(
            "Top Regions by Population-Adjusted Rate",
            Some(note.as_str()),
            &ranking,
            cfg.top_n,
        );
        println!("(Full table exported to {})\n", path.display());
    }

    let summary = reports::generate_summary(
        &prepared.load,
        &prepared.normalize,
        &prepared.data,
        &cfg.columns,
        &cfg.period_field,
        rates.as_ref(),
    );
    let summary_path = out_dir.join("summary.json");
    if let Err(e) = output::write_json(&summary_path, &summary) {
        eprintln!("Write error: {}", e);
    }
    println!("Summary Stats ({}):", summary_path.display());
    println!(
        "{{\"regions\": {}, \"periods\": {}, \"avg_monthly_notifications\": {}}}\n",
        summary.total_regions,
        summary.total_periods,
        util::format_number(summary.avg_monthly_notifications, 2)
    );
    Ok(())
}

struct ForecastRequest {
    overall: bool,
    regions: Vec<String>,
    top: Option<usize>,
    balanced: bool,
    linear: bool,
}

/// Picks the series named by `--top` (largest totals first) and `--region`.
/// Requested regions without a series come back as unavailable outcomes.
fn select_series<'a>(
    series: &'a [types::AggregatedSeries],
    regions: &[String],
    top: Option<usize>,
) -> (Vec<&'a types::AggregatedSeries>, Vec<ForecastOutcome>) {
    let mut selected: Vec<&types::AggregatedSeries> = Vec::new();
    let mut missing = Vec::new();
    if let Some(n) = top {
        selected.extend(rank_series(series).into_iter().take(n));
    }
    for name in regions {
        match series.iter().find(|s| s.key.values().first() == Some(name)) {
            Some(found) => {
                if !selected.iter().any(|s| s.key == found.key) {
                    selected.push(found);
                }
            }
            None => missing.push(ForecastOutcome::Unavailable {
                key: GroupKey::new(vec![name.clone()]),
                reason: "no series for this region".to_string(),
            }),
        }
    }
    (selected, missing)
}

fn handle_forecast(cfg: &PipelineConfig, req: ForecastRequest) -> PipelineResult<()> {
    let prepared = prepare(cfg)?;
    let model: Box<dyn TrendModel> = if req.linear {
        Box::new(PolynomialTrend::linear())
    } else {
        Box::new(PolynomialTrend::quadratic())
    };
    let horizon = cfg.horizon_days;
    let by_region = !req.regions.is_empty() || req.top.is_some();
    let overall = req.overall || !by_region;
    let mut outcomes: Vec<ForecastOutcome> = Vec::new();

    if req.balanced {
        let population = load_population_or_empty(cfg)?;
        match population_rates(cfg, &prepared.data, &population)? {
            Some(rates) => {
                if overall {
                    outcomes.push(forecast(model.as_ref(), &rates.overall, horizon));
                }
                if by_region {
                    let (selected, missing) = select_series(&rates.series, &req.regions, req.top);
                    outcomes.extend(missing);
                    for series in selected {
                        outcomes.push(forecast(model.as_ref(), series, horizon));
                    }
                }
            }
            None => outcomes.push(ForecastOutcome::Unavailable {
                key: GroupKey::all(),
                reason: "population rates unavailable".to_string(),
            }),
        }
    } else {
        if overall {
            match aggregate(&prepared.data, &[], &cfg.period_field)?.into_iter().next() {
                Some(series) => outcomes.push(forecast(model.as_ref(), &series, horizon)),
                None => outcomes.push(ForecastOutcome::Unavailable {
                    key: GroupKey::all(),
                    reason: "no notifications".to_string(),
                }),
            }
        }
        if by_region {
            let region = cfg.columns.region.as_str();
            let series = match aggregate(&prepared.data, &[region], &cfg.period_field) {
                Ok(series) => series,
                Err(e @ PipelineError::Schema { .. }) => {
                    log::error!("region forecasts unavailable: {}", e);
                    eprintln!("Region forecasts unavailable: {}", e);
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            let (selected, missing) = select_series(&series, &req.regions, req.top);
            outcomes.extend(missing);
            for series in selected {
                outcomes.push(forecast(model.as_ref(), series, horizon));
            }
        }
    }

    let rows = reports::forecast_rows(&outcomes);
    let note = format!("{} trend, {} days past the last observed month", model.name(), horizon);
    output::preview_table("Next-Month Forecasts", Some(note.as_str()), &rows, rows.len());
    Ok(())
}

fn handle_consolidate(cfg: &PipelineConfig, out: PathBuf) -> PipelineResult<()> {
    let prepared = prepare(cfg)?;
    let population = load_population_or_empty(cfg)?;
    let rows: Vec<ConsolidatedRow> = match population_rates(cfg, &prepared.data, &population)? {
        Some(rates) => rates.rows,
        None => Vec::new(),
    };
    output::write_csv(&out, &rows)?;
    let reloaded: Vec<ConsolidatedRow> = output::read_csv(&out)?;
    if reloaded != rows {
        return Err(PipelineError::load(&out, "consolidated table did not reload identically"));
    }
    output::preview_table("Consolidated Rates", Some("first rows"), &rows, cfg.top_n);
    println!(
        "File {} written with {} rows.",
        out.display(),
        util::format_int(rows.len())
    );
    Ok(())
}

fn run(cli: Cli) -> PipelineResult<()> {
    let mut cfg = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(p) = cli.notifications {
        cfg.notifications_path = p;
    }
    if let Some(p) = cli.population {
        cfg.population_path = p;
    }
    if let Some(d) = cli.from {
        cfg.valid_from = d;
    }
    if let Some(d) = cli.to {
        cfg.valid_to = d;
    }

    match cli.command {
        Commands::Analyze { top, out_dir } => {
            cfg.top_n = top.unwrap_or(cfg.top_n);
            cfg.validate()?;
            handle_analyze(&cfg, out_dir)
        }
        Commands::Forecast { overall, regions, top, balanced, scale, horizon, linear } => {
            cfg.scale_factor = scale.or(cfg.scale_factor);
            cfg.horizon_days = horizon.unwrap_or(cfg.horizon_days);
            cfg.validate()?;
            handle_forecast(&cfg, ForecastRequest { overall, regions, top, balanced, linear })
        }
        Commands::Consolidate { out, scale, top } => {
            cfg.scale_factor = scale.or(cfg.scale_factor);
            cfg.top_n = top.unwrap_or(cfg.top_n);
            cfg.validate()?;
            handle_consolidate(&cfg, out)
        }
        Commands::ConvertPopulation { input, out } => {
            let report = loader::convert_population_text(&input, &out)?;
            println!(
                "File '{}' created with {} regions ({} lines skipped).",
                out.display(),
                util::format_int(report.written),
                util::format_int(report.skipped_lines)
            );
            Ok(())
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::fit_and_predict;

    #[test]
    fn notifications_flow_from_dates_to_forecast() {
        let raw = Table::from_rows(
            &["municipioNotificacao", "dataNotificacao"],
            vec![
                vec!["A", "2022-01-15"],
                vec!["A", "2022-01-20"],
                vec!["A", "2022-02-10"],
            ],
        );
        let cfg = PipelineConfig::default();
        let range = cfg.valid_range().unwrap();
        let (data, _) = normalize::normalize(&raw, &cfg.columns.date, &cfg.period_field, &range).unwrap();
        let period_col = data.column(&cfg.period_field).unwrap();
        let periods: Vec<&str> = data.rows().map(|r| r[period_col].as_str()).collect();
        assert_eq!(periods, vec!["2022-01", "2022-01", "2022-02"]);

        let series = aggregate(&data, &[cfg.columns.region.as_str()], &cfg.period_field).unwrap();
        assert_eq!(series.len(), 1);
        let points: Vec<(String, f64)> =
            series[0].points().map(|(p, v)| (p.to_string(), v)).collect();
        assert_eq!(points, vec![("2022-01".to_string(), 2.0), ("2022-02".to_string(), 1.0)]);

        let result = fit_and_predict(&series[0], cfg.horizon_days).unwrap();
        assert!(result.value >= 0.0);
    }

    #[test]
    fn balanced_top_regions_follow_summed_rates() {
        let data = Table::from_rows(
            &["region", "period"],
            vec![
                vec!["Big", "2022-01"],
                vec!["Big", "2022-01"],
                vec!["Big", "2022-02"],
                vec!["Small", "2022-01"],
                vec!["Small", "2022-02"],
                vec!["Tiny", "2022-02"],
            ],
        );
        let population: PopulationReference =
            [("Big", 100_000), ("Small", 1_000), ("Tiny", 250)].into_iter().collect();
        let scale = types::ScaleFactor::new(10_000.0).unwrap();
        let rates =
            aggregate_with_population(&data, &["region"], "period", &population, "region", scale)
                .unwrap();

        let (selected, missing) = select_series(&rates.series, &[], Some(2));
        assert!(missing.is_empty());
        let names: Vec<String> = selected.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(names, vec!["Tiny", "Small"]);
        assert!(selected.iter().all(|s| matches!(s.measure, types::Measure::Rate { .. })));

        let outcome = forecast(&PolynomialTrend::quadratic(), selected[1], 30);
        assert!(matches!(outcome, ForecastOutcome::Value(_)));
    }

    #[test]
    fn named_regions_without_series_are_unavailable() {
        let data = Table::from_rows(&["region", "period"], vec![vec!["A", "2022-01"]]);
        let series = aggregate(&data, &["region"], "period").unwrap();
        let (selected, missing) =
            select_series(&series, &["A".to_string(), "Nowhere".to_string()], Some(1));
        assert_eq!(selected.len(), 1);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].key().to_string(), "Nowhere");
    }

    #[test]
    fn cli_parses_forecast_selectors() {
        let cli = Cli::try_parse_from([
            "notif-trends",
            "--from",
            "2022-03-01",
            "forecast",
            "--region",
            "A",
            "--region",
            "B",
            "--balanced",
            "--scale",
            "10000",
        ])
        .unwrap();
        assert_eq!(cli.from, NaiveDate::from_ymd_opt(2022, 3, 1));
        match cli.command {
            Commands::Forecast { regions, balanced, scale, overall, .. } => {
                assert_eq!(regions, vec!["A", "B"]);
                assert!(balanced);
                assert!(!overall);
                assert_eq!(scale, Some(10_000.0));
            }
            _ => panic!("expected the forecast command"),
        }
    }
}
