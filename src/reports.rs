use crate::aggregate::{period_counts, tag_counts, top_n, value_counts, FacetCount, RateAggregation};
use crate::config::NotificationColumns;
use crate::error::PipelineResult;
use crate::forecast::ForecastOutcome;
use crate::loader::LoadReport;
use crate::normalize::NormalizeReport;
use crate::types::{FacetRow, ForecastRow, MonthRow, RateRankingRow, SummaryStats, Table};
use crate::util::{average, format_int, format_number};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Descriptive breakdowns of the normalized notifications.
#[derive(Debug, Clone, Default)]
pub struct Overview {
    pub symptoms: Vec<FacetRow>,
    pub regions: Vec<FacetRow>,
    pub demographics: Vec<FacetRow>,
    pub vaccine_doses: Vec<FacetRow>,
    pub months: Vec<MonthRow>,
}

fn facet_rows(facet: &str, counts: PipelineResult<Vec<FacetCount>>, limit: usize) -> Vec<FacetRow> {
    match counts {
        Ok(counts) => top_n(counts, limit)
            .into_iter()
            .enumerate()
            .map(|(idx, c)| FacetRow {
                rank: idx + 1,
                label: c.label,
                count: format_int(c.count),
            })
            .collect(),
        Err(e) => {
            log::warn!("{} breakdown skipped: {}", facet, e);
            Vec::new()
        }
    }
}

/// Builds every breakdown independently: a missing column empties only its
/// own breakdown.
pub fn generate_overview(
    data: &Table,
    columns: &NotificationColumns,
    period_field: &str,
    limit: usize,
) -> Overview {
    let months = match period_counts(data, period_field) {
        Ok(counts) => counts
            .into_iter()
            .map(|(period, count)| MonthRow {
                period: period.to_string(),
                count: format_int(count),
            })
            .collect(),
        Err(e) => {
            log::warn!("monthly breakdown skipped: {}", e);
            Vec::new()
        }
    };
    Overview {
        symptoms: facet_rows("symptom", tag_counts(data, &columns.symptoms), limit),
        regions: facet_rows("region", value_counts(data, &columns.region), limit),
        demographics: facet_rows("demographic", value_counts(data, &columns.demographic), limit),
        vaccine_doses: facet_rows("vaccine dose", value_counts(data, &columns.vaccine_dose), limit),
        months,
    }
}

/// Regions ranked by the sum of their monthly rates.
pub fn generate_rate_ranking(rates: &RateAggregation, limit: usize) -> Vec<RateRankingRow> {
    struct Acc {
        region: String,
        population: u64,
        months: usize,
        total_rate: f64,
    }
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut accs: Vec<Acc> = Vec::new();
    for row in &rates.rows {
        let idx = *index.entry(row.region.as_str()).or_insert_with(|| {
            accs.push(Acc {
                region: row.region.clone(),
                population: row.population,
                months: 0,
                total_rate: 0.0,
            });
            accs.len() - 1
        });
        accs[idx].months += 1;
        accs[idx].total_rate += row.rate;
    }

    accs.sort_by(|a, b| b.total_rate.partial_cmp(&a.total_rate).unwrap_or(Ordering::Equal));
    accs.into_iter()
        .take(limit)
        .enumerate()
        .map(|(idx, acc)| RateRankingRow {
            rank: idx + 1,
            region: acc.region,
            population: format_int(acc.population),
            months: acc.months,
            total_rate: format_number(acc.total_rate, 2),
        })
        .collect()
}

pub fn forecast_rows(outcomes: &[ForecastOutcome]) -> Vec<ForecastRow> {
    outcomes
        .iter()
        .map(|outcome| match outcome {
            ForecastOutcome::Value(r) => ForecastRow {
                key: r.key.to_string(),
                measure: r.measure.to_string(),
                last_period: r.last_period.to_string(),
                model: r.model.to_string(),
                forecast: format_number(r.value, 2),
            },
            ForecastOutcome::Unavailable { key, reason } => ForecastRow {
                key: key.to_string(),
                measure: "-".to_string(),
                last_period: "-".to_string(),
                model: "-".to_string(),
                forecast: format!("unavailable ({})", reason),
            },
        })
        .collect()
}

pub fn generate_summary(
    load: &LoadReport,
    normalize: &NormalizeReport,
    data: &Table,
    columns: &NotificationColumns,
    period_field: &str,
    rates: Option<&RateAggregation>,
) -> SummaryStats {
    let total_regions = value_counts(data, &columns.region).map(|c| c.len()).unwrap_or(0);
    let months = period_counts(data, period_field).unwrap_or_default();
    let monthly: Vec<f64> = months.iter().map(|(_, c)| *c as f64).collect();
    SummaryStats {
        loaded_rows: load.loaded_rows,
        skipped_rows: load.skipped_rows,
        normalized_rows: normalize.retained,
        unparseable_dates: normalize.unparseable,
        out_of_range_dates: normalize.out_of_range,
        total_regions,
        total_periods: months.len(),
        first_period: months.first().map(|(p, _)| p.to_string()),
        last_period: months.last().map(|(p, _)| p.to_string()),
        avg_monthly_notifications: average(&monthly),
        unmatched_population_rows: rates.map(|r| r.unmatched_rows),
        unmatched_regions: rates.map(|r| r.unmatched_regions.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate_with_population;
    use crate::forecast::{forecast, PolynomialTrend};
    use crate::types::{AggregatedSeries, GroupKey, Measure, PopulationReference, ScaleFactor};

    fn columns() -> NotificationColumns {
        NotificationColumns {
            region: "region".to_string(),
            date: "date".to_string(),
            symptoms: "symptoms".to_string(),
            demographic: "race".to_string(),
            vaccine_dose: "dose".to_string(),
        }
    }

    fn data() -> Table {
        Table::from_rows(
            &["region", "period", "symptoms", "race"],
            vec![
                vec!["A", "2022-01", "Febre,Tosse", "Parda"],
                vec!["A", "2022-02", "Tosse", "Parda"],
                vec!["B", "2022-02", "Febre", "Branca"],
            ],
        )
    }

    #[test]
    fn overview_degrades_per_facet() {
        let overview = generate_overview(&data(), &columns(), "period", 10);
        assert_eq!(overview.symptoms.len(), 2);
        assert_eq!(overview.regions[0].label, "A");
        assert_eq!(overview.regions[0].count, "2");
        assert_eq!(overview.demographics.len(), 2);
        // no "dose" column in the data
        assert!(overview.vaccine_doses.is_empty());
        assert_eq!(overview.months.len(), 2);
        assert_eq!(overview.months[1].period, "2022-02");
    }

    #[test]
    fn rate_ranking_orders_by_summed_rate() {
        let population: PopulationReference = [("A", 1000), ("B", 10)].into_iter().collect();
        let scale = ScaleFactor::new(100_000.0).unwrap();
        let rates =
            aggregate_with_population(&data(), &["region"], "period", &population, "region", scale)
                .unwrap();
        let ranking = generate_rate_ranking(&rates, 10);
        assert_eq!(ranking[0].region, "B");
        assert_eq!(ranking[0].total_rate, "10,000.00");
        assert_eq!(ranking[1].region, "A");
        assert_eq!(ranking[1].months, 2);
        assert_eq!(generate_rate_ranking(&rates, 1).len(), 1);
    }

    #[test]
    fn unavailable_forecasts_render_distinctly() {
        let mut series = AggregatedSeries::new(GroupKey::all(), Measure::Count);
        series.set("2022-01".parse().unwrap(), 3.0);
        let rows = forecast_rows(&[forecast(&PolynomialTrend::quadratic(), &series, 30)]);
        assert_eq!(rows[0].key, "all regions");
        assert!(rows[0].forecast.starts_with("unavailable"));
    }

    #[test]
    fn summary_counts_regions_and_periods() {
        let load = LoadReport { total_rows: 4, loaded_rows: 4, skipped_rows: 0 };
        let norm = NormalizeReport { input_rows: 4, unparseable: 1, out_of_range: 0, retained: 3 };
        let summary = generate_summary(&load, &norm, &data(), &columns(), "period", None);
        assert_eq!(summary.total_regions, 2);
        assert_eq!(summary.total_periods, 2);
        assert_eq!(summary.first_period.as_deref(), Some("2022-01"));
        assert_eq!(summary.avg_monthly_notifications, 1.5);
        assert_eq!(summary.unparseable_dates, 1);
        assert_eq!(summary.unmatched_population_rows, None);
    }

    #[test]
    fn summary_records_rows_left_out_of_rates() {
        let population: PopulationReference = [("A", 1000)].into_iter().collect();
        let scale = ScaleFactor::new(10_000.0).unwrap();
        let rates =
            aggregate_with_population(&data(), &["region"], "period", &population, "region", scale)
                .unwrap();
        let load = LoadReport { total_rows: 3, loaded_rows: 3, skipped_rows: 0 };
        let norm = NormalizeReport { input_rows: 3, unparseable: 0, out_of_range: 0, retained: 3 };
        let summary =
            generate_summary(&load, &norm, &data(), &columns(), "period", Some(&rates));
        assert_eq!(summary.unmatched_population_rows, Some(1));
        assert_eq!(summary.unmatched_regions, Some(1));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["unmatched_population_rows"], 1);
        assert_eq!(json["unmatched_regions"], 1);
    }
}
