use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    AggregatedSeries, ConsolidatedRow, GroupKey, Measure, PeriodKey, PopulationReference,
    ScaleFactor, Table,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Number of records carrying one facet value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetCount {
    pub label: String,
    pub count: usize,
}

/// Population-adjusted aggregation result.
#[derive(Debug, Clone, PartialEq)]
pub struct RateAggregation {
    /// One rate series per matched group, in first-appearance order.
    pub series: Vec<AggregatedSeries>,
    /// Per-period sum of the group rates. This is not a pooled
    /// `total_count / total_population` rate.
    pub overall: AggregatedSeries,
    pub rows: Vec<ConsolidatedRow>,
    /// Records whose region has no population entry.
    pub unmatched_rows: usize,
    pub unmatched_regions: Vec<String>,
}

impl RateAggregation {
    fn empty(measure: Measure) -> Self {
        Self {
            series: Vec::new(),
            overall: AggregatedSeries::new(GroupKey::all(), measure),
            rows: Vec::new(),
            unmatched_rows: 0,
            unmatched_regions: Vec::new(),
        }
    }
}

/// Counts labels while remembering the order each one was first seen.
#[derive(Default)]
struct Tally {
    index: HashMap<String, usize>,
    counts: Vec<FacetCount>,
}

impl Tally {
    fn bump(&mut self, label: &str) {
        match self.index.get(label) {
            Some(&i) => self.counts[i].count += 1,
            None => {
                self.index.insert(label.to_string(), self.counts.len());
                self.counts.push(FacetCount { label: label.to_string(), count: 1 });
            }
        }
    }

    /// Descending by count; `sort_by` is stable so ties keep first-seen order.
    fn ranked(mut self) -> Vec<FacetCount> {
        self.counts.sort_by(|a, b| b.count.cmp(&a.count));
        self.counts
    }
}

fn resolve_columns(table: &Table, fields: &[&str]) -> PipelineResult<Vec<usize>> {
    fields.iter().map(|f| table.require_column(f)).collect()
}

/// Counts records per group-field combination and period.
///
/// Returns one count series per distinct combination, in order of first
/// appearance. With no group fields the single series has the "all regions"
/// key. Empty cells form their own group so no record is lost.
pub fn aggregate(
    table: &Table,
    group_fields: &[&str],
    period_field: &str,
) -> PipelineResult<Vec<AggregatedSeries>> {
    if table.is_empty() {
        return Ok(Vec::new());
    }
    let group_cols = resolve_columns(table, group_fields)?;
    let period_col = table.require_column(period_field)?;

    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut series: Vec<AggregatedSeries> = Vec::new();
    let mut bad_periods = 0usize;
    for row in table.rows() {
        let Ok(period) = row[period_col].parse::<PeriodKey>() else {
            bad_periods += 1;
            continue;
        };
        let key = GroupKey::new(group_cols.iter().map(|&c| row[c].clone()).collect());
        let idx = *index.entry(key.clone()).or_insert_with(|| {
            series.push(AggregatedSeries::new(key, Measure::Count));
            series.len() - 1
        });
        series[idx].add(period, 1.0);
    }

    if bad_periods > 0 {
        log::warn!(
            "skipped {} rows with an invalid '{}' value; normalize the table first",
            bad_periods,
            period_field
        );
    }
    Ok(series)
}

/// Converts per-(group, period) counts into `count / population * scale`.
///
/// `region_field` is added to the group fields when not already present.
/// Groups whose region is absent from `population` are left out of every
/// rate and reported through `unmatched_rows`; when no group matches at all
/// the call fails with [`PipelineError::JoinMismatch`].
pub fn aggregate_with_population(
    table: &Table,
    group_fields: &[&str],
    period_field: &str,
    population: &PopulationReference,
    region_field: &str,
    scale: ScaleFactor,
) -> PipelineResult<RateAggregation> {
    let measure = Measure::Rate { scale: scale.value() };
    let mut result = RateAggregation::empty(measure);
    if table.is_empty() {
        return Ok(result);
    }
    table.require_column(region_field)?;

    let mut fields: Vec<&str> = group_fields.to_vec();
    let region_pos = match fields.iter().position(|f| *f == region_field) {
        Some(pos) => pos,
        None => {
            fields.insert(0, region_field);
            0
        }
    };

    let counts = aggregate(table, &fields, period_field)?;
    let total_groups = counts.len();
    let mut unmatched: HashSet<String> = HashSet::new();
    for count_series in counts {
        let region = count_series
            .key
            .values()
            .get(region_pos)
            .cloned()
            .unwrap_or_default();
        let Some(pop) = population.get(&region) else {
            result.unmatched_rows += count_series.total() as usize;
            if unmatched.insert(region.clone()) {
                result.unmatched_regions.push(region);
            }
            continue;
        };

        let group = (fields.len() > 1).then(|| count_series.key.to_string());
        let mut rates = AggregatedSeries::new(count_series.key.clone(), measure);
        for (period, count) in count_series.points() {
            let rate = scale.rate(count, pop);
            rates.set(period, rate);
            result.overall.add(period, rate);
            result.rows.push(ConsolidatedRow {
                region: region.clone(),
                period,
                count: count as u64,
                population: pop,
                rate,
                group: group.clone(),
            });
        }
        result.series.push(rates);
    }

    if result.series.is_empty() && total_groups > 0 {
        return Err(PipelineError::JoinMismatch { regions: result.unmatched_regions.len() });
    }
    if result.unmatched_rows > 0 {
        log::warn!(
            "{} rows from {} regions have no population entry and were left out of rates",
            result.unmatched_rows,
            result.unmatched_regions.len()
        );
    }
    Ok(result)
}

/// Ranks the distinct values of a single-valued field. Empty cells are not
/// counted.
pub fn value_counts(table: &Table, field: &str) -> PipelineResult<Vec<FacetCount>> {
    if table.is_empty() {
        return Ok(Vec::new());
    }
    let col = table.require_column(field)?;
    let mut tally = Tally::default();
    for row in table.rows() {
        let value = row[col].trim();
        if !value.is_empty() {
            tally.bump(value);
        }
    }
    Ok(tally.ranked())
}

/// Ranks the tags of a comma-separated multi-label field.
///
/// Each record counts once per distinct tag it carries; `"fever,cough"`
/// adds one to both and an empty cell adds nothing.
pub fn tag_counts(table: &Table, field: &str) -> PipelineResult<Vec<FacetCount>> {
    if table.is_empty() {
        return Ok(Vec::new());
    }
    let col = table.require_column(field)?;
    let mut tally = Tally::default();
    let mut seen: HashSet<&str> = HashSet::new();
    for row in table.rows() {
        seen.clear();
        for tag in row[col].split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if seen.insert(tag) {
                tally.bump(tag);
            }
        }
    }
    Ok(tally.ranked())
}

/// Record count per period, in calendar order.
pub fn period_counts(table: &Table, period_field: &str) -> PipelineResult<Vec<(PeriodKey, usize)>> {
    let series = aggregate(table, &[], period_field)?;
    Ok(series
        .first()
        .map(|s| s.points().map(|(p, v)| (p, v as usize)).collect())
        .unwrap_or_default())
}

pub fn top_n(mut ranking: Vec<FacetCount>, n: usize) -> Vec<FacetCount> {
    ranking.truncate(n);
    ranking
}

/// Orders series by descending total, keeping input order for ties.
pub fn rank_series(series: &[AggregatedSeries]) -> Vec<&AggregatedSeries> {
    let mut ranked: Vec<&AggregatedSeries> = series.iter().collect();
    ranked.sort_by(|a, b| b.total().partial_cmp(&a.total()).unwrap_or(Ordering::Equal));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    fn notifications() -> Table {
        Table::from_rows(
            &["region", "period", "symptoms", "race"],
            vec![
                vec!["A", "2022-01", "fever,cough", "Parda"],
                vec!["A", "2022-01", "fever", "Branca"],
                vec!["A", "2022-02", "", "Parda"],
                vec!["B", "2022-01", "cough, headache", ""],
                vec!["C", "2022-03", "headache", "Preta"],
            ],
        )
    }

    fn scale(v: f64) -> ScaleFactor {
        ScaleFactor::new(v).unwrap()
    }

    #[test]
    fn counts_per_region_and_period() {
        let table = Table::from_rows(
            &["region", "period"],
            vec![vec!["A", "2022-01"], vec!["A", "2022-01"], vec!["A", "2022-02"]],
        );
        let series = aggregate(&table, &["region"], "period").unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].key, GroupKey::new(vec!["A".to_string()]));
        assert_eq!(series[0].get(period("2022-01")), Some(2.0));
        assert_eq!(series[0].get(period("2022-02")), Some(1.0));
        assert_eq!(series[0].measure, Measure::Count);
    }

    #[test]
    fn counts_sum_to_row_total() {
        let table = notifications();
        for fields in [&[][..], &["region"][..], &["region", "race"][..]] {
            let series = aggregate(&table, fields, "period").unwrap();
            let total: f64 = series.iter().map(|s| s.total()).sum();
            assert_eq!(total as usize, table.len());
        }
    }

    #[test]
    fn missing_months_stay_absent() {
        let series = aggregate(&notifications(), &["region"], "period").unwrap();
        let c = series.iter().find(|s| s.key.values() == ["C"]).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(period("2022-01")), None);
    }

    #[test]
    fn unknown_group_field_is_a_schema_error_but_empty_input_is_not() {
        assert!(matches!(
            aggregate(&notifications(), &["state"], "period"),
            Err(PipelineError::Schema { .. })
        ));
        assert!(aggregate(&Table::default(), &["state"], "period").unwrap().is_empty());
    }

    #[test]
    fn population_rate_is_count_over_population_times_scale() {
        let table = Table::from_rows(
            &["region", "period"],
            vec![vec!["A", "2022-01"]; 5],
        );
        let population: PopulationReference = [("A", 1000)].into_iter().collect();
        let rates =
            aggregate_with_population(&table, &["region"], "period", &population, "region", scale(10_000.0))
                .unwrap();
        assert_eq!(rates.series[0].get(period("2022-01")), Some(50.0));
        assert_eq!(rates.rows.len(), 1);
        assert_eq!(rates.rows[0].count, 5);
        assert_eq!(rates.rows[0].population, 1000);

        for s in [10_000.0, 100_000.0, 1_000_000.0] {
            let rates =
                aggregate_with_population(&table, &[], "period", &population, "region", scale(s))
                    .unwrap();
            assert_eq!(rates.series[0].get(period("2022-01")), Some(5.0 / 1000.0 * s));
        }
    }

    #[test]
    fn extra_group_fields_stay_distinguishable_in_rows() {
        let population: PopulationReference = [("A", 1000)].into_iter().collect();
        let rates =
            aggregate_with_population(&notifications(), &["race"], "period", &population, "region", scale(10_000.0))
                .unwrap();
        let january: Vec<Option<&str>> = rates
            .rows
            .iter()
            .filter(|r| r.period == period("2022-01"))
            .map(|r| r.group.as_deref())
            .collect();
        assert_eq!(january, vec![Some("A / Parda"), Some("A / Branca")]);
        assert!(rates.rows.iter().all(|r| r.region == "A"));

        let by_region =
            aggregate_with_population(&notifications(), &["region"], "period", &population, "region", scale(10_000.0))
                .unwrap();
        assert!(by_region.rows.iter().all(|r| r.group.is_none()));
    }

    #[test]
    fn unmatched_region_is_excluded_from_rates_but_counted_plainly() {
        let table = notifications();
        let population: PopulationReference = [("A", 1000), ("C", 500)].into_iter().collect();
        let rates =
            aggregate_with_population(&table, &["region"], "period", &population, "region", scale(10_000.0))
                .unwrap();
        assert_eq!(rates.series.len(), 2);
        assert!(rates.series.iter().all(|s| s.key.values() != ["B"]));
        assert_eq!(rates.unmatched_rows, 1);
        assert_eq!(rates.unmatched_regions, vec!["B".to_string()]);

        let counts = aggregate(&table, &["region"], "period").unwrap();
        assert!(counts.iter().any(|s| s.key.values() == ["B"]));
    }

    #[test]
    fn overall_rate_sums_region_rates() {
        let table = Table::from_rows(
            &["region", "period"],
            vec![vec!["A", "2022-01"], vec!["B", "2022-01"], vec!["B", "2022-01"]],
        );
        let population: PopulationReference = [("A", 100), ("B", 1000)].into_iter().collect();
        let rates =
            aggregate_with_population(&table, &["region"], "period", &population, "region", scale(1000.0))
                .unwrap();
        // 1/100*1000 + 2/1000*1000, not 3/1100*1000
        assert_eq!(rates.overall.get(period("2022-01")), Some(10.0 + 2.0));
        assert!(rates.overall.key.is_all());
    }

    #[test]
    fn join_without_any_match_is_an_error() {
        let population: PopulationReference = [("Z", 10)].into_iter().collect();
        let result = aggregate_with_population(
            &notifications(),
            &["region"],
            "period",
            &population,
            "region",
            scale(10_000.0),
        );
        assert!(matches!(result, Err(PipelineError::JoinMismatch { regions: 3 })));
    }

    #[test]
    fn empty_input_yields_empty_rates() {
        let population: PopulationReference = [("A", 10)].into_iter().collect();
        let rates = aggregate_with_population(
            &Table::default(),
            &["region"],
            "period",
            &population,
            "region",
            scale(10_000.0),
        )
        .unwrap();
        assert!(rates.series.is_empty());
        assert!(rates.overall.is_empty());
    }

    #[test]
    fn multi_label_tags_are_expanded() {
        let table = Table::from_rows(
            &["symptoms"],
            vec![vec!["fever,cough"], vec![""], vec!["fever,fever"]],
        );
        let counts = tag_counts(&table, "symptoms").unwrap();
        assert_eq!(
            counts,
            vec![
                FacetCount { label: "fever".to_string(), count: 2 },
                FacetCount { label: "cough".to_string(), count: 1 },
            ]
        );
    }

    #[test]
    fn ties_keep_first_encountered_order() {
        let counts = tag_counts(&notifications(), "symptoms").unwrap();
        let labels: Vec<&str> = counts.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["fever", "cough", "headache"]);

        let races = value_counts(&notifications(), "race").unwrap();
        let labels: Vec<&str> = races.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["Parda", "Branca", "Preta"]);
        assert_eq!(top_n(races, 1).len(), 1);
    }

    #[test]
    fn period_counts_are_in_calendar_order() {
        let counts = period_counts(&notifications(), "period").unwrap();
        assert_eq!(
            counts,
            vec![(period("2022-01"), 3), (period("2022-02"), 1), (period("2022-03"), 1)]
        );
    }

    #[test]
    fn series_ranking_is_stable() {
        let series = aggregate(&notifications(), &["region"], "period").unwrap();
        let ranked: Vec<String> = rank_series(&series).iter().map(|s| s.key.to_string()).collect();
        assert_eq!(ranked, vec!["A", "B", "C"]);
    }
}
