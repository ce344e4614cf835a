use anyhow::{anyhow, Context, Result};
use cdr_toolkit::analysis::aggregation::{
    aggregate_by_date, coverage_report, duplicate_row_count, find_duplicate_dates,
    high_variability, monthly_seasonality, summarize_by_actor, threshold_share_by_marketplace,
    top_actors_by_count, ActorKey, AggregationPolicy, DatedAggregate,
};
use cdr_toolkit::analysis::arima::ArimaModel;
use cdr_toolkit::analysis::correlation::{
    price_time_correlation, volume_price_correlation, SpearmanResult,
};
use cdr_toolkit::analysis::outliers::iqr_outliers;
use cdr_toolkit::analysis::regression::price_trend;
use cdr_toolkit::analysis::stationarity::adf_test;
use cdr_toolkit::analysis::stats::{describe, modes, price_band_share, yearly_price_stats};
use cdr_toolkit::analysis::volume::volume_by_year;
use cdr_toolkit::analysis::AnalysisError;
use cdr_toolkit::config::Config;
use cdr_toolkit::data::loader::TransactionLoader;
use cdr_toolkit::data::NormalizedTable;
use cdr_toolkit::export::{Metric, ReportWriter};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "config/analysis.yaml";

#[derive(Parser)]
#[command(name = "cdr-toolkit")]
#[command(about = "Price analyses over carbon-removal purchase transactions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    report: Option<Report>,

    /// Transaction CSV export
    #[arg(short, long, env = "CDR_SOURCE", global = true)]
    source: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long, env = "CDR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for the CSV report sections
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// Print results without writing any files
    #[arg(long, global = true)]
    no_export: bool,

    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    /// Price distribution and exclusion counts
    Summary,
    /// Price statistics per announcement year
    Yearly,
    /// Transactions sharing an announcement date
    Duplicates,
    /// Buyer, supplier and marketplace breakdowns
    Actors,
    /// Spearman correlation of price against time
    Correlation,
    /// Linear price trend with a held-out test split
    Regression,
    /// Augmented Dickey-Fuller test on the daily price series
    Stationarity,
    /// ARIMA fit and price forecast
    Forecast,
    /// Average price per month
    Seasonality,
    /// IQR price outliers by marketplace
    Outliers,
    /// Tons purchased per year
    Volume,
    /// Transactions kept at each cleaning stage
    Coverage,
    /// Every report above
    All,
}

impl Report {
    const EACH: [Report; 12] = [
        Report::Summary,
        Report::Yearly,
        Report::Duplicates,
        Report::Actors,
        Report::Correlation,
        Report::Regression,
        Report::Stationarity,
        Report::Forecast,
        Report::Seasonality,
        Report::Outliers,
        Report::Volume,
        Report::Coverage,
    ];

    fn name(&self) -> &'static str {
        match self {
            Report::Summary => "summary",
            Report::Yearly => "yearly",
            Report::Duplicates => "duplicates",
            Report::Actors => "actors",
            Report::Correlation => "correlation",
            Report::Regression => "regression",
            Report::Stationarity => "stationarity",
            Report::Forecast => "forecast",
            Report::Seasonality => "seasonality",
            Report::Outliers => "outliers",
            Report::Volume => "volume",
            Report::Coverage => "coverage",
            Report::All => "all",
        }
    }
}

/// Loaded table plus the settings every report reads.
struct Session {
    config: Config,
    table: NormalizedTable,
    writer: Option<ReportWriter>,
}

impl Session {
    fn export<T: Serialize>(&self, report: Report, section: &str, rows: &[T]) -> Result<()> {
        if let Some(writer) = &self.writer {
            let path = writer
                .write_section(report.name(), section, rows)
                .with_context(|| format!("failed to export {} / {}", report.name(), section))?;
            info!(path = %path.display(), "exported section");
        }
        Ok(())
    }

    fn currency(&self) -> &str {
        self.table.price_label()
    }

    fn daily_series(&self, policy: AggregationPolicy) -> Result<Vec<DatedAggregate>> {
        Ok(aggregate_by_date(&self.table, policy)?)
    }

    fn run(&self, report: Report) -> Result<()> {
        match report {
            Report::Summary => self.summary(),
            Report::Yearly => self.yearly(),
            Report::Duplicates => self.duplicates(),
            Report::Actors => self.actors(),
            Report::Correlation => self.correlation(),
            Report::Regression => self.regression(),
            Report::Stationarity => self.stationarity(),
            Report::Forecast => self.forecast(),
            Report::Seasonality => self.seasonality(),
            Report::Outliers => self.outliers(),
            Report::Volume => self.volume(),
            Report::Coverage => self.coverage(),
            Report::All => {
                for report in Report::EACH {
                    if let Err(err) = self.run(report) {
                        // Analysis errors skip only the affected report.
                        if err.downcast_ref::<AnalysisError>().is_none() {
                            return Err(err);
                        }
                        warn!(report = report.name(), "skipped: {err:#}");
                    }
                }
                Ok(())
            }
        }
    }

    fn summary(&self) -> Result<()> {
        let table = &self.table;
        let exclusions = table.exclusions();
        let failures = table.cell_failures();

        println!("\n=== Transaction Summary ===");
        println!("Rows read: {}", table.raw_row_count());
        println!("Method: {}", table.method());
        println!("Filtered transactions: {}", table.filtered().len());
        println!("Cleaned transactions: {}", table.len());
        println!("Excluded (other method): {}", exclusions.method_filtered_out);
        println!("Excluded (price undefined): {}", exclusions.price_undefined);
        println!("Excluded (non-finite price): {}", exclusions.non_finite);
        if failures.total() > 0 {
            println!(
                "Unparseable cells: {} numbers, {} dates",
                failures.numbers, failures.dates
            );
        }

        let summary = describe(&table.prices())?;
        println!("\nPrice per ton ({}):", self.currency());
        println!("  count:  {}", summary.count);
        println!("  mean:   {:.2}", summary.mean);
        match summary.std {
            Some(std) => println!("  std:    {std:.2}"),
            None => println!("  std:    n/a"),
        }
        println!("  min:    {:.2}", summary.min);
        println!("  25%:    {:.2}", summary.q25);
        println!("  median: {:.2}", summary.median);
        println!("  75%:    {:.2}", summary.q75);
        println!("  max:    {:.2}", summary.max);

        let price_modes = modes(&table.prices(), Some(2));
        let listed: Vec<String> = price_modes.iter().map(|m| format!("{m:.2}")).collect();
        println!("  mode:   {}", listed.join(", "));

        let (low, high) = self.config.analysis.price_band;
        let band = price_band_share(table, low, high);
        println!(
            "\nTransactions between {low} and {high} {}/t: {} of {} ({:.2}%)",
            self.currency(),
            band.in_band,
            band.total_transactions,
            band.percentage
        );

        let counts = vec![
            Metric::new("rows_read", table.raw_row_count()),
            Metric::new("filtered", table.filtered().len()),
            Metric::new("cleaned", table.len()),
            Metric::new("method_filtered_out", exclusions.method_filtered_out),
            Metric::new("price_undefined", exclusions.price_undefined),
            Metric::new("non_finite", exclusions.non_finite),
            Metric::new("unparseable_numbers", failures.numbers),
            Metric::new("unparseable_dates", failures.dates),
        ];
        self.export(Report::Summary, "Exclusions", &counts)?;
        self.export(Report::Summary, "Price Distribution", &[summary])?;
        self.export(Report::Summary, "Price Band", &[band])?;
        self.export(Report::Summary, "Data Subset", &table.subset_rows())?;
        Ok(())
    }

    fn yearly(&self) -> Result<()> {
        let stats = yearly_price_stats(&self.table)?;

        println!("\n=== Price per Ton by Year ({}) ===", self.currency());
        for row in &stats {
            let year = row.year.map_or_else(|| "Overall".to_string(), |y| y.to_string());
            println!(
                "{year}: min {:.2}, max {:.2}, mean {:.2}, median {:.2}, mode {:.2}, priced {}/{} ({:.1}%)",
                row.min,
                row.max,
                row.mean,
                row.median,
                row.mode,
                row.priced_transactions,
                row.total_transactions,
                row.price_coverage() * 100.0
            );
        }

        self.export(Report::Yearly, "Price Stats by Year", &stats)
    }

    fn duplicates(&self) -> Result<()> {
        #[derive(Serialize)]
        struct DuplicateRow<'a> {
            announcement_date: NaiveDate,
            purchaser_name: Option<&'a str>,
            supplier_name: Option<&'a str>,
            marketplace_name: Option<&'a str>,
            tons_purchased: Option<f64>,
            price_usd: Option<f64>,
            price_per_ton: f64,
        }

        let groups = find_duplicate_dates(&self.table);
        let rows = self.table.rows();

        println!("\n=== Duplicate Announcement Dates ===");
        println!(
            "{} dates shared by {} transactions",
            groups.len(),
            duplicate_row_count(&groups)
        );

        let mut listing = Vec::new();
        for group in &groups {
            println!("{}: {} transactions", group.date, group.rows.len());
            for &index in &group.rows {
                let row = &rows[index];
                let t = &row.transaction;
                listing.push(DuplicateRow {
                    announcement_date: group.date,
                    purchaser_name: t.purchaser_name.as_deref(),
                    supplier_name: t.supplier_name.as_deref(),
                    marketplace_name: t.marketplace_name.as_deref(),
                    tons_purchased: t.tons_purchased,
                    price_usd: t.price_usd,
                    price_per_ton: row.price(),
                });
            }
        }

        let merged = self.daily_series(self.config.aggregation.duplicate_policy)?;
        println!("Merged to {} dated points", merged.len());

        self.export(Report::Duplicates, "Duplicate Transactions", &listing)?;
        self.export(Report::Duplicates, "Merged by Date", &merged)?;
        Ok(())
    }

    fn actors(&self) -> Result<()> {
        let settings = &self.config.analysis;

        for key in [ActorKey::Purchaser, ActorKey::Supplier, ActorKey::Marketplace] {
            let label = key.label();
            let summaries = summarize_by_actor(&self.table, key)?;
            println!(
                "\n=== Price per Ton by {label} ({}) ===",
                self.currency()
            );
            for summary in summaries.iter().take(settings.top_n) {
                println!(
                    "{}: mean {:.2} over {} transactions",
                    summary.name, summary.mean_price, summary.transactions
                );
            }

            let volatile = high_variability(&summaries, settings.variability_quantile)?;
            if !volatile.is_empty() {
                let names: Vec<&str> = volatile.iter().map(|s| s.name.as_str()).collect();
                println!("High price variability: {}", names.join(", "));
            }

            let top = top_actors_by_count(&self.table, key, settings.top_n);
            let listed: Vec<String> = top.iter().map(|(n, c)| format!("{n} ({c})")).collect();
            println!("Most active: {}", listed.join(", "));

            self.export(Report::Actors, &format!("{label} summary"), &summaries)?;
            self.export(Report::Actors, &format!("{label} high variability"), &volatile)?;

            if key == ActorKey::Purchaser {
                match volume_price_correlation(&summaries) {
                    Ok(result) => {
                        print_spearman("deal count vs mean price", &result, settings.significance);
                        self.export(Report::Actors, "buyer volume correlation", &[result])?;
                    }
                    Err(err) => warn!("buyer volume correlation skipped: {err}"),
                }
            }
        }

        let shares =
            threshold_share_by_marketplace(&self.table, settings.premium_threshold);
        println!(
            "\nMarketplaces above {} {}/t:",
            settings.premium_threshold,
            self.currency()
        );
        for share in &shares {
            println!(
                "{}: {}/{} ({:.1}%)",
                share.marketplace,
                share.above_threshold,
                share.total_transactions,
                share.share_above_threshold * 100.0
            );
        }
        self.export(Report::Actors, "Marketplace Premium Share", &shares)
    }

    fn correlation(&self) -> Result<()> {
        let result = price_time_correlation(&self.table)?;
        println!("\n=== Spearman Rank Correlation ===");
        print_spearman(
            "days since start vs USD price per ton",
            &result,
            self.config.analysis.significance,
        );
        self.export(Report::Correlation, "Price vs Time", &[result])
    }

    fn regression(&self) -> Result<()> {
        let settings = &self.config.analysis;
        let eval = price_trend(&self.table, settings.test_fraction, settings.split_seed)?;
        let model = &eval.model;

        println!("\n=== Linear Price Trend (USD/t vs days) ===");
        println!("Intercept: {:.4}", model.intercept);
        println!(
            "Slope: {:.6} per day (se {:.6}, p = {:.4})",
            model.slope, model.slope_std_error, model.slope_p_value
        );
        if let Some(r2) = model.r_squared {
            println!("Train R²: {r2:.4}");
        }
        println!("Train/test rows: {}/{}", eval.train_len, eval.test_len);
        println!("Test MSE: {:.4}", eval.mse);
        match eval.test_r_squared {
            Some(r2) => println!("Test R²: {r2:.4}"),
            None => println!("Test R²: undefined"),
        }

        let metrics = vec![
            Metric::new("intercept", model.intercept),
            Metric::new("slope", model.slope),
            Metric::new("slope_std_error", model.slope_std_error),
            Metric::new("slope_p_value", model.slope_p_value),
            Metric::new("train_r_squared", fmt_option(model.r_squared)),
            Metric::new("train_rows", eval.train_len),
            Metric::new("test_rows", eval.test_len),
            Metric::new("test_mse", eval.mse),
            Metric::new("test_r_squared", fmt_option(eval.test_r_squared)),
        ];
        self.export(Report::Regression, "Price Trend", &metrics)
    }

    fn stationarity(&self) -> Result<()> {
        let series = self.daily_series(self.config.aggregation.series_policy)?;
        let prices: Vec<f64> = series.iter().map(|p| p.price).collect();
        let result = adf_test(&prices, self.config.forecast.adf_max_lag)?;
        let alpha = self.config.analysis.significance;

        println!("\n=== Augmented Dickey-Fuller Test ===");
        println!("ADF statistic: {:.4}", result.statistic);
        println!("p-value: {:.4}", result.p_value);
        println!("Lags used: {}, observations: {}", result.used_lag, result.n_obs);
        let cv = result.critical_values;
        println!(
            "Critical values: 1% {:.3}, 5% {:.3}, 10% {:.3}",
            cv.cv_1pct, cv.cv_5pct, cv.cv_10pct
        );
        if result.is_stationary(alpha) {
            println!("The series is stationary at the {alpha} level.");
        } else {
            println!("The series is not stationary at the {alpha} level.");
        }

        let metrics = vec![
            Metric::new("statistic", result.statistic),
            Metric::new("p_value", result.p_value),
            Metric::new("used_lag", result.used_lag),
            Metric::new("n_obs", result.n_obs),
            Metric::new("critical_1pct", cv.cv_1pct),
            Metric::new("critical_5pct", cv.cv_5pct),
            Metric::new("critical_10pct", cv.cv_10pct),
            Metric::new("stationary", result.is_stationary(alpha)),
        ];
        self.export(Report::Stationarity, "ADF Test", &metrics)
    }

    fn forecast(&self) -> Result<()> {
        let settings = &self.config.forecast;
        let series = self.daily_series(self.config.aggregation.series_policy)?;
        let prices: Vec<f64> = series.iter().map(|p| p.price).collect();
        let model = ArimaModel::fit(&prices, settings.order)?;

        println!("\n=== ARIMA Forecast ({}/t) ===", self.currency());
        println!("{}", model.summary());

        let points = model.forecast_points(settings.steps, series.last().map(|p| p.date));
        for point in points.iter().take(5) {
            let date = point.date.map_or_else(|| format!("t+{}", point.step), |d| d.to_string());
            println!("{date}: {:.2}", point.value);
        }
        if points.len() > 5 {
            println!("... {} more steps", points.len() - 5);
        }

        let fit = vec![
            Metric::new("constant", model.constant),
            Metric::new("ar", join_coefficients(&model.ar)),
            Metric::new("ma", join_coefficients(&model.ma)),
            Metric::new("sigma2", model.sigma2),
            Metric::new("log_likelihood", model.log_likelihood),
            Metric::new("aic", model.aic),
            Metric::new("bic", model.bic),
        ];
        self.export(Report::Forecast, "Model", &fit)?;
        self.export(Report::Forecast, "Forecast", &points)?;
        Ok(())
    }

    fn seasonality(&self) -> Result<()> {
        let series = self.daily_series(self.config.aggregation.seasonality_policy)?;
        let monthly = monthly_seasonality(&series)?;
        let prices: Vec<f64> = series.iter().map(|point| point.price).collect();
        let summary = describe(&prices)?;
        let price_modes = modes(&prices, Some(2));

        println!("\n=== Average Price per Month ({}/t) ===", self.currency());
        for month in &monthly {
            println!(
                "{}-{:02}: {:.2} over {} dates",
                month.year, month.month, month.mean_price, month.dates
            );
        }
        println!("Daily prices: {} dates, mean {:.2}", summary.count, summary.mean);

        let round = |value: f64| (value * 100.0).round() / 100.0;
        let mut stats = vec![
            Metric::new("count", summary.count),
            Metric::new("mean", round(summary.mean)),
            Metric::new("std", fmt_option(summary.std.map(round))),
            Metric::new("min", round(summary.min)),
            Metric::new("25%", round(summary.q25)),
            Metric::new("50%", round(summary.median)),
            Metric::new("75%", round(summary.q75)),
            Metric::new("max", round(summary.max)),
        ];
        stats.extend(price_modes.iter().map(|&mode| Metric::new("mode", round(mode))));

        self.export(Report::Seasonality, "Monthly Average", &monthly)?;
        self.export(Report::Seasonality, "Statistical summary", &stats)?;
        Ok(())
    }

    fn outliers(&self) -> Result<()> {
        let report = iqr_outliers(&self.table, self.config.analysis.iqr_multiplier)?;

        println!("\n=== Price Outliers ({}/t) ===", self.currency());
        println!("Q1 {:.2}, Q3 {:.2}", report.q1, report.q3);
        println!("Bounds: [{:.2}, {:.2}]", report.lower, report.upper);
        println!("Outliers: {}", report.outliers.len());
        for outlier in &report.outliers {
            println!("  {:.2} ({})", outlier.price, outlier.marketplace);
        }
        println!(
            "Above {:.2} by marketplace:",
            report.smallest_upper_outlier
        );
        for entry in &report.above_by_marketplace {
            println!("  {}: {}", entry.marketplace, entry.transactions);
        }

        let bounds = vec![
            Metric::new("q1", report.q1),
            Metric::new("q3", report.q3),
            Metric::new("lower", report.lower),
            Metric::new("upper", report.upper),
            Metric::new("smallest_upper_outlier", report.smallest_upper_outlier),
        ];
        self.export(Report::Outliers, "Bounds", &bounds)?;
        self.export(Report::Outliers, "Outliers", &report.outliers)?;
        self.export(
            Report::Outliers,
            "Above Threshold by Marketplace",
            &report.above_by_marketplace,
        )?;
        Ok(())
    }

    fn volume(&self) -> Result<()> {
        let report = volume_by_year(&self.table)?;

        println!("\n=== Tons Purchased per Year ===");
        for year in &report.years {
            println!(
                "{}: total {:.2}, mean {:.2}, median {:.2}, min {:.2}, max {:.2}, {} transactions",
                year.year, year.total, year.mean, year.median, year.min, year.max, year.count
            );
        }
        println!("Overall: {:.2} tons", report.overall_total);
        if report.undated > 0 {
            println!("({} transactions without an announcement date)", report.undated);
        }

        self.export(Report::Volume, "Tons by Year", &report.years)?;
        self.export(
            Report::Volume,
            "Overall",
            &[
                Metric::new("total_tons", report.overall_total),
                Metric::new("undated_transactions", report.undated),
            ],
        )?;
        Ok(())
    }

    fn coverage(&self) -> Result<()> {
        let merged = self.daily_series(self.config.aggregation.duplicate_policy)?;
        let stages = coverage_report(&self.table, merged.len());

        println!("\n=== Transaction Stats ===");
        for stage in &stages {
            println!(
                "{}: {} ({:.1}% of previous, {:.1}% of filtered) - {}",
                stage.stage,
                stage.transactions,
                stage.share_of_previous * 100.0,
                stage.share_of_filtered * 100.0,
                stage.description
            );
        }
        self.export(Report::Coverage, "Transaction Stats", &stages)
    }
}

fn print_spearman(label: &str, result: &SpearmanResult, alpha: f64) {
    println!(
        "{label}: rho = {:.4}, p = {:.4}, n = {}",
        result.coefficient, result.p_value, result.n
    );
    if result.is_significant(alpha) {
        println!("The correlation is statistically significant (p < {alpha}).");
    } else {
        println!("The correlation is not statistically significant (p >= {alpha}).");
    }
}

fn fmt_option(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn join_coefficients(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{v:.6}")).collect();
    parts.join(" ")
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load_or_default(DEFAULT_CONFIG)
            .with_context(|| format!("failed to load config {DEFAULT_CONFIG}"))?,
    };
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    init_logging(&cli)?;
    let config = load_config(&cli)?;

    let source = cli
        .source
        .clone()
        .or_else(|| config.source.path.clone())
        .ok_or_else(|| anyhow!("no source file given; pass --source or set CDR_SOURCE"))?;

    let table = TransactionLoader::load_and_normalize(&source, &config.normalize_options())
        .with_context(|| format!("failed to load {}", source.display()))?;
    info!(
        rows = table.raw_row_count(),
        cleaned = table.len(),
        "transactions ready"
    );

    let writer = (config.output.export && !cli.no_export).then(|| {
        let dir = cli
            .output_dir
            .clone()
            .unwrap_or_else(|| config.output.directory.clone());
        ReportWriter::new(dir)
    });

    let session = Session {
        config,
        table,
        writer,
    };
    session.run(cli.report.unwrap_or(Report::All))?;

    if let Some(writer) = &session.writer {
        info!(dir = %writer.root().display(), "reports written");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
