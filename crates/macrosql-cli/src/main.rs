use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

use macrosql_core::{Config, DialectConfig, Diagnostic, DiagnosticCode, Location, Report, Severity};
use macrosql_engine::{Engine, EngineOptions, IntervalContext, RenderFileError, RenderResult, TemplateLayout};

/// macrosql - SQL macro templating
#[derive(Parser)]
#[command(name = "macrosql")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: macrosql.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQL dialect for identifier quoting (overrides the config file)
    #[arg(short, long, global = true)]
    dialect: Option<DialectConfig>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one template and print the SQL
    Render {
        /// Template file
        file: PathBuf,

        /// Interval start (YYYY-MM-DD, YYYY-MM-DD HH:MM:SS or RFC 3339)
        #[arg(long)]
        start: String,

        /// Interval end (defaults to start)
        #[arg(long)]
        end: Option<String>,

        /// Latest available datetime (defaults to end)
        #[arg(long)]
        latest: Option<String>,

        /// Template layout; detected from a MODEL header when omitted
        #[arg(long)]
        layout: Option<TemplateLayout>,

        /// Extra variable as KEY=VALUE; the value is parsed as JSON when possible
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, serde_json::Value)>,

        /// Print the full render result as JSON
        #[arg(long)]
        json: bool,

        /// Abandon the render after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Render every template under a directory and write a report
    Check {
        /// Directory containing .sql templates
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Output file for report.json
        #[arg(short, long, default_value = "report.json")]
        output: PathBuf,

        /// Interval start used for every template
        #[arg(long, default_value = "1970-01-01")]
        start: String,

        /// Interval end (defaults to start)
        #[arg(long)]
        end: Option<String>,

        /// Template layout; detected per file when omitted
        #[arg(long)]
        layout: Option<TemplateLayout>,
    },
}

/// Arguments of the render command
struct RenderArgs {
    file: PathBuf,
    interval: IntervalContext,
    layout: Option<TemplateLayout>,
    json: bool,
    timeout: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_deref(), cli.verbose)?;
    if let Some(dialect) = cli.dialect {
        config.dialect = dialect;
    }

    if cli.verbose {
        eprintln!("{} dialect: {:?}", "Using".cyan(), config.dialect);
    }

    match cli.command {
        Commands::Render { file, start, end, latest, layout, vars, json, timeout_ms } => {
            for (name, value) in vars {
                config.variables.insert(name, value);
            }
            let interval = IntervalContext::parse(&start, end.as_deref(), latest.as_deref())?;
            let args = RenderArgs {
                file,
                interval,
                layout,
                json,
                timeout: timeout_ms.map(Duration::from_millis),
            };
            render_command(&config, args, cli.verbose).await
        }
        Commands::Check { dir, output, start, end, layout } => {
            let interval = IntervalContext::parse(&start, end.as_deref(), None)?;
            check_command(&config, &dir, &output, &interval, layout, cli.verbose)
        }
    }
}

/// Logs go to stderr; `RUST_LOG` wins over `--verbose`
fn init_tracing(verbose: bool) {
    let default = if verbose { "macrosql=debug,macrosql_engine=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    let default_path = Path::new("macrosql.toml");
    let config = if let Some(config_path) = path {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else if default_path.exists() {
        Config::from_file(default_path)?
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };
    Ok(config)
}

/// Parse a `--var KEY=VALUE` argument
fn parse_var(arg: &str) -> Result<(String, serde_json::Value), String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", arg))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{}'", arg));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

/// Render command - expand one template
async fn render_command(config: &Config, args: RenderArgs, verbose: bool) -> Result<()> {
    let engine = Engine::new(EngineOptions::from_config(config)?);
    let template = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read template {}", args.file.display()))?;
    let layout = args.layout.unwrap_or_else(|| TemplateLayout::detect(&template));

    if verbose {
        eprintln!("{} {} ({:?})", "Rendering".cyan(), args.file.display(), layout);
    }

    let task = {
        let template = template.clone();
        let interval = args.interval;
        tokio::task::spawn_blocking(move || engine.render_template(&template, layout, &interval))
    };

    let outcome = match args.timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                tracing::warn!(file = %args.file.display(), ms = limit.as_millis() as u64, "render timed out");
                let diag = Diagnostic::new(
                    DiagnosticCode::RenderTimeout,
                    Severity::Error,
                    format!("Render exceeded the {} ms limit", limit.as_millis()),
                )
                .with_location(Location::new(args.file.display().to_string()));
                print_diagnostic(&diag);
                std::process::exit(1);
            }
        },
        None => task.await?,
    };

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            print_diagnostic(&err.to_diagnostic(&template, Some(&args.file)));
            std::process::exit(1);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.sql);
    }

    if verbose {
        print_render_summary(&result);
    }

    Ok(())
}

/// Check command - render every template under a directory
fn check_command(
    config: &Config,
    dir: &Path,
    output: &Path,
    interval: &IntervalContext,
    layout: Option<TemplateLayout>,
    verbose: bool,
) -> Result<()> {
    let engine = Engine::new(EngineOptions::from_config(config)?);
    let root = if dir.is_relative() {
        config.project_root.join(dir)
    } else {
        dir.to_path_buf()
    };

    if !root.is_dir() {
        return Err(anyhow::anyhow!("Template directory not found: {}", root.display()));
    }

    if verbose {
        eprintln!("{} {}", "Checking templates in:".cyan(), root.display());
    }

    let mut report = Report::new();
    let mut checked = 0;
    let mut skipped = 0;

    let templates = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "sql"));

    for entry in templates {
        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let relative_str = relative.display().to_string();

        if config.skip.is_skipped(&relative_str) {
            skipped += 1;
            if verbose {
                eprintln!("  {} {}", "Skipping".yellow(), relative_str);
            }
            continue;
        }

        if verbose {
            eprintln!("  {} {}...", "Rendering".cyan(), relative_str);
        }
        checked += 1;

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(source) => {
                let err = RenderFileError::Io { path: relative.to_path_buf(), source };
                report.add_diagnostic(apply_severity(config, err.to_diagnostic()));
                continue;
            }
        };

        let file_layout = layout.unwrap_or_else(|| TemplateLayout::detect(&text));
        match engine.render_template(&text, file_layout, interval) {
            Ok(result) => {
                if verbose {
                    eprintln!("    {} ({} passes)", "✓ OK".green(), result.passes);
                }
                report.record_rendered(relative_str, result.fingerprint, result.passes);
            }
            Err(err) => {
                let diag = apply_severity(config, err.to_diagnostic(&text, Some(relative)));
                if verbose {
                    eprintln!("    {} {}", "✗".red(), diag.message);
                }
                report.add_diagnostic(diag);
            }
        }
    }

    if verbose {
        eprintln!();
        eprintln!("Checked {} templates ({} skipped)", checked, skipped);
    }

    report.save_to_file(output)?;

    if verbose {
        eprintln!("{} {}", "Report saved to:".green(), output.display());
    }

    print_report_summary(&report);

    if report.has_errors() {
        std::process::exit(1);
    }

    Ok(())
}

fn apply_severity(config: &Config, mut diag: Diagnostic) -> Diagnostic {
    diag.severity = config.severity.get_severity(diag.code, diag.severity);
    diag
}

fn severity_label(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::Error => "ERROR".red().bold(),
        Severity::Warn => "WARN".yellow().bold(),
        Severity::Info => "INFO".cyan(),
    }
}

/// Print one diagnostic to stderr
fn print_diagnostic(diag: &Diagnostic) {
    eprintln!("[{}] {}: {}", severity_label(diag.severity), diag.code, diag.message);
    if let Some(loc) = &diag.location {
        eprintln!("    at {}", loc);
    }
    if let Some(snippet) = &diag.snippet {
        eprintln!("    | {}", snippet.dimmed());
    }
}

fn print_render_summary(result: &RenderResult) {
    eprintln!();
    eprintln!("{} {:?}", "State:".bold(), result.state);
    eprintln!("{} {}", "Passes:".bold(), result.passes);
    if !result.definitions.is_empty() {
        eprintln!("{} {}", "Definitions:".bold(), result.definitions.join(", "));
    }
    eprintln!("{} {}", "Fingerprint:".bold(), result.fingerprint);
}

/// Diagnostics grouped under their template, then a one-line summary on stdout
fn print_report_summary(report: &Report) {
    let mut current: Option<&str> = None;
    for diag in &report.diagnostics {
        let file = diag.location.as_ref().map(|loc| loc.file.as_str());
        if file != current {
            eprintln!("{}", file.unwrap_or("<project>").bold());
            current = file;
        }
        print_diagnostic(diag);
    }
    println!("{}", summary_line(report));
}

fn summary_line(report: &Report) -> String {
    let summary = &report.summary;
    let status = if report.has_errors() { "FAILED".red().bold() } else { "OK".green().bold() };
    format!(
        "{} {} rendered, {} error(s), {} warning(s), {} info (report v{})",
        status, summary.templates_rendered, summary.errors, summary.warnings, summary.info, report.version
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_counts_renders_and_diagnostics() {
        colored::control::set_override(false);
        let mut report = Report::new();
        report.record_rendered("a.sql", "ff", 1);
        report.add_diagnostic(Diagnostic::new(DiagnosticCode::MacroCycleError, Severity::Error, "too deep"));

        assert_eq!(
            summary_line(&report),
            "FAILED 1 rendered, 1 error(s), 0 warning(s), 0 info (report v1.0)"
        );
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn var_values_parse_as_json_when_possible() {
        assert_eq!(parse_var("size=3").unwrap(), ("size".to_string(), serde_json::json!(3)));
        assert_eq!(
            parse_var("cols=[\"a\",\"b\"]").unwrap(),
            ("cols".to_string(), serde_json::json!(["a", "b"]))
        );
        assert_eq!(
            parse_var("region=eu").unwrap(),
            ("region".to_string(), serde_json::json!("eu"))
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn config_severity_overrides_apply() {
        let mut config = Config::default();
        config.severity.set_override(DiagnosticCode::MacroTypeError, Severity::Warn);

        let diag = Diagnostic::new(DiagnosticCode::MacroTypeError, Severity::Error, "x");
        assert_eq!(apply_severity(&config, diag).severity, Severity::Warn);
    }
}
