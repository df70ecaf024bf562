use clap::Parser;
use leaklint::AnalysisEngine;
use leaklint::ProgramReport;
use leaklint::cli::{AnalyzeArgs, Args, Command, OutputFormat};
use leaklint::config::{self, LeakLintConfig};
use leaklint::findings::{AnalysisDiagnostic, Confidence, Finding};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn main() -> ExitCode {
    leaklint::telemetry::init_tracing();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Some(Command::ListKinds { config }) => {
            list_kinds(config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Analyze(analyze)) => analyze_command(analyze),
        None => analyze_command(args.analyze),
    }
}

fn list_kinds(config_path: Option<&Path>) -> anyhow::Result<()> {
    let start_dir = std::env::current_dir()?;
    let cfg = match config::load_config(config_path, &start_dir)? {
        Some((_path, cfg)) => cfg,
        None => LeakLintConfig::default(),
    };
    let table = cfg.resource_table()?;

    for kind in table.kind_ids() {
        let (acquires, releases, transfers) = table.rules_for(kind);
        println!("{}", table.kind_name(kind));
        println!("  acquire: {}", acquires.join(", "));
        println!("  release: {}", releases.join(", "));
        if !transfers.is_empty() {
            println!("  transfer: {}", transfers.join(", "));
        }
    }
    Ok(())
}

fn analyze_command(args: AnalyzeArgs) -> anyhow::Result<ExitCode> {
    let start_dir = infer_start_dir(&args)?;
    let loaded_cfg = config::load_config(args.config.as_deref(), &start_dir)?;

    let mut cfg = match loaded_cfg {
        Some((_path, cfg)) => cfg,
        None => LeakLintConfig::default(),
    };
    // CLI flag takes precedence over config
    if let Some(ms) = args.timeout_ms {
        cfg.analysis_timeout_ms = ms;
    }
    let engine = AnalysisEngine::from_config(&cfg)?;

    let mut reports: Vec<(String, ProgramReport)> = Vec::new();
    if args.paths.is_empty() {
        let mut source = String::new();
        std::io::stdin().read_to_string(&mut source)?;
        reports.push(("stdin".to_string(), engine.analyze_json(&source)?));
    } else {
        let files = collect_program_files(&args.paths)?;
        for path in files {
            let source = std::fs::read_to_string(&path)?;
            reports.push((path.display().to_string(), engine.analyze_json(&source)?));
        }
    }

    let total_findings: usize = reports.iter().map(|(_, r)| r.findings.len()).sum();
    let has_definite = reports
        .iter()
        .flat_map(|(_, r)| &r.findings)
        .any(|f| f.confidence == Confidence::Definite);

    match args.format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Pretty => print_pretty(&reports),
        OutputFormat::Github => print_github(&reports, args.deny_findings),
    }

    if has_definite || (args.deny_findings && total_findings > 0) {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

#[derive(Debug, Serialize)]
struct JsonFinding {
    file: String,
    #[serde(flatten)]
    finding: Finding,
}

#[derive(Debug, Serialize)]
struct JsonDiagnostic {
    file: String,
    #[serde(flatten)]
    diagnostic: AnalysisDiagnostic,
}

#[derive(Debug, Serialize)]
struct JsonReport {
    findings: Vec<JsonFinding>,
    diagnostics: Vec<JsonDiagnostic>,
}

fn print_json(reports: &[(String, ProgramReport)]) -> anyhow::Result<()> {
    let mut out = JsonReport {
        findings: Vec::new(),
        diagnostics: Vec::new(),
    };
    for (file, report) in reports {
        out.findings.extend(report.findings.iter().map(|finding| JsonFinding {
            file: file.clone(),
            finding: finding.clone(),
        }));
        out.diagnostics
            .extend(report.diagnostics.iter().map(|diagnostic| JsonDiagnostic {
                file: file.clone(),
                diagnostic: diagnostic.clone(),
            }));
    }

    out.findings.sort_by(|a, b| {
        (a.file.as_str(), a.finding.pos, a.finding.allocation).cmp(&(
            b.file.as_str(),
            b.finding.pos,
            b.finding.allocation,
        ))
    });
    out.diagnostics.sort_by(|a, b| {
        (a.file.as_str(), a.diagnostic.function.as_str())
            .cmp(&(b.file.as_str(), b.diagnostic.function.as_str()))
    });

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_pretty(reports: &[(String, ProgramReport)]) {
    for (file, report) in reports {
        for finding in &report.findings {
            println!(
                "{}:{}: {}: {}: {}",
                file,
                finding.pos,
                finding.confidence.as_str(),
                finding.leak.as_str(),
                finding.message
            );
            for witness in &finding.witnesses {
                println!("    path: {witness}");
            }
        }
        for diagnostic in &report.diagnostics {
            println!("{file}: note: {diagnostic}");
        }
        println!("{} findings for {}", report.findings.len(), file);
    }
}

fn print_github(reports: &[(String, ProgramReport)], deny_findings: bool) {
    for (file, report) in reports {
        for finding in &report.findings {
            let kind = if finding.confidence == Confidence::Definite
                || (deny_findings && finding.confidence == Confidence::Possible)
            {
                "error"
            } else {
                "warning"
            };
            println!(
                "::{} file={},line={},col={},title=leaklint({})::{}",
                kind,
                github_escape(file),
                finding.pos.line,
                finding.pos.column,
                finding.leak.as_str(),
                github_escape(&finding.message)
            );
        }
        for diagnostic in &report.diagnostics {
            println!(
                "::notice file={}::{}",
                github_escape(file),
                github_escape(&diagnostic.to_string())
            );
        }
    }
}

fn github_escape(s: &str) -> String {
    s.replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn collect_program_files(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        collect_from_path(path, &mut out)?;
    }

    out.sort();
    out.dedup();
    Ok(out)
}

fn collect_from_path(path: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        collect_from_dir(path, out)
    } else {
        out.push(path.to_path_buf());
        Ok(())
    }
}

fn collect_from_dir(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            if should_skip_dir(&path) {
                continue;
            }
            collect_from_dir(&path, out)?;
            continue;
        }

        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(path);
        }
    }

    Ok(())
}

fn should_skip_dir(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };

    matches!(name, ".git" | "target" | "build")
}

fn infer_start_dir(args: &AnalyzeArgs) -> anyhow::Result<PathBuf> {
    let base = if let Some(p) = args.paths.first() {
        p.clone()
    } else {
        std::env::current_dir()?
    };

    let base = if base.is_file() {
        base.parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        base
    };

    Ok(base)
}
