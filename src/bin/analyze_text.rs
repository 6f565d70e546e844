use anyhow::{anyhow, bail, Context, Result};
use clauseguard::models::{DetectorKind, Document, MergeGranularity};
use clauseguard::services::{
    get_api_key, parse_provider, Analyzer, ConfigStore, EngineSettings, ProviderBackend,
    ProviderClient,
};
use std::sync::Arc;

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn parse_number<T: std::str::FromStr>(args: &[String], key: &str) -> Result<Option<T>> {
    match parse_arg_value(args, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} expects a number, got '{}'", key, raw)),
        None => Ok(None),
    }
}

fn load_settings() -> EngineSettings {
    let Some(dir) = ConfigStore::default_config_dir() else {
        return EngineSettings::default();
    };
    match ConfigStore::new(dir).load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Ignoring unreadable settings: {}", e);
            EngineSettings::default()
        }
    }
}

fn extraction_backend(settings: &EngineSettings) -> Result<ProviderBackend> {
    let provider = settings.provider.clone().unwrap_or_else(|| "anthropic".to_string());
    let spec = parse_provider(&provider);
    let api_key = get_api_key(&spec.name)
        .ok_or_else(|| anyhow!("no API key for provider '{}'", spec.name))?;

    let mut client = ProviderClient::new();
    if let Some(url) = settings.providers.get(&spec.name).and_then(|p| p.base_url.clone()) {
        client = client.with_endpoint(&spec, url);
    }
    Ok(ProviderBackend::new(client, &provider, api_key))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || has_flag(&args, "--help") {
        eprintln!(
            "Usage:\n  analyze_text <path.txt> \
             [--detector pattern|classifier|structured_extraction] [--provider <name[:model]>] \
             [--chunk-size <n>] [--overlap <n>] [--threshold <f>] [--merge category|span] \
             [--out <json_path>]\n\n\
             Notes:\n  \
             - Settings are read from the user config dir (clauseguard/config.json) when \
             present; flags override them.\n  \
             - structured_extraction needs ANTHROPIC_API_KEY or OPENAI_API_KEY (or a stored key)."
        );
        return Ok(());
    }

    clauseguard::init_logging();

    let path = args[1].clone();
    let mut settings = load_settings();

    if let Some(detector) = parse_arg_value(&args, "--detector") {
        settings.detector = DetectorKind::parse(&detector)
            .ok_or_else(|| anyhow!("unknown detector '{}'", detector))?;
    }
    if let Some(provider) = parse_arg_value(&args, "--provider") {
        settings.provider = Some(provider);
    }
    if let Some(size) = parse_number(&args, "--chunk-size")? {
        settings.chunking.max_chunk_size = size;
    }
    if let Some(overlap) = parse_number(&args, "--overlap")? {
        settings.chunking.overlap_size = overlap;
    }
    if let Some(threshold) = parse_number(&args, "--threshold")? {
        settings.confidence_threshold = threshold;
    }
    if let Some(merge) = parse_arg_value(&args, "--merge") {
        settings.merge = match merge.as_str() {
            "category" | "category_severity" => MergeGranularity::CategorySeverity,
            "span" | "span_overlap" => MergeGranularity::SpanOverlap { min_overlap: 0.0 },
            other => bail!("unknown merge mode '{}'", other),
        };
    }
    let out_path = parse_arg_value(&args, "--out");

    let text =
        std::fs::read_to_string(&path).with_context(|| format!("read file failed: {}", path))?;
    let file_name = std::path::Path::new(&path)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "input.txt".to_string());

    let config = settings.to_analysis_config().context("invalid analysis settings")?;
    let mut analyzer = Analyzer::new(config)?;

    if settings.detector == DetectorKind::StructuredExtraction {
        match extraction_backend(&settings) {
            Ok(backend) => analyzer = analyzer.with_extraction_backend(Arc::new(backend)),
            // analysis still runs; the orchestrator falls back to patterns
            Err(e) => eprintln!("Extraction backend unavailable ({}); using pattern detection", e),
        }
    }
    if settings.detector == DetectorKind::Classifier {
        eprintln!("No classifier backend is bundled with this binary; using pattern detection");
    }

    let document = Document::new(text).with_source(file_name);
    let result = analyzer.analyze(&document).await?;

    eprintln!(
        "Risk: {}  Findings: {}  Detector: {}  Chunks: {} ({} fell back)  {} ms",
        result.risk_level,
        result.red_flags.len(),
        result.detector_used,
        result.metadata.total_chunks,
        result.metadata.fallback_chunks,
        result.metadata.processing_time_ms
    );

    let json = serde_json::to_string_pretty(&result).context("serialize result failed")?;
    match out_path {
        Some(out) => {
            std::fs::write(&out, json).with_context(|| format!("write output failed: {}", out))?;
            eprintln!("Wrote {}", out);
        }
        None => println!("{}", json),
    }

    Ok(())
}
