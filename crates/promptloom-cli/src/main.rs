use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use promptloom_contracts::jobs::{ImageData, JobStatus, PromptJob};
use promptloom_contracts::naming::archive_entry_name;
use promptloom_engine::{default_provider_registry, write_archive, BatchRunner, RunnerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser)]
#[command(name = "promptloom", version, about = "Batch text-to-image runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a batch of prompts against one provider, one request at a time.
    Run(RunArgs),
    /// Re-export the zip archive from a previously saved run directory.
    Export(ExportArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// File with one prompt per line; reads stdin when omitted.
    #[arg(long)]
    prompts: Option<PathBuf>,
    #[arg(long, default_value = "pollinations")]
    provider: String,
    /// Upstream model identifier; provider default when empty.
    #[arg(long, default_value = "")]
    model: String,
    /// Fallback model tried on a later attempt; repeatable, order matters.
    #[arg(long = "fallback-model")]
    fallback_models: Vec<String>,
    #[arg(long, default_value = "1024x1024")]
    size: String,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    negative_prompt: Option<String>,
    /// Attempts per job before it is declared failed.
    #[arg(long, default_value_t = 1)]
    attempts: usize,
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,
    #[arg(long, default_value_t = 20)]
    timeout_secs: u64,
    /// Directory receiving images, batch.json and events.jsonl.
    #[arg(long)]
    out: PathBuf,
    /// Also pack every succeeded image into this zip archive.
    #[arg(long)]
    zip: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    /// Run directory containing a batch.json manifest.
    #[arg(long)]
    run: PathBuf,
    /// Path of the zip archive to write.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchManifest {
    batch_id: String,
    created_at: String,
    provider: String,
    jobs: Vec<ManifestJob>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestJob {
    id: String,
    index: usize,
    prompt: String,
    status: JobStatus,
    error: Option<String>,
    /// Image file name inside the run directory, succeeded jobs only.
    file: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("promptloom error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Export(args) => run_export(args),
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let raw_text = read_prompts(args.prompts.as_deref())?;
    let (width, height) = parse_size(&args.size)?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));

    let config = RunnerConfig {
        provider: args.provider.clone(),
        model: args.model.clone(),
        model_fallbacks: args.fallback_models.clone(),
        width,
        height,
        seed: args.seed,
        negative_prompt: args.negative_prompt.clone(),
        attempts: args.attempts,
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        request_timeout: Duration::from_secs(args.timeout_secs),
    };
    let runner =
        BatchRunner::new(default_provider_registry(), config).with_events_path(&events_path);

    let mut seen: HashMap<String, JobStatus> = HashMap::new();
    let snapshot = runner.run(&raw_text, |snapshot| {
        let total = snapshot.jobs.len();
        for job in &snapshot.jobs {
            if seen.get(&job.id) == Some(&job.status) {
                continue;
            }
            seen.insert(job.id.clone(), job.status);
            match job.status {
                JobStatus::Pending => {}
                JobStatus::InProgress => {
                    println!("[{}/{}] generating: {}", job.index + 1, total, job.prompt);
                }
                JobStatus::Succeeded => {
                    println!("[{}/{}] done: {}", job.index + 1, total, job.prompt);
                }
                JobStatus::Failed => {
                    println!(
                        "[{}/{}] failed: {} ({})",
                        job.index + 1,
                        total,
                        job.prompt,
                        job.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
    })?;

    if snapshot.jobs.is_empty() {
        println!("no prompts found; nothing to do");
        return Ok(0);
    }

    let files = write_images(&snapshot.jobs, &args.out)?;
    write_manifest(&snapshot, &args.provider, &files, &args.out)?;

    if let Some(zip_path) = &args.zip {
        if write_archive(&snapshot.jobs, zip_path)? {
            println!("archive written to {}", zip_path.display());
        } else {
            println!("no succeeded images; archive skipped");
        }
    }

    let succeeded = snapshot
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Succeeded)
        .count();
    println!(
        "batch {} complete: {} succeeded, {} failed",
        snapshot.batch_id,
        succeeded,
        snapshot.jobs.len() - succeeded
    );
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let manifest_path = args.run.join("batch.json");
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed reading {}", manifest_path.display()))?;
    let manifest: BatchManifest = serde_json::from_str(&raw)
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;

    let mut jobs = Vec::new();
    for entry in &manifest.jobs {
        if entry.status != JobStatus::Succeeded {
            continue;
        }
        let Some(file) = entry.file.as_deref() else {
            continue;
        };
        let image_path = args.run.join(file);
        let bytes = match fs::read(&image_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("skipping {}: {err}", image_path.display());
                continue;
            }
        };
        jobs.push(PromptJob {
            id: entry.id.clone(),
            index: entry.index,
            prompt: entry.prompt.clone(),
            status: JobStatus::Succeeded,
            image: Some(ImageData {
                bytes,
                extension: extension_of(file),
            }),
            error: None,
        });
    }

    if write_archive(&jobs, &args.out)? {
        println!("archive written to {}", args.out.display());
    } else {
        println!("no succeeded images in {}; nothing to export", args.run.display());
    }
    Ok(0)
}

fn read_prompts(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))
        }
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed reading prompts from stdin")?;
            Ok(raw)
        }
    }
}

fn parse_size(raw: &str) -> Result<(u32, u32)> {
    let Some((width, height)) = raw.trim().to_ascii_lowercase().split_once('x').map(
        |(width, height)| (width.trim().to_string(), height.trim().to_string()),
    ) else {
        bail!("size must look like 1024x1024, got '{raw}'");
    };
    let width: u32 = width
        .parse()
        .with_context(|| format!("invalid width in size '{raw}'"))?;
    let height: u32 = height
        .parse()
        .with_context(|| format!("invalid height in size '{raw}'"))?;
    if width == 0 || height == 0 {
        bail!("size dimensions must be non-zero, got '{raw}'");
    }
    Ok((width, height))
}

/// Writes each succeeded image under the run directory and returns the file
/// name chosen per job id. Names follow the archive naming scheme so the run
/// directory and the zip stay in sync.
fn write_images(jobs: &[PromptJob], out: &Path) -> Result<HashMap<String, String>> {
    let mut files = HashMap::new();
    let succeeded = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Succeeded);
    for (position, job) in succeeded.enumerate() {
        let Some(image) = job.image.as_ref() else {
            continue;
        };
        let name = archive_entry_name(&job.prompt, position + 1, &image.extension);
        let path = out.join(&name);
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        files.insert(job.id.clone(), name);
    }
    Ok(files)
}

fn write_manifest(
    snapshot: &promptloom_contracts::batch::BatchSnapshot,
    provider: &str,
    files: &HashMap<String, String>,
    out: &Path,
) -> Result<()> {
    let manifest = BatchManifest {
        batch_id: snapshot.batch_id.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        provider: provider.to_string(),
        jobs: snapshot
            .jobs
            .iter()
            .map(|job| ManifestJob {
                id: job.id.clone(),
                index: job.index,
                prompt: job.prompt.clone(),
                status: job.status,
                error: job.error.clone(),
                file: files.get(&job.id).cloned(),
            })
            .collect(),
    };
    let path = out.join("batch.json");
    let rendered = serde_json::to_string_pretty(&manifest).context("failed encoding manifest")?;
    fs::write(&path, rendered).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

fn extension_of(file: &str) -> String {
    Path::new(file)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("png")
        .to_string()
}
