//! Atelier CLI - headless front end for the asset library core.
//!
//! Each subcommand submits its work to the task orchestrator, prints the task
//! stream while it runs and exits non-zero if the task did not succeed.

use anyhow::{bail, Context, Result};
use atelier_core::{
    AtelierApi, CollisionPolicy, ParsedFields, Settings, TaskId, TaskOutput, TaskStatus,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "atelier")]
#[command(about = "Index, enrich and annotate local generative-model libraries")]
struct Args {
    /// Application directory (settings file and default cache live here)
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    /// Settings file (defaults to <app-dir>/atelier.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Cache root, overriding the settings file
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the content identity of a file
    Identify { path: PathBuf },
    /// Rescan a library root, by alias or path
    Scan { target: String },
    /// Look up registry metadata for a model file
    Match {
        path: PathBuf,
        /// Registry URL to take metadata from instead of a hash lookup
        #[arg(long)]
        url: Option<String>,
    },
    /// Download a model from a registry URL
    Download {
        url: String,
        dest_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = Policy::Rename)]
        policy: Policy,
    },
    /// Show the cache entry of a file
    Entry { path: PathBuf },
    /// Show or replace the notes of a file
    Notes {
        path: PathBuf,
        /// New notes text
        #[arg(long)]
        set: Option<String>,
    },
    /// Copy an image or video into a file's examples
    AttachExample { path: PathBuf, media: PathBuf },
    /// Read embedded generation metadata from an image
    ReadMeta { image: PathBuf },
    /// Write generation metadata into an image
    WriteMeta {
        image: PathBuf,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        negative: Option<String>,
        /// Extra `Key=Value` fields; an empty value removes the key
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    Rename,
    Overwrite,
    Skip,
}

impl From<Policy> for CollisionPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Rename => CollisionPolicy::Rename,
            Policy::Overwrite => CollisionPolicy::Overwrite,
            Policy::Skip => CollisionPolicy::Skip,
        }
    }
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected Key=Value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("field key is empty".to_string());
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let app_dir = match args.app_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving working directory")?,
    };
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| Settings::default_path(&app_dir));
    debug!("Settings file: {}", settings_path.display());
    let settings = Settings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;

    let mut builder = AtelierApi::builder(settings).app_dir(&app_dir);
    if let Some(root) = &args.cache_root {
        builder = builder.cache_root(root);
    }
    let api = builder.build().await?;

    run(&api, &args).await
}

async fn run(api: &AtelierApi, args: &Args) -> Result<()> {
    match &args.command {
        Command::Identify { path } => {
            let id = api.hash_asset(path).await?;
            await_task(api, id, args.json).await
        }
        Command::Scan { target } => {
            let id = api.refresh_folder(target).await?;
            await_task(api, id, args.json).await
        }
        Command::Match { path, url } => {
            let id = match url {
                Some(url) => api.match_by_url(path, url).await?,
                None => api.auto_match(path).await?,
            };
            await_task(api, id, args.json).await
        }
        Command::Download {
            url,
            dest_dir,
            policy,
        } => {
            let id = api.download_model(url, dest_dir, (*policy).into()).await?;
            await_task(api, id, args.json).await
        }
        Command::Entry { path } => {
            match api.cache_entry(path).await? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => println!("No cache entry for {}", path.display()),
            }
            Ok(())
        }
        Command::Notes { path, set } => {
            let entry = match set {
                Some(text) => api.set_notes(path, text).await?,
                None => match api.cache_entry(path).await? {
                    Some(entry) => entry,
                    None => bail!("No cache entry for {}", path.display()),
                },
            };
            println!("{}", entry.notes.text);
            for attachment in &entry.notes.attachments {
                println!("  attachment: {}", attachment);
            }
            Ok(())
        }
        Command::AttachExample { path, media } => {
            let entry = api.attach_example(path, media).await?;
            info!("{} now has {} examples", entry.hash, entry.examples.len());
            Ok(())
        }
        Command::ReadMeta { image } => {
            let record = api.read_embedded(image).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }
            if record.low_confidence {
                warn!("Text encoding was ambiguous; some characters may be wrong");
            }
            if record.is_empty() {
                println!("No generation metadata found");
            }
            for (key, value) in record.parsed_fields.iter() {
                println!("{}: {}", key, value);
            }
            Ok(())
        }
        Command::WriteMeta {
            image,
            prompt,
            negative,
            fields,
        } => {
            let mut parsed = ParsedFields::new();
            if let Some(prompt) = prompt {
                parsed.insert(atelier_core::codec::PROMPT, prompt.as_str());
            }
            if let Some(negative) = negative {
                parsed.insert(atelier_core::codec::NEGATIVE_PROMPT, negative.as_str());
            }
            for (key, value) in fields {
                parsed.insert(key, value.as_str());
            }
            if parsed.is_empty() {
                bail!("Nothing to write: pass --prompt, --negative or --field");
            }
            let written = api.write_embedded(image, parsed).await?;
            println!("{}", written.display());
            Ok(())
        }
    }
}

/// Follow `id` on the task stream until it finishes, then print its result.
async fn await_task(api: &AtelierApi, id: TaskId, json: bool) -> Result<()> {
    let mut events = api.subscribe();
    let waiter = api.clone();
    let mut done = tokio::spawn(async move { waiter.wait(id).await });

    let task = loop {
        tokio::select! {
            result = &mut done => break result??,
            Some(event) = events.recv() => {
                if event.task_id == id && !event.status.is_terminal() {
                    info!("{} {}: {} ({})", event.kind, event.key, event.status, event.progress);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling task {}", id);
                api.cancel(id)?;
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        match &task.output {
            Some(TaskOutput::Scanned { assets }) => {
                for asset in assets {
                    println!("{}", asset.path().display());
                }
                println!("{} assets", assets.len());
            }
            Some(TaskOutput::Identified { identity }) => {
                println!("sha256  {}", identity.full_hash);
                println!("blake3  {}", identity.blake3);
                println!("fast    {}", identity.fast_hash);
                println!("size    {}", identity.file_size);
            }
            Some(TaskOutput::Matched { hash, metadata }) => {
                println!("{}", hash);
                println!("{}", metadata.summary_markdown());
            }
            Some(TaskOutput::Downloaded {
                path,
                hash,
                skipped,
            }) => {
                let note = if *skipped { " (existing file kept)" } else { "" };
                println!("{}  {}{}", hash, path.display(), note);
            }
            None => {}
        }
    }

    match task.status {
        TaskStatus::Succeeded => Ok(()),
        status => bail!(
            "Task {} ended {}: {}",
            task.id,
            status,
            task.error.as_deref().unwrap_or("no detail")
        ),
    }
}
