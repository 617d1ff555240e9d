mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use beatcast::config::{self, Config};
use beatcast::jobs::{
    Collaborators, FileJobStore, Job, JobEvent, JobRequest, JobScheduler, JobStatus, JobStore,
    SchedulerSettings, VisualConfig,
};
use beatcast::publish::{PublishMetadata, PublishRequest};
use beatcast::render::{Overlay, SpectrumLayer};
use cli::{Cli, Command, QueueArgs, QueueCommand, RenderArgs};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(config::find_config_path);
    let config = match config_path {
        Some(ref path) => match config::load_config(path) {
            Ok(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            Err(err) => {
                log::warn!("Failed to load config from {}: {:#}", path.display(), err);
                Config::default()
            }
        },
        None => Config::default(),
    };

    match cli.command {
        Command::Render(args) => render(args, config),
        Command::Queue(args) => queue(args, config),
    }
}

fn settings(config: &Config, start_paused: bool) -> SchedulerSettings {
    SchedulerSettings {
        output: config.output.clone(),
        scheduler: config.scheduler.clone(),
        font: config.font.clone(),
        temp_root: None,
        start_paused,
    }
}

fn render(mut args: RenderArgs, mut config: Config) -> Result<()> {
    if !args.input.exists() {
        anyhow::bail!("Input file not found: {}", args.input.display());
    }

    // Config values apply only when the CLI flag is at its default
    if args.width == 1920 { args.width = config.output.width; }
    if args.height == 1080 { args.height = config.output.height; }
    if args.fps == 30 { args.fps = config.output.fps; }
    if args.crf != 18 { config.output.crf = args.crf; }
    if args.codec != "auto" { config.output.codec = args.codec.clone(); }
    if args.bitrate.is_some() { config.output.bitrate = args.bitrate.clone(); }
    if args.font.is_some() { config.font.path = args.font.clone(); }

    let mut layers = config.layers.clone();
    if args.no_waveform {
        layers.waveform = None;
    }
    if args.no_spectrum {
        layers.spectrum = None;
    } else if let Some(bars) = args.bars {
        let spectrum = layers.spectrum.get_or_insert_with(SpectrumLayer::default);
        spectrum.bar_count = bars;
    }
    if let Some(ref title) = args.title {
        layers.overlays.push(Overlay::Text {
            text: title.clone(),
            x: 50,
            y: 50,
            size: 48.0,
            color: beatcast::render::Color::WHITE,
        });
    }

    log::info!("beatcast - offline audio visualizer");
    log::info!("Input: {}", args.input.display());
    log::info!("Resolution: {}x{} @ {}fps", args.width, args.height, args.fps);

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::in_memory());
    let scheduler = JobScheduler::start(store, Collaborators::default(), settings(&config, true))?;
    let events = scheduler.subscribe();
    let id = scheduler.add_job(JobRequest {
        audio_path: args.input.clone(),
        visual: VisualConfig {
            width: args.width,
            height: args.height,
            fps: args.fps,
            layers,
        },
        publish: None,
    })?;
    scheduler.resume();

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}% ({eta} remaining)")
            .context("invalid progress template")?
            .progress_chars("=>-"),
    );

    let video = loop {
        let event = events.recv().context("scheduler stopped unexpectedly")?;
        if event.job_id() != id {
            continue;
        }
        match event {
            JobEvent::Progress { percent, .. } => pb.set_position(percent as u64),
            JobEvent::Completed { output_path, .. } => break output_path,
            JobEvent::Failed { error, kind, .. } => {
                pb.abandon();
                anyhow::bail!("{kind}: {error}");
            }
            JobEvent::Cancelled { .. } => {
                pb.abandon();
                anyhow::bail!("render cancelled");
            }
            _ => {}
        }
    };
    pb.finish_with_message("Rendering complete");

    let video = match args.output {
        Some(target) => {
            if let Some(dir) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            std::fs::rename(&video, &target)
                .or_else(|_| std::fs::copy(&video, &target).and_then(|_| std::fs::remove_file(&video)))
                .with_context(|| format!("Failed to move video to {}", target.display()))?;
            target
        }
        None => video,
    };
    log::info!("Output written to {}", video.display());
    Ok(())
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("beatcast")
        .join("jobs.json")
}

fn queue(args: QueueArgs, config: Config) -> Result<()> {
    let store_path = args.store.unwrap_or_else(default_store_path);
    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(&store_path)
            .with_context(|| format!("Failed to open job store {}", store_path.display()))?,
    );

    // Only the runner owns the worker; every other command edits the shared
    // store file directly so a concurrent `queue run` keeps its job.
    match args.command {
        QueueCommand::Add {
            inputs,
            publish,
            account,
            title,
            description,
            tags,
        } => {
            for input in inputs {
                let publish = publish.then(|| {
                    let mut metadata = PublishMetadata::for_audio(&input);
                    if let Some(ref title) = title {
                        metadata.title = title.clone();
                    }
                    metadata.description = description.clone();
                    metadata.tags = tags.clone();
                    PublishRequest {
                        account_id: account.clone(),
                        metadata,
                    }
                });
                let request = JobRequest {
                    audio_path: input.clone(),
                    visual: VisualConfig {
                        width: config.output.width,
                        height: config.output.height,
                        fps: config.output.fps,
                        layers: config.layers.clone(),
                    },
                    publish,
                };
                request.validate()?;
                let id = store.insert(Job::new(request, Utc::now()))?;
                println!("{id}\t{}", input.display());
            }
        }
        QueueCommand::Run => {
            let scheduler = JobScheduler::start(store, Collaborators::default(), settings(&config, false))?;
            scheduler.wait_idle();
            let status = scheduler.queue_status()?;
            scheduler.shutdown();
            println!(
                "completed: {}  failed: {}  cancelled: {}",
                status.count(JobStatus::Completed),
                status.count(JobStatus::Failed),
                status.count(JobStatus::Cancelled)
            );
        }
        QueueCommand::Status => {
            for (state, count) in &store.list_by_status_counts()? {
                println!("{:<10} {}", state.as_str(), count);
            }
        }
        QueueCommand::History { limit } => {
            for job in store.list_history(limit)? {
                println!(
                    "{:>5}  {:<10} {:>3}%  {}  {}",
                    job.id,
                    job.status.as_str(),
                    job.progress,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.audio_path.display()
                );
                if let Some(ref output) = job.output_path {
                    println!("       -> {}", output.display());
                }
                if let Some(ref url) = job.remote_url {
                    println!("       -> {}", url);
                }
                if let Some(ref error) = job.error_message {
                    println!("       !! {}", error);
                }
            }
        }
        QueueCommand::Retry { id } => {
            store
                .update_status(id, JobStatus::Pending, None)
                .with_context(|| format!("job {id} cannot be retried"))?;
            println!("job {id} requeued");
        }
        QueueCommand::Cancel { id } => {
            store
                .update_status(id, JobStatus::Cancelled, None)
                .with_context(|| format!("job {id} cannot be cancelled"))?;
            println!("job {id} cancelled");
        }
        QueueCommand::Clear { days } => {
            let removed = store.delete_finished_before(Utc::now() - chrono::Duration::days(days))?;
            println!("removed {removed} jobs");
        }
    }

    Ok(())
}
