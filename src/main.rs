mod cli;
mod config;
mod index;
mod io;
mod logging;
mod outside;
mod parser;
mod patterns;
mod reconcile;
mod result;
mod store;
mod supervisor;
mod types;

use std::sync::Arc;

use clap::Parser;
use miette::{miette, Context, IntoDiagnostic, Report, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cli::{Args, Command},
    config::Settings,
    index::VideoIndex,
    outside::{Ffmpeg, StopSignal, Ytdl},
    reconcile::reconcile,
    store::FileStore,
    supervisor::{JobHandle, JobSupervisor, Services},
    types::{now_millis, JobRecord},
};

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(logging::level_from_flags(args.verbose, args.quiet))?;

    let mut settings = Settings::load(args.config.as_deref())?;
    args.override_settings(&mut settings);
    settings.prepare_dirs()?;

    // Only the commands running the tools need them to be there
    let check_tools = matches!(
        args.command,
        Command::Add { .. } | Command::Restart { .. } | Command::Reconcile | Command::Probe { .. }
    );
    let services = load_services(settings, check_tools)?;

    match args.command {
        Command::Add { url, format } => {
            let mut index = open_index(&services.settings)?;
            let (mut job, record) = JobSupervisor::create(services, &url, format.as_deref())?;
            index.push(record.uuid)?;
            println!("{}", record.uuid);

            let handle = job.start(false);
            follow(&job, handle)
        }
        Command::Restart { uuid } => {
            let mut job = existing_job(services, uuid)?;
            let handle = job.restart();
            follow(&job, handle)
        }
        Command::Stop {
            uuid,
            signal,
            force,
        } => {
            let timeout = services.settings.stop_timeout();
            let job = existing_job(services, uuid)?;
            if job.stop(signal, timeout, force) {
                info!("Job {uuid} has no process anymore");
                Ok(())
            } else {
                Err(miette!(
                    "The process of job {uuid} is still running, use --force or --signal 9"
                ))
            }
        }
        Command::List => list(&services),
        Command::Remove { uuid } => {
            let mut index = open_index(&services.settings)?;
            let timeout = services.settings.stop_timeout();
            let store = services.store.clone();

            let job = JobSupervisor::new(uuid, services);
            if !job.stop(StopSignal::Interrupt, timeout, true) {
                return Err(miette!("Could not stop the process of job {uuid}"));
            }
            if !store.delete(&uuid) {
                return Err(miette!("Could not delete the record of job {uuid}"));
            }
            if !index.remove(&uuid)? {
                warn!("Job {uuid} was not listed");
            }
            info!("Removed job {uuid}");
            Ok(())
        }
        Command::Reconcile => {
            let mut index = open_index(&services.settings)?;
            let report = reconcile(
                services.store.as_ref(),
                &mut index,
                services.inspector.as_ref(),
            )?;
            println!(
                "{}",
                serde_json::json!({ "removed": report.removed, "refreshed": report.refreshed })
            );
            Ok(())
        }
        Command::Probe { url } => {
            let metadata = services.downloader.probe(&url)?;
            let json = serde_json::to_string_pretty(&metadata).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
    }
}

/// Build the services, checking the external tools only when needed
fn load_services(settings: Settings, check_tools: bool) -> Result<Services> {
    let store = FileStore::open(
        &settings.records_dir,
        settings.cache_capacity,
        settings.cache_ttl(),
    )?;

    let (ytdl, ffmpeg) = if check_tools {
        load_external_components(&settings)?
    } else {
        (
            Ytdl::unchecked(&settings.ytdlp, settings.cookies.clone()),
            Ffmpeg::unchecked(&settings.ffmpeg, &settings.ffprobe),
        )
    };

    Ok(Services {
        store: Arc::new(store),
        downloader: Arc::new(ytdl),
        inspector: Arc::new(ffmpeg),
        settings: Arc::new(settings),
    })
}

/// Load the external components
fn load_external_components(settings: &Settings) -> Result<(Ytdl, Ffmpeg)> {
    // Construct the handles concurrently as executing an external program
    // is not instantaneous. That way we can avoid adding the costs
    let (ytdlp, cookies) = (settings.ytdlp.clone(), settings.cookies.clone());
    let (ffmpeg, ffprobe) = (settings.ffmpeg.clone(), settings.ffprobe.clone());
    let ytdl_thread = std::thread::spawn(move || Ytdl::new(ytdlp, cookies));
    let ffmpeg_thread = std::thread::spawn(move || Ffmpeg::new(ffmpeg, ffprobe));

    let ytdl = ytdl_thread
        .join()
        .map_err(|_| miette!("Could not join thread"))?
        .map_err(Report::from)
        .wrap_err("yt-dlp is not usable")?;
    let ffmpeg = ffmpeg_thread
        .join()
        .map_err(|_| miette!("Could not join thread"))?
        .map_err(Report::from)
        .wrap_err("ffmpeg is not usable")?;

    debug!("External components loaded");
    Ok((ytdl, ffmpeg))
}

fn open_index(settings: &Settings) -> Result<VideoIndex> {
    let index = VideoIndex::read_or_create(settings.index_path())
        .map_err(Report::from)
        .wrap_err("Could not create or read the index file")?;
    debug!("{} jobs listed", index.len());
    Ok(index)
}

fn existing_job(services: Services, uuid: Uuid) -> Result<JobSupervisor> {
    if services.store.reload(&uuid).is_none() {
        return Err(miette!("No job {uuid}"));
    }
    Ok(JobSupervisor::new(uuid, services))
}

/// Wait for the process of the job to exit and report how the job ended
fn follow(job: &JobSupervisor, handle: Option<JobHandle>) -> Result<()> {
    let record = match handle {
        Some(handle) => {
            if let Some(started) = handle.wait_started() {
                info!("Writing to {}", display_path(&started));
            }
            handle.wait()
        }
        None => None,
    };

    // The record may have been written by a failed start only
    let record = match record {
        Some(record) => record,
        None => job
            .record()
            .ok_or_else(|| miette!("Job {} disappeared", job.id()))?,
    };

    println!("{} {}", record.uuid, describe(&record, None));
    match record.error {
        Some(error) => Err(miette!("Job {} failed: {error}", record.uuid)),
        None => Ok(()),
    }
}

fn list(services: &Services) -> Result<()> {
    let index = open_index(&services.settings)?;
    let now = now_millis();
    let stuck_after = services.settings.stuck_after();

    for id in index.ids() {
        match services.store.get(id) {
            Some(record) => {
                let stuck = record.is_stuck(now, stuck_after);
                println!("{id} {}", describe(&record, Some(stuck)));
            }
            None => println!("{id} missing"),
        }
    }
    Ok(())
}

/// One line summary of a job
fn describe(record: &JobRecord, stuck: Option<bool>) -> String {
    let mut line = format!("{} {}", record.status, record.download.progress);
    if let Some(speed) = &record.download.speed {
        line.push_str(&format!(" {speed}"));
    }
    if stuck == Some(true) {
        line.push_str(" stuck");
    }
    if !record.title.is_empty() {
        line.push_str(&format!(" '{}'", record.title));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

fn display_path(record: &JobRecord) -> String {
    record
        .file
        .path
        .as_ref()
        .map_or_else(|| "an unknown file".to_owned(), |p| p.display().to_string())
}
