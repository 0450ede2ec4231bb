use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, TryRecvError};
use kestrel_minimods::cli::HostOptions;
use kestrel_minimods::config::EngineConfig;
use kestrel_minimods::engine::ScriptEngine;
use kestrel_minimods::memory::MemoryRegion;
use kestrel_minimods::region::{Vector3, NO_PRINCIPAL};
use kestrel_minimods::watch::SourceWatcher;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let options = match HostOptions::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(options) {
        tracing::error!("Application error: {err:?}");
        std::process::exit(1);
    }
}

fn run(options: HostOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let owner = Uuid::new_v4();
    let region = MemoryRegion::new(&options.region, owner);
    region.add_principal(owner, &options.owner, true);
    let host_object = Uuid::new_v4();
    region.add_object(host_object, owner, "Module Host", Vector3::new(128.0, 128.0, 25.0));

    let engine = ScriptEngine::new(config, Arc::new(region.clone()));
    let mut watcher = SourceWatcher::new(host_object)?;
    let existing = watcher
        .watch_dir(&options.watch)
        .with_context(|| format!("watching module directory '{}'", options.watch.display()))?;
    watcher.apply(&engine, &existing);
    if options.autostart {
        for change in &existing {
            engine.resume_script(change.item);
        }
    }

    let (lines_tx, lines_rx) = unbounded::<String>();
    thread::Builder::new().name("console".to_string()).spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(Result::ok) {
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    })?;

    tracing::info!("[minimod-host] watching '{}'; type 'mrm help' for commands", options.watch.display());
    let mut frame = 0u64;
    loop {
        let changes = watcher.drain_changes();
        if !changes.is_empty() {
            watcher.apply(&engine, &changes);
            if options.autostart {
                for change in &changes {
                    match engine.script(change.item) {
                        Some(script) if script.is_running() => engine.on_reset_script(change.item),
                        Some(_) => engine.resume_script(change.item),
                        None => false,
                    };
                }
            }
        }
        match lines_rx.try_recv() {
            Ok(line) if line.trim().eq_ignore_ascii_case("mrm help") => println!("{}", kestrel_minimods::commands::USAGE),
            Ok(line) if !line.trim().is_empty() => {
                for reply in engine.run_command(&line, NO_PRINCIPAL) {
                    println!("{reply}");
                }
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) if options.frames.is_none() => break,
            Err(TryRecvError::Disconnected) => {}
        }
        engine.on_frame();
        frame += 1;
        if options.frames.is_some_and(|limit| frame >= limit) {
            break;
        }
        thread::sleep(options.frame_interval);
    }
    engine.close();
    Ok(())
}
