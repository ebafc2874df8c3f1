//! Orchestration: wires every component together into the program's lifecycle.
//!
//! Ground truth: `examples/original_source/main.cpp`'s `MainApp::runApp()`, with
//! the callback/persist/run-after/watch-generated wiring restored from
//! `PersistAndCallbackManager`'s and `GeneratedFilesWatcher`'s own headers (the
//! extracted `main.cpp` only demonstrates the buffer/executor/server/signal core;
//! the surrounding persistence and after-hook features are specified by those
//! classes' own interfaces and by the distributed spec, so this module is where
//! they are actually invoked end to end).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::buffer::{OutputBuffer, ReadResult};
use crate::child::{ChildRunner, ProgramStatus};
use crate::config::{env_map, CliArgs};
use crate::error::{AppResult, SupervisorError};
use crate::format::format_size;
use crate::io_pump::IoPump;
use crate::persist::PersistAndCallbackManager;
use crate::server::OutputServer;
use crate::signal::ScopedSignalHandler;
use crate::watcher::GeneratedFilesWatcher;

const ENV_PREFIX: &str = "ML_GRIDENGINE_";

/// Runs one supervised program from configuration to final exit. Returns the
/// process exit code the binary should use.
pub async fn run(args: CliArgs) -> AppResult<i32> {
    let work_dir = resolve_work_dir(args.work_dir.clone())?;
    std::fs::create_dir_all(&work_dir)?;

    info!("Server host: {}", args.server_host.as_deref().unwrap_or(""));
    info!("Server port: {}", args.server_port);
    info!(
        "Memory buffer size: {} ({})",
        args.buffer_size,
        format_size(args.buffer_size as u64)
    );
    info!("Working dir: {}", work_dir.display());
    if let Some(uri) = &args.callback_api {
        info!("Callback API: {uri}");
    }
    if let Some(path) = &args.save_output {
        info!("Save output to: {}", path.display());
    }
    info!("Program arguments:\n  {}", args.args.join("\n  "));

    let environ = env_map(&args.env);
    let child = Arc::new(ChildRunner::new(
        args.args.clone(),
        environ,
        Some(work_dir.clone()),
        "Program",
    )?);
    let buffer = Arc::new(OutputBuffer::with_default_initial(args.buffer_size));
    let io_pump = Arc::new(IoPump::with_default_chunk_size());

    let persist = Arc::new(PersistAndCallbackManager::new(
        args.status_file.clone(),
        args.callback_api.clone().unwrap_or_default(),
        args.callback_token.clone(),
    ));

    if persist.enabled() {
        if let Some(status_file) = &args.status_file {
            if status_file.exists() {
                return Err(SupervisorError::Config(format!(
                    "status file `{}` already exists",
                    status_file.display()
                )));
            }
        }
    }

    let watcher = if args.watch_generated {
        let persist_for_watcher = persist.clone();
        let watcher = GeneratedFilesWatcher::new(work_dir.clone(), move |tag, value| {
            persist_for_watcher.file_generated(tag, value);
        });
        watcher.start().map_err(|e| SupervisorError::Watcher(e.to_string()))?;
        Some(Arc::new(watcher))
    } else {
        None
    };

    let server_host: IpAddr = match &args.server_host {
        Some(h) if !h.is_empty() => h
            .parse()
            .map_err(|_| SupervisorError::Config(format!("invalid server host: `{h}`")))?,
        _ => IpAddr::from([0, 0, 0, 0]),
    };
    let bind_addr = SocketAddr::new(server_host, args.server_port);
    let output_server = OutputServer::new(child.clone(), buffer.clone(), 65536);
    let (bound_addr, server_fut) = output_server
        .serve(bind_addr)
        .await
        .map_err(SupervisorError::Io)?;
    info!("HTTP server started at http://{bound_addr}");
    let server_task = tokio::spawn(server_fut);

    persist.program_started(&hostname(), bound_addr.port())?;

    // Start the child and the IO pump, and install the signal handler that kills
    // the child on SIGINT/SIGTERM for exactly the lifetime of `executor.wait()`.
    {
        child.start()?;
        io_pump.start(child.clone(), buffer.clone())?;

        let kill_on_signal_child = child.clone();
        let _signal_guard = ScopedSignalHandler::new(move |_| {
            info!("Termination signal received, kill the user program ...");
            kill_on_signal_child.kill();
        });

        let wait_child = child.clone();
        tokio::task::spawn_blocking(move || wait_child.wait(None))
            .await
            .map_err(|e| SupervisorError::Io(std::io::Error::other(e.to_string())))??;
    }
    // The signal guard above is dropped here, unregistering the handler before
    // any after-hook or lingering wait below.
    child.kill();

    if let Some(watcher) = &watcher {
        watcher.stop();
        watcher.collect_all();
    }

    io_pump.join();
    buffer.close();
    info!(
        "Total number of bytes output by the program: {} ({})",
        buffer.written_bytes(),
        format_size(buffer.written_bytes())
    );

    if let Some(save_path) = &args.save_output {
        save_output_to_file(&buffer, save_path)?;
    }

    let work_dir_size = directory_size(&work_dir).unwrap_or(0);
    persist.program_finished(child.status(), work_dir_size)?;

    if let Some(command) = &args.run_after {
        if !crate::signal::interrupted() {
            run_after_hook(command, &work_dir, child.status())?;
        }
    }

    if args.no_exit && !crate::signal::interrupted() {
        info!("Waiting for termination signal ...");
        let _guard = ScopedSignalHandler::new(|_| {
            info!("Termination signal received.");
        });
        tokio::task::spawn_blocking(crate::signal::wait_for_signal)
            .await
            .map_err(|e| SupervisorError::Io(std::io::Error::other(e.to_string())))?;
    }

    info!("HTTP server shutdown ...");
    server_task.abort();

    Ok(exit_code_for(child.status()))
}

fn exit_code_for(status: ProgramStatus) -> i32 {
    match status {
        ProgramStatus::Exited(code) => code,
        ProgramStatus::Signalled(_) | ProgramStatus::CannotKill => 1,
        ProgramStatus::NotStarted | ProgramStatus::Running => 1,
    }
}

fn resolve_work_dir(work_dir: Option<PathBuf>) -> AppResult<PathBuf> {
    let dir = match work_dir {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => std::env::current_dir()?,
    };
    dir.canonicalize().or_else(|_| Ok(dir))
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn directory_size(path: &PathBuf) -> std::io::Result<u64> {
    let mut total = 0u64;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total += directory_size(&entry.path())?;
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Writes the ring buffer's remaining contents to `save_path`, prefixed with a
/// discarded-byte-count line whenever the window has already slid.
fn save_output_to_file(buffer: &OutputBuffer, save_path: &PathBuf) -> AppResult<()> {
    use std::io::Write;

    let mut out = std::fs::File::create(save_path)?;
    let written = buffer.written_bytes();
    let size = buffer.size() as u64;

    if written > size {
        let discarded = written - size;
        let formatted = format_size(discarded);
        if !formatted.is_empty() && !formatted.ends_with('B') {
            writeln!(out, "[{discarded} ({formatted}) bytes discarded]")?;
        } else {
            writeln!(out, "[{discarded} bytes discarded]")?;
        }
    }

    let mut begin: i64 = 0;
    loop {
        match buffer.try_read(begin, 8192) {
            ReadResult::Data { begin: b, data } => {
                out.write_all(&data)?;
                begin = (b + data.len() as u64) as i64;
            }
            _ => break,
        }
    }

    if written > size {
        info!("The last {} output saved to: {}", format_size(size), save_path.display());
    } else {
        info!("All output saved to: {}", save_path.display());
    }
    Ok(())
}

fn run_after_hook(command: &str, work_dir: &PathBuf, status: ProgramStatus) -> AppResult<()> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
    let mut environ = std::collections::HashMap::new();
    environ.insert(
        format!("{ENV_PREFIX}PROGRAM_WORK_DIR"),
        work_dir.to_string_lossy().into_owned(),
    );
    match status {
        ProgramStatus::Exited(code) => {
            environ.insert(format!("{ENV_PREFIX}PROGRAM_EXIT_STATUS"), "EXITED".to_string());
            environ.insert(format!("{ENV_PREFIX}PROGRAM_EXIT_CODE"), code.to_string());
        }
        ProgramStatus::Signalled(sig) => {
            environ.insert(format!("{ENV_PREFIX}PROGRAM_EXIT_STATUS"), "SIGNALLED".to_string());
            environ.insert(format!("{ENV_PREFIX}PROGRAM_EXIT_SIGNAL"), sig.to_string());
        }
        ProgramStatus::CannotKill => {
            environ.insert(format!("{ENV_PREFIX}PROGRAM_EXIT_STATUS"), "CANNOT_KILL".to_string());
        }
        ProgramStatus::NotStarted | ProgramStatus::Running => {}
    }

    let hook = Arc::new(ChildRunner::new(
        vec![shell, "-c".to_string(), command.to_string()],
        environ,
        Some(work_dir.clone()),
        "run-after",
    )?);
    hook.start()?;
    // Drain the hook's own pipe so a chatty after-hook can't block on a full pipe
    // buffer; its output isn't otherwise observable.
    let hook_buffer = Arc::new(OutputBuffer::with_default_initial(64 * 1024));
    let hook_pump = IoPump::with_default_chunk_size();
    hook_pump.start(hook.clone(), hook_buffer)?;

    let kill_on_signal_hook = hook.clone();
    let _signal_guard = ScopedSignalHandler::new(move |_| {
        info!("Termination signal received, kill the after-hook ...");
        kill_on_signal_hook.kill();
    });
    hook.wait(None)?;

    hook_pump.join();
    Ok(())
}
