use super::error;
use super::output;
use super::{Commands, FileArgs, PackageAction, PackageArgs};
use crate::pool::http_client::{ProgressCallback, TransferProgress};
use crate::pool::package::{PackageFile, PackageProgress, PackageProgressCallback, PackageRequest};
use crate::pool::queue::ProcessOutcome;
use crate::pool::{FileOptions, Filepool};
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::sync::Arc;

/// Retained failures in a row after which a non-daemon run gives up
const MAX_RETAINED_IN_A_ROW: usize = 3;

/// Handle a CLI command and return exit code
pub async fn handle_command(command: Commands, pool: Filepool) -> i32 {
    let result = match command {
        Commands::Url {
            site,
            url,
            file,
            ignore_stale,
        } => handle_url(&pool, site, url, file, ignore_stale, false).await,
        Commands::Src {
            site,
            url,
            file,
            ignore_stale,
        } => handle_url(&pool, site, url, file, ignore_stale, true).await,
        Commands::Download { site, url, file } => handle_download(&pool, site, url, file).await,
        Commands::Enqueue {
            site,
            url,
            file,
            priority,
        } => handle_enqueue(&pool, site, url, file, priority),
        Commands::State {
            site,
            url,
            revision,
            timemodified,
        } => handle_state(&pool, site, url, revision, timemodified).await,
        Commands::Queue { json } => handle_queue(&pool, json),
        Commands::Run { daemon } => handle_run(&pool, daemon).await,
        Commands::Invalidate {
            site,
            url,
            component,
            component_id,
            all,
            only_unknown,
        } => handle_invalidate(&pool, site, url, component, component_id, all, only_unknown),
        Commands::Remove {
            site,
            url,
            component,
            component_id,
        } => handle_remove(&pool, site, url, component, component_id).await,
        Commands::Package { action } => handle_package(&pool, action).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            error::exit_code_for(&e)
        }
    }
}

fn file_options(file: &FileArgs) -> FileOptions {
    FileOptions {
        component: file.component.clone(),
        component_id: file.component_id.clone(),
        revision: file.revision,
        timemodified: file.timemodified,
        path: file.path.clone(),
        ..FileOptions::default()
    }
}

fn register_token(pool: &Filepool, site: &str, token: Option<&String>) {
    if let Some(token) = token {
        pool.register_site_token(site, token.clone());
    }
}

/// Progress line rewritten in place
fn progress_printer() -> ProgressCallback {
    Arc::new(|progress: TransferProgress| {
        match progress.total {
            Some(total) if total > 0 => {
                let percent = (progress.loaded as f64 / total as f64 * 100.0) as u8;
                print!(
                    "\r[{:3}%] {} / {}   ",
                    percent,
                    output::format_bytes(progress.loaded),
                    output::format_bytes(total)
                );
            }
            _ => print!("\rDownloaded: {}   ", output::format_bytes(progress.loaded)),
        }
        let _ = io::stdout().flush();
    })
}

/// Resolve the URL (or path) a caller should use for a file
async fn handle_url(
    pool: &Filepool,
    site: String,
    url: String,
    file: FileArgs,
    ignore_stale: bool,
    src: bool,
) -> Result<i32> {
    register_token(pool, &site, file.token.as_ref());
    let options = FileOptions {
        ignore_stale,
        ..file_options(&file)
    };
    let resolved = if src {
        pool.get_src_by_url(&site, &url, &options).await?
    } else {
        pool.get_url_by_url(&site, &url, &options).await?
    };
    println!("{}", resolved);

    Ok(error::SUCCESS)
}

/// Download a file immediately
async fn handle_download(pool: &Filepool, site: String, url: String, file: FileArgs) -> Result<i32> {
    register_token(pool, &site, file.token.as_ref());
    let local = pool
        .download_url(&site, &url, &file_options(&file), Some(progress_printer()))
        .await?;
    println!("\n✓ {}", local);

    Ok(error::SUCCESS)
}

/// Queue a file for the background processor
fn handle_enqueue(
    pool: &Filepool,
    site: String,
    url: String,
    file: FileArgs,
    priority: Option<i64>,
) -> Result<i32> {
    register_token(pool, &site, file.token.as_ref());
    let options = FileOptions {
        priority,
        ..file_options(&file)
    };
    let handle = pool.add_to_queue_by_url(&site, &url, &options)?;
    println!("Queued {}", handle.key());

    Ok(error::SUCCESS)
}

/// Show the pool state of a file
async fn handle_state(
    pool: &Filepool,
    site: String,
    url: String,
    revision: i64,
    timemodified: i64,
) -> Result<i32> {
    let state = pool
        .get_file_state_by_url(&site, &url, revision, timemodified)
        .await?;
    println!("State: {}", state);
    if let Some(entry) = pool.get_file_entry_by_url(&site, &url)? {
        print!("{}", output::format_file_entry(&entry));
    }

    Ok(error::SUCCESS)
}

/// List queued files
fn handle_queue(pool: &Filepool, json: bool) -> Result<i32> {
    let entries = pool.get_queue_entries()?;
    println!("{}", output::format_queue_entries(&entries, json));

    Ok(error::SUCCESS)
}

/// Drain the queue, or run the loop until Ctrl+C
async fn handle_run(pool: &Filepool, daemon: bool) -> Result<i32> {
    if daemon {
        super::daemon::run_daemon(pool.clone()).await?;
        return Ok(error::SUCCESS);
    }

    let mut retained_in_a_row = 0;
    let mut failures = 0;
    loop {
        let outcome = pool.process_next().await?;
        println!("{}", output::format_outcome(&outcome));
        match outcome {
            ProcessOutcome::Empty => break,
            ProcessOutcome::Paused(_) => {
                failures += 1;
                break;
            }
            ProcessOutcome::Retained { .. } => {
                retained_in_a_row += 1;
                if retained_in_a_row >= MAX_RETAINED_IN_A_ROW {
                    println!("Giving up after {} transient failures in a row", retained_in_a_row);
                    failures += 1;
                    break;
                }
            }
            ProcessOutcome::Dropped { .. } => {
                retained_in_a_row = 0;
                failures += 1;
            }
            ProcessOutcome::Downloaded(_) | ProcessOutcome::AlreadyCurrent(_) => {
                retained_in_a_row = 0;
            }
        }
    }

    if failures > 0 {
        Ok(error::ERROR)
    } else {
        Ok(error::SUCCESS)
    }
}

/// Mark files stale
fn handle_invalidate(
    pool: &Filepool,
    site: String,
    url: Option<String>,
    component: Option<String>,
    component_id: Option<String>,
    all: bool,
    only_unknown: bool,
) -> Result<i32> {
    if let Some(url) = url {
        if !pool.invalidate_file_by_url(&site, &url)? {
            println!("File is not in the pool");
            return Ok(error::NOT_FOUND);
        }
        println!("Invalidated 1 file");
    } else if let Some(component) = component {
        let count = pool.invalidate_files_by_component(
            &site,
            &component,
            component_id.as_deref(),
            only_unknown,
        )?;
        println!("Invalidated {} files", count);
    } else if all {
        let count = pool.invalidate_all_files(&site, only_unknown)?;
        println!("Invalidated {} files", count);
    } else {
        eprintln!("Specify --url, --component or --all");
        return Ok(error::INVALID_INPUT);
    }

    Ok(error::SUCCESS)
}

/// Remove files from the pool
async fn handle_remove(
    pool: &Filepool,
    site: String,
    url: Option<String>,
    component: Option<String>,
    component_id: Option<String>,
) -> Result<i32> {
    if let Some(url) = url {
        pool.remove_file_by_url(&site, &url).await?;
        println!("Removed {}", url);
    } else if let Some(component) = component {
        let count = pool
            .remove_files_by_component(&site, &component, component_id.as_deref())
            .await?;
        println!("Removed {} files", count);
    } else {
        eprintln!("Specify --url or --component");
        return Ok(error::INVALID_INPUT);
    }

    Ok(error::SUCCESS)
}

fn load_package_request(args: &PackageArgs) -> Result<PackageRequest> {
    let content = std::fs::read_to_string(&args.files)
        .context(format!("Failed to read {:?}", args.files))?;
    let files: Vec<PackageFile> = serde_json::from_str(&content)
        .context(format!("Failed to parse {:?}", args.files))?;
    Ok(PackageRequest {
        component: args.component.clone(),
        component_id: args.component_id.clone(),
        files,
        extra: args.extra.clone(),
        dir_path: args.dir.clone(),
    })
}

fn package_progress_printer() -> PackageProgressCallback {
    Arc::new(|progress: PackageProgress| {
        print!(
            "\r[{}/{}] {}   ",
            progress.files_done,
            progress.total_files,
            output::format_bytes(progress.loaded)
        );
        let _ = io::stdout().flush();
    })
}

/// Package commands
async fn handle_package(pool: &Filepool, action: PackageAction) -> Result<i32> {
    match action {
        PackageAction::Status {
            site,
            component,
            component_id,
            json,
        } => {
            match pool.get_package_entry(&site, &component, component_id.as_deref())? {
                Some(entry) => print!("{}", output::format_package_entry(&entry, json)),
                None => println!("Status: {}", crate::pool::status::PackageStatus::NotDownloaded),
            }
            Ok(error::SUCCESS)
        }
        PackageAction::Download { site, package } => {
            register_token(pool, &site, package.token.as_ref());
            let request = load_package_request(&package)?;
            pool.download_package(&site, &request, Some(package_progress_printer()))
                .await?;
            println!("\n✓ Package downloaded ({} files)", request.files.len());
            Ok(error::SUCCESS)
        }
        PackageAction::Prefetch { site, package } => {
            register_token(pool, &site, package.token.as_ref());
            let request = load_package_request(&package)?;
            let worker = pool.start_queue();
            let result = pool
                .prefetch_package(&site, &request, Some(package_progress_printer()))
                .await;
            if let Some(worker) = worker {
                worker.stop();
            }
            result?;
            println!("\n✓ Package prefetched ({} files)", request.files.len());
            Ok(error::SUCCESS)
        }
        PackageAction::Size { site, package } => {
            register_token(pool, &site, package.token.as_ref());
            let request = load_package_request(&package)?;
            let estimate = pool.get_files_download_size(&site, &request.files).await?;
            let prefix = if estimate.total { "" } else { "at least " };
            println!("Download size: {}{}", prefix, output::format_bytes(estimate.size));
            Ok(error::SUCCESS)
        }
        PackageAction::Restore { site } => {
            let restored = pool.restore_package_status(&site)?;
            println!("Restored {} packages", restored);
            Ok(error::SUCCESS)
        }
    }
}
