mod cmd;
mod config;
mod error;
mod image;
mod logging;
mod overwrite;
mod paths;
mod steps;
mod ui;

#[cfg(test)]
mod testutil;

use std::{fs, path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use config::{Args, Configuration};
use error::PlacerError;
use steps::{
    extract::StatvfsProbe,
    mount::{GuestMounter, MountOptions, SignalGuard},
};
use ui::{Prompt, TerminalPrompt};

const REQUIRED_PROGRAMS: [&str; 2] = ["guestmount", "guestunmount"];

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Configuration errors are reported before anything is touched.
    let mut config = match Configuration::from_args(Args::parse()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(e) => exit_with(&e),
    };

    let log_dir = config.log_path.clone().unwrap_or_else(|| PathBuf::from("./"));
    let guard = match logging::init(&log_dir) {
        Ok(guard) => guard,
        Err(e) => exit_with(&e),
    };

    let result = run(&mut config).await;
    if let Err(e) = &result {
        error!(error = %e, "stopped");
    }
    // flush the log file before exiting
    drop(guard);

    if let Err(e) = result {
        exit_with(&e);
    }
}

fn exit_with(e: &PlacerError) -> ! {
    println!();
    ui::print_error(&format!("{}", e));
    std::process::exit(1);
}

async fn run(config: &mut Configuration) -> Result<(), PlacerError> {
    ui::print_banner();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        interactive = config.interactive,
        "starting"
    );

    cmd::require_programs(&REQUIRED_PROGRAMS)?;
    if let Some(inspected) = config.inspected_image() {
        image::validate_gpt(inspected)?;
    }

    let prompt = TerminalPrompt;
    let total = if config.interactive { 3 } else { 2 };
    let mut step = 0;

    // ── Selection (interactive only) ──────────────────────────────────────────
    let mut saved_config = None;
    if config.interactive {
        step += 1;
        ui::print_step(step, total, "Package & Partition Selection");
        saved_config = steps::select::run(config, &prompt)?;
    }

    // ── Image preparation ─────────────────────────────────────────────────────
    step += 1;
    ui::print_step(step, total, "Image Preparation");
    print_summary(config);
    if config.interactive && !prompt.confirm("Do you want to continue?")? {
        return Err(PlacerError::Cancelled);
    }
    if config.no_clone {
        ui::print_warning("Working on the target image in place. A failure may leave it damaged.");
    } else {
        tokio::task::block_in_place(|| prepare_target(config, &prompt))?;
    }

    // ── Copy ──────────────────────────────────────────────────────────────────
    step += 1;
    ui::print_step(step, total, "Copying Packages");
    let signals = SignalGuard::install()?;
    steps::copy::copy_packages_to_partitions(
        config,
        Arc::new(GuestMounter),
        &signals,
        &prompt,
        &StatvfsProbe,
        &MountOptions::default(),
    )
    .await?;

    info!("all packages copied");
    ui::print_success("All packages copied successfully.");

    // Overwrite approvals given during the copy are part of the saved run.
    if let Some(path) = saved_config {
        config.save(&path)?;
        ui::print_info(&format!("Configuration {} updated.", path.display()));
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn print_summary(config: &Configuration) {
    let target = config
        .target
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let source = match &config.source {
        Some(source) if !config.no_clone => source.display().to_string(),
        _ => "(in place)".to_string(),
    };
    let partitions = config
        .partition_numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let packages = config.packages.len().to_string();
    let configuration_packages = config.configuration_packages.len().to_string();
    let config_file = config
        .config_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(interactive)".to_string());

    println!();
    ui::print_kv_box(
        "Run Summary",
        &[
            ("Config", config_file.as_str()),
            ("Target", target.as_str()),
            ("Source", source.as_str()),
            ("Packages", packages.as_str()),
            ("Config pkgs", configuration_packages.as_str()),
            ("Partitions", partitions.as_str()),
        ],
    );
    println!();

    for pkg in &config.packages {
        ui::print_info(&format!(
            "{} → {}",
            pkg.package_path.display(),
            pkg.target_directory
        ));
    }
    for pkg in &config.configuration_packages {
        ui::print_info(&format!("{} → /", pkg.package_path.display()));
    }
    info!(packages = config.packages.len(), partitions = %partitions, "run summary");
}

/// Clones the source image over the target. An existing target is deleted;
/// interactive runs ask first.
fn prepare_target(config: &Configuration, prompt: &dyn Prompt) -> Result<(), PlacerError> {
    let (Some(source), Some(target)) = (&config.source, &config.target) else {
        return Err(PlacerError::Config(
            "source and target image paths are required to clone".into(),
        ));
    };

    if target.exists() {
        let question = format!(
            "File {} already exists. Do you want to delete it?",
            target.display()
        );
        if config.interactive && !prompt.confirm(&question)? {
            return Err(PlacerError::Config(
                "file already exists and user chose not to delete it".into(),
            ));
        }
        fs::remove_file(target).map_err(PlacerError::file("delete existing image", target))?;
        info!(target = %target.display(), "deleted existing target image");
    }

    image::clone_image(source, target)
}
