// dmxpanel - Terminal control panel for the ESP32 DMX512 controller
// Live channel state over the device's WebSocket, liveness probing, firmware
// upload, WiFi scan and maintenance commands
use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod bindings;
mod config;
mod device;
mod firmware;
mod logging;
mod panel;
mod reachability;
mod session;
mod snapshot;
mod sync;
mod types;
mod ui;
mod wifi;

#[cfg(test)]
mod fake_device;

use config::{Args, Command, PanelConfig};
use device::DeviceClient;
use firmware::{FirmwareUpdateClient, UpdateOutcome, UploadProgress, UploadTask};
use logging::LogBuffer;
use panel::PanelModel;
use session::Session;
use snapshot::ChannelControlIntent;
use sync::StateSyncClient;
use types::{AppEvent, SessionExit};
use wifi::WifiScanOutcome;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg_arg = args.cfg.as_deref();
    let (mut config, config_file_exists) = match PanelConfig::load_or_default(cfg_arg) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Failed to load config file: {:#}", e);
            eprintln!("\nPlease fix the config file or delete it to regenerate with defaults.");
            return Err(e);
        }
    };

    let args_provided = config.merge_with_args(&args);

    // Save only on first run or when the command line changed something
    if !config_file_exists || args_provided {
        if let Err(e) = config.save() {
            eprintln!("⚠️  Could not save config file: {:#}", e);
        }
    }

    let command = args.command.clone().unwrap_or(Command::Monitor);
    let tui = command == Command::Monitor && !args.quiet;
    let log_buffer = if tui {
        Some(logging::init_ui(&config.log_filter))
    } else {
        logging::init_stderr(&config.log_filter);
        None
    };

    let rt = Runtime::new()?;
    let device = DeviceClient::new(&config.host, CONNECT_TIMEOUT)?;

    match command {
        Command::Monitor => match log_buffer {
            Some(log) => run_tui(&rt, &config, device, &log),
            None => rt.block_on(run_headless(&config, device)),
        },
        Command::Set { channel, value } => rt.block_on(send_level(&config, &device, channel, value)),
        Command::Upload {
            firmware,
            filesystem,
        } => rt.block_on(upload(&config, device, &firmware, &filesystem)),
        Command::WifiScan => rt.block_on(wifi_scan(&config, &device)),
        Command::FactoryReset { yes } => {
            if !yes && !confirm("Erase all device settings and reboot?")? {
                println!("Aborted.");
                return Ok(());
            }
            rt.block_on(device.factory_reset())?;
            println!("✅ Factory reset done, device is rebooting");
            Ok(())
        }
        Command::Reboot => {
            rt.block_on(device.reboot())?;
            println!("✅ Device is rebooting");
            Ok(())
        }
        Command::RawConfig => {
            let text = rt.block_on(device.raw_config())?;
            print!("{}", text);
            if !text.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        Command::SaveConfig { set } => rt.block_on(save_config(&config, &device, &set)),
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn run_tui(rt: &Runtime, config: &PanelConfig, device: DeviceClient, log: &LogBuffer) -> Result<()> {
    let mut session = Session::start(config, device, rt.handle().clone());
    let exit = ui::run(&mut session, log, config);
    rt.block_on(session.shutdown());

    match exit? {
        SessionExit::UserQuit => println!("\n👋 Monitor stopped.\n"),
        SessionExit::EventsClosed => println!("\n❌ Background tasks ended unexpectedly.\n"),
    }
    Ok(())
}

fn channel_summary(panel: &PanelModel) -> String {
    panel
        .channels()
        .iter()
        .enumerate()
        .map(|(slot, c)| format!("{}={}", slot + 1, c.output))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run_headless(config: &PanelConfig, device: DeviceClient) -> Result<()> {
    println!("📡 Monitoring {} (Ctrl+C to stop)", device.host());
    let mut session = Session::start(config, device, Handle::current());

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let exit = follow_events(&mut session, ctrl_c).await;

    session.shutdown().await;
    match exit {
        SessionExit::UserQuit => println!("\n👋 Monitor stopped.\n"),
        SessionExit::EventsClosed => bail!("background tasks ended unexpectedly"),
    }
    Ok(())
}

/// Apply session events until `quit` resolves or the queue closes.
/// `quit` is created once, so a signal that lands mid-event is not lost.
async fn follow_events(session: &mut Session, quit: impl Future<Output = ()>) -> SessionExit {
    tokio::pin!(quit);
    loop {
        tokio::select! {
            _ = &mut quit => break SessionExit::UserQuit,
            event = session.next_event() => match event {
                Some(event) => {
                    let is_snapshot = matches!(event, AppEvent::Snapshot(_));
                    session.handle_event(event);
                    if is_snapshot {
                        info!(levels = %channel_summary(session.panel()), "channel state");
                    }
                }
                None => break SessionExit::EventsClosed,
            },
        }
    }
}

/// Connect, push one intent and disconnect
async fn send_level(config: &PanelConfig, device: &DeviceClient, channel: u16, value: u8) -> Result<()> {
    let url = device.index_data_url();
    let (client, handle) = StateSyncClient::new(url.clone(), config.reconnect_delay());
    let (events_tx, mut events) = mpsc::channel(16);
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(client.run(events_tx, stop_rx));

    let connected = tokio::time::timeout(CONNECT_TIMEOUT * 2, async {
        while let Some(event) = events.recv().await {
            if matches!(event, AppEvent::SocketConnected) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    let sent = if connected {
        handle
            .send_intent(&ChannelControlIntent { channel, value })
            .map_err(anyhow::Error::from)
    } else {
        Err(anyhow::anyhow!("could not connect to {}", url))
    };

    // Queued sends are flushed before the stop signal is seen
    let _ = stop.send(true);
    let _ = task.await;
    drop(events);

    sent?;
    println!("✅ Channel {} set to {}", channel, value);
    Ok(())
}

async fn upload(config: &PanelConfig, device: DeviceClient, firmware: &Path, filesystem: &Path) -> Result<()> {
    let task = match UploadTask::from_paths(firmware, filesystem) {
        Ok(task) => task,
        Err(e) => {
            println!("❌ {}", e);
            return Err(e.into());
        }
    };

    println!("\n📤 Uploading to {}", device.host());
    println!("   Firmware:   {} ({} bytes)", task.firmware.name, task.firmware.size);
    println!("   Filesystem: {} ({} bytes)", task.filesystem.name, task.filesystem.size);

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}%")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );
    let bar = pb.clone();
    let on_progress = Arc::new(move |p: UploadProgress| bar.set_position(p.percent() as u64));

    let client = FirmwareUpdateClient::new(device, config.upload_timeout());
    match client.submit(&task, on_progress).await {
        Ok(UpdateOutcome::Rebooting {
            reboot_acknowledged,
        }) => {
            pb.finish_and_clear();
            println!("   ✅ Upload successful! Device will restart.");
            if !reboot_acknowledged {
                println!("   ⚠️  Reboot request was not acknowledged, power-cycle the device if it does not restart");
            }
            Ok(())
        }
        Err(e) => {
            pb.finish_and_clear();
            println!("   ❌ {}", e);
            Err(e.into())
        }
    }
}

async fn wifi_scan(config: &PanelConfig, device: &DeviceClient) -> Result<()> {
    println!("📡 Scanning for WiFi networks...");
    // No monitor runs here, the gate only matters inside a session
    let gate = reachability::MonitorGate::new();
    let outcome =
        wifi::scan_networks(device, &gate, config.wifi_rescan_delay(), config.wifi_scan_timeout()).await;
    match outcome {
        WifiScanOutcome::Networks(networks) => {
            println!("{:<32} {:>8} {:>4}  {}", "SSID", "RSSI", "CH", "SECURITY");
            for network in &networks {
                let [ssid, rssi, channel, security] = network.row();
                println!("{:<32} {:>8} {:>4}  {}", ssid, rssi, channel, security);
            }
            Ok(())
        }
        WifiScanOutcome::NoNetworksFound => {
            println!("No networks found");
            Ok(())
        }
        WifiScanOutcome::Failed(reason) => {
            println!("❌ {}", reason);
            bail!("WiFi scan failed")
        }
    }
}

/// Read the device state from one full snapshot, apply overrides, post the form
async fn save_config(config: &PanelConfig, device: &DeviceClient, overrides: &[(String, String)]) -> Result<()> {
    let mut session = Session::start(config, device.clone(), Handle::current());

    let loaded = tokio::time::timeout(CONNECT_TIMEOUT * 2, async {
        while !session.panel().has_full_snapshot() {
            match session.next_event().await {
                Some(event) => session.handle_event(event),
                None => return false,
            }
        }
        true
    })
    .await
    .unwrap_or(false);

    let mut panel = session.panel().clone();
    session.shutdown().await;
    if !loaded {
        bail!("no configuration received from {}", device.host());
    }

    for (key, value) in overrides {
        panel
            .apply_override(key, value)
            .with_context(|| format!("cannot apply {}={}", key, value))?;
    }
    let form = panel.config_form()?;
    device.save_config(&form).await?;
    println!("✅ Configuration saved, device is rebooting");
    Ok(())
}
