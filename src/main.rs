//! # Media Deck Application Entry Point
//!
//! Loads configuration, builds the transport set, and runs the
//! coordination loop. Two wirings exist: the real one (network time and
//! weather, USB gadget HID) and a simulation mode (`--sim`) that runs
//! the full loop against scripted collaborators for testing on a
//! desktop without hardware or network.

// Test modules
#[cfg(test)]
mod tests;

use anyhow::Context;
use env_logger::Env;
use log::{info, warn};
use mediadeck_lib::config::Config;
use mediadeck_lib::net::{HttpWeatherSource, ProbeWifiLink, SntpTimeSource};
use mediadeck_lib::renderer::TerminalDisplay;
use mediadeck_lib::scheduler::{DeckRuntime, Transports};
use mediadeck_lib::sim::{
    canned_weather_body, LinkScript, LoggingHid, ScriptedInput, ScriptedLink,
    ScriptedWeatherSource, WeatherScript,
};
use mediadeck_lib::transport::HidTransport;
use std::env;
use std::time::Duration;

fn config_path_from_args() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }
    None
}

/// Run the loop against scripted collaborators: the link associates after
/// a few polls, time comes from the host clock, weather is a canned
/// response. Useful for watching the terminal display without a network.
fn run_sim(config: &Config) -> anyhow::Result<()> {
    info!("simulation mode: scripted link, host clock, canned weather");

    let transports = Transports {
        link: ScriptedLink::new(vec![LinkScript::Succeed { after_polls: 3 }]),
        time: mediadeck_lib::net::HostTimeSource::new(),
        weather: ScriptedWeatherSource::new(vec![WeatherScript::Reply(canned_weather_body(
            &config.weather.city,
            18.5,
            "Clouds",
        ))]),
        hid: LoggingHid,
        display: TerminalDisplay,
        input: ScriptedInput::new(config.input.buttons.len(), config.input.encoders.len()),
    };

    let mut runtime = DeckRuntime::new(config, transports).context("assemble runtime")?;
    runtime.show_boot_frame();
    runtime.run_forever()
}

fn open_hid(config: &Config) -> Box<dyn HidTransport> {
    #[cfg(unix)]
    if !config.hid.keyboard_dev.is_empty() && !config.hid.consumer_dev.is_empty() {
        match mediadeck_lib::hid_gadget::GadgetHid::open(
            &config.hid.keyboard_dev,
            &config.hid.consumer_dev,
        ) {
            Ok(gadget) => return Box::new(gadget),
            Err(err) => {
                warn!("hid gadget unavailable ({err}), reports will be logged instead");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = config;
    Box::new(LoggingHid)
}

fn run_real(config: &Config, handle: tokio::runtime::Handle) -> anyhow::Result<()> {
    let weather_timeout = Duration::from_secs(config.timing.weather_timeout_s);

    let transports = Transports {
        link: ProbeWifiLink::new(handle.clone(), config.wifi.probe_addr.clone()),
        time: SntpTimeSource::new(handle.clone(), config.time.ntp_server.clone()),
        weather: HttpWeatherSource::new(handle, weather_timeout)
            .context("build http client")?,
        hid: open_hid(config),
        display: TerminalDisplay,
        input: ScriptedInput::new(config.input.buttons.len(), config.input.encoders.len()),
    };

    let mut runtime = DeckRuntime::new(config, transports).context("assemble runtime")?;
    runtime.show_boot_frame();
    runtime.run_forever()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // Configuration errors are fatal before the loop starts; a deck with
    // a broken config should fail loudly, not limp.
    let config = match config_path_from_args() {
        Some(path) => Config::load_from_path(&path).with_context(|| format!("load {path}"))?,
        None => Config::load().context("load configuration")?,
    };

    let sim_mode = env::args().any(|arg| arg == "--sim");
    if sim_mode {
        return run_sim(&config);
    }

    // The runtime handle outlives the loop; spawned network work runs on
    // its worker threads while the tick loop owns the main thread.
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    run_real(&config, rt.handle().clone())
}
