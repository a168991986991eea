// SPDX-FileCopyrightText: 2026 Flowtrack contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Result, anyhow, Context};
use std::sync::OnceLock;

use crate::log_println;

use crate::log;

use log::LogLevel;

static OPT_LOG_LEVEL: OnceLock<LogLevel> = OnceLock::new();
static OPT_NO_SPLASH: OnceLock<bool> = OnceLock::new();

static OPT_INTERFACE: OnceLock<String> = OnceLock::new();
static OPT_UPDATE_SECS: OnceLock<u64> = OnceLock::new();
static OPT_UPDATE_DIR: OnceLock<String> = OnceLock::new();
static OPT_DAEMON: OnceLock<bool> = OnceLock::new();

#[cfg(feature = "anonymize")]    static OPT_SEED_FILE: OnceLock<String> = OnceLock::new();
#[cfg(feature = "thresholding")] static OPT_THRESHOLD_LOG: OnceLock<String> = OnceLock::new();

#[cfg(debug_assertions)]      const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Debug;
#[cfg(not(debug_assertions))] const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Warning;
const DEFAULT_NO_SPLASH: bool = false;

const DEFAULT_INTERFACE: &str = "eth0";
const DEFAULT_UPDATE_SECS: u64 = 30;
const DEFAULT_UPDATE_DIR: &str = "/tmp/flowtrack-updates";
const DEFAULT_DAEMON: bool = false;

#[cfg(feature = "anonymize")]    const DEFAULT_SEED_FILE: &str = "/etc/flowtrack/seed";
#[cfg(feature = "thresholding")] const DEFAULT_THRESHOLD_LOG: &str = "/tmp/flowtrack-thresholded.log";

pub fn log_level() -> LogLevel {
    *OPT_LOG_LEVEL.get().unwrap_or(&DEFAULT_LOG_LEVEL)
}

pub fn no_splash() -> bool {
    *OPT_NO_SPLASH.get().unwrap_or(&DEFAULT_NO_SPLASH)
}

pub fn interface() -> &'static str {
    OPT_INTERFACE.get().map(String::as_str).unwrap_or(DEFAULT_INTERFACE)
}

pub fn update_secs() -> u64 {
    *OPT_UPDATE_SECS.get().unwrap_or(&DEFAULT_UPDATE_SECS)
}

pub fn update_dir() -> &'static str {
    OPT_UPDATE_DIR.get().map(String::as_str).unwrap_or(DEFAULT_UPDATE_DIR)
}

pub fn daemon() -> bool {
    *OPT_DAEMON.get().unwrap_or(&DEFAULT_DAEMON)
}

#[cfg(feature = "anonymize")]
pub fn seed_file() -> &'static str {
    OPT_SEED_FILE.get().map(String::as_str).unwrap_or(DEFAULT_SEED_FILE)
}

#[cfg(feature = "thresholding")]
pub fn threshold_log() -> &'static str {
    OPT_THRESHOLD_LOG.get().map(String::as_str).unwrap_or(DEFAULT_THRESHOLD_LOG)
}

fn take_value<T, I>(args: &mut I, arg_name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    I: Iterator<Item = String>,
{
    let raw = args
        .next()
        .ok_or_else(|| anyhow!("argument: missing value after {}", arg_name))?;
    raw.parse::<T>()
        .with_context(|| format!("argument: {}: invalid value '{}'", arg_name, raw))
}

fn usage() {
    println!("Usage: flowtrack [OPTIONS]\n");
    println!("Options:");
    println!("  --interface    <name>                    Capture interface (default: {DEFAULT_INTERFACE})");
    println!("  --update-secs  <u64>                     Seconds between updates (default: {DEFAULT_UPDATE_SECS})");
    println!("  --update-dir   <path>                    Where update files go (default: {DEFAULT_UPDATE_DIR})");

    #[cfg(feature = "thresholding")]
    println!("  --threshold-log <path>                   Heavy-hitter report (default: {DEFAULT_THRESHOLD_LOG})");
    #[cfg(feature = "anonymize")]
    println!("  --seed-file    <path>                    Anonymization seed (default: {DEFAULT_SEED_FILE})");

    println!("  --daemon                                 Detach and run in the background");
    println!("  --log-level    <debug|info|warning|error>  (default: {DEFAULT_LOG_LEVEL})");
    println!("  --no-splash                              Do not print splash messages\n");

    println!("  -h, --help                               Show this help");
}

fn set_opt<T: std::fmt::Display>(
    name: &str,
    cell: &OnceLock<T>,
    value: T,
) -> Result<()> {
    cell.set(value).map_err(|_| anyhow!("{name} already initialized"))?;

    let v = cell.get().expect("just set; qed");
    log_println!(LogLevel::Info, "{name}: {v}");

    Ok(())
}

fn parse_args_1() -> Result<()> {
    let mut log_level   = DEFAULT_LOG_LEVEL;
    let mut no_splash   = DEFAULT_NO_SPLASH;
    let mut interface   = String::from(DEFAULT_INTERFACE);
    let mut update_secs = DEFAULT_UPDATE_SECS;
    let mut update_dir  = String::from(DEFAULT_UPDATE_DIR);
    let mut daemon      = DEFAULT_DAEMON;

    #[cfg(feature = "anonymize")]
    let mut seed_file = String::from(DEFAULT_SEED_FILE);
    #[cfg(feature = "thresholding")]
    let mut threshold_log = String::from(DEFAULT_THRESHOLD_LOG);

    let mut args = std::env::args().skip(1); // program name

    while let Some(arg) = args.next() {
        let argv = arg.as_str();

        match argv {
            "-h" | "--help" => { usage(); std::process::exit(0); }
            "--interface" => { interface = take_value(&mut args, argv)?; }
            "--update-secs" => { update_secs = take_value(&mut args, argv)?; }
            "--update-dir" => { update_dir = take_value(&mut args, argv)?; }
            "--daemon" => { daemon = true; }
            "--log-level" => { log_level = take_value(&mut args, argv)?; }
            "--no-splash" => { no_splash = true; }

            #[cfg(feature = "anonymize")]
            "--seed-file" => { seed_file = take_value(&mut args, argv)?; }

            #[cfg(feature = "thresholding")]
            "--threshold-log" => { threshold_log = take_value(&mut args, argv)?; }

            _ => { return Err(anyhow!("argument: unknown: {}", arg)); }
        }
    }

    if update_secs == 0 {
        return Err(anyhow!("argument: --update-secs: must be nonzero"));
    }

    set_opt("OPT_LOG_LEVEL", &OPT_LOG_LEVEL, log_level)?;
    set_opt("OPT_NO_SPLASH", &OPT_NO_SPLASH, no_splash)?;

    set_opt("OPT_INTERFACE", &OPT_INTERFACE, interface)?;
    set_opt("OPT_UPDATE_SECS", &OPT_UPDATE_SECS, update_secs)?;
    set_opt("OPT_UPDATE_DIR", &OPT_UPDATE_DIR, update_dir)?;
    set_opt("OPT_DAEMON", &OPT_DAEMON, daemon)?;

    #[cfg(feature = "anonymize")]
    set_opt("OPT_SEED_FILE", &OPT_SEED_FILE, seed_file)?;
    #[cfg(feature = "thresholding")]
    set_opt("OPT_THRESHOLD_LOG", &OPT_THRESHOLD_LOG, threshold_log)?;

    Ok(())
}

pub fn parse_args() {
    if let Err(e) = parse_args_1() {
        log_println!(LogLevel::Error, "{e}");
        usage();
        std::process::exit(1);
    }
}
