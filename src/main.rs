// Copyright 2026 Flowtrack contributors.
//
// This file is part of Flowtrack.
//
// Flowtrack is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// Flowtrack is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
// for more details.
//
// You should have received a copy of the GNU General Public License
// along with Flowtrack. If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Result, Context};
use std::sync::atomic::{AtomicBool, Ordering};

mod platform;
mod pkt;
mod update;
mod log;
mod opt;

#[cfg(feature = "anonymize")]
mod anon;

use log::LogLevel;

const PROJECT_NAME: &str = "Flowtrack";
const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Wall-clock seconds. The one clock every table timestamp, update
/// header and session id comes from.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

fn trap_exit() -> Result<()> {
    ctrlc::set_handler(|| {
        RUNNING.store(false, Ordering::SeqCst);
    }).context("handler: ")?;

    Ok(())
}

fn main_0() -> Result<()> {
    opt::parse_args();

    splash!(
        r#"{PROJECT_NAME} v{PKG_VERSION} - {PKG_DESCRIPTION}

Press Ctrl+c (or stop the service) to stop."#
    );

    platform::ensure_root()?;

    // Fork first: the signal-handler thread would not survive it.
    if opt::daemon() {
        daemonize::Daemonize::new().start().context("daemonize")?;
    }

    trap_exit()?;

    #[cfg(feature = "anonymize")]
    anon::init_from_file(opt::seed_file())?;

    platform::run()?;

    Ok(())
}

fn main() {
    let code = match main_0() {
        Ok(()) => 0,
        Err(e) => {
            log_println!(LogLevel::Error, "{e}");

            for (i, cause) in e.chain().skip(1).enumerate() {
                log_println!(LogLevel::Error, "caused by[{i}]: {cause}");
            }
            1
        }
    };

    std::process::exit(code);
}
