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

pub mod rxring;

use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, anyhow};

use crate::{log_println, splash, now_seconds, opt, update};
use crate::log::LogLevel;
use crate::pkt::{self, flowtab::FlowTab};

use rxring::RxRing;

pub fn ensure_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(anyhow!("flowtrack needs root to open an AF_PACKET capture socket"));
    }

    Ok(())
}

/// One reporting cycle: snapshot heavy hitters, rebase the offset
/// epoch to now, then drain unsent entries into a fresh compressed
/// update file.
///
/// The snapshot has to come first; draining promotes exactly the
/// entries it is defined over.
fn flush_cycle(tab: &mut FlowTab, session_id: u64, sequence: &mut i64) -> Result<()> {
    #[cfg(feature = "thresholding")]
    update::write_thresholded_ips(
        tab,
        Path::new(opt::threshold_log()),
        session_id,
        *sequence,
    )?;

    tab.advance_base_timestamp(now_seconds());

    let mut sink = update::open_sink(Path::new(opt::update_dir()), session_id, *sequence)?;
    update::write_update(tab, &mut sink)?;
    sink.finish().context("finish update stream")?;

    *sequence += 1;
    Ok(())
}

fn drain_ring(ring: &mut RxRing, tab: &mut FlowTab) {
    while let Some(frame) = ring.current_packet() {
        match pkt::flow_key(frame) {
            Ok(Some(key)) => {
                // A refused packet is bookkept by the table; nothing
                // to do here but note it.
                if let Err(e) = tab.process_flow(key, now_seconds()) {
                    log_println!(LogLevel::Debug, "process_flow: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log_println!(LogLevel::Debug, "flow_key: {e}"),
        }

        ring.advance();
    }
}

pub fn run() -> Result<()> {
    use std::os::fd::AsFd;
    use nix::{
        poll::{poll, PollFd, PollFlags},
        errno::Errno,
    };

    let mut ring = RxRing::new(opt::interface())
        .with_context(|| format!("open capture ring on {}", opt::interface()))?;

    splash!("Capturing IPv4 traffic on {}.", opt::interface());

    let mut tab = FlowTab::new();
    let session_id = now_seconds() as u64;
    let mut sequence: i64 = 0;

    let period = opt::update_secs() as i64;
    let mut next_update = now_seconds() + period;

    while crate::RUNNING.load(Ordering::SeqCst) {
        {
            let fd = ring.as_fd();
            let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];

            let wait_ms = ((next_update - now_seconds()).max(0) * 1000)
                .min(i32::MAX as i64) as i32;

            match poll(&mut fds, wait_ms) {
                Ok(_) => {},
                Err(e) if e == Errno::EINTR => break,
                Err(e) => return Err(e.into()),
            }
        }                       // restore BorrowedFd to ring

        drain_ring(&mut ring, &mut tab);

        if now_seconds() >= next_update {
            log_flush(&mut tab, session_id, &mut sequence);
            next_update += period;
        }
    }

    // Last cycle on the way out so a clean shutdown loses nothing.
    drain_ring(&mut ring, &mut tab);
    flush_cycle(&mut tab, session_id, &mut sequence)?;

    Ok(())
}

/// A failed cycle must not stop capture; log it and move on. The
/// sequence number does not advance, so the next cycle recreates the
/// same update file and any partial one is overwritten.
fn log_flush(tab: &mut FlowTab, session_id: u64, sequence: &mut i64) {
    if let Err(e) = flush_cycle(tab, session_id, sequence) {
        log_println!(LogLevel::Warning, "update cycle {}: {e:#}", *sequence);
    }
}
