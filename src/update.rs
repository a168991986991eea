// SPDX-FileCopyrightText: 2026 Flowtrack contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serialization of table state to the collector-facing outputs
//!
//! Two independent consumers read what the flow table accumulates:
//!
//! * [`write_update`] drains entries the collector has not seen yet
//!   into a compressed update stream and promotes them to the sent
//!   state. Called once per reporting cycle with a fresh gzip sink
//!   from [`open_sink`].
//! * [`write_thresholded_ips`] snapshots heavy hitters into a local
//!   plaintext file for operator inspection. Purely observational;
//!   the table is not touched.
//!
//! Both formats are line-oriented ASCII. The update header reports
//! cumulative expired/dropped totals rather than deltas so a collector
//! that misses a file can still reconstruct rates from its own memory.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

#[cfg(feature = "anonymize")]
use crate::anon;
use crate::pkt::flowtab::{FlowTab, Occupancy, CAPACITY};

/// Packet count at which a flow is reported as a heavy hitter.
/// Must stay below the counter's saturation point to be meaningful.
#[cfg(feature = "thresholding")]
pub const FLOW_THRESHOLD: u8 = 32;

#[cfg(feature = "anonymize")]
fn ip_field(ip: u32) -> Result<u64> {
    anon::digest(ip).context("anonymize address")
}

#[cfg(not(feature = "anonymize"))]
fn ip_field(ip: u32) -> Result<u64> {
    Ok(ip as u64)
}

/// Stream every not-yet-sent entry into `sink`, promoting each to the
/// sent state as its record goes out.
///
/// Format: one header line `<base_ts> <live> <expired> <dropped>`,
/// one line `<idx> <src:hex> <dst:hex> <proto> <sport> <dport>` per
/// drained slot in index order, one blank terminator line.
///
/// A failed write (or a failed address digest) aborts the rest of the
/// update; slots already promoted stay promoted, and their records are
/// simply part of the truncated stream the collector will discard.
pub fn write_update<W: Write>(tab: &mut FlowTab, sink: &mut W) -> Result<()> {
    writeln!(
        sink,
        "{} {} {} {}",
        tab.base_timestamp(),
        tab.num_live(),
        tab.num_expired(),
        tab.num_dropped()
    )
    .context("update header")?;

    for idx in 0..CAPACITY {
        let e = *tab.slot(idx);
        if e.occupancy() != Occupancy::Unsent {
            continue;
        }

        let key = e.key();

        // Digest both addresses before touching the sink so a digest
        // failure aborts with no partial record emitted.
        let src = ip_field(key.src_ip)?;
        let dst = ip_field(key.dst_ip)?;

        writeln!(
            sink,
            "{idx} {src:x} {dst:x} {} {} {}",
            key.proto, key.src_port, key.dst_port
        )
        .context("update record")?;

        tab.promote_sent(idx);
    }

    writeln!(sink).context("update terminator")?;
    Ok(())
}

/// Snapshot all not-yet-sent flows whose packet count has reached
/// [`FLOW_THRESHOLD`] into the plaintext report at `path`, truncating
/// any previous report.
///
/// Addresses here stay raw: this file never leaves the machine and an
/// operator chasing an abuse report needs the real endpoints.
#[cfg(feature = "thresholding")]
pub fn write_thresholded_ips(
    tab: &FlowTab,
    path: &Path,
    session_id: u64,
    sequence: i64,
) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    writeln!(out, "{session_id} {sequence}")?;
    writeln!(out)?;

    for idx in 0..CAPACITY {
        let e = tab.slot(idx);
        if e.occupancy() == Occupancy::Unsent && e.packet_count() >= FLOW_THRESHOLD {
            let key = e.key();
            writeln!(
                out,
                "{idx} {:x} {:x} {}",
                key.src_ip,
                key.dst_ip,
                e.packet_count()
            )?;
        }
    }

    out.flush().context("flush thresholded-flows report")?;
    Ok(())
}

/// One gzip stream per reporting cycle: `<session_id>-<sequence>.gz`
/// under `dir`. The caller owns the encoder and must `finish()` it.
pub fn open_sink(dir: &Path, session_id: u64, sequence: i64) -> Result<GzEncoder<File>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create update directory {}", dir.display()))?;

    let path = dir.join(format!("{session_id}-{sequence}.gz"));
    let file =
        File::create(&path).with_context(|| format!("create {}", path.display()))?;

    Ok(GzEncoder::new(file, Compression::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::flowtab::FlowKey;

    fn seed_anon() {
        #[cfg(feature = "anonymize")]
        {
            let _ = crate::anon::init(0x517e_a5ed);
        }
    }

    fn expected_ip(ip: u32) -> String {
        #[cfg(feature = "anonymize")]
        {
            format!("{:x}", crate::anon::digest(ip).unwrap())
        }
        #[cfg(not(feature = "anonymize"))]
        {
            format!("{ip:x}")
        }
    }

    fn web_key() -> FlowKey {
        FlowKey {
            src_ip: 0x0101_0101,
            dst_ip: 0x0202_0202,
            src_port: 1000,
            dst_port: 80,
            proto: 6,
        }
    }

    /// Write that accepts exactly `budget` bytes, then errors.
    struct Choked {
        taken: Vec<u8>,
        budget: usize,
    }

    impl Write for Choked {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.taken.len() + buf.len() > self.budget {
                return Err(std::io::Error::other("sink full"));
            }
            self.taken.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn update_stream_single_flow() {
        seed_anon();

        let mut tab = FlowTab::new();
        let idx = tab.process_flow(web_key(), 1000).unwrap();

        let mut sink = Vec::new();
        write_update(&mut tab, &mut sink).unwrap();

        let src = expected_ip(0x0101_0101);
        let dst = expected_ip(0x0202_0202);
        let want = format!("1000 1 0 0\n{idx} {src} {dst} 6 1000 80\n\n");
        assert_eq!(String::from_utf8(sink).unwrap(), want);

        assert_eq!(tab.slot(idx).occupancy(), Occupancy::Sent);
        assert_eq!(tab.num_live(), 1);
    }

    #[cfg(not(feature = "anonymize"))]
    #[test]
    fn raw_addresses_are_eight_hex_digits_max() {
        let mut tab = FlowTab::new();
        let idx = tab.process_flow(web_key(), 1000).unwrap();

        let mut sink = Vec::new();
        write_update(&mut tab, &mut sink).unwrap();

        let got = String::from_utf8(sink).unwrap();
        assert_eq!(got, format!("1000 1 0 0\n{idx} 1010101 2020202 6 1000 80\n\n"));
    }

    #[test]
    fn second_update_is_bodyless() {
        seed_anon();

        let mut tab = FlowTab::new();
        tab.process_flow(web_key(), 1000).unwrap();

        let mut sink = Vec::new();
        write_update(&mut tab, &mut sink).unwrap();

        let mut sink = Vec::new();
        write_update(&mut tab, &mut sink).unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), "1000 1 0 0\n\n");
    }

    #[test]
    fn no_unsent_slots_survive_a_successful_update() {
        seed_anon();

        let mut tab = FlowTab::new();
        for n in 0..20u32 {
            let key = FlowKey {
                src_ip: 0x0a00_0000 + n,
                ..web_key()
            };
            tab.process_flow(key, 1000).unwrap();
        }

        let mut sink = Vec::new();
        write_update(&mut tab, &mut sink).unwrap();

        for idx in 0..CAPACITY {
            assert_ne!(tab.slot(idx).occupancy(), Occupancy::Unsent);
        }
    }

    #[test]
    fn failed_sink_keeps_promotions_done_so_far() {
        seed_anon();

        let mut tab = FlowTab::new();
        let ia = tab.process_flow(web_key(), 1000).unwrap();
        let other = FlowKey {
            src_ip: 0x0303_0303,
            ..web_key()
        };
        let ib = tab.process_flow(other, 1000).unwrap();

        let (first_idx, second_idx) = if ia < ib { (ia, ib) } else { (ib, ia) };
        let first_key = tab.slot(first_idx).key();

        let header = "1000 2 0 0\n".to_string();
        let rec = format!(
            "{first_idx} {} {} {} {} {}\n",
            expected_ip(first_key.src_ip),
            expected_ip(first_key.dst_ip),
            first_key.proto,
            first_key.src_port,
            first_key.dst_port
        );

        // Room for the header and the first record only.
        let mut sink = Choked {
            taken: Vec::new(),
            budget: header.len() + rec.len(),
        };

        assert!(write_update(&mut tab, &mut sink).is_err());

        // No rollback: the emitted slot stays promoted, the rest stays
        // queued for the next cycle.
        assert_eq!(tab.slot(first_idx).occupancy(), Occupancy::Sent);
        assert_eq!(tab.slot(second_idx).occupancy(), Occupancy::Unsent);
        assert_eq!(tab.num_live(), 2);
    }

    #[test]
    fn gzip_sink_round_trips() {
        use std::io::Read;

        seed_anon();

        let mut tab = FlowTab::new();
        let idx = tab.process_flow(web_key(), 1000).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut sink = open_sink(dir.path(), 42, 0).unwrap();
        write_update(&mut tab, &mut sink).unwrap();
        sink.finish().unwrap();

        let file = File::open(dir.path().join("42-0.gz")).unwrap();
        let mut text = String::new();
        flate2::read::GzDecoder::new(file)
            .read_to_string(&mut text)
            .unwrap();

        assert!(text.starts_with("1000 1 0 0\n"));
        assert!(text.contains(&format!("{idx} ")));
        assert!(text.ends_with("\n\n"));
    }

    #[cfg(feature = "thresholding")]
    #[test]
    fn thresholded_report_snapshot() {
        let mut tab = FlowTab::new();

        let heavy = web_key();
        let idx = tab.process_flow(heavy, 0).unwrap();
        for t in 1..FLOW_THRESHOLD as i64 {
            tab.process_flow(heavy, t).unwrap();
        }

        let light = FlowKey {
            src_ip: 0x0404_0404,
            ..web_key()
        };
        tab.process_flow(light, 0).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholded.log");
        write_thresholded_ips(&tab, &path, 0xDEAD_BEEF_CAFE_BABE, 7).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let want = format!(
            "16045690984503098030 7\n\n{idx} 1010101 2020202 {}\n",
            FLOW_THRESHOLD
        );
        assert_eq!(text, want);

        // Observational: nothing promoted, nothing counted.
        assert_eq!(tab.slot(idx).occupancy(), Occupancy::Unsent);
        assert_eq!(tab.slot(idx).packet_count(), FLOW_THRESHOLD);
    }

    #[cfg(feature = "thresholding")]
    #[test]
    fn thresholded_report_truncates_previous() {
        let tab = FlowTab::new();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholded.log");
        std::fs::write(&path, "stale contents\n").unwrap();

        write_thresholded_ips(&tab, &path, 1, 0).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1 0\n\n");
    }
}
