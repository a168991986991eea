// SPDX-FileCopyrightText: 2026 Flowtrack contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Keyed anonymization of IP addresses for the update stream
//!
//! Update files leave the machine; raw subscriber addresses must not.
//! Every address written to the compressed stream is replaced by a
//! 64-bit digest keyed on a per-deployment seed, so the same host maps
//! to the same digest across updates (and across restarts, since the
//! seed is persisted) while the address itself is not recoverable
//! without the seed file.
//!
//! This is deliberately not a cryptographic construction. The threat
//! model is casual inspection of collected updates, not a dedicated
//! adversary with the seed file in hand; anyone holding the seed can
//! trivially confirm a guessed address.

use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};

static SEED: OnceLock<u64> = OnceLock::new();

/// SplitMix64-style finalizer.
#[inline]
fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

/// Fold arbitrary seed-file contents down to the 64-bit key.
#[inline]
fn fold_seed(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0x9e37_79b9_7f4a_7c15, |acc, &b| mix(acc ^ b as u64))
}

/// Read the seed material at `path`, generating and persisting fresh
/// material on first run. Pure of global state; [`init_from_file`]
/// feeds its result into the process-wide seed.
fn load_or_create_seed(path: &str) -> Result<u64> {
    match std::fs::read(path) {
        Ok(bytes) if !bytes.is_empty() => Ok(fold_seed(&bytes)),
        Ok(_) => Err(anyhow!("seed file {path} is empty")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let fresh = mix(
                (std::process::id() as u64) ^ chrono::Utc::now().timestamp_micros() as u64,
            );
            let material = format!("{fresh:016x}\n");
            std::fs::write(path, &material)
                .with_context(|| format!("persist seed to {path}"))?;
            Ok(fold_seed(material.as_bytes()))
        }
        Err(e) => Err(e).with_context(|| format!("read seed file {path}")),
    }
}

pub fn init(seed: u64) -> Result<()> {
    SEED.set(seed)
        .map_err(|_| anyhow!("anonymization seed already initialized"))
}

/// Initialize the process-wide seed from `path`, creating the file if
/// this is the first run on this machine.
pub fn init_from_file(path: &str) -> Result<()> {
    init(load_or_create_seed(path)?)
}

/// Keyed digest of an IPv4 address. Pure given the process seed;
/// fails if no seed was initialized, which aborts the update being
/// written rather than leaking a raw address.
#[inline]
pub fn digest(ip: u32) -> Result<u64> {
    let seed = SEED
        .get()
        .ok_or_else(|| anyhow!("anonymization seed not initialized"))?;
    Ok(mix(seed ^ ip as u64))
}
