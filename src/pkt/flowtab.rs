// SPDX-FileCopyrightText: 2026 Flowtrack contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-capacity open-addressed table of unidirectional flows
//!
//! Every captured IPv4 packet is folded into this table by
//! [`FlowTab::process_flow`]: either it refreshes the entry for a
//! 5-tuple we have already seen, or it claims a slot for a new one.
//! The update writer later drains entries in the *unsent* state into
//! the compressed update stream and promotes them to *sent* (see
//! `crate::update`), which is why occupancy distinguishes the two.
//!
//! One could consider a growable `HashMap<FlowKey, ...>` here. The
//! problem is that this runs unattended on small routers for months:
//! memory must be a single allocation fixed at startup, and the work
//! per packet must be bounded no matter how adversarial the traffic
//! mix is. So the table is a flat array of [`CAPACITY`] entries,
//! probed quadratically for at most [`MAX_PROBES`] steps; when the
//! budget is exhausted the packet is counted in `num_dropped` and
//! forgotten.
//!
//! Entries do not store absolute timestamps. Each records a signed
//! 24-bit offset from the table-wide `base_timestamp`, which keeps the
//! whole entry in one `u32` of metadata next to its 13-byte key. The
//! price is that the offsets drift out of range as the process lives
//! on; [`FlowTab::advance_base_timestamp`] rebases them in place and
//! evicts anything too old to represent. Should the caller forget to
//! rebase, [`FlowTab::process_flow`] refuses out-of-range timestamps
//! instead of corrupting offsets.
//!
//! Expiration is lazy: a stale entry is only reclaimed when a probe
//! sequence happens to traverse its slot. This costs nothing on the
//! hot path and needs no timer wheel, but it means `num_expired`
//! advances only as slots are touched.

use std::fmt;
use std::net::Ipv4Addr;

use crate::log_println;
use crate::log::LogLevel;

/// Number of slots in [`FlowTab`]; fixed at construction, never grown.
pub const CAPACITY: usize = 1 << 15; // 32768

/// Probe budget per [`FlowTab::process_flow`] call.
pub const MAX_PROBES: usize = 32;

/// Linear and quadratic probe coefficients:
/// `slot(i) = (hash + C1*i + C2*i*i) % CAPACITY`.
const C1: usize = 1;
const C2: usize = 3;

/// Entries untouched for longer than this are reclaimed when probed.
pub const EXPIRATION_SECONDS: i64 = 600;

/// Representable range of an entry's last-update offset (24-bit
/// two's complement; see [`FlowEntry`] packing).
pub const MAX_OFFSET: i64 = (1 << 23) - 1;
pub const MIN_OFFSET: i64 = -(1 << 23);

/// Saturation point of the per-entry packet counter (6 bits).
pub const PKT_COUNT_MAX: u8 = 63;

/// Unidirectional flow identity.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl FlowKey {
    const ZERO: Self = Self {
        src_ip: 0,
        dst_ip: 0,
        src_port: 0,
        dst_port: 0,
        proto: 0,
    };

    /// Canonical byte layout the hash is computed over. Fixed so that
    /// an alternate [`HashFn`] sees the same input as the default.
    #[inline]
    pub fn bytes(&self) -> [u8; 13] {
        let mut b = [0u8; 13];
        b[0..4].copy_from_slice(&self.src_ip.to_be_bytes());
        b[4..8].copy_from_slice(&self.dst_ip.to_be_bytes());
        b[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        b[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        b[12] = self.proto;
        b
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto={}",
            Ipv4Addr::from(self.src_ip),
            self.src_port,
            Ipv4Addr::from(self.dst_ip),
            self.dst_port,
            self.proto
        )
    }
}

/// Slot state.
///
/// `Empty` terminates a probe sequence (the key cannot be further
/// along); `Deleted` does not, it is a tombstone left by expiration
/// or rebasing and is reused by later inserts. A slot never returns
/// to `Empty` short of a full reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Occupancy {
    Empty = 0,
    /// Live, not yet written to the update stream.
    Unsent = 1,
    /// Live, already written; kept so repeats refresh instead of
    /// reinserting.
    Sent = 2,
    Deleted = 3,
}

impl Occupancy {
    #[inline]
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Occupancy::Empty,
            1 => Occupancy::Unsent,
            2 => Occupancy::Sent,
            _ => Occupancy::Deleted,
        }
    }

    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, Occupancy::Unsent | Occupancy::Sent)
    }
}

#[derive(Clone, Copy)]
pub struct FlowEntry {
    key: FlowKey,

    /// [STATE(2) | COUNT(6) | OFF(24)]
    ///   * OFF: `last_update_seconds - base_timestamp`, 24-bit two's
    ///     complement
    ///   * COUNT: saturating packet counter, meaningful while Unsent
    ///   * STATE: [`Occupancy`] tag
    meta: u32,
}

impl FlowEntry {
    const S_COUNT: u32 = 24;
    const S_STATE: u32 = 30;

    /// Offset lives in the low bits; no shift needed.
    const OFF_MASK: u32 = (1 << 24) - 1;

    const EMPTY: Self = Self {
        key: FlowKey::ZERO,
        meta: 0,
    };

    #[inline]
    fn new(key: FlowKey, occupancy: Occupancy, count: u8, off: i64) -> Self {
        let mut e = Self {
            key,
            meta: ((occupancy as u32) << Self::S_STATE)
                | (((count & PKT_COUNT_MAX) as u32) << Self::S_COUNT),
        };
        e.set_offset(off);
        e
    }

    #[inline]
    pub fn key(&self) -> FlowKey {
        self.key
    }

    #[inline]
    pub fn occupancy(&self) -> Occupancy {
        Occupancy::from_bits((self.meta >> Self::S_STATE) as u8)
    }

    #[inline]
    fn set_occupancy(&mut self, occ: Occupancy) {
        self.meta = (self.meta & !(0x3 << Self::S_STATE)) | ((occ as u32) << Self::S_STATE);
    }

    #[inline]
    pub fn packet_count(&self) -> u8 {
        ((self.meta >> Self::S_COUNT) as u8) & PKT_COUNT_MAX
    }

    #[inline]
    fn bump_count(&mut self) {
        self.meta += 1 << Self::S_COUNT;
    }

    /// Sign-extend the low 24 bits.
    #[inline]
    pub fn offset(&self) -> i64 {
        ((((self.meta & Self::OFF_MASK) << 8) as i32) >> 8) as i64
    }

    #[inline]
    fn set_offset(&mut self, off: i64) {
        debug_assert!((MIN_OFFSET..=MAX_OFFSET).contains(&off));
        self.meta = (self.meta & !Self::OFF_MASK) | ((off as u32) & Self::OFF_MASK);
    }
}

impl fmt::Debug for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlowEntry{{ {:?}, state={:?}, count={}, off={}, meta=0x{:08x} }}",
            self.key,
            self.occupancy(),
            self.packet_count(),
            self.offset(),
            self.meta
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// `now` is not representable as an offset from the current base
    /// timestamp; the caller should rebase and retry.
    TimestampOutOfRange,
    /// Probe budget exhausted without finding a reusable slot.
    TableFull,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::TimestampOutOfRange => write!(f, "timestamp out of offset range"),
            FlowError::TableFull => write!(f, "no reusable slot within probe budget"),
        }
    }
}

impl std::error::Error for FlowError {}

pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Replaceable 5-tuple hash, taken over [`FlowKey::bytes`].
pub type HashFn = fn(&FlowKey) -> u32;

/// FNV-1a, 32-bit. Non-cryptographic; collisions only cost probes.
#[inline]
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[inline]
pub fn default_hash(key: &FlowKey) -> u32 {
    fnv1a(&key.bytes())
}

pub struct FlowTab {
    entries: Box<[FlowEntry]>,

    /// Epoch all entry offsets are measured from. Reassigned to `now`
    /// whenever the first entry lands in an empty table, shifted by
    /// [`Self::advance_base_timestamp`] otherwise.
    base_ts: i64,

    /// Slots currently Unsent or Sent.
    num_live: u32,

    /// Total entries reclaimed by lazy expiration since start.
    num_expired: u64,

    /// Total packets refused since start (probe budget exhausted or
    /// timestamp out of range).
    num_dropped: u64,

    hash: HashFn,
}

impl FlowTab {
    pub fn new() -> Self {
        Self::with_hash(default_hash)
    }

    /// Same table, alternate hash. Meant for tests that need to force
    /// collision paths.
    pub fn with_hash(hash: HashFn) -> Self {
        Self {
            entries: vec![FlowEntry::EMPTY; CAPACITY].into_boxed_slice(),
            base_ts: 0,
            num_live: 0,
            num_expired: 0,
            num_dropped: 0,
            hash,
        }
    }

    #[inline]
    pub fn base_timestamp(&self) -> i64 {
        self.base_ts
    }

    #[inline]
    pub fn num_live(&self) -> u32 {
        self.num_live
    }

    #[inline]
    pub fn num_expired(&self) -> u64 {
        self.num_expired
    }

    #[inline]
    pub fn num_dropped(&self) -> u64 {
        self.num_dropped
    }

    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> &FlowEntry {
        &self.entries[idx]
    }

    /// Unsent -> Sent, once the update writer has emitted the slot.
    /// Counter and offset stay as they are; the count is frozen by the
    /// Unsent check in [`Self::process_flow`], not erased.
    #[inline]
    pub(crate) fn promote_sent(&mut self, idx: usize) {
        debug_assert_eq!(self.entries[idx].occupancy(), Occupancy::Unsent);
        self.entries[idx].set_occupancy(Occupancy::Sent);
    }

    /// Fold one observed packet into the table: refresh the live entry
    /// matching `key`, or claim a slot for it. Returns the slot index.
    ///
    /// Stale entries along the probe path are reclaimed on the way,
    /// whether or not they have been written out yet; an unsent entry
    /// that expires is simply lost. Under memory pressure that is the
    /// intended trade.
    pub fn process_flow(&mut self, key: FlowKey, now: i64) -> FlowResult<usize> {
        if self.num_live > 0 {
            let off = now - self.base_ts;
            if !(MIN_OFFSET..=MAX_OFFSET).contains(&off) {
                self.num_dropped += 1;
                return Err(FlowError::TimestampOutOfRange);
            }
        }

        let h = (self.hash)(&key) as usize;
        let mut reuse: Option<usize> = None;

        for i in 0..MAX_PROBES {
            let idx = (h + C1 * i + C2 * i * i) % CAPACITY;

            // Reclaim anything stale we touch, same-key or not. Done
            // before the match check so a dead flow with our key is
            // reborn fresh instead of refreshed.
            let stale = {
                let e = &self.entries[idx];
                e.occupancy().is_live()
                    && self.base_ts + e.offset() + EXPIRATION_SECONDS < now
            };
            if stale {
                #[cfg(debug_assertions)]
                log_println!(LogLevel::Debug, "flowtab: expire {idx}; {:?}", self.entries[idx]);

                self.entries[idx].set_occupancy(Occupancy::Deleted);
                self.num_live -= 1;
                self.num_expired += 1;
            }

            let e = &mut self.entries[idx];

            if e.occupancy().is_live() && e.key == key {
                e.set_offset(now - self.base_ts);
                if cfg!(feature = "thresholding")
                    && e.occupancy() == Occupancy::Unsent
                    && e.packet_count() < PKT_COUNT_MAX
                {
                    e.bump_count();
                }
                return Ok(idx);
            }

            if !e.occupancy().is_live() && reuse.is_none() {
                reuse = Some(idx);
            }

            if e.occupancy() == Occupancy::Empty {
                break; // key cannot be further along the probe path
            }
        }

        let Some(idx) = reuse else {
            log_println!(LogLevel::Debug, "flowtab: probe budget exhausted; {:?}", key);

            self.num_dropped += 1;
            return Err(FlowError::TableFull);
        };

        if self.num_live == 0 {
            // Nothing references the old base; re-anchor so this
            // entry's offset is zero.
            self.base_ts = now;
        }

        let count = if cfg!(feature = "thresholding") { 1 } else { 0 };
        self.entries[idx] = FlowEntry::new(key, Occupancy::Unsent, count, now - self.base_ts);
        self.num_live += 1;

        Ok(idx)
    }

    /// Shift the offset epoch to `new_base`, adjusting every live
    /// entry in place. Entries whose offset would leave the
    /// representable range are dropped on the spot; unlike lazy
    /// expiration this is a bookkeeping eviction and does not count
    /// in `num_expired`.
    pub fn advance_base_timestamp(&mut self, new_base: i64) {
        let shift = new_base - self.base_ts;

        for e in self.entries.iter_mut() {
            if !e.occupancy().is_live() {
                continue;
            }

            let off = e.offset() - shift;
            if (MIN_OFFSET..=MAX_OFFSET).contains(&off) {
                e.set_offset(off);
            } else {
                e.set_occupancy(Occupancy::Deleted);
                self.num_live -= 1;
            }
        }

        self.base_ts = new_base;
    }
}
