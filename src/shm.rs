//! Shared telemetry block
//!
//! A file-backed mapping shared between the daemon and every drive-mode
//! client process: one lock header followed by a fixed array of
//! [`TelemetryFrame`] records indexed by telemetry slot.
//!
//! Lock discipline (deliberately inverted, do not "fix"): a client writing
//! its own slot's run data takes the READ lock, so clients touching disjoint
//! slots proceed concurrently; the daemon takes the WRITE lock only when it
//! needs a consistent snapshot across all slots at once (bulk assembly,
//! feedback recording, slot scrub).

use crate::wire::{FeedbackData, RunData, LINK_PAYLOAD_BUDGET};
use crate::{Result, XbeedError};
use bytemuck::{Pod, Zeroable};
use memmap2::MmapRaw;
use std::fs::OpenOptions;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

const BLOCK_MAGIC: u32 = 0x7862_6544; // "xbeD"
const BLOCK_VERSION: u32 = 1;

/// Number of telemetry slots: the link payload budget divided by the packed
/// run-data record size.
pub const SLOT_COUNT: usize = LINK_PAYLOAD_BUDGET / RunData::SIZE;

/// One telemetry slot as it lives in the shared mapping.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct TelemetryFrame {
    /// Last client refresh of `run_data`, CLOCK_MONOTONIC nanoseconds
    pub timestamp_ns: u64,
    /// Rolling feedback-solicitation outcome history, newest outcome at bit 0
    pub delivery_mask: u64,
    /// Round trip of the last successful feedback solicitation
    pub latency_ns: u64,
    /// Packed RUN_DATA exactly as broadcast
    pub run_data: [u8; RunData::SIZE],
    /// Packed FEEDBACK_DATA exactly as last received
    pub feedback: [u8; FeedbackData::SIZE],
    pub inbound_rssi: u8,
    _pad: [u8; 7],
}

impl TelemetryFrame {
    pub fn run_data(&self) -> RunData {
        RunData::decode(&self.run_data)
    }

    pub fn set_run_data(&mut self, run_data: &RunData, timestamp_ns: u64) {
        self.run_data = run_data.encode();
        self.timestamp_ns = timestamp_ns;
    }

    pub fn feedback(&self) -> FeedbackData {
        FeedbackData::decode(&self.feedback)
    }
}

#[repr(C)]
struct BlockHeader {
    magic: u32,
    version: u32,
    slot_count: u32,
    _pad: u32,
    lock: libc::pthread_rwlock_t,
}

/// Frames start at the next cache line after the header.
fn frames_offset() -> usize {
    (mem::size_of::<BlockHeader>() + 63) & !63
}

fn block_size() -> usize {
    frames_offset() + SLOT_COUNT * mem::size_of::<TelemetryFrame>()
}

fn shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

/// The mapped block. The daemon `create`s it (and unlinks it on drop);
/// clients `open` it.
pub struct SharedTelemetryBlock {
    map: MmapRaw,
    path: PathBuf,
    owner: bool,
}

impl SharedTelemetryBlock {
    /// Create (or recreate) the block and initialize the process-shared lock.
    pub fn create(name: &str) -> Result<Self> {
        let path = shm_dir().join(format!("xbeed_{}", name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| XbeedError::SharedMemory(format!("create {:?}: {}", path, e)))?;
        file.set_len(block_size() as u64)
            .map_err(|e| XbeedError::SharedMemory(format!("size {:?}: {}", path, e)))?;

        let map = MmapRaw::map_raw(&file)
            .map_err(|e| XbeedError::SharedMemory(format!("map {:?}: {}", path, e)))?;

        let block = Self {
            map,
            path,
            owner: true,
        };

        unsafe {
            std::ptr::write_bytes(block.map.as_mut_ptr(), 0, block_size());

            let header = block.header();
            let mut attr: libc::pthread_rwlockattr_t = mem::zeroed();
            if libc::pthread_rwlockattr_init(&mut attr) != 0
                || libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED)
                    != 0
                || libc::pthread_rwlock_init(std::ptr::addr_of_mut!((*header).lock), &attr) != 0
            {
                return Err(XbeedError::SharedMemory(
                    "failed to initialize process-shared lock".to_string(),
                ));
            }
            libc::pthread_rwlockattr_destroy(&mut attr);

            (*header).slot_count = SLOT_COUNT as u32;
            (*header).version = BLOCK_VERSION;
            (*header).magic = BLOCK_MAGIC;
        }

        Ok(block)
    }

    /// Open an existing block created by a running daemon.
    pub fn open(name: &str) -> Result<Self> {
        let path = shm_dir().join(format!("xbeed_{}", name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| XbeedError::SharedMemory(format!("open {:?}: {}", path, e)))?;

        let map = MmapRaw::map_raw(&file)
            .map_err(|e| XbeedError::SharedMemory(format!("map {:?}: {}", path, e)))?;
        if map.len() < block_size() {
            return Err(XbeedError::SharedMemory(format!(
                "block {:?} too small: {} < {}",
                path,
                map.len(),
                block_size()
            )));
        }

        let block = Self {
            map,
            path,
            owner: false,
        };

        let header = block.header();
        unsafe {
            if (*header).magic != BLOCK_MAGIC || (*header).version != BLOCK_VERSION {
                return Err(XbeedError::SharedMemory(format!(
                    "block {:?} has wrong magic/version",
                    block.path
                )));
            }
            if (*header).slot_count != SLOT_COUNT as u32 {
                return Err(XbeedError::SharedMemory(format!(
                    "block {:?} has {} slots, expected {}",
                    block.path,
                    (*header).slot_count,
                    SLOT_COUNT
                )));
            }
        }

        Ok(block)
    }

    fn header(&self) -> *mut BlockHeader {
        self.map.as_mut_ptr() as *mut BlockHeader
    }

    fn frames_ptr(&self) -> *mut TelemetryFrame {
        unsafe { self.map.as_mut_ptr().add(frames_offset()) as *mut TelemetryFrame }
    }

    /// Take the aggregate (write) lock: the daemon-side consistent view of
    /// every slot at once.
    pub fn lock_aggregate(&self) -> AggregateGuard<'_> {
        unsafe {
            libc::pthread_rwlock_wrlock(std::ptr::addr_of_mut!((*self.header()).lock));
        }
        AggregateGuard { block: self }
    }

    /// Take the slot-writer (read) lock for one slot: concurrent with other
    /// slot writers, excluded against the aggregator. Correctness relies on
    /// each writer touching only its own slot.
    pub fn lock_slot_writer(&self, slot: usize) -> SlotWriterGuard<'_> {
        assert!(slot < SLOT_COUNT, "slot {} out of range", slot);
        unsafe {
            libc::pthread_rwlock_rdlock(std::ptr::addr_of_mut!((*self.header()).lock));
        }
        SlotWriterGuard { block: self, slot }
    }
}

impl Drop for SharedTelemetryBlock {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// The raw pointers only ever target the shared mapping, which outlives and
// travels with the struct.
unsafe impl Send for SharedTelemetryBlock {}

pub struct AggregateGuard<'a> {
    block: &'a SharedTelemetryBlock,
}

impl Deref for AggregateGuard<'_> {
    type Target = [TelemetryFrame];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.block.frames_ptr(), SLOT_COUNT) }
    }
}

impl DerefMut for AggregateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { std::slice::from_raw_parts_mut(self.block.frames_ptr(), SLOT_COUNT) }
    }
}

impl Drop for AggregateGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_rwlock_unlock(std::ptr::addr_of_mut!((*self.block.header()).lock));
        }
    }
}

pub struct SlotWriterGuard<'a> {
    block: &'a SharedTelemetryBlock,
    slot: usize,
}

impl Deref for SlotWriterGuard<'_> {
    type Target = TelemetryFrame;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.block.frames_ptr().add(self.slot) }
    }
}

impl DerefMut for SlotWriterGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.block.frames_ptr().add(self.slot) }
    }
}

impl Drop for SlotWriterGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_rwlock_unlock(std::ptr::addr_of_mut!((*self.block.header()).lock));
        }
    }
}

/// CLOCK_MONOTONIC in nanoseconds, the clock slot timestamps use.
pub fn now_monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
