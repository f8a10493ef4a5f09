//! # Physical map for a software-refilled TLB
//!
//! Machine-dependent half of a virtual memory system on a 32-bit MIPS-style
//! processor: per-address-space translation tables, the reverse map from
//! physical frames to their mappings, ASID management and TLB coherence
//! across CPUs.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌──────────────────────────────┐
//!   Pmap::cpu(n) ───────► │ CpuContext  (one per call)   │
//!                         └──────┬───────────────┬───────┘
//!                                │               │
//!          space lock (first)    ▼               ▼   frame-queue lock (second)
//!   ┌──────────────────────────────┐   ┌─────────────────────────────┐
//!   │ AddressSpace                 │   │ PageQueues                  │
//!   │  TranslationTable            │◄──┤  FrameMd per managed frame  │
//!   │   directory ─► table pages   │   │   pv: [PvHandle]            │
//!   │  pv: va ─► PvHandle ─────────┼──►│  PvPool (bounded arena)     │
//!   └──────────────────────────────┘   └─────────────────────────────┘
//!                                │
//!                                ▼ leaf locks
//!               PerCpu { SoftTlb, AsidAllocator, Mailbox, windows }
//! ```
//!
//! * Every valid translation of a managed frame owns one reverse-mapping
//!   record, indexed by address in its space and by frame in the frame
//!   metadata.
//! * `D` doubles as the modified bit. Writable managed mappings start
//!   clean and the first store traps into [`CpuContext::emulate_modified`].
//! * Per-CPU ASIDs are generation-tagged; exhausting the tag space flushes
//!   the CPU's user TLB entries and starts a new generation.
//! * TLB shootdowns reach other CPUs through their mailboxes. A CPU spinning
//!   on any lock keeps answering its own mailbox.
//!
//! ## Example
//!
//! ```rust
//! use kernel_info::boot::PhysRegion;
//! use kernel_memory_addresses::{FrameNumber, VirtualAddress};
//! use kernel_pmap::{EnterFlags, Pmap, PmapConfig, Protection};
//!
//! let ram = [PhysRegion::new(0, 0x0100_0000)];
//! let pmap = Pmap::bootstrap(PmapConfig::default(), &ram).unwrap();
//! let cpu = pmap.cpu(0);
//!
//! let space = pmap.create();
//! let va = VirtualAddress::new(0x0040_0000);
//! let frame = FrameNumber::new(0x100);
//! cpu.enter(&space, va, frame, Protection::RW, EnterFlags::ACCESS_READ).unwrap();
//! assert_eq!(cpu.extract(&space, va), Some(frame));
//!
//! cpu.remove(&space, va, va + 0x1000);
//! cpu.release(&space);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod arena;
mod asid;
mod audit;
mod cache;
mod config;
mod cpu;
mod error;
mod frame;
mod invalidate;
mod kernel;
mod mapping;
mod page;
mod pmap;
mod prot;
mod pte;
mod ptp;
mod pv;
mod queues;
mod smp;
mod space;
mod table;
mod tlb;
mod window;

pub use asid::Asid;
pub use audit::AuditError;
pub use cache::{CacheOps, NoCacheOps};
pub use config::{IpiDelivery, MIN_TABLE_FRAMES, PmapConfig};
pub use cpu::{CpuId, CpuSet};
pub use error::{ConfigError, PmapError};
pub use frame::PageQueue;
pub use pmap::{CpuContext, Pmap};
pub use prot::{EnterFlags, Mincore, Protection};
pub use pte::{CacheAttr, PtEntry};
pub use ptp::{FrameSource, ReservedFrames};
pub use pv::{InactiveFirst, PvStats, VictimSelector};
pub use space::{AddressSpace, SpaceId};
pub use tlb::TlbEntry;
pub use window::PhysWindow;
