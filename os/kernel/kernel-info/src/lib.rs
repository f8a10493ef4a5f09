//! # Machine Layout and Boot Interface
//!
//! Authoritative constants for the 32-bit MIPS virtual address map and the
//! boot-time physical memory description consumed by the translation manager.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! * **Segments**: `kuseg` for processes, `kseg0`/`kseg1` as fixed
//!   direct maps of the low physical range, `kseg2` for mapped kernel VA
//! * **Table geometry**: base page size, entries per page-table page, size
//!   of one segment-directory slot
//! * **Per-CPU windows**: where the physical window slots of every CPU live
//! * **Tags**: the reserved kernel ASID and the hardware ASID width
//!
//! ### Boot Information ([`boot`])
//! * **Physical regions**: half-open RAM ranges reported by firmware
//! * **Normalization**: sort, page-align and merge in place
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │            kuseg                │
//!             │   (per-process, TLB mapped,     │
//!             │    ASID tagged)                 │
//! 0x8000_0000 ├─────────────────────────────────┤ KSEG0_BASE
//!             │   kseg0: cached direct map      │
//!             │   of physical [0, 512 MiB)      │
//! 0xA000_0000 ├─────────────────────────────────┤ KSEG1_BASE
//!             │   kseg1: uncached direct map    │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_BASE
//!             │   kseg2: kernel VA, TLB mapped, │
//!             │   global entries                │
//! 0xFFC0_0000 ├─────────────────────────────────┤ WINDOW_BASE
//!             │   per-CPU physical windows      │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Physical frames at or above [`DIRECT_MAP_SIZE`](memory::DIRECT_MAP_SIZE)
//! have no permanent mapping and are reached through the window slots.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
