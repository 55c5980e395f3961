//! # Architecture Glue
//!
//! Pieces a 32-bit x86 board needs to implement [`Platform`](crate::Platform): the
//! trampoline image, direct-map physical memory access and a final halt. Everything
//! else in the crate is target independent and runs on the host under test.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;
