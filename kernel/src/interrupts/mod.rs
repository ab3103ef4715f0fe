//! Interrupt masking for VM critical sections.
//!
//! TLB updates have to be atomic with respect to the local core; on bare metal
//! that means running them with interrupts off. Hosted builds have no
//! interrupts to mask.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86_64::instructions::interrupts::without_interrupts;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}
