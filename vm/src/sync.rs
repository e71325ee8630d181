//! Locks used by the memory manager, built on [spin](https://docs.rs/spin/latest/spin/).
//!
//! With the `ticket_mutex` feature (the default) waiters are served in FIFO
//! order, so a thread faulting under memory pressure cannot be starved of the
//! frame lock by other faulting threads.

#[cfg(feature = "ticket_mutex")]
pub type Mutex<T> = spin::mutex::TicketMutex<T>;
#[cfg(feature = "ticket_mutex")]
pub type MutexGuard<'a, T> = spin::mutex::TicketMutexGuard<'a, T>;

#[cfg(not(feature = "ticket_mutex"))]
pub type Mutex<T> = spin::mutex::SpinMutex<T>;
#[cfg(not(feature = "ticket_mutex"))]
pub type MutexGuard<'a, T> = spin::mutex::SpinMutexGuard<'a, T>;
