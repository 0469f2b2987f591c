//! `bind()` interception for the berth daemon.
//!
//! Loaded via the dynamic linker's preload mechanism (`LD_PRELOAD` on
//! Linux, `DYLD_INSERT_LIBRARIES` on macOS), this library exports a `bind`
//! symbol with the libc ABI. IPv4 TCP binds to user ports that fail with
//! address-in-use are retried on daemon-suggested alternatives, rewriting
//! the caller's sockaddr in place; everything else passes straight through.
//!
//! The hook is fully transparent when the daemon is unreachable: the caller
//! sees the original `bind` result, bit for bit. No work happens at load
//! time; the original symbol is resolved lazily on first use.
//!
//! Configuration is by environment variable:
//! - `BERTH_INTERCEPT_DISABLE=1` turns the hook off
//! - `BERTH_DAEMON_HOST` / `BERTH_DAEMON_PORT` locate the daemon
//! - `BERTH_SERVICE_HINT` sets the service-type guess (default `dev`)
//! - `BERTH_DATA_DIR` locates the auth token and audit file

#![warn(clippy::all)]
#![warn(unsafe_op_in_unsafe_fn)]

#[cfg(unix)]
mod hook;

#[cfg(unix)]
pub use hook::suggestions_from_body;
