//! The interposed `bind` and its daemon client.

use std::ffi::c_void;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use libc::{c_int, sockaddr, sockaddr_in, socklen_t, AF_INET, SOCK_STREAM};

/// Hard budget for each daemon round-trip.
const DAEMON_TIMEOUT: Duration = Duration::from_millis(200);

/// How many suggestions to request per failed bind.
const SUGGESTION_COUNT: usize = 5;

type BindFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;

static ORIGINAL_BIND: OnceLock<Option<BindFn>> = OnceLock::new();

fn original_bind() -> Option<BindFn> {
    *ORIGINAL_BIND.get_or_init(|| {
        // SAFETY: dlsym with RTLD_NEXT is the standard interposition idiom;
        // the returned pointer has the bind ABI or is null.
        let symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, c"bind".as_ptr()) };
        if symbol.is_null() {
            None
        } else {
            // SAFETY: non-null dlsym result for "bind" has the bind signature.
            Some(unsafe { std::mem::transmute::<*mut c_void, BindFn>(symbol) })
        }
    })
}

fn errno() -> c_int {
    // SAFETY: reading the thread-local errno location.
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        *libc::__error()
    }
}

fn set_errno(value: c_int) {
    // SAFETY: writing the thread-local errno location.
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = value;
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        *libc::__error() = value;
    }
}

fn disabled() -> bool {
    std::env::var("BERTH_INTERCEPT_DISABLE")
        .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn is_tcp_socket(sockfd: c_int) -> bool {
    let mut sock_type: c_int = 0;
    let mut len = socklen_t::try_from(std::mem::size_of::<c_int>()).unwrap_or(4);
    // SAFETY: out-params sized and aligned for SO_TYPE.
    let rc = unsafe {
        libc::getsockopt(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            std::ptr::addr_of_mut!(sock_type).cast::<c_void>(),
            &mut len,
        )
    };
    rc == 0 && sock_type == SOCK_STREAM
}

/// The interposed `bind`.
///
/// # Safety
///
/// Called by the C runtime with the standard `bind` contract: `addr` points
/// to at least `addrlen` readable bytes. The hook writes back into that
/// buffer only when it is a full `sockaddr_in` the caller handed us, which
/// the real `bind` contract already requires to be writable by the caller.
#[no_mangle]
pub unsafe extern "C" fn bind(
    sockfd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> c_int {
    let Some(real_bind) = original_bind() else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    let first = unsafe { real_bind(sockfd, addr, addrlen) };
    if first == 0 || disabled() {
        return first;
    }
    let original_errno = errno();
    if original_errno != libc::EADDRINUSE {
        return first;
    }

    // Only IPv4 TCP user ports are eligible for reassignment.
    if addr.is_null() || (addrlen as usize) < std::mem::size_of::<sockaddr_in>() {
        return first;
    }
    let addr_in = addr.cast::<sockaddr_in>().cast_mut();
    // SAFETY: length checked above; the caller's buffer is a sockaddr_in.
    let family = unsafe { (*addr_in).sin_family };
    if c_int::from(family) != AF_INET || !is_tcp_socket(sockfd) {
        return first;
    }
    // SAFETY: same buffer as above.
    let original_port = u16::from_be(unsafe { (*addr_in).sin_port });
    if original_port < 1024 {
        return first;
    }

    let hint = std::env::var("BERTH_SERVICE_HINT").unwrap_or_else(|_| "dev".to_string());
    let suggestions = query_suggestions(&hint, SUGGESTION_COUNT).unwrap_or_default();

    for suggestion in suggestions {
        // SAFETY: rewriting the port field of the caller's sockaddr_in.
        unsafe {
            (*addr_in).sin_port = suggestion.to_be();
        }
        let retry = unsafe { real_bind(sockfd, addr, addrlen) };
        if retry == 0 {
            let pid = std::process::id();
            // Never panic in the hook, even with stdout closed.
            let _ = writeln!(
                std::io::stdout(),
                "[berth] port {original_port} was in use; pid {pid} rebound to port {suggestion}"
            );
            append_audit(original_port, suggestion, pid);
            return 0;
        }
    }

    // Full transparency on failure: restore the caller's buffer and the
    // original errno.
    // SAFETY: same buffer as above.
    unsafe {
        (*addr_in).sin_port = original_port.to_be();
    }
    set_errno(original_errno);
    first
}

fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("BERTH_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".berth"))
}

fn auth_token() -> Option<String> {
    if let Ok(token) = std::env::var("BERTH_AUTH_TOKEN") {
        return Some(token);
    }
    let path = data_dir()?.join("auth.token");
    std::fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
}

/// Ask the daemon for suggestions. Every failure path returns `None`; the
/// caller then falls back to the original bind result.
fn query_suggestions(service_hint: &str, n: usize) -> Option<Vec<u16>> {
    let host = std::env::var("BERTH_DAEMON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("BERTH_DAEMON_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(9876);
    let token = auth_token()?;

    let address = format!("{host}:{port}");
    let socket_addr = address.parse().ok()?;
    let mut stream = TcpStream::connect_timeout(&socket_addr, DAEMON_TIMEOUT).ok()?;
    stream.set_read_timeout(Some(DAEMON_TIMEOUT)).ok()?;
    stream.set_write_timeout(Some(DAEMON_TIMEOUT)).ok()?;

    let request = format!(
        "GET /suggest/{service_hint}?n={n} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Authorization: Bearer {token}\r\n\
         Connection: close\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).ok()?;

    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;

    let (head, body) = response.split_once("\r\n\r\n")?;
    if !head.starts_with("HTTP/1.1 200") && !head.starts_with("HTTP/1.0 200") {
        return None;
    }
    suggestions_from_body(body)
}

/// Extract the `ports` array from a `/suggest` response body.
///
/// Split out of the transport path so it can be tested without a daemon.
#[must_use]
pub fn suggestions_from_body(body: &str) -> Option<Vec<u16>> {
    // Chunked responses carry length lines around the JSON; take the first
    // line that parses to an object with a ports array.
    for candidate in body.lines().chain(std::iter::once(body)) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate.trim()) else {
            continue;
        };
        let Some(ports) = value.get("ports").and_then(serde_json::Value::as_array) else {
            continue;
        };
        return Some(
            ports
                .iter()
                .filter_map(serde_json::Value::as_u64)
                .filter_map(|raw| u16::try_from(raw).ok())
                .collect(),
        );
    }
    None
}

/// One line per reassignment, mirrored to a well-known file so hooks and
/// tests can observe interceptor activity without the daemon.
fn append_audit(original: u16, reassigned: u16, pid: u32) {
    let Some(dir) = data_dir() else { return };
    let path = dir.join("intercept-audit.log");
    let line = format!(
        "{{\"original_port\":{original},\"reassigned_port\":{reassigned},\"pid\":{pid}}}\n"
    );
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestions_from_plain_body() {
        let ports = suggestions_from_body("{\"ports\":[3000,3001,3002]}").unwrap();
        assert_eq!(ports, vec![3000, 3001, 3002]);
    }

    #[test]
    fn test_suggestions_from_chunked_body() {
        let body = "1a\r\n{\"ports\":[3000,3001]}\r\n0\r\n\r\n";
        let ports = suggestions_from_body(body).unwrap();
        assert_eq!(ports, vec![3000, 3001]);
    }

    #[test]
    fn test_suggestions_rejects_garbage() {
        assert!(suggestions_from_body("not json").is_none());
        assert!(suggestions_from_body("{\"other\":1}").is_none());
    }

    #[test]
    fn test_original_bind_resolves() {
        // In a test binary the next bind symbol is libc's own.
        assert!(original_bind().is_some());
    }
}
