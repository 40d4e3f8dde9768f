//! The utilities shared by the CSI services

use clippy_utilities::OverflowArithmetic;
use tonic::Status;
use tracing::error;

use super::proto::csi::Timestamp;
use crate::common::error::{DateraError, DateraResult};

/// The CSI plugin name
pub const CSI_PLUGIN_NAME: &str = "dsp.csi.daterainc.io";
/// The CSI plugin version
pub const CSI_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Bytes of one GiB
pub const GIB: i64 = 1 << 30;
/// Size used when no capacity range is given
pub const DEFAULT_SIZE_GIB: u64 = 16;
/// Mount filesystems the driver can format
pub const SUPPORTED_FS: [&str; 2] = ["ext4", "xfs"];
/// Default `mkfs.ext4` arguments
const EXT4_DEFAULT_ARGS: &str = "-E lazy_itable_init=0,lazy_journal_init=0,nodiscard -F";

/// Default mkfs arguments of a filesystem
#[must_use]
pub fn default_fs_args(fs_type: &str) -> &'static str {
    match fs_type {
        "ext4" => EXT4_DEFAULT_ARGS,
        _ => "",
    }
}

/// Log a failed RPC and convert the error to a status
pub fn into_status(method: &str, err: DateraError) -> Status {
    let status = Status::from(err);
    error!(
        "{} failed, code={:?}, message={}",
        method,
        status.code(),
        status.message()
    );
    status
}

/// Return the page `[start, min(start + max, len))` of `items`.
/// `max` of 0 means everything from `start`, a `start` past the end is an
/// empty page. The second value is the end offset when entries remain,
/// 0 otherwise.
#[must_use]
pub fn paginate<T>(mut items: Vec<T>, start: usize, max: usize) -> (Vec<T>, usize) {
    let len = items.len();
    if start >= len {
        return (Vec::new(), 0);
    }
    let end = if max == 0 {
        len
    } else {
        start.saturating_add(max).min(len)
    };
    let next = if end < len { end } else { 0 };
    items.truncate(end);
    (items.split_off(start), next)
}

/// Parse a list starting token, empty means the beginning
pub fn parse_starting_token(token: &str) -> DateraResult<usize> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .parse::<usize>()
        .map_err(|e| DateraError::StartingTokenInvalid {
            starting_token: token.to_owned(),
            context: vec![format!("failed to parse starting token, the error is: {e}")],
        })
}

/// Convert a requested `max_entries` to a page size
pub fn parse_max_entries(max_entries: i32) -> DateraResult<usize> {
    usize::try_from(max_entries).map_err(|_| DateraError::ArgumentInvalid {
        context: vec![format!("max entries {max_entries} is negative")],
    })
}

/// Scale a per GiB limit by `size_gib`, capped by `max` when `max` is set.
/// A zero on either side never wins.
#[must_use]
pub fn dynamic_limit(per_gib: u64, size_gib: u64, max: u64) -> u64 {
    let scaled = per_gib.saturating_mul(size_gib);
    match (scaled, max) {
        (0, m) => m,
        (s, 0) => s,
        (s, m) => s.min(m),
    }
}

/// Round a byte count up to whole GiB, at least 1
#[must_use]
pub fn bytes_to_gib(bytes: i64) -> u64 {
    if bytes <= 0 {
        return 1;
    }
    let gib = bytes.saturating_add(GIB.overflow_sub(1)).overflow_div(GIB);
    u64::try_from(gib).unwrap_or(1).max(1)
}

/// Whole GiB that fit in a byte count, rounded down
#[must_use]
pub fn whole_gib(bytes: i64) -> u64 {
    u64::try_from(bytes.max(0).overflow_div(GIB)).unwrap_or(0)
}

/// GiB as bytes
#[must_use]
pub fn gib_to_bytes(gib: u64) -> i64 {
    i64::try_from(gib).unwrap_or(i64::MAX).saturating_mul(GIB)
}

/// Parse a backend snapshot id `<secs>.<nanos>` into a timestamp
#[must_use]
pub fn parse_utc_ts(utc_ts: &str) -> Option<Timestamp> {
    let (secs, frac) = utc_ts.split_once('.').unwrap_or((utc_ts, ""));
    let seconds = secs.parse::<i64>().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        // Pad or cut the fraction to nine digits
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse::<i32>().ok()?
    };
    Some(Timestamp { seconds, nanos })
}
