//! Bulk-load retry coordination and size-transition diagnostics.
//!
//! Writers recover from a full map by growing it (doubling, up to the
//! largest signed size) and retrying. Ordinary calls are retried by the
//! session a few times. A bulk load keeps everything in one transaction, so
//! when the map fills up the session discards the transaction and every
//! write made so far; [`load`] then replays the caller's fill routine from
//! the beginning. The number of replays is proportional to the address
//! space width, since each one follows a doubling of the map.

use mapstore::{Control, Notification, NotifyFn, Session};
use tracing::{debug, info, warn};

use crate::{MapDict, Result};

/// Growth factor applied on every map-full retry.
pub const MAP_SIZE_INCR: u64 = 2;

/// Largest map size.
pub const MAP_SIZE_MAX: u64 = isize::MAX as u64;

/// Retries per dictionary call.
pub const API_RETRY_LIMIT: u32 = 2;

/// Restarts per bulk transaction.
pub const BULK_RETRY_LIMIT: u32 = 2 * usize::BITS;

/// Install the retry budget on a freshly opened session.
pub fn install_retry_limits(session: &mut Session) {
    session.control(Control::ApiRetryLimit(API_RETRY_LIMIT));
    session.control(Control::BulkRetryLimit(BULK_RETRY_LIMIT));
}

/// Log one size transition for the dictionary labelled `dict`.
pub fn log_notification(dict: &str, notification: &Notification) {
    match notification {
        Notification::Opened(limit) => {
            info!("database {dict}: using size limit {limit} during open");
        }
        Notification::MapFull(limit) => {
            info!("database {dict}: using size limit {limit} after map full");
        }
        Notification::MapResized(limit) => {
            info!("database {dict}: using size limit {limit} after map resized");
        }
        Notification::ReadersFull => {
            info!("database {dict}: pausing after readers full");
        }
    }
}

/// Build a notification callback that logs for `dict`.
pub fn notifier(dict: String) -> NotifyFn {
    Box::new(move |notification| log_notification(&dict, notification))
}

/// Run `fill` inside the dictionary's bulk transaction and commit it.
///
/// When the map fills up, the transaction is discarded and `fill` runs
/// again from the start against the grown map. Returns the number of
/// replays. Once the session's restart budget is spent the error is fatal.
/// The load is never committed partially.
///
/// Without `BULK_UPDATE` every update commits on its own and `fill` runs
/// exactly once.
pub fn load<F>(dict: &mut MapDict, mut fill: F) -> Result<u32>
where
    F: FnMut(&mut MapDict) -> Result<()>,
{
    let mut replays = 0;
    loop {
        match fill(dict).and_then(|()| dict.commit()) {
            Ok(()) => {
                debug!("{}: bulk load committed after {replays} replays", dict.label());
                return Ok(replays);
            }
            Err(e) if e.is_retry() => {
                replays += 1;
                if replays > BULK_RETRY_LIMIT {
                    warn!("{}: bulk load replay limit reached", dict.label());
                    return Err(e);
                }
                debug!("{}: replaying bulk load ({replays})", dict.label());
            }
            Err(e) => return Err(e),
        }
    }
}
