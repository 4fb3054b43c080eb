use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::MockStorage;
use crate::ObjectList;
use crate::StorageError;
use crate::WatchEvent;
use crate::WatchStream;

/// Message of the error every other list returns
pub(crate) const BYPASSED_LIST_ERROR: &str = "list bypassed";

pub(crate) type WatchSenders = Arc<Mutex<Vec<mpsc::Sender<WatchEvent>>>>;

/// Mock storage whose list returns nothing at `list_resource_version` and
/// whose watches from that version stay open until the returned senders
/// are dropped. Any other list fails with [`BYPASSED_LIST_ERROR`].
///
/// Further expectations (for bypassed requests) can be added by the caller.
pub(crate) fn mock_storage_with_empty_list(list_resource_version: u64) -> (MockStorage, WatchSenders) {
    let mut storage = MockStorage::new();
    storage.expect_get_list().returning(move |_, opts| {
        if opts.resource_version.is_empty() && opts.predicate.continue_key.is_none() && opts.predicate.limit == 0 {
            Ok(ObjectList {
                resource_version: list_resource_version,
                ..Default::default()
            })
        } else {
            Err(StorageError::Unavailable(BYPASSED_LIST_ERROR.to_string()).into())
        }
    });

    let senders: WatchSenders = Arc::new(Mutex::new(Vec::new()));
    let list_rv = list_resource_version.to_string();
    let sink = senders.clone();
    storage
        .expect_watch()
        .withf(move |_, opts| opts.resource_version == list_rv)
        .returning(move |_, _| {
            let (tx, rx) = mpsc::channel(16);
            sink.lock().push(tx);
            Ok(WatchStream::new(rx))
        });

    (storage, senders)
}
