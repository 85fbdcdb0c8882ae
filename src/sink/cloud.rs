//! Cloud storage sink.
//!
//! The sink is provider-neutral: a [`CloudConnector`] turns an access token
//! into a [`CloudClient`], and the uploader thread only talks to that trait.

use anyhow::{Context, Result};
use chrono::FixedOffset;
use std::collections::HashSet;
use std::sync::Arc;

use super::queue::{FrameQueue, PushError};
use super::{date_folder, frame_file_name, Acceptance, Sink, SinkKind};
use crate::snapshot::Snapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderStatus {
    Created,
    AlreadyExists,
}

pub trait CloudClient: Send + Sync {
    /// Display name of the account behind the token. Used to validate it.
    fn account_name(&self) -> Result<String>;

    fn create_folder(&self, path: &str) -> Result<FolderStatus>;

    fn upload(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

pub trait CloudConnector: Send + Sync {
    fn connect(&self, token: &str) -> Result<Arc<dyn CloudClient>>;
}

pub struct CloudSink {
    account: String,
    base: String,
    queue: FrameQueue,
}

impl CloudSink {
    /// Validate the client's credential, then start the uploader.
    ///
    /// Fails without starting anything when the credential is rejected.
    pub fn connect(
        client: Arc<dyn CloudClient>,
        base: &str,
        offset: FixedOffset,
        capacity: usize,
    ) -> Result<Self> {
        let account = client
            .account_name()
            .context("validate cloud credential")?;
        log::info!("cloud sink: connected as {account}");

        let base = normalize_base(base);
        let uploader_base = base.clone();
        let mut folders: HashSet<String> = HashSet::new();
        let queue = FrameQueue::spawn("cloud-sink", capacity, move |snapshot| {
            let folder = format!(
                "{}/{}",
                uploader_base,
                date_folder(snapshot.captured_at(), offset)
            );
            if !folders.contains(&folder) {
                match client.create_folder(&folder) {
                    Ok(status) => {
                        log::debug!("cloud sink: folder {folder} {status:?}");
                        folders.insert(folder.clone());
                    }
                    Err(err) => {
                        log::warn!(
                            "cloud sink: create {folder} failed, dropped {}: {:#}",
                            snapshot.id(),
                            err
                        );
                        return;
                    }
                }
            }
            let path = format!(
                "{}/{}",
                folder,
                frame_file_name(snapshot.captured_at(), offset)
            );
            match client.upload(&path, snapshot.raw()) {
                Ok(()) => {
                    snapshot.mark_stored();
                    log::info!("cloud sink: uploaded {path}");
                }
                Err(err) => log::warn!("cloud sink: upload {path} failed: {:#}", err),
            }
        })?;

        Ok(Self {
            account,
            base,
            queue,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Remote base folder, without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Upload everything queued, then stop.
    pub fn drain(&self) {
        self.queue.drain();
    }
}

impl Sink for CloudSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Cloud
    }

    fn accept(&self, snapshot: &Arc<Snapshot>) -> Acceptance {
        if !snapshot.claim(SinkKind::Cloud) {
            return Acceptance::Duplicate;
        }
        match self.queue.try_push(Arc::clone(snapshot)) {
            Ok(()) => Acceptance::Queued,
            Err(PushError::Full) => {
                log::warn!("cloud sink: queue full, dropped {}", snapshot.id());
                Acceptance::Dropped
            }
            Err(PushError::Closed) => {
                log::warn!("cloud sink: closed, dropped {}", snapshot.id());
                Acceptance::Dropped
            }
        }
    }

    fn close(&self) {
        self.queue.close();
    }
}

/// `"/"` and `""` map to the root (`""`); anything else gets a leading slash
/// and loses trailing ones.
fn normalize_base(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::{TimeZone, Utc};
    use std::sync::mpsc::{self, Receiver, SyncSender};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        folders: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    struct MockClient {
        rec: Arc<Recorder>,
        valid: bool,
        folder_result: fn(&str) -> Result<FolderStatus>,
        gate: Option<Mutex<Receiver<()>>>,
        fail_uploads: bool,
    }

    impl MockClient {
        fn ok(rec: Arc<Recorder>) -> Self {
            Self {
                rec,
                valid: true,
                folder_result: |_| Ok(FolderStatus::Created),
                gate: None,
                fail_uploads: false,
            }
        }
    }

    impl CloudClient for MockClient {
        fn account_name(&self) -> Result<String> {
            if self.valid {
                Ok("sentinel test".into())
            } else {
                Err(anyhow!("invalid_access_token"))
            }
        }

        fn create_folder(&self, path: &str) -> Result<FolderStatus> {
            self.rec.folders.lock().unwrap().push(path.to_string());
            (self.folder_result)(path)
        }

        fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
            if let Some(gate) = &self.gate {
                let _ = gate.lock().unwrap().recv();
            }
            if self.fail_uploads {
                return Err(anyhow!("503 service unavailable"));
            }
            self.rec
                .uploads
                .lock()
                .unwrap()
                .push((path.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    // 2023-11-14T22:13:20.123Z
    const T0: i64 = 1_700_000_000_123;

    fn snap_at(ms: i64, tag: u8) -> Arc<Snapshot> {
        let at = Utc.timestamp_millis_opt(ms).unwrap();
        Arc::new(Snapshot::from_rgb(vec![tag], vec![0; 3], 1, 1, at).unwrap())
    }

    fn gated(rec: Arc<Recorder>) -> (MockClient, SyncSender<()>) {
        let (tx, rx) = mpsc::sync_channel(64);
        let mut client = MockClient::ok(rec);
        client.gate = Some(Mutex::new(rx));
        (client, tx)
    }

    #[test]
    fn rejected_credential_fails_connect() {
        let rec = Arc::new(Recorder::default());
        let mut client = MockClient::ok(rec);
        client.valid = false;
        let err = CloudSink::connect(Arc::new(client), "/", utc(), 4)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("invalid_access_token"));
    }

    #[test]
    fn uploads_in_order_and_creates_each_date_folder_once() {
        let rec = Arc::new(Recorder::default());
        let sink = CloudSink::connect(Arc::new(MockClient::ok(rec.clone())), "/cam/", utc(), 8)
            .unwrap();
        assert_eq!(sink.account(), "sentinel test");
        assert_eq!(sink.base(), "/cam");

        let day = 86_400_000;
        for (i, ms) in [T0, T0 + 1, T0 + day].into_iter().enumerate() {
            assert_eq!(sink.accept(&snap_at(ms, i as u8)), Acceptance::Queued);
        }
        sink.drain();

        assert_eq!(
            *rec.folders.lock().unwrap(),
            vec!["/cam/2023-11-14".to_string(), "/cam/2023-11-15".to_string()]
        );
        let uploads = rec.uploads.lock().unwrap();
        let paths: Vec<_> = uploads.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/cam/2023-11-14/22-13-20.123.jpg",
                "/cam/2023-11-14/22-13-20.124.jpg",
                "/cam/2023-11-15/22-13-20.123.jpg",
            ]
        );
        assert_eq!(uploads[2].1, vec![2]);
    }

    #[test]
    fn root_base_has_no_double_slash() {
        let rec = Arc::new(Recorder::default());
        let sink =
            CloudSink::connect(Arc::new(MockClient::ok(rec.clone())), "/", utc(), 2).unwrap();
        sink.accept(&snap_at(T0, 0));
        sink.drain();
        assert_eq!(
            rec.uploads.lock().unwrap()[0].0,
            "/2023-11-14/22-13-20.123.jpg"
        );
    }

    #[test]
    fn existing_folder_is_not_an_error() {
        let rec = Arc::new(Recorder::default());
        let mut client = MockClient::ok(rec.clone());
        client.folder_result = |_| Ok(FolderStatus::AlreadyExists);
        let sink = CloudSink::connect(Arc::new(client), "/", utc(), 2).unwrap();
        let snap = snap_at(T0, 7);
        sink.accept(&snap);
        sink.drain();
        assert_eq!(rec.uploads.lock().unwrap().len(), 1);
        assert!(snap.is_stored());
    }

    #[test]
    fn folder_failure_drops_frame_and_is_retried_next_time() {
        let rec = Arc::new(Recorder::default());
        let mut client = MockClient::ok(rec.clone());
        client.folder_result = |_| Err(anyhow!("insufficient_space"));
        let sink = CloudSink::connect(Arc::new(client), "/", utc(), 4).unwrap();
        let a = snap_at(T0, 0);
        let b = snap_at(T0 + 1, 1);
        sink.accept(&a);
        sink.accept(&b);
        sink.drain();

        assert_eq!(rec.folders.lock().unwrap().len(), 2);
        assert!(rec.uploads.lock().unwrap().is_empty());
        assert!(!a.is_stored());
        assert!(!b.is_stored());
    }

    #[test]
    fn upload_failure_is_not_retried() {
        let rec = Arc::new(Recorder::default());
        let mut client = MockClient::ok(rec.clone());
        client.fail_uploads = true;
        let sink = CloudSink::connect(Arc::new(client), "/", utc(), 4).unwrap();
        let snap = snap_at(T0, 0);
        assert_eq!(sink.accept(&snap), Acceptance::Queued);
        sink.drain();
        assert!(!snap.is_stored());
        assert_eq!(sink.accept(&snap), Acceptance::Duplicate);
    }

    #[test]
    fn accepting_twice_enqueues_once() {
        let rec = Arc::new(Recorder::default());
        let sink =
            CloudSink::connect(Arc::new(MockClient::ok(rec.clone())), "/", utc(), 4).unwrap();
        let snap = snap_at(T0, 0);
        assert_eq!(sink.accept(&snap), Acceptance::Queued);
        assert_eq!(sink.accept(&snap), Acceptance::Duplicate);
        sink.drain();
        assert_eq!(rec.uploads.lock().unwrap().len(), 1);
    }

    #[test]
    fn full_queue_drops_newest() {
        let rec = Arc::new(Recorder::default());
        let (client, permits) = gated(rec.clone());
        let sink = CloudSink::connect(Arc::new(client), "/", utc(), 2).unwrap();

        // First frame is picked up and parked inside upload.
        sink.accept(&snap_at(T0, 0));
        let start = std::time::Instant::now();
        while sink.pending() > 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.accept(&snap_at(T0 + 1, 1)), Acceptance::Queued);
        assert_eq!(sink.accept(&snap_at(T0 + 2, 2)), Acceptance::Queued);
        assert_eq!(sink.accept(&snap_at(T0 + 3, 3)), Acceptance::Dropped);

        for _ in 0..3 {
            permits.send(()).unwrap();
        }
        sink.drain();
        let uploaded: Vec<u8> = rec
            .uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b[0])
            .collect();
        assert_eq!(uploaded, vec![0, 1, 2]);
    }

    #[test]
    fn base_normalization() {
        assert_eq!(normalize_base("/"), "");
        assert_eq!(normalize_base(""), "");
        assert_eq!(normalize_base("cam"), "/cam");
        assert_eq!(normalize_base("/a/b//"), "/a/b");
    }
}
